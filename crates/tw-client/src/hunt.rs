use crate::rest::{ApiError, HuntApi};
use crate::runner::WatchCommand;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tw_core::api_contracts::{Conclusion, ExecutionAck, ExecutionRequest, HuntScope, Hypothesis};
use tw_core::EntityId;
use tw_sync::{ExecutionPhase, GateError, HuntWorkflow, MergedView, Stage};

#[derive(Debug, Error)]
pub enum HuntRunError {
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("invalid hunt scope: {0}")]
    Scope(String),
}

/// Pairs the workflow gate with the REST calls each stage needs. Every call
/// is checked against the gate before it leaves the process.
pub struct HuntRunner<A> {
    api: A,
    workflow: HuntWorkflow,
    watch: Option<mpsc::Sender<WatchCommand>>,
}

impl<A: HuntApi> HuntRunner<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            workflow: HuntWorkflow::new(),
            watch: None,
        }
    }

    /// Lets `execute` restart the hunt's watch session when a new execution
    /// follows a failed or stopped one.
    pub fn attach_watch(&mut self, commands: mpsc::Sender<WatchCommand>) {
        self.watch = Some(commands);
    }

    pub fn workflow(&self) -> &HuntWorkflow {
        &self.workflow
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    pub async fn create_scope(&mut self, scope: &HuntScope) -> Result<EntityId, HuntRunError> {
        scope.validate().map_err(HuntRunError::Scope)?;
        if self.workflow.hunt_id().is_some() {
            return Err(GateError::ScopeAlreadyCreated.into());
        }
        let session = self.api.create_session(scope).await?;
        self.workflow.scope_created(session.hunt_id.clone())?;
        Ok(session.hunt_id)
    }

    pub async fn save_hypothesis(&mut self, hypothesis: Hypothesis) -> Result<(), HuntRunError> {
        self.workflow.check_hypothesis(&hypothesis)?;
        let hunt_id = self.workflow.require_hunt(Stage::Hypothesis)?.clone();
        self.api.save_hypothesis(&hunt_id, &hypothesis).await?;
        self.workflow.hypothesis_saved(hypothesis)?;
        Ok(())
    }

    pub async fn execute(&mut self, request: &ExecutionRequest) -> Result<ExecutionAck, HuntRunError> {
        let hunt_id = self.workflow.check_execute()?.clone();
        let previous = self.workflow.phase();
        let ack = self.api.execute(&hunt_id, request).await?;
        info!(
            event = "hunt_execution_started",
            hunt_id = %hunt_id,
            execution_id = %ack.execution_id,
            mode = ?request.mode,
            depth = ?request.depth
        );
        self.workflow.execution_started(ack.execution_id.clone())?;
        if matches!(previous, ExecutionPhase::Failed | ExecutionPhase::Stopped) {
            if let Some(watch) = &self.watch {
                if watch.send(WatchCommand::Restart).await.is_err() {
                    debug!(event = "hunt_watch_gone", hunt_id = %hunt_id);
                }
            }
        }
        Ok(ack)
    }

    pub async fn pause(&mut self) -> Result<(), HuntRunError> {
        let (hunt_id, execution_id) = self.workflow.check_control(ExecutionPhase::Paused)?;
        self.api.pause(&hunt_id, &execution_id).await?;
        self.workflow.execution_moved(ExecutionPhase::Paused)?;
        Ok(())
    }

    pub async fn stop(&mut self) -> Result<(), HuntRunError> {
        let (hunt_id, execution_id) = self.workflow.check_control(ExecutionPhase::Stopped)?;
        self.api.stop(&hunt_id, &execution_id).await?;
        self.workflow.execution_moved(ExecutionPhase::Stopped)?;
        Ok(())
    }

    pub fn observe(&mut self, view: &MergedView) {
        self.workflow.observe(view);
    }

    pub async fn conclude(&mut self, conclusion: Conclusion) -> Result<(), HuntRunError> {
        let hunt_id = self.workflow.check_conclude()?.clone();
        self.api.save_conclusion(&hunt_id, &conclusion).await?;
        info!(event = "hunt_concluded", hunt_id = %hunt_id, verdict = %conclusion.verdict);
        self.workflow.concluded(conclusion)?;
        Ok(())
    }
}
