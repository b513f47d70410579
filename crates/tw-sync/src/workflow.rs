use crate::merge::MergedView;
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::{info, warn};
use tw_core::api_contracts::{Conclusion, Hypothesis};
use tw_core::{EntityId, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Scope,
    Hypothesis,
    Execution,
    Findings,
    Conclusion,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Scope,
        Stage::Hypothesis,
        Stage::Execution,
        Stage::Findings,
        Stage::Conclusion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Scope => "scope",
            Stage::Hypothesis => "hypothesis",
            Stage::Execution => "execution",
            Stage::Findings => "findings",
            Stage::Conclusion => "conclusion",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Locked,
    Available,
    Active,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPhase {
    Idle,
    Running,
    Paused,
    Stopped,
    Completed,
    Failed,
}

impl ExecutionPhase {
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Running => Some(ExecutionPhase::Running),
            Status::Paused => Some(ExecutionPhase::Paused),
            Status::Stopped => Some(ExecutionPhase::Stopped),
            Status::Completed => Some(ExecutionPhase::Completed),
            Status::Failed => Some(ExecutionPhase::Failed),
            _ => None,
        }
    }

    pub fn can_transition_to(self, next: ExecutionPhase) -> bool {
        use ExecutionPhase::*;
        if self == next {
            return true;
        }
        matches!(
            (self, next),
            (Idle, Running)
                | (Running, Paused | Stopped | Completed | Failed)
                | (Paused, Running | Stopped | Completed | Failed)
                | (Stopped, Running)
                | (Failed, Running)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("{stage} stage is locked: {reason}")]
    Locked { stage: Stage, reason: &'static str },
    #[error("execution cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        from: ExecutionPhase,
        to: ExecutionPhase,
    },
    #[error("hypothesis text must not be empty")]
    EmptyHypothesis,
    #[error("a hunt scope was already created")]
    ScopeAlreadyCreated,
    #[error("conclusion was already saved")]
    AlreadyConcluded,
}

/// Five-stage hunt gate. It only tracks preconditions; connection and
/// reconciliation stay with the reconciler whose view it mirrors.
#[derive(Debug, Clone)]
pub struct HuntWorkflow {
    hunt_id: Option<EntityId>,
    hypothesis: Option<Hypothesis>,
    execution_id: Option<String>,
    phase: ExecutionPhase,
    conclusion: Option<Conclusion>,
}

impl Default for HuntWorkflow {
    fn default() -> Self {
        Self {
            hunt_id: None,
            hypothesis: None,
            execution_id: None,
            phase: ExecutionPhase::Idle,
            conclusion: None,
        }
    }
}

impl HuntWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hunt_id(&self) -> Option<&EntityId> {
        self.hunt_id.as_ref()
    }

    pub fn hypothesis(&self) -> Option<&Hypothesis> {
        self.hypothesis.as_ref()
    }

    pub fn execution_id(&self) -> Option<&str> {
        self.execution_id.as_deref()
    }

    pub fn phase(&self) -> ExecutionPhase {
        self.phase
    }

    pub fn conclusion(&self) -> Option<&Conclusion> {
        self.conclusion.as_ref()
    }

    pub fn scope_created(&mut self, hunt_id: EntityId) -> Result<(), GateError> {
        if self.hunt_id.is_some() {
            return Err(GateError::ScopeAlreadyCreated);
        }
        info!(event = "hunt_scope_created", hunt_id = %hunt_id);
        self.hunt_id = Some(hunt_id);
        Ok(())
    }

    pub fn require_hunt(&self, stage: Stage) -> Result<&EntityId, GateError> {
        self.hunt_id.as_ref().ok_or(GateError::Locked {
            stage,
            reason: "no hunt scope has been created",
        })
    }

    pub fn check_hypothesis(&self, hypothesis: &Hypothesis) -> Result<(), GateError> {
        self.require_hunt(Stage::Hypothesis)?;
        if hypothesis.hypothesis.trim().is_empty() {
            return Err(GateError::EmptyHypothesis);
        }
        if self.phase != ExecutionPhase::Idle {
            return Err(GateError::Locked {
                stage: Stage::Hypothesis,
                reason: "an execution has already started",
            });
        }
        Ok(())
    }

    pub fn hypothesis_saved(&mut self, hypothesis: Hypothesis) -> Result<(), GateError> {
        self.check_hypothesis(&hypothesis)?;
        self.hypothesis = Some(hypothesis);
        Ok(())
    }

    pub fn check_execute(&self) -> Result<&EntityId, GateError> {
        let hunt_id = self.require_hunt(Stage::Execution)?;
        let has_text = self
            .hypothesis
            .as_ref()
            .is_some_and(|h| !h.hypothesis.trim().is_empty());
        if !has_text {
            return Err(GateError::Locked {
                stage: Stage::Execution,
                reason: "a hypothesis must be saved first",
            });
        }
        self.check_transition(ExecutionPhase::Running)?;
        Ok(hunt_id)
    }

    pub fn execution_started(&mut self, execution_id: String) -> Result<(), GateError> {
        self.check_execute()?;
        self.phase = ExecutionPhase::Running;
        self.execution_id = Some(execution_id);
        Ok(())
    }

    /// Returns the hunt and execution ids a pause or stop must target.
    pub fn check_control(&self, to: ExecutionPhase) -> Result<(EntityId, String), GateError> {
        let hunt_id = self.require_hunt(Stage::Execution)?.clone();
        let execution_id = self.execution_id.clone().ok_or(GateError::Locked {
            stage: Stage::Execution,
            reason: "no execution has been started",
        })?;
        self.check_transition(to)?;
        Ok((hunt_id, execution_id))
    }

    pub fn execution_moved(&mut self, to: ExecutionPhase) -> Result<(), GateError> {
        self.check_transition(to)?;
        self.phase = to;
        Ok(())
    }

    /// Mirrors the execution status streamed through the merged view.
    pub fn observe(&mut self, view: &MergedView) {
        if self.hunt_id.as_ref() != Some(&view.id) {
            return;
        }
        if let Some(execution_id) = &view.execution_id {
            self.execution_id = Some(execution_id.clone());
        }
        let Some(next) = ExecutionPhase::from_status(view.status) else {
            return;
        };
        if self.phase == next {
            return;
        }
        if self.phase.can_transition_to(next) {
            info!(event = "hunt_execution_phase", hunt_id = %view.id, from = ?self.phase, to = ?next);
            self.phase = next;
        } else {
            warn!(event = "hunt_execution_phase_rejected", hunt_id = %view.id, from = ?self.phase, to = ?next);
        }
    }

    pub fn check_conclude(&self) -> Result<&EntityId, GateError> {
        let hunt_id = self.require_hunt(Stage::Conclusion)?;
        if self.conclusion.is_some() {
            return Err(GateError::AlreadyConcluded);
        }
        if self.phase != ExecutionPhase::Completed {
            return Err(GateError::Locked {
                stage: Stage::Conclusion,
                reason: "execution has not completed",
            });
        }
        Ok(hunt_id)
    }

    pub fn concluded(&mut self, conclusion: Conclusion) -> Result<(), GateError> {
        self.check_conclude()?;
        self.conclusion = Some(conclusion);
        Ok(())
    }

    pub fn stage_state(&self, stage: Stage) -> StageState {
        match stage {
            Stage::Scope => {
                if self.hunt_id.is_some() {
                    StageState::Done
                } else {
                    StageState::Active
                }
            }
            Stage::Hypothesis => match (&self.hunt_id, &self.hypothesis) {
                (None, _) => StageState::Locked,
                (Some(_), None) => StageState::Active,
                (Some(_), Some(_)) => StageState::Done,
            },
            Stage::Execution => {
                if self.hypothesis.is_none() {
                    StageState::Locked
                } else if self.phase == ExecutionPhase::Completed {
                    StageState::Done
                } else {
                    StageState::Active
                }
            }
            Stage::Findings => {
                if self.phase == ExecutionPhase::Completed {
                    StageState::Done
                } else {
                    StageState::Available
                }
            }
            Stage::Conclusion => {
                if self.conclusion.is_some() {
                    StageState::Done
                } else if self.phase == ExecutionPhase::Completed {
                    StageState::Active
                } else {
                    StageState::Locked
                }
            }
        }
    }

    pub fn stages(&self) -> Vec<(Stage, StageState)> {
        Stage::ALL
            .iter()
            .map(|stage| (*stage, self.stage_state(*stage)))
            .collect()
    }

    fn check_transition(&self, to: ExecutionPhase) -> Result<(), GateError> {
        if self.phase.can_transition_to(to) {
            Ok(())
        } else {
            Err(GateError::InvalidTransition {
                from: self.phase,
                to,
            })
        }
    }
}
