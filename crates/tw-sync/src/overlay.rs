use crate::error::DomainError;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;
use tw_core::patch_protocol::ChannelMsg;
use tw_core::{Progress, Status, COLLECTION_FINDINGS, COLLECTION_TIMELINE};

#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome {
    Applied,
    /// A log line for the event buffer; the overlay itself is unchanged.
    Atom(String),
    Terminal,
    Error { error: DomainError, terminal: bool },
    Ignored,
}

/// Ephemeral entity state folded from streamed patches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overlay {
    pub status: Option<Status>,
    pub summary: Option<Map<String, Value>>,
    pub collections: BTreeMap<String, Vec<Value>>,
    pub fields: Map<String, Value>,
    pub progress: Option<Progress>,
    pub execution_id: Option<String>,
    /// Streamed findings, newest first.
    pub findings: Vec<Value>,
    /// Atoms released by the event buffer, in arrival order.
    pub atoms: Vec<String>,
    pub last_error: Option<DomainError>,
    pub terminal: bool,
    folded: u64,
}

impl Overlay {
    /// Count of patches folded since the overlay was created. Survives resets.
    pub fn folded(&self) -> u64 {
        self.folded
    }

    pub fn fold(&mut self, msg: ChannelMsg) -> FoldOutcome {
        if self.terminal {
            debug!(event = "overlay_patch_after_terminal", tag = msg.tag());
            return FoldOutcome::Ignored;
        }
        self.folded += 1;

        match msg {
            ChannelMsg::Status(patch) => {
                self.status = Some(patch.status);
                if patch.status.is_terminal() {
                    self.terminal = true;
                    return FoldOutcome::Terminal;
                }
            }
            ChannelMsg::Summary(patch) => self.merge_summary(patch.summary),
            ChannelMsg::Timeline(patch) => {
                self.collections
                    .insert(COLLECTION_TIMELINE.to_string(), patch.timeline);
            }
            ChannelMsg::Collection(patch) => {
                self.collections.insert(patch.name, patch.items);
            }
            ChannelMsg::Log(patch) => return FoldOutcome::Atom(patch.line),
            ChannelMsg::Progress(progress) => self.progress = Some(progress),
            ChannelMsg::Finding(patch) => self.prepend_finding(patch.item),
            ChannelMsg::ExecutionCreated(patch) => {
                if patch.execution_id.is_some() {
                    self.execution_id = patch.execution_id;
                }
            }
            ChannelMsg::Initial(patch) => {
                self.collections
                    .insert(COLLECTION_FINDINGS.to_string(), patch.items);
                if let Some(summary) = patch.summary {
                    self.merge_summary(summary);
                }
            }
            ChannelMsg::Completed(patch) => {
                let status = patch
                    .status
                    .filter(Status::is_terminal)
                    .unwrap_or(Status::Completed);
                self.status = Some(status);
                self.terminal = true;
                if let Some(summary) = patch.summary {
                    self.merge_summary(summary);
                }
                if let Some(timeline) = patch.timeline {
                    self.collections
                        .insert(COLLECTION_TIMELINE.to_string(), timeline);
                }
                if let Some(stats) = patch.stats {
                    self.fields.extend(stats);
                }
                return FoldOutcome::Terminal;
            }
            ChannelMsg::Error(patch) => {
                let fatal = patch.is_fatal();
                let error = DomainError {
                    message: patch.text().to_string(),
                    fatal,
                };
                self.last_error = Some(error.clone());
                if fatal {
                    self.status = Some(Status::Failed);
                    self.terminal = true;
                }
                return FoldOutcome::Error {
                    error,
                    terminal: fatal,
                };
            }
        }
        FoldOutcome::Applied
    }

    pub fn append_atoms(&mut self, batch: Vec<String>) {
        self.atoms.extend(batch);
    }

    /// A terminal snapshot is authoritative for status only.
    pub fn force_status(&mut self, status: Status) {
        self.status = Some(status);
        if status.is_terminal() {
            self.terminal = true;
        }
    }

    /// Starts a new observation session for the same entity. Released atoms
    /// and the fold counter carry over.
    pub fn reset_keep_atoms(&mut self) {
        let atoms = std::mem::take(&mut self.atoms);
        let folded = self.folded;
        *self = Overlay {
            atoms,
            folded,
            ..Overlay::default()
        };
    }

    fn merge_summary(&mut self, partial: Map<String, Value>) {
        self.summary.get_or_insert_with(Map::new).extend(partial);
    }

    fn prepend_finding(&mut self, item: Value) {
        if let Some(id) = item.get("id").filter(|id| !id.is_null()) {
            self.findings.retain(|existing| existing.get("id") != Some(id));
        }
        self.findings.insert(0, item);
    }
}
