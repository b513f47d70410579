use crate::overlay::Overlay;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tw_core::{summarize_findings, EntityId, FindingsSummary, Progress, Snapshot, Status};
use tw_core::{COLLECTION_FINDINGS, COLLECTION_TIMELINE};

/// The read model consumers render: snapshot underneath, overlay on top.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergedView {
    pub id: EntityId,
    pub status: Status,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub summary: Map<String, Value>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub collections: BTreeMap<String, Vec<Value>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub live_atoms: Vec<String>,
    pub terminal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl MergedView {
    pub fn findings_summary(&self) -> FindingsSummary {
        summarize_findings(&self.findings)
    }

    pub fn timeline(&self) -> &[Value] {
        self.collections
            .get(COLLECTION_TIMELINE)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

pub fn merge_view(snapshot: &Snapshot, overlay: &Overlay) -> MergedView {
    let status = overlay.status.unwrap_or(snapshot.status);

    let mut fields = snapshot.fields.clone();
    fields.extend(overlay.fields.clone());

    let mut summary = snapshot.summary.clone();
    if let Some(partial) = &overlay.summary {
        summary.extend(partial.clone());
    }

    let mut collections = snapshot.collections.clone();
    for (name, items) in &overlay.collections {
        collections.insert(name.clone(), items.clone());
    }
    let base_findings = collections.remove(COLLECTION_FINDINGS).unwrap_or_default();

    MergedView {
        id: snapshot.id.clone(),
        status,
        fields,
        summary,
        collections,
        findings: merge_findings(&overlay.findings, base_findings),
        progress: overlay.progress,
        execution_id: overlay.execution_id.clone(),
        live_atoms: overlay.atoms.clone(),
        terminal: overlay.terminal || status.is_terminal(),
        last_error: overlay.last_error.as_ref().map(|err| err.message.clone()),
    }
}

fn merge_findings(streamed: &[Value], base: Vec<Value>) -> Vec<Value> {
    let mut merged = streamed.to_vec();
    for item in base {
        let duplicate = match item.get("id").filter(|id| !id.is_null()) {
            Some(id) => streamed.iter().any(|seen| seen.get("id") == Some(id)),
            None => false,
        };
        if !duplicate {
            merged.push(item);
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tw_core::patch_protocol::{
        ChannelMsg, CompletedPatch, FindingPatch, InitialPatch, SummaryPatch,
    };

    fn snapshot(value: Value) -> Snapshot {
        Snapshot::from_value(value, None).expect("snapshot")
    }

    fn object(value: Value) -> Map<String, Value> {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn progress_and_summary_overlay_a_running_snapshot() {
        let base = snapshot(json!({"id": "j1", "status": "running", "total_logs": 0}));
        let mut overlay = Overlay::default();
        overlay.fold(ChannelMsg::Progress(Progress {
            processed: 5,
            total: 20,
        }));
        overlay.fold(ChannelMsg::Summary(SummaryPatch {
            summary: object(json!({"threat_percentage": 10})),
        }));

        let view = serde_json::to_value(merge_view(&base, &overlay)).expect("json");
        assert_eq!(
            view,
            json!({
                "id": "j1",
                "status": "running",
                "total_logs": 0,
                "progress": {"processed": 5, "total": 20},
                "summary": {"threat_percentage": 10},
                "terminal": false
            })
        );
    }

    #[test]
    fn empty_overlay_reproduces_the_snapshot() {
        let base = snapshot(json!({
            "id": "j2",
            "status": "completed",
            "summary": {"threat_percentage": 3},
            "timeline": [{"t": 1}],
            "total_logs": 40
        }));
        let view = merge_view(&base, &Overlay::default());
        assert_eq!(view.status, Status::Completed);
        assert_eq!(view.summary, base.summary);
        assert_eq!(view.fields, base.fields);
        assert_eq!(view.timeline(), base.collection(COLLECTION_TIMELINE));
        assert!(view.terminal);
    }

    #[test]
    fn terminal_overlay_wins_over_lagging_snapshot() {
        let mut overlay = Overlay::default();
        overlay.fold(ChannelMsg::Completed(CompletedPatch {
            summary: Some(object(json!({"x": 1}))),
            ..CompletedPatch::default()
        }));
        let lagging = snapshot(json!({"id": "j3", "status": "running", "summary": {"x": 0, "y": 2}}));

        let view = merge_view(&lagging, &overlay);
        assert_eq!(view.status, Status::Completed);
        assert_eq!(view.summary, object(json!({"x": 1, "y": 2})));
    }

    #[test]
    fn streamed_findings_precede_base_findings_without_duplicates() {
        let base = snapshot(json!({"hunt_id": 5, "items": [{"id": 1, "severity": "low"}]}));
        let mut overlay = Overlay::default();
        overlay.fold(ChannelMsg::Initial(InitialPatch {
            items: vec![json!({"id": 1, "severity": "low"}), json!({"id": 2, "severity": "medium"})],
            summary: None,
        }));
        overlay.fold(ChannelMsg::Finding(FindingPatch {
            item: json!({"id": 2, "severity": "medium"}),
        }));
        overlay.fold(ChannelMsg::Finding(FindingPatch {
            item: json!({"id": 3, "severity": "critical"}),
        }));

        let view = merge_view(&base, &overlay);
        let ids: Vec<_> = view.findings.iter().map(|f| f["id"].clone()).collect();
        assert_eq!(ids, vec![json!(3), json!(2), json!(1)]);
        let summary = view.findings_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.critical, 1);
        assert!(!view.collections.contains_key(COLLECTION_FINDINGS));
    }
}
