use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use txseq_core::{RunReport, SequencerError, StoreOp};

use crate::output::{print_json, print_table};
use crate::plan::Plan;
use crate::settings::load_config;

// ---------------------------------------------------------------------------
// RunExit: typed non-zero exit codes
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RunExit {
    /// The transaction did not commit.
    #[error("transaction failed: {0}")]
    Failed(String),
}

impl RunExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunExit::Failed(_) => 2,
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// How a run ended, as reported to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Outcome {
    Committed,
    /// A transaction was opened and rolled back.
    RolledBack,
    /// The run stopped without opening or closing a transaction.
    Aborted,
    BeginFailed,
    CommitFailed,
    Lost,
}

impl Outcome {
    fn classify(report: &RunReport, journal: &[StoreOp]) -> Self {
        match &report.outcome {
            Ok(()) => Outcome::Committed,
            Err(SequencerError::Begin(_)) => Outcome::BeginFailed,
            Err(SequencerError::Commit(_)) => Outcome::CommitFailed,
            Err(SequencerError::Lost) => Outcome::Lost,
            Err(_) if journal.contains(&StoreOp::Rollback) => Outcome::RolledBack,
            Err(_) => Outcome::Aborted,
        }
    }
}

#[derive(Serialize)]
struct RunSummary {
    run_id: String,
    outcome: Outcome,
    committed: bool,
    actions_total: usize,
    actions_invoked: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    failed_step: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rollback_error: Option<String>,
    started_at: DateTime<Utc>,
    elapsed_ms: u64,
    journal: Vec<StoreOp>,
    state: BTreeMap<String, Value>,
}

impl RunSummary {
    fn new(report: &RunReport, journal: Vec<StoreOp>, state: BTreeMap<String, Value>) -> Self {
        let err = report.outcome.as_ref().err();
        Self {
            run_id: report.run_id.to_string(),
            outcome: Outcome::classify(report, &journal),
            committed: report.succeeded(),
            actions_total: report.actions_total,
            actions_invoked: report.actions_invoked,
            failed_step: err.and_then(|e| e.failed_index()),
            error: err.map(|e| e.to_string()),
            rollback_error: err.and_then(|e| e.rollback_error()).map(|e| e.to_string()),
            started_at: report.started_at,
            elapsed_ms: u64::try_from(report.elapsed.as_millis()).unwrap_or(u64::MAX),
            journal,
            state,
        }
    }
}

pub fn run(plan_path: &Path, config: Option<&Path>, json: bool) -> anyhow::Result<()> {
    let (config, _) = load_config(config)?;
    let plan = Plan::load(plan_path)
        .with_context(|| format!("failed to load plan {}", plan_path.display()))?;
    let (store, sequencer) = plan.build(config)?;

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(async move { sequencer.run().report().await });
    let summary = RunSummary::new(&report, store.journal(), store.snapshot());

    if json {
        print_json(&summary)?;
    } else {
        print_human(&summary);
    }

    match summary.error {
        None => Ok(()),
        Some(error) => Err(RunExit::Failed(error).into()),
    }
}

fn headline(s: &RunSummary) -> String {
    let at = s
        .failed_step
        .map(|i| format!(" at step {i}"))
        .unwrap_or_default();
    match s.outcome {
        Outcome::Committed => format!(
            "Committed run {} ({} action(s), {} ms).",
            s.run_id, s.actions_invoked, s.elapsed_ms
        ),
        Outcome::RolledBack => format!(
            "Rolled back run {}{at} ({}/{} action(s) invoked, {} ms).",
            s.run_id, s.actions_invoked, s.actions_total, s.elapsed_ms
        ),
        Outcome::Aborted => format!(
            "Stopped run {} before any transaction was opened ({} ms).",
            s.run_id, s.elapsed_ms
        ),
        Outcome::BeginFailed => format!(
            "Begin failed for run {}; no actions ran ({} ms).",
            s.run_id, s.elapsed_ms
        ),
        Outcome::CommitFailed => format!(
            "Commit failed for run {} after {} action(s) ({} ms).",
            s.run_id, s.actions_invoked, s.elapsed_ms
        ),
        Outcome::Lost => format!("Lost run {}: it ended without reporting.", s.run_id),
    }
}

fn print_human(s: &RunSummary) {
    println!("{}", headline(s));
    if let Some(e) = &s.rollback_error {
        println!("  rollback also failed: {e}");
    }

    println!();
    let rows: Vec<Vec<String>> = s
        .state
        .iter()
        .map(|(k, v)| vec![k.clone(), v.to_string()])
        .collect();
    print_table(&["KEY", "VALUE"], &rows);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn summary(outcome: Result<(), SequencerError>, journal: Vec<StoreOp>) -> RunSummary {
        let report = RunReport {
            run_id: Uuid::nil(),
            outcome,
            actions_total: 3,
            actions_invoked: 3,
            started_at: Utc::now(),
            elapsed: Duration::from_millis(7),
        };
        RunSummary::new(&report, journal, BTreeMap::new())
    }

    #[test]
    fn commit_failure_is_not_reported_as_a_rollback() {
        let s = summary(
            Err(SequencerError::Commit("disk full".into())),
            vec![StoreOp::Begin],
        );
        assert_eq!(s.outcome, Outcome::CommitFailed);
        let line = headline(&s);
        assert!(line.starts_with("Commit failed for run"), "{line}");
        assert!(!line.contains("Rolled back"));
    }

    #[test]
    fn begin_failure_is_not_reported_as_a_rollback() {
        let s = summary(Err(SequencerError::Begin("no connection".into())), vec![]);
        assert_eq!(s.outcome, Outcome::BeginFailed);
        assert!(headline(&s).starts_with("Begin failed for run"));
    }

    #[test]
    fn action_failure_is_a_rollback() {
        let s = summary(
            Err(SequencerError::Cancelled { rollback: None }),
            vec![StoreOp::Begin, StoreOp::Rollback],
        );
        assert_eq!(s.outcome, Outcome::RolledBack);
        assert!(headline(&s).starts_with("Rolled back run"));
        assert_eq!(serde_json::to_value(&s).unwrap()["outcome"], "rolled_back");
    }

    #[test]
    fn success_is_committed() {
        let s = summary(Ok(()), vec![StoreOp::Begin, StoreOp::Commit]);
        assert_eq!(s.outcome, Outcome::Committed);
        assert!(headline(&s).starts_with("Committed run"));
    }
}
