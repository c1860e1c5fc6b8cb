//! YAML transaction plans.
//!
//! A plan seeds a [`MemoryStore`] and lists the steps to run inside one
//! transaction:
//!
//! ```yaml
//! seed:
//!   checking: 100
//! steps:
//!   - op: increment
//!     key: checking
//!     by: -25
//!   - op: fail
//!     message: unable to save the account
//!     style: emitter
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use txseq_core::{
    BoxError, Completion, Emitter, Invocation, MemorySession, MemoryStore, Sequencer,
    SequencerConfig,
};

// ---------------------------------------------------------------------------
// PlanError / PlanIssue
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("plan file not found: {0}")]
    NotFound(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error("plan has {} invalid step(s); first: {}", .0.len(), first_issue(.0))]
    Invalid(Vec<PlanIssue>),
}

fn first_issue(issues: &[PlanIssue]) -> String {
    issues.first().map(ToString::to_string).unwrap_or_default()
}

/// One problem found by [`Plan::validate`]. `step` is zero-based.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanIssue {
    pub step: usize,
    pub message: String,
}

impl fmt::Display for PlanIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "step {}: {}", self.step, self.message)
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Plan {
    /// Committed data the store starts with.
    #[serde(default)]
    pub seed: BTreeMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub kind: StepKind,
    #[serde(default)]
    pub style: Style,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepKind {
    Put { key: String, value: Value },
    Delete { key: String },
    Increment { key: String, by: i64 },
    /// Report failure with `message`.
    Fail { message: String },
    /// Wait `ms` milliseconds, then succeed.
    Sleep { ms: u64 },
    /// Never report; the completion handle is dropped.
    Abandon,
}

/// Which completion convention a step reports through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Style {
    #[default]
    Callback,
    Emitter,
    Ready,
}

impl StepKind {
    fn op(&self) -> &'static str {
        match self {
            StepKind::Put { .. } => "put",
            StepKind::Delete { .. } => "delete",
            StepKind::Increment { .. } => "increment",
            StepKind::Fail { .. } => "fail",
            StepKind::Sleep { .. } => "sleep",
            StepKind::Abandon => "abandon",
        }
    }

    /// Steps that need to wait cannot finish during the call.
    fn needs_async(&self) -> bool {
        matches!(self, StepKind::Sleep { .. } | StepKind::Abandon)
    }

    fn key(&self) -> Option<&str> {
        match self {
            StepKind::Put { key, .. } | StepKind::Delete { key } | StepKind::Increment { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }

    /// Apply the step's effect on the session right now.
    fn apply(&self, session: &MemorySession) -> Result<(), BoxError> {
        match self {
            StepKind::Put { key, value } => session.put(key.as_str(), value.clone())?,
            StepKind::Delete { key } => session.delete(key.as_str())?,
            StepKind::Increment { key, by } => {
                session.increment(key, *by)?;
            }
            StepKind::Fail { message } => return Err(message.clone().into()),
            StepKind::Sleep { .. } | StepKind::Abandon => {
                return Err(format!("'{}' cannot finish synchronously", self.op()).into())
            }
        }
        Ok(())
    }

    /// Run the step to completion; `None` means it abandons its report.
    async fn perform(self, session: MemorySession) -> Option<Result<(), BoxError>> {
        match self {
            StepKind::Abandon => None,
            StepKind::Sleep { ms } => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Some(Ok(()))
            }
            other => {
                tokio::task::yield_now().await;
                Some(other.apply(&session))
            }
        }
    }
}

impl Step {
    /// Turn the step into a queued action reporting through its style.
    fn into_action(
        self,
        index: usize,
    ) -> impl FnOnce(&mut MemorySession, Completion) -> Invocation + Send + 'static {
        let Step { kind, style } = self;
        move |session, done| {
            tracing::debug!(index, op = kind.op(), ?style, "step invoked");
            match style {
                Style::Ready => Invocation::Ready(kind.apply(session)),
                Style::Callback => {
                    let session = session.clone();
                    tokio::spawn(async move {
                        match kind.perform(session).await {
                            Some(result) => done.finish(result),
                            None => drop(done),
                        }
                    });
                    Invocation::Callback
                }
                Style::Emitter => {
                    let session = session.clone();
                    let (signal, emitter) = Emitter::channel();
                    tokio::spawn(async move {
                        match kind.perform(session).await {
                            Some(Ok(())) => signal.success(),
                            Some(Err(e)) => signal.failure(e),
                            None => drop(signal),
                        }
                    });
                    emitter.into()
                }
            }
        }
    }
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        if !path.exists() {
            return Err(PlanError::NotFound(path.to_path_buf()));
        }
        let data = std::fs::read_to_string(path)?;
        Self::parse(&data)
    }

    pub fn parse(data: &str) -> Result<Self, PlanError> {
        Ok(serde_yaml::from_str(data)?)
    }

    pub fn validate(&self) -> Vec<PlanIssue> {
        let mut issues = Vec::new();
        for (step, s) in self.steps.iter().enumerate() {
            let mut issue = |message: String| issues.push(PlanIssue { step, message });

            if s.kind.key().is_some_and(|k| k.trim().is_empty()) {
                issue(format!("'{}' needs a non-empty key", s.kind.op()));
            }
            match &s.kind {
                StepKind::Increment { by: 0, .. } => {
                    issue("'increment' by 0 has no effect".to_string())
                }
                StepKind::Fail { message } if message.trim().is_empty() => {
                    issue("'fail' needs a message".to_string())
                }
                _ => {}
            }
            if s.style == Style::Ready && s.kind.needs_async() {
                issue(format!(
                    "'{}' cannot use the ready style; use callback or emitter",
                    s.kind.op()
                ));
            }
        }
        issues
    }

    /// Validate, then seed a store and queue every step on a sequencer.
    pub fn build(self, config: SequencerConfig) -> Result<(MemoryStore, Sequencer<MemoryStore>), PlanError> {
        let issues = self.validate();
        if !issues.is_empty() {
            return Err(PlanError::Invalid(issues));
        }
        let store = MemoryStore::with_data(self.seed);
        let sequencer = self
            .steps
            .into_iter()
            .enumerate()
            .fold(Sequencer::with_config(store.clone(), config), |seq, (i, step)| {
                seq.add(step.into_action(i))
            });
        Ok((store, sequencer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use txseq_core::{ActionError, SequencerError};

    const ACCOUNT: &str = "
seed:
  checking: 100
steps:
  - op: increment
    key: checking
    by: -25
";

    #[test]
    fn parses_steps_and_styles() {
        let plan = Plan::parse(
            "
steps:
  - op: put
    key: owner
    value: { name: ada }
    style: ready
  - op: sleep
    ms: 5
    style: emitter
  - op: abandon
",
        )
        .unwrap();
        assert!(plan.seed.is_empty());
        assert_eq!(plan.steps.len(), 3);
        assert!(matches!(&plan.steps[0].kind, StepKind::Put { value, .. } if *value == json!({"name": "ada"})));
        assert_eq!(plan.steps[0].style, Style::Ready);
        assert_eq!(plan.steps[1].style, Style::Emitter);
        assert_eq!(plan.steps[2].style, Style::Callback);
        assert!(plan.validate().is_empty());
    }

    #[test]
    fn unknown_op_is_rejected() {
        assert!(matches!(
            Plan::parse("steps:\n  - op: transfer\n"),
            Err(PlanError::Yaml(_))
        ));
    }

    #[test]
    fn validate_reports_every_issue() {
        let plan = Plan::parse(
            "
steps:
  - op: put
    key: ''
    value: 1
  - op: increment
    key: n
    by: 0
  - op: sleep
    ms: 1
    style: ready
  - op: fail
    message: ' '
",
        )
        .unwrap();
        let steps: Vec<usize> = plan.validate().iter().map(|i| i.step).collect();
        assert_eq!(steps, [0, 1, 2, 3]);

        let err = plan.build(SequencerConfig::default()).err().unwrap();
        assert!(err.to_string().starts_with("plan has 4 invalid step(s); first: step 0"));
    }

    #[tokio::test]
    async fn account_plan_commits() {
        for style in ["callback", "emitter", "ready"] {
            let yaml = format!("{ACCOUNT}    style: {style}\n");
            let (store, seq) = Plan::parse(&yaml)
                .unwrap()
                .build(SequencerConfig::default())
                .unwrap();
            seq.run().await.unwrap();
            assert_eq!(store.get("checking"), Some(json!(75)), "{style}");
        }
    }

    #[tokio::test]
    async fn failing_step_reverts_the_account() {
        let yaml = format!(
            "{ACCOUNT}  - op: fail\n    message: unable to save the account\n    style: emitter\n"
        );
        let (store, seq) = Plan::parse(&yaml)
            .unwrap()
            .build(SequencerConfig::default())
            .unwrap();
        let err = seq.run().await.unwrap_err();
        assert_eq!(err.to_string(), "unable to save the account");
        assert_eq!(err.failed_index(), Some(1));
        assert_eq!(store.get("checking"), Some(json!(100)));
    }

    #[tokio::test]
    async fn abandoned_step_fails_the_run() {
        let (store, seq) = Plan::parse("steps:\n  - op: put\n    key: k\n    value: 1\n  - op: abandon\n")
            .unwrap()
            .build(SequencerConfig::default())
            .unwrap();
        let err = seq.run().await.unwrap_err();
        assert!(matches!(
            err,
            SequencerError::Action {
                error: ActionError::Abandoned,
                ..
            }
        ));
        assert_eq!(store.get("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_step_hits_the_action_timeout() {
        let config = SequencerConfig::default().with_action_timeout(Duration::from_millis(10));
        let (_store, seq) = Plan::parse("steps:\n  - op: sleep\n    ms: 1000\n")
            .unwrap()
            .build(config)
            .unwrap();
        let err = seq.run().await.unwrap_err();
        assert!(matches!(err, SequencerError::ActionTimedOut { index: 0, .. }));
    }
}
