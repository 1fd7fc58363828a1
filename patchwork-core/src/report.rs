use serde::Serialize;
use std::fmt;

use crate::descriptor::{PatchId, PatchKind};
use crate::instruction::MethodRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The declared method does not exist on this host.
    TargetNotFound,
    /// A rewrite's search matched nothing (or matched ambiguously).
    PatternNotFound,
    /// A rewrite produced a structurally invalid or unbalanced body.
    ImbalancedEdit,
    /// Conflicting kinds on one target, or a descriptor installed twice.
    InstallConflict,
    /// The host could not provide or accept the method.
    HostError,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureReason::TargetNotFound => "target not found",
            FailureReason::PatternNotFound => "pattern not found",
            FailureReason::ImbalancedEdit => "imbalanced edit",
            FailureReason::InstallConflict => "install conflict",
            FailureReason::HostError => "host error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Version or capability gate evaluated false. Never reported.
    GateClosed,
    /// Turned off by session configuration.
    Disabled,
    /// Another `Replace` with a lower priority won the target.
    Superseded { by: PatchId },
    /// Held back because the target's patch set conflicts.
    Conflict { with: PatchId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PatchState {
    Applied,
    Skipped { reason: SkipReason },
    Failed { reason: FailureReason, detail: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchOutcome {
    pub patch: PatchId,
    pub target: MethodRef,
    pub kind: PatchKind,
    #[serde(flatten)]
    pub state: PatchState,
}

impl PatchOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self.state, PatchState::Applied)
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self.state {
            PatchState::Failed { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Outcomes the user should see: every failure, and skips other than a
    /// closed gate.
    pub fn is_reportable(&self) -> bool {
        match &self.state {
            PatchState::Applied => false,
            PatchState::Skipped { reason } => *reason != SkipReason::GateClosed,
            PatchState::Failed { .. } => true,
        }
    }
}

impl fmt::Display for PatchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} on {}: ", self.kind, self.patch, self.target)?;
        match &self.state {
            PatchState::Applied => f.write_str("applied"),
            PatchState::Skipped { reason } => match reason {
                SkipReason::GateClosed => f.write_str("skipped (not applicable to this host)"),
                SkipReason::Disabled => f.write_str("skipped (disabled)"),
                SkipReason::Superseded { by } => write!(f, "skipped (superseded by {})", by),
                SkipReason::Conflict { with } => write!(f, "skipped (conflicts with {})", with),
            },
            PatchState::Failed { reason, detail } => write!(f, "FAILED, {}: {}", reason, detail),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeSummary {
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl OutcomeSummary {
    pub fn tally<'a, I>(outcomes: I) -> Self
    where
        I: IntoIterator<Item = &'a PatchOutcome>,
    {
        let mut summary = OutcomeSummary::default();
        for outcome in outcomes {
            match outcome.state {
                PatchState::Applied => summary.applied += 1,
                PatchState::Skipped { .. } => summary.skipped += 1,
                PatchState::Failed { .. } => summary.failed += 1,
            }
        }
        summary
    }
}

impl fmt::Display for OutcomeSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} applied, {} skipped, {} failed",
            self.applied, self.skipped, self.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(state: PatchState) -> PatchOutcome {
        PatchOutcome {
            patch: PatchId::new("fixes", "gravity"),
            target: MethodRef::new("Physics", "Step"),
            kind: PatchKind::StreamRewrite,
            state,
        }
    }

    #[test]
    fn gate_skips_are_silent() {
        assert!(!outcome(PatchState::Skipped { reason: SkipReason::GateClosed }).is_reportable());
        assert!(outcome(PatchState::Skipped { reason: SkipReason::Disabled }).is_reportable());
        assert!(!outcome(PatchState::Applied).is_reportable());
    }

    #[test]
    fn failure_renders_reason_and_detail() {
        let o = outcome(PatchState::Failed {
            reason: FailureReason::PatternNotFound,
            detail: "pattern 'x' matched nothing".into(),
        });
        assert_eq!(o.failure(), Some(FailureReason::PatternNotFound));
        assert_eq!(
            o.to_string(),
            "[rewrite] fixes/gravity on Physics::Step(): FAILED, pattern not found: pattern 'x' matched nothing"
        );
    }

    #[test]
    fn summary_counts_states() {
        let all = vec![
            outcome(PatchState::Applied),
            outcome(PatchState::Applied),
            outcome(PatchState::Skipped { reason: SkipReason::GateClosed }),
            outcome(PatchState::Failed {
                reason: FailureReason::TargetNotFound,
                detail: String::new(),
            }),
        ];
        let s = OutcomeSummary::tally(&all);
        assert_eq!(s, OutcomeSummary { applied: 2, skipped: 1, failed: 1 });
        assert_eq!(s.to_string(), "2 applied, 1 skipped, 1 failed");
    }
}
