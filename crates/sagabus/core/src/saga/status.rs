//! Saga instance status machine.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a saga instance.
///
/// Valid transitions:
///
/// ```text
/// Created ── start ──► InProgress
/// InProgress ── progress ──► InProgress
/// InProgress ── complete ──► Completed   (terminal)
/// InProgress ── fail ──► Failed          (terminal)
/// InProgress ── compensate ──► Compensating
/// Compensating ── complete ──► Completed (terminal)
/// Compensating ── fail ──► Failed        (terminal)
/// <non-terminal> ── recover ──► Recovering
/// Recovering ── progress/complete/fail ──► as above
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    #[default]
    Created,
    InProgress,
    Compensating,
    Completed,
    Failed,
    Recovering,
}

/// Operation applied to a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Start,
    Progress,
    Complete,
    Fail,
    Compensate,
    Recover,
}

impl std::fmt::Display for Transition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Transition::Start => "start",
            Transition::Progress => "progress",
            Transition::Complete => "complete",
            Transition::Fail => "fail",
            Transition::Compensate => "compensate",
            Transition::Recover => "recover",
        };
        f.write_str(name)
    }
}

/// Error for transitions outside the table above.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid saga status transition: {from} via {via}")]
pub struct StatusError {
    pub from: SagaStatus,
    pub via: Transition,
}

impl SagaStatus {
    /// Terminal statuses reject further event handling.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SagaStatus::Completed)
    }

    /// Statuses from which a routine event turn may progress.
    pub fn can_progress(&self) -> bool {
        matches!(self, SagaStatus::InProgress | SagaStatus::Recovering)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Created => "created",
            SagaStatus::InProgress => "in_progress",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Recovering => "recovering",
        }
    }

    /// Apply a transition, yielding the next status.
    pub fn apply(self, via: Transition) -> Result<SagaStatus, StatusError> {
        use SagaStatus::*;
        use Transition::*;

        match (self, via) {
            (Created, Start) => Ok(InProgress),
            (InProgress, Progress) => Ok(InProgress),
            (InProgress, Complete) => Ok(Completed),
            (InProgress, Fail) => Ok(Failed),
            (InProgress, Compensate) => Ok(Compensating),
            (Compensating, Complete) => Ok(Completed),
            (Compensating, Fail) => Ok(Failed),
            (Recovering, Progress) => Ok(InProgress),
            (Recovering, Complete) => Ok(Completed),
            (Recovering, Fail) => Ok(Failed),
            (from, Recover) if !from.is_terminal() => Ok(Recovering),
            (from, via) => Err(StatusError { from, via }),
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(SagaStatus::Created),
            "in_progress" => Ok(SagaStatus::InProgress),
            "compensating" => Ok(SagaStatus::Compensating),
            "completed" => Ok(SagaStatus::Completed),
            "failed" => Ok(SagaStatus::Failed),
            "recovering" => Ok(SagaStatus::Recovering),
            other => Err(format!("unknown saga status: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SagaStatus::*;
    use Transition::*;

    #[test]
    fn default_status_is_created() {
        assert_eq!(SagaStatus::default(), Created);
    }

    #[test]
    fn valid_forward_path() {
        let status = Created.apply(Start).unwrap();
        assert_eq!(status, InProgress);
        let status = status.apply(Progress).unwrap();
        assert_eq!(status, InProgress);
        assert_eq!(status.apply(Complete).unwrap(), Completed);
    }

    #[test]
    fn compensation_path() {
        let status = InProgress.apply(Compensate).unwrap();
        assert_eq!(status, Compensating);
        assert_eq!(status.apply(Complete).unwrap(), Completed);
        assert_eq!(status.apply(Fail).unwrap(), Failed);
    }

    #[test]
    fn recovery_path() {
        for from in [Created, InProgress, Compensating, Recovering] {
            assert_eq!(from.apply(Recover).unwrap(), Recovering);
        }
        assert_eq!(Recovering.apply(Progress).unwrap(), InProgress);
        assert_eq!(Recovering.apply(Complete).unwrap(), Completed);
        assert_eq!(Recovering.apply(Fail).unwrap(), Failed);
    }

    #[test]
    fn terminal_statuses_accept_nothing() {
        for from in [Completed, Failed] {
            for via in [Start, Progress, Complete, Fail, Compensate, Recover] {
                assert!(from.apply(via).is_err(), "{from} via {via} should fail");
            }
        }
    }

    #[test]
    fn start_only_from_created() {
        for from in [InProgress, Compensating, Recovering] {
            assert!(from.apply(Start).is_err());
        }
    }

    #[test]
    fn progress_not_allowed_from_compensating() {
        let err = Compensating.apply(Progress).unwrap_err();
        assert_eq!(err.from, Compensating);
        assert_eq!(err.via, Progress);
    }

    #[test]
    fn terminal_predicates() {
        assert!(Completed.is_terminal());
        assert!(Failed.is_terminal());
        assert!(!Compensating.is_terminal());
        assert!(Completed.is_completed());
        assert!(!Failed.is_completed());
    }

    #[test]
    fn string_round_trip() {
        for status in [Created, InProgress, Compensating, Completed, Failed, Recovering] {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<SagaStatus>().is_err());
    }
}
