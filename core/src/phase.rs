//! Coarse task phases derived from observed pod status.

use std::fmt;

use chrono::DateTime;
use chrono::Utc;

/// A coarse task phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// The observation could not be classified.
    Undefined,
    /// The pod is waiting to be scheduled.
    Queued,
    /// The pod is scheduled and its containers are being prepared.
    Initializing,
    /// The primary container is running.
    Running,
    /// The task finished successfully.
    Success,
    /// The task failed; the failure counts against the user's retry budget.
    RetryableFailure,
    /// The task failed due to the platform; the failure does not count
    /// against the user's retry budget.
    SystemRetryableFailure,
    /// The task failed and must not be retried.
    PermanentFailure,
}

impl Phase {
    /// Determines whether the phase is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success
                | Self::RetryableFailure
                | Self::SystemRetryableFailure
                | Self::PermanentFailure
        )
    }

    /// Determines whether the phase represents a failure.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::RetryableFailure | Self::SystemRetryableFailure | Self::PermanentFailure
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undefined => write!(f, "undefined"),
            Self::Queued => write!(f, "queued"),
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::Success => write!(f, "success"),
            Self::RetryableFailure => write!(f, "retryable failure"),
            Self::SystemRetryableFailure => write!(f, "system retryable failure"),
            Self::PermanentFailure => write!(f, "permanent failure"),
        }
    }
}

/// Prior information about a task carried between interpretations.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskInfo {
    /// When the observation that produced this info occurred.
    pub occurred_at: Option<DateTime<Utc>>,
}

impl TaskInfo {
    /// Creates a [`TaskInfo`] that occurred at the given time.
    pub fn occurred_at(at: DateTime<Utc>) -> Self {
        Self {
            occurred_at: Some(at),
        }
    }
}

/// A classified pod observation.
#[derive(Debug, Clone)]
pub struct PhaseInfo {
    /// The phase of the observation.
    phase: Phase,
    /// A short reason code for the phase.
    reason: Option<String>,
    /// A human-readable message accompanying the reason.
    message: Option<String>,
    /// When the observation occurred.
    occurred_at: Option<DateTime<Utc>>,
    /// Whether the pod should be cleaned up as a result of the observation.
    cleanup: bool,
}

impl PhaseInfo {
    /// Creates a new [`PhaseInfo`] with the given phase.
    fn new(phase: Phase) -> Self {
        Self {
            phase,
            reason: None,
            message: None,
            occurred_at: None,
            cleanup: false,
        }
    }

    /// Creates an undefined observation.
    pub fn undefined() -> Self {
        Self::new(Phase::Undefined)
    }

    /// Creates a queued observation with the given transition time and reason.
    pub fn queued(occurred_at: DateTime<Utc>, reason: impl Into<String>) -> Self {
        Self {
            occurred_at: Some(occurred_at),
            reason: Some(reason.into()),
            ..Self::new(Phase::Queued)
        }
    }

    /// Creates an initializing observation.
    pub fn initializing(
        occurred_at: DateTime<Utc>,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            occurred_at: Some(occurred_at),
            reason: Some(reason.into()),
            message: Some(message.into()),
            ..Self::new(Phase::Initializing)
        }
    }

    /// Creates a running observation.
    pub fn running(info: &TaskInfo) -> Self {
        Self {
            occurred_at: info.occurred_at,
            ..Self::new(Phase::Running)
        }
    }

    /// Creates a successful observation.
    pub fn success(info: &TaskInfo) -> Self {
        Self {
            occurred_at: info.occurred_at,
            ..Self::new(Phase::Success)
        }
    }

    /// Creates a retryable failure observation.
    ///
    /// Retryable failures count against the user's retry budget.
    pub fn retryable_failure(
        reason: impl Into<String>,
        message: impl Into<String>,
        info: &TaskInfo,
    ) -> Self {
        Self {
            reason: Some(reason.into()),
            message: Some(message.into()),
            occurred_at: info.occurred_at,
            ..Self::new(Phase::RetryableFailure)
        }
    }

    /// Creates a system retryable failure observation.
    ///
    /// System retryable failures do not count against the user's retry
    /// budget.
    pub fn system_retryable_failure(
        reason: impl Into<String>,
        message: impl Into<String>,
        info: &TaskInfo,
    ) -> Self {
        Self {
            reason: Some(reason.into()),
            message: Some(message.into()),
            occurred_at: info.occurred_at,
            ..Self::new(Phase::SystemRetryableFailure)
        }
    }

    /// Creates a permanent failure observation.
    pub fn failure(
        reason: impl Into<String>,
        message: impl Into<String>,
        info: &TaskInfo,
    ) -> Self {
        Self {
            reason: Some(reason.into()),
            message: Some(message.into()),
            occurred_at: info.occurred_at,
            ..Self::new(Phase::PermanentFailure)
        }
    }

    /// Marks the observation as requiring pod cleanup.
    pub fn with_cleanup(mut self) -> Self {
        self.cleanup = true;
        self
    }

    /// Replaces the occurrence time of the observation.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(occurred_at);
        self
    }

    /// Gets the phase of the observation.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Gets the reason code of the observation.
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Gets the message of the observation.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Gets when the observation occurred.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.occurred_at
    }

    /// Determines whether the pod should be cleaned up as a result of the
    /// observation.
    pub fn cleanup(&self) -> bool {
        self.cleanup
    }
}
