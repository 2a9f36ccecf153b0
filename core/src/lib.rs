//! Task model, execution context, and phase outcomes for the gantry pod
//! construction core.

pub mod context;
pub mod phase;
pub mod task;

pub use context::TaskExecutionContext;
pub use phase::Phase;
pub use phase::PhaseInfo;
pub use task::TaskDefinition;

/// Represents an error surfaced by the pod construction core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The task definition (or an override supplied with it) was structurally
    /// invalid.
    ///
    /// These errors are never retried; callers treat them as permanent.
    #[error("bad task specification: {0}")]
    BadTaskSpecification(String),
    /// A pod template was named by the task but is not present in the store.
    #[error("pod template `{0}` does not exist")]
    TemplateNotFound(String),
    /// Another type of error occurred.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Creates a [`Error::BadTaskSpecification`] from a message.
    pub fn bad_task_spec(message: impl Into<String>) -> Self {
        Self::BadTaskSpecification(message.into())
    }
}

/// The result type for pod construction operations.
pub type Result<T> = std::result::Result<T, Error>;
