use std::fmt;
use thiserror::Error;

/// One create call that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateFailure {
    pub path: String,
    pub line: usize,
    pub message: String,
}

impl fmt::Display for CreateFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: {}", self.path, self.line, self.message)
    }
}

#[derive(Debug, Error)]
pub enum FlushError {
    /// Existing comments could not be listed, so nothing was posted.
    #[error("{backend}: failed to list existing comments: {error:#}")]
    List {
        backend: String,
        error: anyhow::Error,
    },

    #[error(
        "{backend}: {} of {attempted} comments failed to post: {}",
        .failures.len(),
        join(.failures)
    )]
    Create {
        backend: String,
        attempted: usize,
        posted: usize,
        failures: Vec<CreateFailure>,
    },

    /// The caller's cancellation token fired. Never retried internally.
    #[error("{backend}: cancelled after posting {posted} of {eligible} comments")]
    Cancelled {
        backend: String,
        eligible: usize,
        posted: usize,
        failures: Vec<CreateFailure>,
    },

    #[error("{}", join(.0))]
    Multiple(Vec<FlushError>),
}

impl FlushError {
    pub fn is_cancelled(&self) -> bool {
        match self {
            FlushError::Cancelled { .. } => true,
            FlushError::Multiple(errors) => errors.iter().any(FlushError::is_cancelled),
            _ => false,
        }
    }

    /// Every individual create failure, across nested errors
    pub fn failures(&self) -> Vec<&CreateFailure> {
        match self {
            FlushError::Create { failures, .. } | FlushError::Cancelled { failures, .. } => {
                failures.iter().collect()
            }
            FlushError::Multiple(errors) => errors.iter().flat_map(|e| e.failures()).collect(),
            FlushError::List { .. } => Vec::new(),
        }
    }

    /// Flatten a list of backend errors into one; `None` when empty.
    pub fn combine(mut errors: Vec<FlushError>) -> Option<FlushError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(FlushError::Multiple(errors)),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
