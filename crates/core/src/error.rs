use serde::{Deserialize, Serialize};

use crate::ChildIdentity;

/// A child the deleter could not remove, with the reason it gave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteFailure {
    pub identity: ChildIdentity,
    pub reason: String,
}

/// Errors surfaced by a reconciliation cycle.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BroodError {
    /// Parent payload could not be interpreted by the generator.
    #[error("generation: {0}")]
    Generation(String),
    /// A generator emitted two children with the same identity.
    #[error("generation: duplicate child identity {0}")]
    DuplicateIdentity(ChildIdentity),
    #[error("invalid object: {0}")]
    InvalidObject(String),
    /// A mutation step rejected the (parent, children) pair.
    #[error("mutation: step {step}: {reason}")]
    Mutation { step: String, reason: String },
    /// Some of the deletion set is still present.
    #[error("partial deletion: {deleted} of {requested} deleted, {} failed", .failures.len())]
    PartialDeletion { requested: usize, deleted: usize, failures: Vec<DeleteFailure> },
    #[error("apply: {0}")]
    Apply(String),
    #[error("cluster: {0}")]
    Cluster(String),
}

/// Coarse classification the orchestrator uses to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Generation,
    Mutation,
    PartialDeletion,
    Transient,
}

impl ErrorKind {
    /// Generation and mutation failures repeat until the parent changes.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::PartialDeletion | ErrorKind::Transient)
    }
}

impl BroodError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BroodError::Generation(_) | BroodError::DuplicateIdentity(_) | BroodError::InvalidObject(_) => ErrorKind::Generation,
            BroodError::Mutation { .. } => ErrorKind::Mutation,
            BroodError::PartialDeletion { .. } => ErrorKind::PartialDeletion,
            BroodError::Apply(_) | BroodError::Cluster(_) => ErrorKind::Transient,
        }
    }

    pub fn mutation(step: impl Into<String>, reason: impl Into<String>) -> Self {
        BroodError::Mutation { step: step.into(), reason: reason.into() }
    }
}

pub type Result<T, E = BroodError> = std::result::Result<T, E>;
