// Domain Error Types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid queue status transition: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("Invalid job state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Attempts exhausted for job {job_id}: {attempts}/{max_attempts}")]
    AttemptsExhausted {
        job_id: String,
        attempts: u32,
        max_attempts: u32,
    },

    #[error("Invalid thresholds: {0}")]
    InvalidThresholds(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

pub type Result<T> = std::result::Result<T, DomainError>;
