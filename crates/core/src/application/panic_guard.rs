// Panic isolation for worker safety
//
// Processors run inside their own spawned task; a panic surfaces as a
// JoinError on the worker side and becomes an ordinary job failure.
use std::any::Any;
use tokio::task::JoinError;
use tracing::error;

/// Outcome of awaiting an isolated processor task
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Task ran to completion
    Success(T),
    /// Task panicked
    Panicked(String),
    /// Task was aborted (stalled-job sweep reclaimed it)
    Cancelled,
}

impl<T> From<Result<T, JoinError>> for PanicGuardResult<T> {
    fn from(result: Result<T, JoinError>) -> Self {
        match result {
            Ok(value) => PanicGuardResult::Success(value),
            Err(err) if err.is_panic() => {
                let msg = panic_message(err.into_panic());
                error!(panic_msg = %msg, "Processor task panicked");
                PanicGuardResult::Panicked(msg)
            }
            Err(_) => PanicGuardResult::Cancelled,
        }
    }
}

/// Extract a readable message from a panic payload
pub fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_is_captured() {
        let handle = tokio::spawn(async {
            panic!("boom");
        });
        match PanicGuardResult::<()>::from(handle.await) {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_abort_is_cancelled() {
        let handle = tokio::spawn(futures::future::pending::<()>());
        handle.abort();
        assert!(matches!(
            PanicGuardResult::from(handle.await),
            PanicGuardResult::Cancelled
        ));
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let handle = tokio::spawn(async { 42 });
        assert!(matches!(
            PanicGuardResult::from(handle.await),
            PanicGuardResult::Success(42)
        ));
    }
}
