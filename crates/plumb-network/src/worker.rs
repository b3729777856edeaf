//! Thread-confined execution for namespace-switching work.
//!
//! `setns(CLONE_NEWNET)` changes the namespace of the calling OS thread only,
//! and a multi-threaded runtime may move a task between threads at any await
//! point. Migrations therefore run on a dedicated thread with its own
//! current-thread runtime; the thread exits when the work is done, so a
//! context that failed to restore never leaks into other tasks.

use std::future::Future;
use std::thread;

use plumb_common::{PlumbError, PlumbResult};
use tokio::sync::oneshot;

/// Run `work` to completion on a fresh OS thread and block until it finishes.
///
/// `work` receives nothing and builds whatever driver it needs on that thread.
///
/// # Errors
///
/// Returns [`PlumbError::Internal`] if the thread or runtime cannot be started
/// or the work panics; otherwise the work's own result.
pub fn run_confined<F, Fut, T>(name: &str, work: F) -> PlumbResult<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = PlumbResult<T>>,
    T: Send + 'static,
{
    let handle = thread::Builder::new()
        .name(name.to_string())
        .spawn(move || drive(work))?;

    handle.join().map_err(|_| PlumbError::Internal {
        message: format!("confined worker '{name}' panicked"),
    })?
}

/// Async variant of [`run_confined`] that does not block the caller's runtime.
///
/// # Errors
///
/// Same as [`run_confined`].
pub async fn spawn_confined<F, Fut, T>(name: &str, work: F) -> PlumbResult<T>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = PlumbResult<T>>,
    T: Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let _ = tx.send(drive(work));
        })?;

    rx.await.map_err(|_| PlumbError::Internal {
        message: format!("confined worker '{name}' exited without a result"),
    })?
}

fn drive<F, Fut, T>(work: F) -> PlumbResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = PlumbResult<T>>,
{
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(work())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_on_a_named_thread() {
        let caller = thread::current().id();
        let (id, name) = run_confined("plumb-test", || async {
            let current = thread::current();
            Ok((current.id(), current.name().map(str::to_string)))
        })
        .unwrap();
        assert_ne!(id, caller);
        assert_eq!(name.as_deref(), Some("plumb-test"));
    }

    #[test]
    fn propagates_work_errors() {
        let err = run_confined::<_, _, ()>("plumb-test", || async {
            Err(PlumbError::invalid_argument("bad"))
        })
        .unwrap_err();
        assert!(matches!(err, PlumbError::InvalidArgument { .. }));
    }

    #[test]
    fn panics_become_internal_errors() {
        let err = run_confined("plumb-test", || async {
            let fail = true;
            if fail {
                panic!("boom");
            }
            Ok(())
        })
        .unwrap_err();
        assert!(matches!(err, PlumbError::Internal { .. }));
    }

    #[tokio::test]
    async fn spawn_confined_returns_result() {
        let value = spawn_confined("plumb-test", || async {
            tokio::task::yield_now().await;
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
    }
}
