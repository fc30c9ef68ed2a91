//! Task helpers
use std::future::Future;

use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Spawn a named task and exit the process if it panics.
pub fn spawn<T>(name: &'static str, future: T) -> JoinHandle<()>
where
    T: Future + Send + 'static,
    T::Output: Send + 'static,
{
    let task = tokio::spawn(future);

    tokio::spawn(async move {
        match task.await {
            Ok(_) => {
                debug!(task = name, "Task terminated normally");
            }
            Err(err) => {
                error!(task = name, "Task aborted with error: {err}");
                std::process::exit(1);
            }
        }
    })
}
