use std::fmt::Display;
use std::future::Future;

use tokio::task::JoinHandle;

/// Start a detached task ("virtual thread") whose failure is logged rather
/// than propagated. Nothing escapes to the runtime: the error path of every
/// detached chain ends here.
pub fn spawn_logged<F, E>(name: &'static str, fut: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display,
{
    tokio::spawn(async move {
        if let Err(e) = fut.await {
            log::error!("{name}: {e}");
        }
    })
}
