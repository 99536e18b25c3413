use parking_lot::Mutex;
use tokio::sync::oneshot;

enum NotifierState {
    Idle,
    Waiting(oneshot::Sender<()>),
    Notified,
}

/// A one-shot event with at most one observer.
///
/// `wait` completes immediately if the event already fired. Registering a
/// second observer while one is pending is a programming error.
pub struct Notifier {
    what: &'static str,
    state: Mutex<NotifierState>,
}

impl Notifier {
    pub fn new(what: &'static str) -> Self {
        Notifier {
            what,
            state: Mutex::new(NotifierState::Idle),
        }
    }

    /// Fire the event, resuming the observer if one is registered.
    /// Subsequent `wait` calls complete immediately.
    pub fn notify(&self) {
        let previous = std::mem::replace(&mut *self.state.lock(), NotifierState::Notified);
        if let NotifierState::Waiting(sender) = previous {
            let _ = sender.send(());
        }
    }

    pub async fn wait(&self) {
        let rx = {
            let mut state = self.state.lock();
            match &*state {
                NotifierState::Notified => return,
                // A waiter whose future was dropped (a lost select race) may
                // be replaced; two live observers is a bug.
                NotifierState::Waiting(existing) if !existing.is_closed() => {
                    panic!("cannot register two {} observers", self.what)
                }
                NotifierState::Waiting(_) | NotifierState::Idle => {
                    let (tx, rx) = oneshot::channel();
                    *state = NotifierState::Waiting(tx);
                    rx
                }
            }
        };
        // The sender is only ever consumed by notify(), so an error here
        // means the notifier was dropped mid-wait; treat it as fired.
        let _ = rx.await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn notify_before_wait_completes_immediately() {
        let notifier = Notifier::new("test");
        notifier.notify();
        tokio::time::timeout(Duration::from_secs(1), notifier.wait())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn notify_resumes_pending_waiter() {
        let notifier = Arc::new(Notifier::new("test"));
        let waiter = tokio::spawn({
            let notifier = notifier.clone();
            async move { notifier.wait().await }
        });
        tokio::task::yield_now().await;
        notifier.notify();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
