// Per-task cancellation handle shared by scheduler, engine and sandbox
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Explicit cancel request
    User,
    /// The task timeout elapsed
    Deadline,
}

/// Sending half, owned by the scheduler
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<Option<CancelReason>>,
}

/// Receiving half, cloned into the engine and the sandbox supervisor
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<Option<CancelReason>>,
}

pub fn cancel_pair() -> (CancelHandle, CancelToken) {
    let (tx, rx) = watch::channel(None);
    (CancelHandle { tx }, CancelToken { rx })
}

impl CancelHandle {
    /// Fire the cancellation. The first reason wins.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }
}

impl CancelToken {
    /// A token that is never cancelled
    pub fn never() -> Self {
        let (_, token) = cancel_pair();
        token
    }

    pub fn reason(&self) -> Option<CancelReason> {
        *self.rx.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }

    /// Resolve once cancellation fires. Never resolves if the handle is
    /// dropped without cancelling.
    pub async fn cancelled(&mut self) -> CancelReason {
        loop {
            if let Some(reason) = *self.rx.borrow_and_update() {
                return reason;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_reason_wins() {
        let (handle, token) = cancel_pair();
        assert!(!token.is_cancelled());
        assert!(handle.cancel(CancelReason::Deadline));
        assert!(!handle.cancel(CancelReason::User));
        assert_eq!(token.reason(), Some(CancelReason::Deadline));
    }

    #[tokio::test]
    async fn test_cancelled_resolves() {
        let (handle, mut token) = cancel_pair();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        handle.cancel(CancelReason::User);
        assert_eq!(waiter.await.unwrap(), CancelReason::User);
    }

    #[test]
    fn test_never_token() {
        let token = CancelToken::never();
        assert!(!token.is_cancelled());
    }
}
