//! Single-assignment connection outcome
//!
//! A connect attempt produces a [`ConnectionResult`] immediately; the
//! outcome is decided later, once every handshake layer has passed (or any
//! of them failed). The result completes at most once no matter how many
//! paths race to complete it, and can be observed by polling, awaiting, or
//! registering a callback.

use super::NetError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Outcome of a connect attempt
#[derive(Debug, Clone, Default)]
pub enum ConnectOutcome {
    /// Not yet decided
    #[default]
    Pending,
    /// Every configured handshake layer succeeded
    Success,
    /// The transport or one of the layers failed
    Failure(NetError),
}

impl ConnectOutcome {
    pub fn is_pending(&self) -> bool {
        matches!(self, ConnectOutcome::Pending)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ConnectOutcome::Success)
    }
}

/// Shared handle to a single-assignment connect outcome
#[derive(Debug, Clone)]
pub struct ConnectionResult {
    tx: watch::Sender<ConnectOutcome>,
}

impl ConnectionResult {
    /// Create a new pending result
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectOutcome::Pending);
        Self { tx }
    }

    /// Mark the result successful.
    ///
    /// Returns whether this call performed the transition; false if the
    /// result was already decided.
    pub fn succeed(&self) -> bool {
        self.complete(ConnectOutcome::Success)
    }

    /// Mark the result failed. First terminal transition wins.
    pub fn fail(&self, err: NetError) -> bool {
        self.complete(ConnectOutcome::Failure(err))
    }

    fn complete(&self, terminal: ConnectOutcome) -> bool {
        let mut transitioned = false;
        self.tx.send_if_modified(|outcome| {
            if outcome.is_pending() {
                *outcome = terminal;
                transitioned = true;
                true
            } else {
                false
            }
        });
        transitioned
    }

    /// Current outcome
    pub fn outcome(&self) -> ConnectOutcome {
        self.tx.borrow().clone()
    }

    /// Whether the result has been decided
    pub fn is_done(&self) -> bool {
        !self.tx.borrow().is_pending()
    }

    /// Whether the result has been decided successfully
    pub fn is_success(&self) -> bool {
        self.tx.borrow().is_success()
    }

    /// Wait for the terminal outcome
    pub async fn wait(&self) -> ConnectOutcome {
        let mut rx = self.tx.subscribe();
        loop {
            {
                let outcome = rx.borrow_and_update();
                if !outcome.is_pending() {
                    return outcome.clone();
                }
            }
            // All senders are held by this handle's clones; if they are all
            // dropped the result can never complete, report it as closed.
            if rx.changed().await.is_err() {
                return ConnectOutcome::Failure(NetError::Closed(
                    "connect attempt abandoned".to_string(),
                ));
            }
        }
    }

    /// Wait for the terminal outcome, bounded by `timeout`.
    ///
    /// Returns `None` if the result is still pending when the timeout fires.
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ConnectOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    /// Register a callback invoked once with the terminal outcome.
    pub fn on_complete<F, Fut>(&self, f: F)
    where
        F: FnOnce(ConnectOutcome) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let this = self.clone();
        tokio::spawn(async move {
            let outcome = this.wait().await;
            f(outcome).await;
        });
    }
}

impl Default for ConnectionResult {
    fn default() -> Self {
        Self::new()
    }
}
