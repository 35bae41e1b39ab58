use futures_channel::oneshot;
use futures_util::FutureExt;
use futures_util::future::Shared;

use std::sync::{Arc, Mutex};

type Signal = Shared<oneshot::Receiver<()>>;

/// Cancellation scope for one run.
///
/// Cancelling a scope cancels every scope derived from it with [`CancelScope::child`]; cancelling
/// a child leaves the parent untouched. Clones share the same state.
#[derive(Clone)]
pub struct CancelScope {
    inner: Arc<ScopeInner>,
}

struct ScopeInner {
    trigger: Mutex<Option<oneshot::Sender<()>>>,
    // Own signal first, then every ancestor's.
    signals: Vec<Signal>,
}

impl std::fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelScope")
            .field("depth", &self.inner.signals.len())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Default for CancelScope {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelScope {
    /// A root scope that is only cancelled explicitly.
    pub fn new() -> Self {
        Self::with_ancestors(Vec::new())
    }

    /// Derive a scope that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        Self::with_ancestors(self.inner.signals.clone())
    }

    fn with_ancestors(ancestors: Vec<Signal>) -> Self {
        let (tx, rx) = oneshot::channel();
        let mut signals = Vec::with_capacity(ancestors.len() + 1);
        signals.push(rx.shared());
        signals.extend(ancestors);
        Self {
            inner: Arc::new(ScopeInner {
                trigger: Mutex::new(Some(tx)),
                signals,
            }),
        }
    }

    /// Cancel this scope and its descendants. Idempotent.
    pub fn cancel(&self) {
        let sender = match self.inner.trigger.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = sender {
            let _ = tx.send(());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .signals
            .iter()
            .any(|s| matches!(s.clone().now_or_never(), Some(Ok(()))))
    }

    /// Resolves once this scope or any ancestor is cancelled.
    ///
    /// Dropping every handle to an ancestor does not count as cancellation.
    pub async fn cancelled(&self) {
        let waits = self.inner.signals.iter().cloned().map(|s| {
            Box::pin(async move {
                if s.await.is_err() {
                    futures_util::future::pending::<()>().await;
                }
            })
        });
        let _ = futures_util::future::select_all(waits).await;
    }
}
