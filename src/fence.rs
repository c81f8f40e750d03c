//! Write fences: barriers that delay a method's acknowledgment until every
//! observer affected by the method's writes has caught up. Each write
//! against the store registers itself on the fence scoped around the
//! method; the fence fires once every registered write has been committed.

use std::{
    fmt,
    sync::{Arc, Mutex as SyncMutex},
};

use tracing::warn;

use crate::{
    error::{Error, Result},
    runtime, BoxFuture,
};

tokio::task_local! {
    static CURRENT_WRITE_FENCE: WriteFence;
}

type FenceCallback = Box<dyn FnOnce(WriteFence) -> BoxFuture<'static, Result<()>> + Send>;

/// A barrier between a set of writes and the acknowledgment that depends on
/// them.
///
/// Lifecycle: created → `begin_write`* → `arm` → (once every write has
/// committed) before-fire callbacks, which may begin further writes → fire →
/// completion callbacks → `retire`. Arming is idempotent and firing is
/// single-shot; a retired fence silently hands out already-committed write
/// tokens.
#[derive(Clone)]
pub struct WriteFence {
    inner: Arc<FenceInner>,
}

struct FenceInner {
    state: SyncMutex<FenceState>,
}

struct FenceState {
    outstanding: usize,
    armed: bool,
    firing: bool,
    fired: bool,
    retired: bool,
    before_fire: Vec<FenceCallback>,
    completion: Vec<FenceCallback>,
}

impl WriteFence {
    /// Creates an unarmed fence with no outstanding writes.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FenceInner {
                state: SyncMutex::new(FenceState {
                    outstanding: 0,
                    armed: false,
                    firing: false,
                    fired: false,
                    retired: false,
                    before_fire: Vec::new(),
                    completion: Vec::new(),
                }),
            }),
        }
    }

    /// The fence scoped around the currently executing method, if any.
    /// Observers inspect this slot when an invalidation reaches them and
    /// register their catch-up work on it.
    ///
    /// The value does not survive into tasks spawned from the scope; code
    /// that needs the fence past a spawn must capture it first.
    pub fn current() -> Option<WriteFence> {
        CURRENT_WRITE_FENCE.try_with(|fence| fence.clone()).ok()
    }

    /// Runs `fut` with this fence installed as the current fence.
    pub async fn with_current<F>(&self, fut: F) -> F::Output
    where
        F: std::future::Future,
    {
        CURRENT_WRITE_FENCE.scope(self.clone(), fut).await
    }

    /// Registers the start of a write and returns its one-shot commit token.
    /// On a retired fence this is a no-op returning an already-committed
    /// token; on a fired fence it is an error.
    pub fn begin_write(&self) -> Result<WriteToken> {
        let mut state = self.inner.state.lock().unwrap();
        if state.retired {
            return Ok(WriteToken { fence: None });
        }
        if state.fired {
            return Err(Error::internal("fence has already fired"));
        }
        state.outstanding += 1;
        Ok(WriteToken {
            fence: Some(self.clone()),
        })
    }

    /// Arms the fence: once every outstanding write commits, it fires. A
    /// fence may not be armed while it is the current fence — the method it
    /// is scoped around could still add writes.
    pub async fn arm(&self) -> Result<()> {
        if let Some(current) = Self::current() {
            if Arc::ptr_eq(&current.inner, &self.inner) {
                return Err(Error::internal("can't arm the current fence"));
            }
        }
        self.inner.state.lock().unwrap().armed = true;
        self.maybe_fire().await;
        Ok(())
    }

    /// Registers a callback to run after the fence's writes have committed
    /// but before it fires. The callback receives the fence and may call
    /// `begin_write` on it to extend the fence with follow-up writes.
    pub fn on_before_fire<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(WriteFence) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.fired {
            return Err(Error::internal("fence has already fired"));
        }
        state.before_fire.push(Box::new(callback));
        Ok(())
    }

    /// Registers a callback to run once the fence has fired.
    pub fn on_all_committed<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(WriteFence) -> BoxFuture<'static, Result<()>> + Send + 'static,
    {
        let mut state = self.inner.state.lock().unwrap();
        if state.fired {
            return Err(Error::internal("fence has already fired"));
        }
        state.completion.push(Box::new(callback));
        Ok(())
    }

    /// Arms the fence and waits for it to fire.
    pub async fn arm_and_wait(&self) -> Result<()> {
        let (fired_tx, fired_rx) = tokio::sync::oneshot::channel::<()>();
        self.on_all_committed(move |_| {
            Box::pin(async move {
                let _ = fired_tx.send(());
                Ok(())
            })
        })?;
        self.arm().await?;
        fired_rx
            .await
            .map_err(|_| Error::internal("fence dropped before firing"))
    }

    /// Retires a fired fence: subsequent `begin_write` calls become no-ops.
    /// Retiring an unfired fence is an error.
    pub fn retire(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        if !state.fired {
            return Err(Error::internal("can't retire a fence that hasn't fired"));
        }
        state.retired = true;
        Ok(())
    }

    /// Whether the fence has fired.
    pub fn fired(&self) -> bool {
        self.inner.state.lock().unwrap().fired
    }

    fn release_write(&self) {
        let should_fire = {
            let mut state = self.inner.state.lock().unwrap();
            state.outstanding -= 1;
            state.outstanding == 0 && state.armed && !state.fired && !state.firing
        };
        if should_fire {
            let fence = self.clone();
            runtime::spawn(async move { fence.maybe_fire().await });
        }
    }

    async fn maybe_fire(&self) {
        // Before-fire callbacks run under a one-write shim so that writes
        // they begin cannot fire the fence out from under them.
        let before_fire = {
            let mut state = self.inner.state.lock().unwrap();
            if state.outstanding != 0 || !state.armed || state.fired || state.firing {
                return;
            }
            state.firing = true;
            state.outstanding += 1;
            std::mem::take(&mut state.before_fire)
        };
        for callback in before_fire {
            if let Err(err) = callback(self.clone()).await {
                warn!("write fence before-fire callback failed: {}", err);
            }
        }
        let completion = {
            let mut state = self.inner.state.lock().unwrap();
            state.outstanding -= 1;
            state.firing = false;
            if state.outstanding != 0 {
                // A before-fire callback began new writes; their commits
                // will re-enter once they land.
                return;
            }
            state.fired = true;
            std::mem::take(&mut state.completion)
        };
        for callback in completion {
            if let Err(err) = callback(self.clone()).await {
                warn!("write fence completion callback failed: {}", err);
            }
        }
    }
}

impl Default for WriteFence {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WriteFence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("WriteFence")
            .field("outstanding", &state.outstanding)
            .field("armed", &state.armed)
            .field("fired", &state.fired)
            .field("retired", &state.retired)
            .finish()
    }
}

/// A one-shot commit token for a single write registered on a fence. The
/// write is considered committed when `committed` is called or the token is
/// dropped.
#[derive(Debug)]
pub struct WriteToken {
    fence: Option<WriteFence>,
}

impl WriteToken {
    /// Marks the write as committed.
    pub fn committed(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(fence) = self.fence.take() {
            fence.release_write();
        }
    }
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn fence_with_no_writes_fires_on_arm() {
        let fence = WriteFence::new();
        fence.arm_and_wait().await.unwrap();
        assert!(fence.fired());
    }

    #[tokio::test]
    async fn fence_waits_for_every_write() {
        let fence = WriteFence::new();
        let a = fence.begin_write().unwrap();
        let b = fence.begin_write().unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_flag = fired.clone();
        fence
            .on_all_committed(move |_| {
                Box::pin(async move {
                    fired_flag.store(true, Ordering::SeqCst);
                    Ok(())
                })
            })
            .unwrap();
        fence.arm().await.unwrap();
        assert!(!fired.load(Ordering::SeqCst));

        a.committed();
        assert!(!fired.load(Ordering::SeqCst));

        b.committed();
        // The final commit fires from a spawned task.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn before_fire_callbacks_may_extend_the_fence() {
        let fence = WriteFence::new();
        let order = Arc::new(SyncMutex::new(Vec::<&'static str>::new()));

        let before_order = order.clone();
        fence
            .on_before_fire(move |fence| {
                Box::pin(async move {
                    before_order.lock().unwrap().push("before");
                    let extra = fence.begin_write()?;
                    let late_order = before_order.clone();
                    runtime::spawn(async move {
                        tokio::task::yield_now().await;
                        late_order.lock().unwrap().push("late write");
                        extra.committed();
                    });
                    Ok(())
                })
            })
            .unwrap();

        let completion_order = order.clone();
        fence
            .on_all_committed(move |_| {
                Box::pin(async move {
                    completion_order.lock().unwrap().push("fired");
                    Ok(())
                })
            })
            .unwrap();

        fence.arm_and_wait().await.unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["before", "late write", "fired"]);
    }

    #[tokio::test]
    async fn begin_write_after_fire_is_an_error_and_after_retire_a_noop() {
        let fence = WriteFence::new();
        fence.arm_and_wait().await.unwrap();
        assert!(fence.begin_write().is_err());

        fence.retire().unwrap();
        // Retired fences hand out pre-committed tokens.
        let token = fence.begin_write().unwrap();
        token.committed();
    }

    #[tokio::test]
    async fn retire_before_fire_is_an_error() {
        let fence = WriteFence::new();
        assert!(fence.retire().is_err());
    }

    #[tokio::test]
    async fn arming_the_current_fence_is_an_error() {
        let fence = WriteFence::new();
        let inner = fence.clone();
        let result = fence
            .with_current(async move { inner.arm().await })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn current_fence_is_scoped() {
        assert!(WriteFence::current().is_none());
        let fence = WriteFence::new();
        fence
            .with_current(async {
                assert!(WriteFence::current().is_some());
            })
            .await;
        assert!(WriteFence::current().is_none());
    }

    #[tokio::test]
    async fn dropping_a_token_counts_as_committing() {
        let fence = WriteFence::new();
        let token = fence.begin_write().unwrap();
        drop(token);
        fence.arm_and_wait().await.unwrap();
    }

    #[tokio::test]
    async fn completion_callbacks_all_run_once() {
        let fence = WriteFence::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            fence
                .on_all_committed(move |_| {
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                })
                .unwrap();
        }
        fence.arm_and_wait().await.unwrap();
        fence.arm().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
