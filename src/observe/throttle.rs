//! A leading+trailing throttle for poll scheduling, modeled as a small
//! state machine (idle / cooling) rather than chained timers.

use std::{
    sync::{Arc, Mutex as SyncMutex, Weak},
    time::Duration,
};

use crate::runtime::{self, AsyncJoinHandle};

enum Phase {
    Idle,
    /// A fire happened within the last window; `trailing` records whether
    /// another call arrived during it.
    Cooling {
        trailing: bool,
    },
}

struct ThrottleState {
    phase: Phase,
    cooldown: Option<AsyncJoinHandle<()>>,
    stopped: bool,
}

struct ThrottleInner {
    window: Duration,
    func: Box<dyn Fn() + Send + Sync>,
    state: SyncMutex<ThrottleState>,
}

/// Rate-limits calls to a function: a call either runs it immediately (if
/// the last run was at least one window ago) or schedules one trailing run
/// at the end of the current window.
#[derive(Clone)]
pub(crate) struct Throttle {
    inner: Arc<ThrottleInner>,
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("window", &self.inner.window)
            .finish()
    }
}

impl Throttle {
    pub(crate) fn new(window: Duration, func: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                window,
                func: Box::new(func),
                state: SyncMutex::new(ThrottleState {
                    phase: Phase::Idle,
                    cooldown: None,
                    stopped: false,
                }),
            }),
        }
    }

    pub(crate) fn call(&self) {
        if self.inner.window.is_zero() {
            (self.inner.func)();
            return;
        }
        let fire = {
            let mut state = self.inner.state.lock().unwrap();
            if state.stopped {
                return;
            }
            match &mut state.phase {
                Phase::Idle => {
                    state.phase = Phase::Cooling { trailing: false };
                    state.cooldown = Some(Self::start_cooldown(Arc::downgrade(&self.inner)));
                    true
                }
                Phase::Cooling { trailing } => {
                    *trailing = true;
                    false
                }
            }
        };
        if fire {
            (self.inner.func)();
        }
    }

    /// Cancels any pending trailing run; subsequent calls are ignored.
    pub(crate) fn stop(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.stopped = true;
        if let Some(cooldown) = state.cooldown.take() {
            cooldown.abort();
        }
    }

    fn start_cooldown(inner: Weak<ThrottleInner>) -> AsyncJoinHandle<()> {
        runtime::spawn(async move {
            loop {
                let window = match inner.upgrade() {
                    Some(inner) => inner.window,
                    None => return,
                };
                tokio::time::sleep(window).await;
                let Some(inner) = inner.upgrade() else { return };
                let fire = {
                    let mut state = inner.state.lock().unwrap();
                    if state.stopped {
                        return;
                    }
                    if matches!(state.phase, Phase::Cooling { trailing: true }) {
                        state.phase = Phase::Cooling { trailing: false };
                        true
                    } else {
                        state.phase = Phase::Idle;
                        state.cooldown = None;
                        return;
                    }
                };
                if fire {
                    (inner.func)();
                }
            }
        })
    }
}
