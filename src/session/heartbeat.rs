//! Session heartbeating: ping after a quiet interval, close after a
//! further silent timeout.

use std::time::Duration;

use tokio::sync::mpsc;

use crate::runtime::{self, AsyncJoinHandle};

/// Watches one session's inbound traffic. After `interval` of silence it
/// asks the session to send a `ping`; if nothing at all arrives within
/// `timeout` after that, it declares the session dead.
#[derive(Debug)]
pub(crate) struct Heartbeat {
    seen_traffic: mpsc::UnboundedSender<()>,
    task: AsyncJoinHandle<()>,
}

impl Heartbeat {
    pub(crate) fn start(
        interval: Duration,
        timeout: Duration,
        send_ping: impl Fn() + Send + 'static,
        on_dead: impl FnOnce() + Send + 'static,
    ) -> Self {
        let (seen_traffic, mut traffic) = mpsc::unbounded_channel::<()>();
        let task = runtime::spawn(async move {
            loop {
                // Quiet period: any message restarts it.
                match tokio::time::timeout(interval, traffic.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => {}
                }
                send_ping();
                // Grace period: any message at all counts as liveness.
                match tokio::time::timeout(timeout, traffic.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) => return,
                    Err(_) => {
                        on_dead();
                        return;
                    }
                }
            }
        });
        Self { seen_traffic, task }
    }

    /// Notes that the session received a message.
    pub(crate) fn message_received(&self) {
        let _ = self.seen_traffic.send(());
    }

    pub(crate) fn stop(&self) {
        self.task.abort();
    }
}
