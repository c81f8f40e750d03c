//! The transport seam: the server accepts anything that can deliver inbound
//! string frames and accept outbound ones. The concrete WebSocket/long-poll
//! machinery lives outside this crate.

use std::collections::HashMap;

use tokio::sync::mpsc;

use crate::error::Result;

/// The outbound half of a client connection. `send_frame` must enqueue
/// without blocking and preserve call order; the transport flushes frames to
/// the wire in the background.
pub trait FrameSender: Send + Sync + 'static {
    /// Queues one wire frame for delivery.
    fn send_frame(&self, frame: &str) -> Result<()>;

    /// Closes the underlying socket. Idempotent.
    fn close(&self);
}

/// A newly accepted client connection, handed to
/// [`Server::accept`](crate::Server::accept): the outbound sink, the inbound
/// frame stream (closed by dropping the sender side), and the connection
/// metadata the transport saw.
pub struct RawConnection {
    /// Outbound frames.
    pub sender: std::sync::Arc<dyn FrameSender>,
    /// Inbound frames; the channel closing means the socket closed.
    pub receiver: mpsc::UnboundedReceiver<String>,
    /// The peer address as the transport saw it, before proxy unwinding.
    pub remote_address: Option<String>,
    /// The HTTP headers of the upgrade/first request, lower-cased keys.
    pub headers: HashMap<String, String>,
}

/// Derives the real client address from the socket address and the
/// `x-forwarded-for` header, trusting `forwarded_count` proxies: with N
/// trusted proxies the client is the N-th entry from the end of the
/// forwarded chain. Returns `None` when the chain is shorter than the number
/// of trusted proxies.
pub(crate) fn client_address(
    remote_address: Option<&str>,
    headers: &HashMap<String, String>,
    forwarded_count: Option<usize>,
) -> Option<String> {
    let count = match forwarded_count {
        None | Some(0) => return remote_address.map(str::to_string),
        Some(count) => count,
    };
    let chain: Vec<String> = headers
        .get("x-forwarded-for")
        .map(|raw| {
            raw.split(',')
                .map(|entry| entry.trim().to_string())
                .filter(|entry| !entry.is_empty())
                .collect()
        })
        .unwrap_or_default();
    chain.len().checked_sub(count).map(|i| chain[i].clone())
}
