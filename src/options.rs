//! Contains the types needed to configure the server and individual cursors.
//!
//! The options structs in this module use the
//! [`typed-builder`](https://crates.io/crates/typed-builder) crate to derive a
//! type-safe builder API on them, so that partially specified options read
//! naturally at call sites:
//!
//! ```rust
//! # use mongodb_livedata::options::CursorOptions;
//! let options = CursorOptions::builder()
//!     .limit(Some(20))
//!     .polling_interval(Some(std::time::Duration::from_secs(5)))
//!     .build();
//! ```

use std::time::Duration;

use bson::Document;
use typed_builder::TypedBuilder;

use crate::server::PublicationStrategy;

/// Name of the environment variable overriding the default poll throttle.
pub(crate) const POLLING_THROTTLE_ENV: &str = "METEOR_POLLING_THROTTLE_MS";

/// Name of the environment variable overriding the default forced-poll
/// interval.
pub(crate) const POLLING_INTERVAL_ENV: &str = "METEOR_POLLING_INTERVAL_MS";

/// Name of the environment variable declaring how many proxies in front of
/// the server are trusted when deriving client addresses from
/// `x-forwarded-for`.
pub(crate) const FORWARDED_COUNT_ENV: &str = "HTTP_FORWARDED_COUNT";

/// Name of the environment variable that disables WebSocket transports in
/// favor of long polling. The transport layer is external to this crate; the
/// parsed flag is exposed for it on [`ServerOptions`].
pub(crate) const DISABLE_WEBSOCKETS_ENV: &str = "DISABLE_WEBSOCKETS";

/// Name of the environment variable enabling the session-affinity cookie.
pub(crate) const USE_JSESSIONID_ENV: &str = "USE_JSESSIONID";

const DEFAULT_POLLING_THROTTLE: Duration = Duration::from_millis(50);
const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_millis(10_000);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(15_000);
const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(15_000);

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|raw| !raw.is_empty()).unwrap_or(false)
}

/// Specifies the options for a [`Server`](crate::Server).
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct ServerOptions {
    /// How long a session may stay silent before the server sends it a
    /// `ping`. `None` disables the heartbeat. Heartbeats only run on
    /// sessions whose negotiated protocol supports ping/pong.
    #[builder(default = Some(DEFAULT_HEARTBEAT_INTERVAL))]
    pub heartbeat_interval: Option<Duration>,

    /// How long the server waits for any traffic after sending a heartbeat
    /// `ping` before it closes the session.
    #[builder(default = DEFAULT_HEARTBEAT_TIMEOUT)]
    pub heartbeat_timeout: Duration,

    /// Whether the server answers client `ping` messages with `pong`.
    #[builder(default = true)]
    pub respond_to_pings: bool,

    /// The publication strategy used for publications without a per-name
    /// override.
    #[builder(default = PublicationStrategy::ServerMerge)]
    pub default_publication_strategy: PublicationStrategy,

    /// The number of trusted proxies between clients and this server,
    /// governing client-address derivation from `x-forwarded-for`.
    pub http_forwarded_count: Option<usize>,

    /// Whether the embedding transport should offer long polling only.
    /// Parsed from `DISABLE_WEBSOCKETS`; this crate only carries the flag.
    pub disable_websockets: bool,

    /// Whether the embedding transport should set a session-affinity cookie.
    /// Parsed from `USE_JSESSIONID`; this crate only carries the flag.
    pub use_jsessionid: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ServerOptions {
    /// Resolves unset fields from the process environment
    /// (`HTTP_FORWARDED_COUNT`, `DISABLE_WEBSOCKETS`, `USE_JSESSIONID`).
    pub fn resolve_from_env(mut self) -> Self {
        if self.http_forwarded_count.is_none() {
            self.http_forwarded_count = std::env::var(FORWARDED_COUNT_ENV)
                .ok()
                .and_then(|raw| raw.trim().parse::<usize>().ok());
        }
        self.disable_websockets = self.disable_websockets || env_flag(DISABLE_WEBSOCKETS_ENV);
        self.use_jsessionid = self.use_jsessionid || env_flag(USE_JSESSIONID_ENV);
        self
    }
}

/// Specifies the options attached to a cursor description. These participate
/// in multiplexer deduplication: two cursors with equal collection, selector
/// and options observe through one driver.
#[derive(Clone, Debug, Default, PartialEq, TypedBuilder)]
#[builder(field_defaults(default))]
#[non_exhaustive]
pub struct CursorOptions {
    /// Minimum spacing between two polls of this query. Unset falls back to
    /// `METEOR_POLLING_THROTTLE_MS`, then to 50ms.
    pub polling_throttle: Option<Duration>,

    /// Forced-poll period: the query re-runs at this interval even without
    /// invalidations, providing eventual consistency against writes the
    /// crossbar never saw. Unset falls back to `METEOR_POLLING_INTERVAL_MS`,
    /// then to 10s.
    pub polling_interval: Option<Duration>,

    /// Never use the oplog for this cursor, even when an oplog handle is
    /// available and the query shape is supported.
    pub disable_oplog: bool,

    /// The sort specification.
    pub sort: Option<Document>,

    /// The projection: fields to include or exclude.
    pub projection: Option<Document>,

    /// The maximum number of documents the query returns.
    pub limit: Option<u64>,

    /// The number of leading documents the query skips.
    pub skip: Option<u64>,

    /// Observe as a tailable, added-only stream: documents are reported once
    /// when first seen and never changed, moved or removed.
    pub tailable: bool,

    /// The store-side time budget for each execution of the query.
    pub max_time: Option<Duration>,
}

impl CursorOptions {
    /// The effective poll throttle: explicit option, environment override,
    /// or the 50ms default.
    pub(crate) fn resolved_polling_throttle(&self) -> Duration {
        self.polling_throttle
            .or_else(|| env_millis(POLLING_THROTTLE_ENV))
            .unwrap_or(DEFAULT_POLLING_THROTTLE)
    }

    /// The effective forced-poll interval: explicit option, environment
    /// override, or the 10s default.
    pub(crate) fn resolved_polling_interval(&self) -> Duration {
        self.polling_interval
            .or_else(|| env_millis(POLLING_INTERVAL_ENV))
            .unwrap_or(DEFAULT_POLLING_INTERVAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn polling_defaults() {
        let options = CursorOptions::default();
        assert_eq!(
            options.resolved_polling_throttle(),
            Duration::from_millis(50)
        );
        assert_eq!(
            options.resolved_polling_interval(),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn explicit_polling_options_win() {
        let options = CursorOptions::builder()
            .polling_throttle(Some(Duration::from_millis(5)))
            .polling_interval(Some(Duration::from_secs(1)))
            .build();
        assert_eq!(
            options.resolved_polling_throttle(),
            Duration::from_millis(5)
        );
        assert_eq!(options.resolved_polling_interval(), Duration::from_secs(1));
    }

    #[test]
    fn server_defaults() {
        let options = ServerOptions::default();
        assert_eq!(
            options.heartbeat_interval,
            Some(Duration::from_millis(15_000))
        );
        assert!(options.respond_to_pings);
        assert_eq!(
            options.default_publication_strategy,
            PublicationStrategy::ServerMerge
        );
    }
}
