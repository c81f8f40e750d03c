//! A reactive live-data protocol server over a MongoDB-compatible document
//! store.
//!
//! Clients subscribe to server-defined publications over any string-frame
//! transport and receive an initial snapshot plus a live delta feed of the
//! matching documents. Clients may also invoke server-registered methods;
//! when a method writes to the store, a write fence holds the method's
//! `updated` acknowledgment until every affected subscriber has received
//! the resulting changes.
//!
//! The crate's core is the live-data engine: the observe multiplexer (one
//! driver feeding any number of identical queries), the polling observe
//! driver, the per-session merge-box, and the write-fence/crossbar plumbing
//! between method writes and observer flushes. The WebSocket transport, the
//! EJSON codec, the selector matcher and the oplog tailer are collaborator
//! interfaces (see [`transport`] and [`store`]); wire a transport in by
//! handing [`Server::accept`] a [`transport::RawConnection`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mongodb_livedata::{LiveConnection, Server, ServerOptions, PublishResult, options::CursorOptions};
//! # use bson::doc;
//! # fn store() -> Arc<dyn mongodb_livedata::store::DocumentStore> { unimplemented!() }
//! # async fn run() -> mongodb_livedata::error::Result<()> {
//! let live = LiveConnection::new(store());
//! let server = Server::new(live.clone(), ServerOptions::default());
//!
//! server.publish(Some("apples"), move |_sub| {
//!     let live = live.clone();
//!     Box::pin(async move {
//!         let cursor = live.find("fruit", doc! { "category": "apples" }, CursorOptions::default())?;
//!         Ok(PublishResult::Cursor(Box::new(cursor)))
//!     })
//! })?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use ::bson;

mod bson_util;
pub(crate) mod crossbar;
mod cursor;
pub mod diff;
pub mod error;
mod fence;
mod live;
mod mergebox;
pub mod observe;
pub mod options;
pub mod protocol;
pub(crate) mod runtime;
mod server;
mod session;
pub mod store;
mod task_queue;
#[cfg(test)]
mod test;
pub mod transport;

pub use crate::{
    cursor::CursorDescription,
    fence::{WriteFence, WriteToken},
    live::{LiveConnection, LiveCursor, PublishableCursor},
    options::{CursorOptions, ServerOptions},
    server::{ConnectionHandle, MethodHandler, PublicationStrategy, Server},
    session::{MethodInvocation, PublishHandler, PublishResult, Session, Subscription},
};

/// A boxed future.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;
