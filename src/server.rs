//! The server: registries of publish and method handlers, session
//! acceptance and version negotiation, publication strategies, and the
//! connection lifecycle hooks.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as SyncMutex, Weak},
};

use bson::Bson;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    live::LiveConnection,
    options::ServerOptions,
    protocol::{self, parse_ddp, stringify_ddp, ClientMessage, ServerMessage},
    runtime,
    session::{MethodInvocation, PublishHandler, PublishResult, Session, SessionInner, Subscription},
    transport::RawConnection,
    BoxFuture,
};

/// A method handler: runs with the invocation context and the call's
/// parameters, returning the value for the `result` message.
pub type MethodHandler =
    Arc<dyn Fn(MethodInvocation, Vec<Bson>) -> BoxFuture<'static, Result<Bson>> + Send + Sync>;

/// Controls how a publication's documents are fed to clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublicationStrategy {
    /// Merge-box accounting: overlapping subscriptions are deduplicated
    /// field-by-field and the client sees exactly one copy of each
    /// document.
    ServerMerge,
    /// No merging, but each subscription still tracks the ids it sent, so
    /// stopping it can send the matching `removed` messages.
    NoMerge,
    /// No merging and no tracking: nothing is sent when the subscription
    /// stops.
    NoMergeNoHistory,
}

impl PublicationStrategy {
    pub(crate) fn uses_collection_view(self) -> bool {
        self == PublicationStrategy::ServerMerge
    }

    pub(crate) fn does_accounting(self) -> bool {
        matches!(
            self,
            PublicationStrategy::ServerMerge | PublicationStrategy::NoMerge
        )
    }
}

type ConnectionHook = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;
type MessageHook = Arc<dyn Fn(&str) + Send + Sync>;

pub(crate) struct ServerInner {
    pub(crate) options: ServerOptions,
    live: LiveConnection,
    publish_handlers: SyncMutex<HashMap<String, PublishHandler>>,
    universal_handlers: SyncMutex<Vec<PublishHandler>>,
    method_handlers: SyncMutex<HashMap<String, MethodHandler>>,
    sessions: SyncMutex<HashMap<String, Session>>,
    publication_strategies: SyncMutex<HashMap<String, PublicationStrategy>>,
    connection_hooks: SyncMutex<Vec<ConnectionHook>>,
    message_hooks: SyncMutex<Vec<MessageHook>>,
}

impl ServerInner {
    pub(crate) fn publish_handler(&self, name: &str) -> Option<PublishHandler> {
        self.publish_handlers.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn method_handler(&self, name: &str) -> Option<MethodHandler> {
        self.method_handlers.lock().unwrap().get(name).cloned()
    }

    pub(crate) fn publication_strategy(&self, name: Option<&str>) -> PublicationStrategy {
        name.and_then(|name| {
            self.publication_strategies
                .lock()
                .unwrap()
                .get(name)
                .copied()
        })
        .unwrap_or(self.options.default_publication_strategy)
    }

    pub(crate) fn forget_session(&self, id: &str) {
        self.sessions.lock().unwrap().remove(id);
    }
}

/// A live-data protocol server. Accepts connections from any transport that
/// can deliver string frames, runs publications and methods against a
/// [`LiveConnection`], and keeps every client's view current.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("sessions", &self.inner.sessions.lock().unwrap().len())
            .finish()
    }
}

impl Server {
    /// Creates a server over `live` with the given options.
    pub fn new(live: LiveConnection, options: ServerOptions) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                options,
                live,
                publish_handlers: SyncMutex::new(HashMap::new()),
                universal_handlers: SyncMutex::new(Vec::new()),
                method_handlers: SyncMutex::new(HashMap::new()),
                sessions: SyncMutex::new(HashMap::new()),
                publication_strategies: SyncMutex::new(HashMap::new()),
                connection_hooks: SyncMutex::new(Vec::new()),
                message_hooks: SyncMutex::new(Vec::new()),
            }),
        }
    }

    /// The live connection this server publishes from.
    pub fn live(&self) -> &LiveConnection {
        &self.inner.live
    }

    /// Registers a publication. A `name` of `None` registers a universal
    /// subscription: it runs on every current and future session without
    /// being asked. Named registrations reject duplicates.
    pub fn publish(
        &self,
        name: Option<&str>,
        handler: impl Fn(Arc<Subscription>) -> BoxFuture<'static, Result<PublishResult>>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        let handler: PublishHandler = Arc::new(handler);
        match name {
            Some(name) => {
                let mut handlers = self.inner.publish_handlers.lock().unwrap();
                if handlers.contains_key(name) {
                    return Err(Error::invalid_argument(format!(
                        "a publication named '{}' already exists",
                        name
                    )));
                }
                handlers.insert(name.to_string(), handler);
                Ok(())
            }
            None => {
                self.inner
                    .universal_handlers
                    .lock()
                    .unwrap()
                    .push(handler.clone());
                // Retroactively start on every open session.
                let sessions: Vec<Session> =
                    self.inner.sessions.lock().unwrap().values().cloned().collect();
                for session in sessions {
                    session.queue_universal_sub(handler.clone());
                }
                Ok(())
            }
        }
    }

    /// Registers a method. Duplicate names are rejected.
    pub fn methods(
        &self,
        name: &str,
        handler: impl Fn(MethodInvocation, Vec<Bson>) -> BoxFuture<'static, Result<Bson>>
            + Send
            + Sync
            + 'static,
    ) -> Result<()> {
        let mut handlers = self.inner.method_handlers.lock().unwrap();
        if handlers.contains_key(name) {
            return Err(Error::invalid_argument(format!(
                "a method named '{}' already exists",
                name
            )));
        }
        handlers.insert(name.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Overrides the publication strategy for one publication name.
    pub fn set_publication_strategy(&self, name: &str, strategy: PublicationStrategy) {
        self.inner
            .publication_strategies
            .lock()
            .unwrap()
            .insert(name.to_string(), strategy);
    }

    /// The effective strategy for a publication name.
    pub fn publication_strategy(&self, name: &str) -> PublicationStrategy {
        self.inner.publication_strategy(Some(name))
    }

    /// Registers a hook invoked with each new session's connection handle
    /// once it reaches the connected state. Hook failures are contained.
    pub fn on_connection(&self, hook: impl Fn(ConnectionHandle) + Send + Sync + 'static) {
        self.inner.connection_hooks.lock().unwrap().push(Arc::new(hook));
    }

    /// Registers a hook observing every raw inbound frame before protocol
    /// dispatch.
    pub fn on_message(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.message_hooks.lock().unwrap().push(Arc::new(hook));
    }

    /// Adopts a transport connection: drives version negotiation, then
    /// feeds the session until the connection closes.
    pub fn accept(&self, connection: RawConnection) {
        let server = self.inner.clone();
        let RawConnection {
            sender,
            mut receiver,
            remote_address,
            headers,
        } = connection;
        runtime::spawn(async move {
            let mut session: Option<Session> = None;
            while let Some(frame) = receiver.recv().await {
                let hooks: Vec<MessageHook> = server.message_hooks.lock().unwrap().clone();
                for hook in hooks {
                    if let Err(panic) =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(&frame)))
                    {
                        warn!("message hook panicked: {:?}", panic);
                    }
                }
                match &session {
                    Some(session) => session.queue_message(frame),
                    None => {
                        match negotiate_connection(&frame) {
                            ConnectOutcome::Connected(version) => {
                                let new_session = Session::start(
                                    &server,
                                    version,
                                    sender.clone(),
                                    remote_address.clone(),
                                    headers.clone(),
                                );
                                server
                                    .sessions
                                    .lock()
                                    .unwrap()
                                    .insert(new_session.id().to_string(), new_session.clone());
                                send_frame(
                                    &sender,
                                    &ServerMessage::Connected {
                                        session: new_session.id().to_string(),
                                    },
                                );
                                info!(
                                    session = new_session.id(),
                                    version = version.as_str(),
                                    "session connected"
                                );
                                let universal: Vec<PublishHandler> =
                                    server.universal_handlers.lock().unwrap().clone();
                                for handler in universal {
                                    new_session.queue_universal_sub(handler);
                                }
                                run_connection_hooks(&server, &new_session);
                                session = Some(new_session);
                            }
                            ConnectOutcome::Failed(version) => {
                                send_frame(
                                    &sender,
                                    &ServerMessage::Failed {
                                        version: version.as_str().to_string(),
                                    },
                                );
                                sender.close();
                                return;
                            }
                            ConnectOutcome::NotConnect => {
                                send_frame(
                                    &sender,
                                    &ServerMessage::Error {
                                        reason: "Must connect first".to_string(),
                                        offending_message: Some(frame),
                                    },
                                );
                            }
                        }
                    }
                }
            }
            if let Some(session) = session {
                debug!(session = session.id(), "socket closed");
                session.close();
            }
        });
    }

    /// Closes every open session. The server keeps accepting new
    /// connections; shutting the transport down is the embedder's concern.
    pub fn close(&self) {
        let sessions: Vec<Session> = {
            let mut sessions = self.inner.sessions.lock().unwrap();
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close();
        }
    }

    /// The number of currently open sessions.
    pub fn session_count(&self) -> usize {
        self.inner.sessions.lock().unwrap().len()
    }
}

enum ConnectOutcome {
    Connected(crate::protocol::ProtocolVersion),
    Failed(crate::protocol::ProtocolVersion),
    NotConnect,
}

fn negotiate_connection(frame: &str) -> ConnectOutcome {
    match parse_ddp(frame) {
        Ok(ClientMessage::Connect { version, support }) => {
            match protocol::negotiate(&version, &support) {
                protocol::Negotiation::Accepted(version) => ConnectOutcome::Connected(version),
                protocol::Negotiation::Failed(version) => ConnectOutcome::Failed(version),
            }
        }
        _ => ConnectOutcome::NotConnect,
    }
}

fn send_frame(sender: &Arc<dyn crate::transport::FrameSender>, message: &ServerMessage) {
    match stringify_ddp(message) {
        Ok(frame) => {
            if let Err(err) = sender.send_frame(&frame) {
                debug!("send failed: {}", err);
            }
        }
        Err(err) => warn!("dropping unserializable message: {}", err),
    }
}

fn run_connection_hooks(server: &Arc<ServerInner>, session: &Session) {
    let hooks: Vec<ConnectionHook> = server.connection_hooks.lock().unwrap().clone();
    let handle_source = session.inner.clone();
    for hook in hooks {
        let handle = handle_source.connection_handle();
        if let Err(panic) =
            std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(handle)))
        {
            warn!("connection hook panicked: {:?}", panic);
        }
    }
}

/// A capability for the connection behind a session: close it, observe its
/// closure, and inspect where it came from.
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: String,
    session: Weak<SessionInner>,
    client_address: Option<String>,
    http_headers: HashMap<String, String>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: String,
        session: Weak<SessionInner>,
        client_address: Option<String>,
        http_headers: HashMap<String, String>,
    ) -> Self {
        Self {
            id,
            session,
            client_address,
            http_headers,
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Closes the session.
    pub fn close(&self) {
        if let Some(session) = self.session.upgrade() {
            session.close();
        }
    }

    /// Registers a callback to run (on a deferred task) when the session
    /// closes. On an already-closed session it runs immediately.
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        match self.session.upgrade() {
            Some(session) => session.on_close(callback),
            None => callback(),
        }
    }

    /// The client's address, after unwinding trusted proxies.
    pub fn client_address(&self) -> Option<&str> {
        self.client_address.as_deref()
    }

    /// The HTTP headers seen at connection time.
    pub fn http_headers(&self) -> &HashMap<String, String> {
        &self.http_headers
    }
}
