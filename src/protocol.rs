//! The client wire protocol: message types, version negotiation, and the
//! JSON (de)serialization boundary. One message per frame; framing and the
//! EJSON type-adjustment layer live outside this crate.

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Error, Result};

/// The protocol versions this server speaks, most preferred first.
pub(crate) const SUPPORTED_VERSIONS: [ProtocolVersion; 4] = [
    ProtocolVersion::V1a,
    ProtocolVersion::V1,
    ProtocolVersion::Pre2,
    ProtocolVersion::Pre1,
];

/// A negotiated protocol version.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// `1a`: `1` plus the `init` batching extension and client-side cleanup
    /// on `nosub`.
    V1a,
    /// `1`: the stable protocol.
    V1,
    /// `pre2`: `1` without EJSON binary support.
    Pre2,
    /// `pre1`: the original preview protocol, without ping/pong.
    Pre1,
}

impl ProtocolVersion {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ProtocolVersion::V1a => "1a",
            ProtocolVersion::V1 => "1",
            ProtocolVersion::Pre2 => "pre2",
            ProtocolVersion::Pre1 => "pre1",
        }
    }

    pub(crate) fn from_str(raw: &str) -> Option<Self> {
        SUPPORTED_VERSIONS
            .iter()
            .copied()
            .find(|version| version.as_str() == raw)
    }

    /// Whether this protocol has ping/pong (and therefore heartbeats).
    pub(crate) fn supports_ping(self) -> bool {
        self != ProtocolVersion::Pre1
    }

    /// Whether clients on this protocol discard a subscription's documents
    /// themselves when they receive `nosub`, relieving the server from
    /// sending `removed` for each.
    pub(crate) fn client_cleans_up_on_nosub(self) -> bool {
        self == ProtocolVersion::V1a
    }

    /// Whether initial-add bursts are coalesced into `init` messages.
    pub(crate) fn batches_initial_adds(self) -> bool {
        self == ProtocolVersion::V1a
    }
}

/// The outcome of version negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Negotiation {
    /// The client's proposed version is the one we would pick.
    Accepted(ProtocolVersion),
    /// We prefer a different (or no common) version; the client must
    /// reconnect proposing it.
    Failed(ProtocolVersion),
}

/// Picks the first version in the server's preference order that the client
/// supports. Proposal and pick must agree for the connection to proceed.
pub(crate) fn negotiate(proposed: &str, support: &[String]) -> Negotiation {
    let pick = SUPPORTED_VERSIONS
        .iter()
        .copied()
        .find(|version| support.iter().any(|s| s == version.as_str()))
        .unwrap_or(SUPPORTED_VERSIONS[0]);
    if pick.as_str() == proposed {
        Negotiation::Accepted(pick)
    } else {
        Negotiation::Failed(pick)
    }
}

/// A message from client to server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
pub enum ClientMessage {
    /// Opens (or resumes) a session.
    #[serde(rename = "connect")]
    Connect {
        /// The protocol version the client proposes.
        version: String,
        /// Every version the client can speak.
        support: Vec<String>,
    },
    /// Starts a subscription.
    #[serde(rename = "sub")]
    Sub {
        /// The client-chosen subscription id.
        id: String,
        /// The publication name.
        name: String,
        /// Arguments for the publish handler.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Bson>>,
    },
    /// Stops a subscription.
    #[serde(rename = "unsub")]
    Unsub {
        /// The subscription id from the `sub`.
        id: String,
    },
    /// Invokes a method.
    #[serde(rename = "method")]
    Method {
        /// The client-chosen method call id.
        id: String,
        /// The method name.
        method: String,
        /// Arguments for the method handler.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Bson>>,
        /// Seed for client/server id generation agreement. Accepted and
        /// ignored by this server.
        #[serde(
            rename = "randomSeed",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        random_seed: Option<String>,
    },
    /// Liveness probe.
    #[serde(rename = "ping")]
    Ping {
        /// Echoed back in the `pong`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Liveness response.
    #[serde(rename = "pong")]
    Pong {
        /// The id of the `ping` being answered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
}

/// A message from server to client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg")]
#[allow(missing_docs)]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected { session: String },

    #[serde(rename = "failed")]
    Failed { version: String },

    #[serde(rename = "ping")]
    Ping {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[serde(rename = "pong")]
    Pong {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },

    #[serde(rename = "nosub")]
    Nosub {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ClientError>,
    },

    #[serde(rename = "added")]
    Added {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Document>,
    },

    #[serde(rename = "changed")]
    Changed {
        collection: String,
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<Document>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cleared: Option<Vec<String>>,
    },

    #[serde(rename = "removed")]
    Removed { collection: String, id: String },

    /// One collection's initial documents, coalesced (protocol `1a` only).
    #[serde(rename = "init")]
    Init { collection: String, items: Vec<Document> },

    #[serde(rename = "ready")]
    Ready { subs: Vec<String> },

    #[serde(rename = "updated")]
    Updated { methods: Vec<String> },

    #[serde(rename = "result")]
    Result {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Bson>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ClientError>,
    },

    #[serde(rename = "error")]
    Error {
        reason: String,
        #[serde(
            rename = "offendingMessage",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        offending_message: Option<String>,
    },
}

/// Parses one inbound wire frame.
pub fn parse_ddp(frame: &str) -> Result<ClientMessage> {
    serde_json::from_str(frame).map_err(|e| Error::protocol(format!("malformed message: {}", e)))
}

/// Serializes one outbound message to its wire frame.
pub fn stringify_ddp(message: &ServerMessage) -> Result<String> {
    serde_json::to_string(message)
        .map_err(|e| Error::internal(format!("unserializable message: {}", e)))
}
