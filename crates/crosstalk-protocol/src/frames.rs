//! Presence frames exchanged between Crosstalk servers.
//!
//! Frames travel as ordinary envelope payloads. They are serialized with
//! MessagePack (see [`crate::codec`]) so that peers can tell them apart from
//! application payloads.

use serde::{Deserialize, Serialize};

/// A locally connected client as announced to peers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RosterEntry {
    /// Stable client identifier.
    pub id: String,
    /// Display name.
    pub name: String,
}

impl RosterEntry {
    /// Create a new roster entry.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// A presence frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Periodic announcement of a server's live client roster.
    #[serde(rename = "presence")]
    Presence {
        /// Announcing server.
        server: String,
        /// Milliseconds since the Unix epoch at the announcing server.
        timestamp: u64,
        /// Clients connected to the announcing server.
        clients: Vec<RosterEntry>,
    },

    /// Sent once when a server stops cleanly.
    #[serde(rename = "departure")]
    Departure {
        /// Departing server.
        server: String,
        /// Milliseconds since the Unix epoch at the departing server.
        timestamp: u64,
    },
}

impl Frame {
    /// Get the server this frame is about.
    #[must_use]
    pub fn server(&self) -> &str {
        match self {
            Frame::Presence { server, .. } | Frame::Departure { server, .. } => server,
        }
    }

    /// Create a new Presence frame.
    #[must_use]
    pub fn presence(server: impl Into<String>, timestamp: u64, clients: Vec<RosterEntry>) -> Self {
        Frame::Presence {
            server: server.into(),
            timestamp,
            clients,
        }
    }

    /// Create a new Departure frame.
    #[must_use]
    pub fn departure(server: impl Into<String>, timestamp: u64) -> Self {
        Frame::Departure {
            server: server.into(),
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_server() {
        assert_eq!(Frame::presence("lobby", 1, vec![]).server(), "lobby");
        assert_eq!(Frame::departure("arena", 2).server(), "arena");
    }
}
