//! # crosstalk-protocol
//!
//! Wire formats for the Crosstalk cross-process broker.
//!
//! Two layers live here:
//!
//! - **Envelope** - the line published on the bus: `sender|base64(payload)`
//! - **Frames** - presence announcements carried inside envelope payloads,
//!   MessagePack-encoded with a length prefix
//!
//! ## Example
//!
//! ```rust
//! use crosstalk_protocol::{envelope, codec, Frame, RosterEntry};
//!
//! let frame = Frame::presence("lobby", 0, vec![RosterEntry::new("7c1e", "Alex")]);
//! let payload = codec::encode(&frame).unwrap();
//!
//! let line = envelope::encode("lobby", &payload);
//! let received = envelope::decode(&line).unwrap();
//! assert_eq!(received.sender, "lobby");
//! assert_eq!(codec::decode(&received.payload).unwrap(), frame);
//! ```

pub mod codec;
pub mod envelope;
pub mod frames;

pub use codec::ProtocolError;
pub use envelope::{validate_sender_id, Envelope, EnvelopeError, SEPARATOR};
pub use frames::{Frame, RosterEntry};
