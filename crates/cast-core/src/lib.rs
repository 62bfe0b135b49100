//! cast-core: Wire protocol for the cast device-control channel.
//!
//! Provides the protobuf envelope, 4-byte length-prefixed framing, the JSON
//! payload vocabulary spoken on the connection/receiver/media/heartbeat
//! namespaces, and the shared error type.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod messages;

// Re-export commonly used items at crate root.
pub use codec::{frame_encode, frame_len, message_decode, MAX_FRAME_LEN};
pub use envelope::{CastMessage, PayloadType, ProtocolVersion};
pub use error::{CastError, CastResult};
pub use messages::{
    Inbound, PayloadHeader, Request, DEFAULT_MEDIA_RECEIVER_APP_ID, DEFAULT_RECEIVER,
    DEFAULT_SENDER, NS_CONNECTION, NS_HEARTBEAT, NS_MEDIA, NS_RECEIVER,
};
