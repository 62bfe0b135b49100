//! The protobuf envelope carried by every frame on the control channel.
//!
//! Hand-derived with `prost` rather than generated; the schema is fixed:
//!
//! ```text
//! message CastMessage {
//!   required ProtocolVersion protocol_version = 1;
//!   required string source_id = 2;
//!   required string destination_id = 3;
//!   required string namespace = 4;
//!   required PayloadType payload_type = 5;
//!   optional string payload_utf8 = 6;
//!   optional bytes payload_binary = 7;
//! }
//! ```

use serde::Serialize;

use crate::error::{CastError, CastResult};
use crate::messages::PayloadHeader;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ProtocolVersion {
    Castv210 = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum PayloadType {
    String = 0,
    Binary = 1,
}

/// One wire message: routing header plus payload.
#[derive(Clone, PartialEq, prost::Message)]
pub struct CastMessage {
    #[prost(enumeration = "ProtocolVersion", required, tag = "1")]
    pub protocol_version: i32,
    #[prost(string, required, tag = "2")]
    pub source_id: String,
    #[prost(string, required, tag = "3")]
    pub destination_id: String,
    #[prost(string, required, tag = "4")]
    pub namespace: String,
    #[prost(enumeration = "PayloadType", required, tag = "5")]
    pub payload_type: i32,
    #[prost(string, optional, tag = "6")]
    pub payload_utf8: Option<String>,
    #[prost(bytes = "vec", optional, tag = "7")]
    pub payload_binary: Option<Vec<u8>>,
}

impl CastMessage {
    /// Build a string-payload envelope from any serializable JSON payload.
    pub fn json<T: Serialize>(
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        payload: &T,
    ) -> CastResult<Self> {
        let payload = serde_json::to_string(payload)?;
        Ok(Self::utf8(source_id, destination_id, namespace, payload))
    }

    /// Build a string-payload envelope from an already-encoded JSON string.
    pub fn utf8(
        source_id: &str,
        destination_id: &str,
        namespace: &str,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            protocol_version: ProtocolVersion::Castv210 as i32,
            source_id: source_id.to_string(),
            destination_id: destination_id.to_string(),
            namespace: namespace.to_string(),
            payload_type: PayloadType::String as i32,
            payload_utf8: Some(payload.into()),
            payload_binary: None,
        }
    }

    /// The UTF-8 JSON payload, or an empty string for binary messages.
    pub fn payload(&self) -> &str {
        self.payload_utf8.as_deref().unwrap_or("")
    }

    /// Parse the `type` / `requestId` header out of the JSON payload.
    pub fn header(&self) -> CastResult<PayloadHeader> {
        serde_json::from_str(self.payload())
            .map_err(|e| CastError::InvalidMessage(format!("payload header: {e}")))
    }

    /// Decode the JSON payload into a typed response.
    pub fn decode_payload<T: serde::de::DeserializeOwned>(&self) -> CastResult<T> {
        serde_json::from_str(self.payload())
            .map_err(|e| CastError::InvalidMessage(format!("payload body: {e}")))
    }
}

impl std::fmt::Display for CastMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} [{}]: {}",
            self.source_id,
            self.destination_id,
            self.namespace,
            self.payload()
        )
    }
}
