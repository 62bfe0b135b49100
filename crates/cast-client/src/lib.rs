//! cast-client: async client for cast receivers.
//!
//! Connects over TLS, correlates requests with replies over one connection,
//! tracks receiver and media state, and serves local files to the device
//! over a small HTTP server (optionally transcoded).
//!
//! # Quick Start
//!
//! ```no_run
//! use cast_client::device::CONTROL_PORT;
//! use cast_client::{CastApplication, CastDevice, ClientConfig};
//!
//! # async fn example() -> cast_core::CastResult<()> {
//! let device = CastDevice::new("192.168.1.40".parse().unwrap(), CONTROL_PORT);
//! let app = CastApplication::start(&device, ClientConfig::default()).await?;
//!
//! let reason = app.load("/media/holiday.mp4", None, false).await?;
//! println!("playback ended: {reason:?}");
//!
//! app.close().await;
//! # Ok(())
//! # }
//! ```

pub mod application;
pub mod config;
pub mod content;
pub mod device;
pub mod media_server;
pub mod mux;
pub mod net;
pub mod storage;
pub mod transport;

#[cfg(test)]
mod testing;

// Re-export primary public types.
pub use application::{CastApplication, FinishReason, Status};
pub use config::ClientConfig;
pub use device::{CastDevice, DeviceInfo};
pub use media_server::{MediaLibrary, MediaServer, PlayedItem};
pub use mux::{BroadcastHandler, Channel, Multiplexer};
pub use storage::{FileStorage, MemoryStorage, Storage};
pub use transport::Transport;

// Re-export cast-core error types for convenience.
pub use cast_core::{CastError, CastResult};
