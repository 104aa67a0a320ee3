//! FrameLink client for Rust.
//!
//! [`SignalingClient`] speaks the signaling protocol; [`RoomAgent`] joins a
//! room with it and moves an external call's media between devices as camera
//! ownership changes.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use framelink_arbitration::ArbitrationConfig;
//! use framelink_client::{MediaController, RoomAgent, SignalingClient};
//!
//! async fn run(media: impl MediaController + 'static) -> framelink_client::Result<()> {
//!     let client = Arc::new(SignalingClient::new(Some("ws://localhost:3000")));
//!     client.connect().await?;
//!     RoomAgent::new(client, media, "living-room", "laptop", &ArbitrationConfig::default())
//!         .run()
//!         .await
//! }
//! ```

pub mod agent;
pub mod error;
pub mod signaling;

pub use agent::{MediaController, RoomAgent};
pub use error::{ClientError, Result};
pub use signaling::{SignalEvent, SignalingClient};
