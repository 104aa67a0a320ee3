//! # framelink-common
//!
//! Shared configuration, error handling, and wire protocol types used across all FrameLink crates.
//! This is the foundation layer: primitives and contracts, no business logic.

pub mod config;
pub mod error;
pub mod protocol;

pub use error::{FramelinkError, FramelinkResult};
