//! # framelink-arbitration
//!
//! Decides which device in a room owns the camera, based on face presence,
//! and coordinates moving an in-progress external call to the new owner.
//!
//! Pure state machines: no I/O, and every time-dependent operation takes
//! `now` from the caller.

pub mod call;
pub mod engine;
pub mod face;
pub mod takeover;

pub use call::CallPhase;
pub use engine::{
    ArbitrationConfig, ArbitrationEngine, EngineStatus, FaceObservation, SwitchDecision,
    SwitchReason,
};
pub use face::FaceState;
pub use takeover::{CallTakeover, HandoverToken, TakeoverAction, TakeoverPhase};
