//! Broadcasting of real-time carrier progress events.
//!
//! Consumers (a UI layer, an API stream) subscribe; the engine never waits
//! on them.

pub mod carrier_progress;

pub use carrier_progress::{
    CarrierPhase, CarrierProgressEvent, CarrierProgressTracker, ProgressBroadcaster,
};
