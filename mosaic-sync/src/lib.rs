//! Mosaic Sync
//!
//! Keeps list views consistent with the server:
//!
//! - [`invalidator`]: turns push-channel signals into debounced, watermark
//!   stamped invalidations.
//! - [`engine`]: the per-partition [`ListingEngine`] that owns view state,
//!   runs loads and mutations, and publishes [`ListSnapshot`]s.

pub mod engine;
pub mod invalidator;
pub mod snapshot;

pub use engine::ListingEngine;
pub use invalidator::{
    Flush, FlushReport, InvalidationTarget, InvalidatorMachine, InvalidatorState,
    RealtimeInvalidator, Verdict,
};
pub use snapshot::ListSnapshot;
