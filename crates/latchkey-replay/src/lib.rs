//! Anti-replay protection for the authenticated request pipeline.
//!
//! Two pieces compose here: [`SlidingWindowFilter`] is the RFC 6479-style
//! counter window (component A of the pipeline), and [`ReplayProtector`]
//! fuses it with a bounded nonce cache and the persistence contract that
//! lets a client's state survive across requests (component B).

mod protector;
mod window;

pub use protector::ReplayProtector;
pub use window::SlidingWindowFilter;
