//! Shared state wiring the SLAM workers together.

pub mod shared_state;

pub use shared_state::SharedState;
