//! Testing utilities and mock implementations
//!
//! Lets the connection state machine be exercised without a broker or a
//! configuration endpoint.

pub mod mocks;

pub use mocks::*;
