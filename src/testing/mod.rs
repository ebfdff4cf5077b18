//! Testing utilities and mock implementations
//!
//! Lets the broker bridge be exercised without the accounts service.

pub mod mocks;

pub use mocks::*;
