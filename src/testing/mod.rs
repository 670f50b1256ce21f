//! Testing utilities and mock implementations
//!
//! Lets the client be exercised end to end without a broker or real key
//! material.

pub mod mocks;

pub use mocks::*;
