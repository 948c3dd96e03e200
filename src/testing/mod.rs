//! Testing utilities and mock implementations
//!
//! Scripted stand-ins for tool endpoints, health probes and step executors so
//! the coordinator can be exercised without any network services.

pub mod mocks;

pub use mocks::*;
