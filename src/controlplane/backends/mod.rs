//! Array Transport Backends
//!
//! Implementations of `ArrayTransport`:
//! - InMemoryArray: simulated management server for tests and local runs
//!
//! A REST transport against a live management server plugs in at the same
//! port.

pub mod simulator;

pub use simulator::*;
