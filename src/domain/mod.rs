//! Domain layer - Resource model and the transport port
//!
//! `model` holds the array resources; `ports` defines the trait the
//! transport adapter implements, following hexagonal architecture principles.

pub mod model;
pub mod ports;

pub use model::*;
pub use ports::*;
