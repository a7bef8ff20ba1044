//! Service layer module.
//!
//! This module provides the service container that wires and runs the
//! scheduler services.

pub mod container;

pub use container::{Collaborators, ServiceContainer, ServiceStats};
