//! dvr-scheduler library crate.
//!
//! Decides which recordings get a tuner on a multi-tuner DVR: conflict
//! detection, per-input admission with priority preemption, and expansion of
//! series rules into per-episode schedules.

pub mod catalog;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod domain;
pub mod dvr;
pub mod error;
pub mod events;
pub mod logging;
pub mod manager;
pub mod scheduler;
pub mod series;
pub mod services;
pub mod store;

pub use error::{Error, Result};
