//! Fault-tolerant collector core for a terminal relay monitor.
//!
//! Independent producers (connection resolution, daemon events, numeric
//! sampling, configuration diffing) each publish into a single-slot handoff;
//! the snapshot coordinator assembles one immutable frame per tick for the
//! renderer.

pub mod agent;
pub mod confdiff;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod export;
pub mod pid;
pub mod resolver;
pub mod sampler;
pub mod snapshot;
