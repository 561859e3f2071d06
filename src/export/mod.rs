//! Outward surfaces: the health endpoint and snapshot files.

pub mod health;
pub mod snapshot;

pub use snapshot::write_snapshot;
