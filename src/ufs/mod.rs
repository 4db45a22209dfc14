//! Under-store integration: ranged reads from the system of record and the
//! bridge that serves local misses (with cache-on-read).

pub mod bridge;
pub mod client;
