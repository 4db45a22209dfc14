//! blockworker: worker-side tiered block cache node.
//!
//! Caches blocks of under-store files across a hierarchy of local storage
//! tiers (memory first, then disk), serving reads from the fastest resident
//! copy and falling back to streaming from the under store on a miss.
//! Inventory is reported to a coordinator via full registration plus
//! per-cycle heartbeat deltas.

pub mod config;
pub mod error;
pub mod metrics;
pub mod server;
pub mod store;
pub mod ufs;
pub mod worker;
