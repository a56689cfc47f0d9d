//! Master-process worker-pool controller for the document service.
//!
//! Sizes and maintains a fleet of worker processes under a capacity limit
//! derived from a license file and the host CPU count, and propagates
//! license state to every worker.

pub mod capacity;
pub mod config;
pub mod controller;
pub mod license;
pub mod process;
