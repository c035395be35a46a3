//! Windowed storage pool I/O sampler.
//!
//! A capture session streams pool/dataset read and write events; they are
//! aggregated per window into latency, bandwidth and IOPS rates and
//! published to collectd as `PUTVAL` records.

#[cfg(not(unix))]
compile_error!("poolscope requires a unix platform");

pub mod agent;
pub mod aggregate;
pub mod capture;
pub mod clock;
pub mod config;
pub mod health;
pub mod ident;
pub mod publish;
pub mod session;
