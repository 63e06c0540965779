//! ringlb - A consistent-hashing TCP load balancer
//!
//! This crate provides a byte-transparent TCP load balancer built around:
//! - A CRC32 consistent-hash ring with weighted virtual nodes
//! - A per-destination connection pool with active/idle accounting
//! - A phi-accrual failure detector that adapts to each backend's rhythm

pub mod admin;
pub mod balancer;
pub mod config;
pub mod hashing;
pub mod health;
pub mod metrics;
pub mod pool;
pub mod util;

pub use config::Config;
