//! Backup Orchestrator - Backend Library
//!
//! Policy-driven backup engine: exports organizational data on a schedule,
//! archives it and replicates the archive to a primary and replica
//! destinations under a success quorum.

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod services;
pub mod storage;
pub mod store;
pub mod telemetry;

pub use config::Config;
pub use error::{AppError, Result};
