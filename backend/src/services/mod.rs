//! Business logic services.

pub mod archive;
pub mod backup_service;
pub mod backup_worker;
pub mod encryption;
pub mod metrics_service;
pub mod notification_service;
pub mod policy_service;
pub mod schedule;
pub mod scheduler_service;
