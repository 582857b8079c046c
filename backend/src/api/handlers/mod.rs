//! HTTP request handlers.

pub mod backups;
pub mod health;
