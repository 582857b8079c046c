//! Domain models.

pub mod connection;
pub mod destination;
pub mod job;
pub mod policy;
