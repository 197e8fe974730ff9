// Cadence scheduler core: task registry, due-time evaluation, overlap
// locking and run dispatch

pub mod bootstrap;
pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor;
pub mod lock;
pub mod manifest;
pub mod models;
pub mod output;
pub mod registry;
pub mod schedule;
pub mod scheduler;
pub mod telemetry;
