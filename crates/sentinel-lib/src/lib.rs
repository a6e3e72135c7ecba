//! Library for the hypervisor monitoring mesh
//!
//! This crate provides the core functionality for:
//! - Authenticated message transport between agents and the aggregator
//! - Per-host monitor agents polling the Proxmox API
//! - Central aggregation, storage and agent liveness
//! - Per-entity utilization forecasting and critical alerts
//! - Health checks and observability

pub mod aggregator;
pub mod anomaly;
pub mod error;
pub mod forecast;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod proto;
pub mod store;
pub mod transport;

pub use error::{ErrorKind, Result, SentinelError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SentinelMetrics, StructuredLogger};
