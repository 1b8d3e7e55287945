//! Node Feature Discovery master library
//!
//! This crate provides the core functionality for:
//! - Authorizing worker reports against their client certificates
//! - Classifying feature labels into labels and extended resources
//! - Reconciling node labels, annotations, status and topology records
//! - Serving the worker-facing gRPC services
//! - Health checks and observability

pub mod auth;
pub mod classify;
pub mod crd;
pub mod error;
pub mod health;
pub mod locks;
pub mod maintenance;
pub mod models;
pub mod observability;
pub mod patch;
pub mod proto;
pub mod reconcile;
pub mod service;
pub mod store;

pub use auth::{Authorizer, PeerAuthenticator, PeerIdentity};
pub use classify::{Classification, FeatureClassifier};
pub use error::{AuthorizationError, MasterError, PruneError, StoreError, ValidationError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use maintenance::{advertise_master, Pruner};
pub use models::*;
pub use observability::{MasterMetrics, StructuredLogger};
pub use service::{ReportingService, ServiceConfig};
