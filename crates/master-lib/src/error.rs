//! Error types shared by the reconcilers and the RPC layer

use std::net::SocketAddr;
use thiserror::Error;

/// Failure to bind a request to the node it claims to describe.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthorizationError {
    #[error("failed to get peer (client)")]
    MissingPeer,

    #[error("client certificate verification for '{}' failed", fmt_addr(.peer))]
    MissingCertificate { peer: Option<SocketAddr> },

    #[error("invalid client certificate from '{}': {reason}", fmt_addr(.peer))]
    InvalidCertificate {
        peer: Option<SocketAddr>,
        reason: String,
    },

    #[error(
        "request authorization failed: cert valid for '{common_name}', requested node name '{node_name}'"
    )]
    NodeNameMismatch {
        common_name: String,
        node_name: String,
    },
}

fn fmt_addr(peer: &Option<SocketAddr>) -> String {
    peer.map(|a| a.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// A single feature entry rejected during classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("namespace '{namespace}' is not allowed, ignoring label '{key}'")]
    NamespaceNotAllowed { namespace: String, key: String },

    #[error("'{name}' does not match the whitelist ({pattern}) and will not be published")]
    NameNotAllowed { name: String, pattern: String },

    #[error("bad label value encountered for extended resource '{key}': '{value}'")]
    InvalidResourceValue { key: String, value: String },
}

/// Object store failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflicting update of {kind} '{name}'")]
    Conflict { kind: &'static str, name: String },

    #[error("invalid status patch: {0}")]
    InvalidPatch(String),

    #[error("object store request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("object store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Error returned by the reporting service.
#[derive(Debug, Error)]
pub enum MasterError {
    #[error(transparent)]
    Authorization(#[from] AuthorizationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to patch extended resources of node '{node}': {source}")]
    StatusPatch {
        node: String,
        #[source]
        source: StoreError,
    },
}

/// Failure of the bulk prune operation.
#[derive(Debug, Error)]
pub enum PruneError {
    #[error("failed to list nodes: {0}")]
    ListNodes(#[source] StoreError),

    /// Pruning stopped at `node`; nodes listed after it were not touched.
    #[error("failed to prune node '{node}': {source}")]
    Node {
        node: String,
        #[source]
        source: MasterError,
    },
}

impl From<MasterError> for tonic::Status {
    fn from(err: MasterError) -> Self {
        let message = err.to_string();
        match err {
            MasterError::Authorization(_) => tonic::Status::permission_denied(message),
            MasterError::Store(store) | MasterError::StatusPatch { source: store, .. } => {
                match store {
                    StoreError::NotFound { .. } => tonic::Status::not_found(message),
                    StoreError::Conflict { .. } => tonic::Status::aborted(message),
                    StoreError::InvalidPatch(_) => tonic::Status::internal(message),
                    StoreError::Api(_) | StoreError::Unavailable(_) => {
                        tonic::Status::unavailable(message)
                    }
                }
            }
        }
    }
}
