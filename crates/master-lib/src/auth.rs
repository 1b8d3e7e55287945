//! Client authorization for incoming reports
//!
//! With mutual TLS enabled the transport has already verified the client
//! certificate chain against the configured CA. What remains is binding the
//! certificate to the request: the subject CN of the leaf certificate must
//! equal the node name the worker claims to report for.

use crate::error::AuthorizationError;
use std::net::SocketAddr;
use tracing::warn;

/// Transport-level identity of the caller
#[derive(Debug, Clone, Default)]
pub struct PeerIdentity {
    /// Remote address, if the transport exposes one
    pub addr: Option<SocketAddr>,
    /// Verified client certificate chain (DER, leaf first)
    pub certificates: Option<Vec<Vec<u8>>>,
}

impl PeerIdentity {
    /// Extract the peer identity from an inbound tonic request.
    pub fn from_request<T>(request: &tonic::Request<T>) -> Self {
        Self {
            addr: request.remote_addr(),
            certificates: request
                .peer_certs()
                .map(|certs| certs.iter().map(|c| c.get_ref().to_vec()).collect()),
        }
    }

    /// A peer that presented the given DER-encoded chain.
    pub fn with_certificates(addr: Option<SocketAddr>, certificates: Vec<Vec<u8>>) -> Self {
        Self {
            addr,
            certificates: Some(certificates),
        }
    }

    fn is_empty(&self) -> bool {
        self.addr.is_none() && self.certificates.is_none()
    }
}

/// Authorization step applied uniformly to every RPC handler
pub trait Authorizer: Send + Sync {
    /// Check that `peer` may report for `node_name`.
    fn authorize(&self, peer: &PeerIdentity, node_name: &str) -> Result<(), AuthorizationError>;
}

/// Verifies that the client certificate CN matches the requested node name
#[derive(Debug, Clone, Copy)]
pub struct PeerAuthenticator {
    verify_node_name: bool,
}

impl PeerAuthenticator {
    pub fn new(verify_node_name: bool) -> Self {
        Self { verify_node_name }
    }

    /// Authenticator that trusts every request.
    pub fn disabled() -> Self {
        Self::new(false)
    }

    pub fn is_enabled(&self) -> bool {
        self.verify_node_name
    }
}

impl Authorizer for PeerAuthenticator {
    fn authorize(&self, peer: &PeerIdentity, node_name: &str) -> Result<(), AuthorizationError> {
        if !self.verify_node_name {
            return Ok(());
        }

        let result = verify_peer(peer, node_name);
        if let Err(ref e) = result {
            warn!(
                event = "authorization_failed",
                node = %node_name,
                peer = ?peer.addr,
                error = %e,
                "gRPC request rejected"
            );
        }
        result
    }
}

fn verify_peer(peer: &PeerIdentity, node_name: &str) -> Result<(), AuthorizationError> {
    if peer.is_empty() {
        return Err(AuthorizationError::MissingPeer);
    }

    let leaf = peer
        .certificates
        .as_ref()
        .and_then(|chain| chain.first())
        .filter(|der| !der.is_empty())
        .ok_or(AuthorizationError::MissingCertificate { peer: peer.addr })?;

    let common_name = subject_common_name(leaf).map_err(|reason| {
        AuthorizationError::InvalidCertificate {
            peer: peer.addr,
            reason,
        }
    })?;

    if common_name != node_name {
        return Err(AuthorizationError::NodeNameMismatch {
            common_name,
            node_name: node_name.to_string(),
        });
    }
    Ok(())
}

/// Subject common name of a DER-encoded X.509 certificate.
pub fn subject_common_name(der: &[u8]) -> Result<String, String> {
    use x509_parser::prelude::*;

    let (_, cert) = X509Certificate::from_der(der).map_err(|e| e.to_string())?;

    let attr = cert
        .subject()
        .iter_common_name()
        .next()
        .ok_or_else(|| "certificate has no subject common name".to_string())?;

    attr.as_str()
        .map(str::to_string)
        .map_err(|e| format!("unreadable subject common name: {}", e))
}
