//! Master configuration
//!
//! Read from `NFD_MASTER_*` environment variables, optionally layered on
//! top of a file named by `NFD_MASTER_CONFIG`. List settings are
//! comma-separated strings.

use anyhow::{bail, Context, Result};
use master_lib::{FeatureClassifier, ServiceConfig, LABEL_NS};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Paths of the TLS material used for mutual TLS
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub ca_file: PathBuf,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Master configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    /// Name of the node the master runs on, from the downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// gRPC port
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP port for health/metrics
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    #[serde(default)]
    pub ca_file: Option<PathBuf>,
    #[serde(default)]
    pub cert_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Label namespaces accepted besides the default one
    #[serde(default)]
    pub extra_label_ns: String,

    /// Regex that bare label names must match. Empty accepts everything.
    #[serde(default)]
    pub label_whitelist: String,

    /// Labels published as extended resources
    #[serde(default)]
    pub resource_labels: String,

    /// Do not write anything to the cluster
    #[serde(default)]
    pub no_publish: bool,

    /// Require the client certificate CN to match the reported node name
    #[serde(default)]
    pub verify_node_name: bool,

    /// Remove all published labels, resources and annotations, then exit
    #[serde(default)]
    pub prune: bool,

    #[serde(default = "default_topology_namespace")]
    pub topology_namespace: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_default()
}

fn default_port() -> u16 {
    8080
}

fn default_health_port() -> u16 {
    8081
}

fn default_topology_namespace() -> String {
    master_lib::service::DEFAULT_TOPOLOGY_NAMESPACE.to_string()
}

fn default_request_timeout() -> u64 {
    30
}

/// Split a comma-separated setting, dropping empty entries.
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl MasterConfig {
    /// Load configuration from environment and config file
    pub fn load() -> Result<Self> {
        Self::load_from(std::env::var_os("NFD_MASTER_CONFIG").map(PathBuf::from))
    }

    /// Load from an optional config file, overridden by the environment.
    pub fn load_from(file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config = builder
            .add_source(config::Environment::with_prefix("NFD_MASTER").try_parsing(true))
            .build()
            .context("failed to read configuration")?;

        Self::from_config(config)
    }

    fn from_config(config: config::Config) -> Result<Self> {
        let config: Self = config
            .try_deserialize()
            .context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let tls_set = [&self.ca_file, &self.cert_file, &self.key_file]
            .iter()
            .filter(|p| p.is_some())
            .count();
        if tls_set != 0 && tls_set != 3 {
            bail!("ca_file, cert_file and key_file must be specified together");
        }
        if self.verify_node_name && tls_set == 0 {
            bail!("verify_node_name requires TLS authentication to be enabled");
        }
        self.label_pattern()?;
        Ok(())
    }

    /// TLS material, if mutual TLS is enabled.
    pub fn tls(&self) -> Option<TlsPaths> {
        match (&self.ca_file, &self.cert_file, &self.key_file) {
            (Some(ca), Some(cert), Some(key)) => Some(TlsPaths {
                ca_file: ca.clone(),
                cert_file: cert.clone(),
                key_file: key.clone(),
            }),
            _ => None,
        }
    }

    fn label_pattern(&self) -> Result<Option<Regex>> {
        if self.label_whitelist.is_empty() {
            return Ok(None);
        }
        let pattern = Regex::new(&self.label_whitelist)
            .with_context(|| format!("invalid label_whitelist '{}'", self.label_whitelist))?;
        Ok(Some(pattern))
    }

    /// Allowed namespaces: the default label namespace plus the configured extras.
    pub fn allowed_namespaces(&self) -> Vec<String> {
        let mut namespaces = vec![LABEL_NS.to_string()];
        for ns in split_list(&self.extra_label_ns) {
            if !namespaces.contains(&ns) {
                namespaces.push(ns);
            }
        }
        namespaces
    }

    pub fn classifier(&self) -> Result<FeatureClassifier> {
        Ok(FeatureClassifier::new(
            self.allowed_namespaces(),
            self.label_pattern()?,
            split_list(&self.resource_labels),
        ))
    }

    pub fn service_config(&self) -> ServiceConfig {
        ServiceConfig {
            publish: !self.no_publish,
            topology_namespace: self.topology_namespace.clone(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
