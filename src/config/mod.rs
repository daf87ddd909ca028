use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::str::FromStr;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::ProxyError;

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Config::validate_cluster_refs"))]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    pub log: Option<Log>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub clusters: Vec<Cluster>,

    /// Cluster the inbound request itself is proxied to.
    pub upstream: String,

    #[serde(default)]
    #[validate(nested)]
    pub aggregate: Aggregate,
}

// Config file load and validation
impl Config {
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        conf.validate().map_err(ProxyError::from)?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_cluster_refs(&self) -> Result<(), ValidationError> {
        let mut ids = HashSet::new();
        for cluster in &self.clusters {
            if !ids.insert(cluster.id.as_str()) {
                let mut err = ValidationError::new("duplicate_cluster_id");
                err.add_param("id".into(), &cluster.id);
                return Err(err);
            }
        }

        if !ids.contains(self.upstream.as_str()) {
            let mut err = ValidationError::new("unknown_upstream_cluster");
            err.add_param("cluster".into(), &self.upstream);
            return Err(err);
        }

        for rule in &self.aggregate.rules {
            for target in &rule.targets {
                if !ids.contains(target.cluster.as_str()) {
                    let mut err = ValidationError::new("unknown_target_cluster");
                    err.add_param("target".into(), &target.id);
                    err.add_param("cluster".into(), &target.cluster);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
    #[serde(default)]
    pub offer_h2c: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1))]
    pub path: String,
    #[validate(custom(function = "Log::validate_level"))]
    pub level: Option<String>,
}

impl Log {
    fn validate_level(level: &str) -> Result<(), ValidationError> {
        log::LevelFilter::from_str(level)
            .map(|_| ())
            .map_err(|_| ValidationError::new("invalid_log_level"))
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        self.level
            .as_deref()
            .and_then(|level| log::LevelFilter::from_str(level).ok())
            .unwrap_or(log::LevelFilter::Info)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Timeout {
    pub connect: u64,
    pub send: u64,
    pub read: u64,
}

/// A named set of upstream nodes. Its id is the cluster identifier targets
/// refer to.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Cluster {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1), custom(function = "Cluster::validate_nodes_keys"))]
    pub nodes: HashMap<String, u32>,
    #[serde(default)]
    pub r#type: SelectionType,
    #[serde(default)]
    pub scheme: ClusterScheme,
    /// Host header and SNI used towards the nodes.
    pub host: Option<String>,
    #[validate(nested)]
    pub timeout: Option<Timeout>,
}

impl Cluster {
    fn validate_nodes_keys(nodes: &HashMap<String, u32>) -> Result<(), ValidationError> {
        for key in nodes.keys() {
            if key.parse::<SocketAddr>().is_err() {
                let mut err = ValidationError::new("invalid_node_key");
                err.add_param("key".into(), &key.to_string());
                return Err(err);
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionType {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Copy, Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterScheme {
    #[default]
    HTTP,
    HTTPS,
}

#[derive(Clone, Default, Debug, PartialEq, Serialize, Deserialize)]
pub enum HttpMethod {
    #[default]
    GET,
    POST,
    PUT,
    DELETE,
    PATCH,
    HEAD,
    OPTIONS,
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let method = match self {
            HttpMethod::GET => "GET",
            HttpMethod::POST => "POST",
            HttpMethod::PUT => "PUT",
            HttpMethod::DELETE => "DELETE",
            HttpMethod::PATCH => "PATCH",
            HttpMethod::HEAD => "HEAD",
            HttpMethod::OPTIONS => "OPTIONS",
        };
        write!(f, "{}", method)
    }
}

/// Aggregation settings. Absent from the file means no rules, so every
/// request passes through.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Aggregate {
    /// Budget for every dispatched call, in milliseconds.
    #[serde(default = "Aggregate::default_timeout")]
    #[validate(range(min = 1))]
    pub timeout: u64,
    /// Largest call response body kept, in bytes.
    #[serde(default = "Aggregate::default_max_body_size")]
    #[validate(range(min = 1))]
    pub max_body_size: usize,
    #[serde(default)]
    #[validate(nested)]
    pub rules: Vec<AggregationRule>,
}

impl Default for Aggregate {
    fn default() -> Self {
        Self {
            timeout: Self::default_timeout(),
            max_body_size: Self::default_max_body_size(),
            rules: Vec::new(),
        }
    }
}

impl Aggregate {
    fn default_timeout() -> u64 {
        5000
    }

    fn default_max_body_size() -> usize {
        1024 * 1024
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "AggregationRule::validate_unique_keys"))]
pub struct AggregationRule {
    #[validate(custom(function = "validate_path"))]
    pub path: String,
    #[serde(default)]
    #[validate(nested)]
    pub targets: Vec<UpstreamTarget>,
}

impl AggregationRule {
    // Target ids and extracted keys share the key space of the merged object.
    fn validate_unique_keys(&self) -> Result<(), ValidationError> {
        let mut ids = HashSet::new();
        for target in &self.targets {
            if !ids.insert(target.id.as_str()) {
                let mut err = ValidationError::new("duplicate_target_id");
                err.add_param("id".into(), &target.id);
                return Err(err);
            }
        }

        let mut keys = ids;
        for target in &self.targets {
            for extract in &target.extract {
                if !keys.insert(extract.key.as_str()) {
                    let mut err = ValidationError::new("duplicate_merged_key");
                    err.add_param("key".into(), &extract.key);
                    return Err(err);
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct UpstreamTarget {
    #[validate(length(min = 1))]
    pub id: String,
    #[validate(length(min = 1))]
    pub cluster: String,
    #[validate(custom(function = "validate_path"))]
    pub path: String,
    #[serde(default)]
    pub method: HttpMethod,
    /// Authority sent with the call, defaults to the cluster host.
    pub host: Option<String>,
    /// Inbound request headers copied onto the call when present.
    #[serde(default)]
    pub forward_headers: Vec<String>,
    #[serde(default)]
    #[validate(nested)]
    pub extract: Vec<Extract>,
}

/// Lifts the value at `pointer` out of a target's document into `key` of the
/// merged object.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Extract {
    #[validate(length(min = 1))]
    pub key: String,
    #[validate(custom(function = "validate_pointer"))]
    pub pointer: String,
}

fn validate_path(path: &str) -> Result<(), ValidationError> {
    if path.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::new("path_must_start_with_slash"))
    }
}

fn validate_pointer(pointer: &str) -> Result<(), ValidationError> {
    if pointer.is_empty() || pointer.starts_with('/') {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_json_pointer"))
    }
}
