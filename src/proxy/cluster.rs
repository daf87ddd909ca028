use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, Result};
use pingora_http::RequestHeader;
use pingora_load_balancing::{
    discovery::Static,
    selection::{BackendIter, BackendSelection, Random, RoundRobin},
    Backend, Backends, LoadBalancer,
};

use crate::config;

/// A named group of upstream nodes.
///
/// Serves both the pass-through proxy and the calls dispatched by the
/// aggregation filter.
pub struct ProxyCluster {
    pub inner: config::Cluster,
    lb: SelectionLB,
}

impl TryFrom<config::Cluster> for ProxyCluster {
    type Error = Box<Error>;

    fn try_from(value: config::Cluster) -> Result<Self> {
        Ok(Self {
            lb: SelectionLB::try_from(&value)?,
            inner: value,
        })
    }
}

impl ProxyCluster {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Authority used towards the nodes when none is given explicitly.
    pub fn authority(&self) -> &str {
        self.inner.host.as_deref().unwrap_or(&self.inner.id)
    }

    /// Selects a node and returns a peer for it.
    pub fn select_peer(&self) -> Option<HttpPeer> {
        let backend = match &self.lb {
            SelectionLB::RoundRobin(lb) => lb.select(b"", 256),
            SelectionLB::Random(lb) => lb.select(b"", 256),
        }?;

        let mut peer = backend.ext.get::<HttpPeer>()?.clone();
        self.set_timeout(&mut peer);
        Some(peer)
    }

    /// Rewrites the upstream host in the request header if configured.
    pub fn upstream_host_rewrite(&self, upstream_request: &mut RequestHeader) -> Result<()> {
        if let Some(host) = &self.inner.host {
            upstream_request.insert_header(http::header::HOST, host)?;
        }
        Ok(())
    }

    fn set_timeout(&self, p: &mut HttpPeer) {
        if let Some(config::Timeout {
            connect,
            read,
            send,
        }) = self.inner.timeout
        {
            p.options.connection_timeout = Some(Duration::from_secs(connect));
            p.options.read_timeout = Some(Duration::from_secs(read));
            p.options.write_timeout = Some(Duration::from_secs(send));
        }
    }
}

enum SelectionLB {
    RoundRobin(LoadBalancer<RoundRobin>),
    Random(LoadBalancer<Random>),
}

impl TryFrom<&config::Cluster> for SelectionLB {
    type Error = Box<Error>;

    fn try_from(value: &config::Cluster) -> Result<Self> {
        match value.r#type {
            config::SelectionType::RoundRobin => Ok(SelectionLB::RoundRobin(build_lb(value)?)),
            config::SelectionType::Random => Ok(SelectionLB::Random(build_lb(value)?)),
        }
    }
}

fn build_lb<BS>(cluster: &config::Cluster) -> Result<LoadBalancer<BS>>
where
    BS: BackendSelection + 'static,
    BS::Iter: BackendIter,
{
    let tls = cluster.scheme == config::ClusterScheme::HTTPS;
    let sni = cluster.host.clone().unwrap_or_default();

    let mut backends = BTreeSet::new();
    for (addr, weight) in cluster.nodes.iter() {
        let mut backend = Backend::new(addr)?;
        backend.weight = *weight as usize;

        let peer = HttpPeer::new(addr.as_str(), tls, sni.clone());
        backend.ext.insert::<HttpPeer>(peer);
        backends.insert(backend);
    }

    let lb = LoadBalancer::<BS>::from_backends(Backends::new(Static::new(backends)));
    match lb.update().now_or_never() {
        Some(result) => result?,
        None => return Error::e_explain(InternalError, "static discovery should not block"),
    }

    Ok(lb)
}

/// Every configured cluster by id. Built once at startup, read-only after.
#[derive(Default)]
pub struct ClusterRegistry {
    clusters: HashMap<String, Arc<ProxyCluster>>,
}

impl ClusterRegistry {
    pub fn from_config(clusters: &[config::Cluster]) -> Result<Self> {
        let mut registry = Self::default();
        for cluster in clusters.iter() {
            log::info!("Configuring Cluster: {}", cluster.id);
            let proxy_cluster = ProxyCluster::try_from(cluster.clone()).map_err(|e| {
                log::error!("Failed to configure Cluster {}: {}", cluster.id, e);
                e
            })?;
            registry
                .clusters
                .insert(cluster.id.clone(), Arc::new(proxy_cluster));
        }
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxyCluster>> {
        let cluster = self.clusters.get(id).cloned();
        if cluster.is_none() {
            log::warn!("Cluster with id '{}' not found", id);
        }
        cluster
    }
}
