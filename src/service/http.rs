use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::HTTPStatus, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::config::Config;
use crate::proxy::cluster::{ClusterRegistry, ProxyCluster};
use crate::proxy::plugin::{build_plugin_executor, PluginExecutor, ProxyPlugin};
use crate::proxy::ProxyContext;

/// Proxy service.
///
/// Forwards every request to the default upstream cluster and runs the plugin
/// chain around it.
pub struct HttpService {
    upstream: Arc<ProxyCluster>,
    plugin: Arc<PluginExecutor>,
}

#[async_trait]
impl ProxyHttp for HttpService {
    type CTX = ProxyContext;

    /// Creates a new context for each request
    fn new_ctx(&self) -> Self::CTX {
        ProxyContext::new(self.plugin.clone())
    }

    /// Selects an upstream peer for the request
    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        self.upstream
            .select_peer()
            .map(Box::new)
            .ok_or_else(|| {
                Error::explain(
                    HTTPStatus(503),
                    format!("no node available in cluster '{}'", self.upstream.id()),
                )
            })
    }

    /// Filters incoming requests
    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        // execute plugins
        ctx.plugin.clone().request_filter(session, ctx).await
    }

    // Modify the request before it is sent to the upstream
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        _ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.upstream.upstream_host_rewrite(upstream_request)
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        // execute plugins
        ctx.plugin
            .clone()
            .response_filter(session, upstream_response, ctx)
            .await
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        // execute plugins
        ctx.plugin
            .clone()
            .response_body_filter(session, body, end_of_stream, ctx)?;
        Ok(None)
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        // execute plugins
        ctx.plugin.clone().logging(session, e, ctx).await;
    }
}

/// Initializes a proxy service from the given configuration.
pub fn build_http_service(config: &Config) -> Result<HttpService> {
    let clusters = Arc::new(ClusterRegistry::from_config(&config.clusters)?);

    let upstream = clusters.get(&config.upstream).ok_or_else(|| {
        Error::explain(
            pingora_error::ErrorType::InternalError,
            format!("upstream cluster '{}' is not configured", config.upstream),
        )
    })?;

    Ok(HttpService {
        upstream,
        plugin: build_plugin_executor(config, clusters),
    })
}
