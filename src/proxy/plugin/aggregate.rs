use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Version};
use pingora_core::connectors::http::Connector;
use pingora_error::{Error, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

use crate::config;
use crate::core::Action;
use crate::filter::{AggregationFilter, RuleStore};
use crate::proxy::{
    cluster::ClusterRegistry, gateway::PingoraCallGateway, pipeline::SessionPipeline,
    ProxyContext,
};

use super::ProxyPlugin;

pub const PLUGIN_NAME: &str = "aggregate";

pub fn create_aggregate_plugin(
    config: &config::Aggregate,
    clusters: Arc<ClusterRegistry>,
) -> Arc<dyn ProxyPlugin> {
    Arc::new(PluginAggregate {
        store: Arc::new(RuleStore::from(config)),
        clusters,
        connector: Arc::new(Connector::new(None)),
        max_body_size: config.max_body_size,
    })
}

/// Runs the request phase of one exchange. Returns once the filter let the
/// request go, which for a matched rule is after every call settled.
pub async fn hold_request(
    filter: &mut AggregationFilter,
    gateway: &mut PingoraCallGateway,
    pipeline: &mut SessionPipeline,
) {
    if filter.on_request_headers(gateway, pipeline) != Action::Pause {
        return;
    }

    pipeline.pause_request();
    log::debug!("holding request for {} calls", gateway.in_flight());

    while pipeline.request_paused() {
        let Some((token, completion)) = gateway.next_completion().await else {
            log::error!("request still held with no call in flight");
            break;
        };
        filter.on_http_call_response(token, completion, &*gateway, pipeline);
    }
}

// The merged body length is not known up front; HTTP/1.0 has no chunked
// framing and h2 frames bodies itself.
fn chunked_framing(version: Version) -> bool {
    version == Version::HTTP_11
}

/// Filter state carried from the request phase to the response phases.
pub struct AggregationExchange {
    pub filter: AggregationFilter,
    pub pipeline: SessionPipeline,
}

/// Fans out the calls of a matched rule while holding the request, then
/// swaps the upstream response body for the merged documents.
pub struct PluginAggregate {
    store: Arc<RuleStore>,
    clusters: Arc<ClusterRegistry>,
    connector: Arc<Connector>,
    max_body_size: usize,
}

#[async_trait]
impl ProxyPlugin for PluginAggregate {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn priority(&self) -> i32 {
        1000
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let mut filter = AggregationFilter::new(self.store.clone());
        let mut pipeline = SessionPipeline::new(session.req_header());
        let mut gateway = PingoraCallGateway::new(
            self.clusters.clone(),
            self.connector.clone(),
            self.max_body_size,
        );

        hold_request(&mut filter, &mut gateway, &mut pipeline).await;

        if filter.is_aggregating() {
            ctx.aggregation = Some(AggregationExchange { filter, pipeline });
        }
        Ok(false)
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        let Some(exchange) = ctx.aggregation.as_mut() else {
            return Ok(());
        };

        if exchange.filter.on_response_headers(&mut exchange.pipeline) == Action::Pause {
            // The request phase is only left once every call settled.
            log::warn!("response headers reached before the calls settled");
            exchange.pipeline.pause_response();
        }
        exchange.pipeline.apply_response_headers(upstream_response)?;

        if chunked_framing(session.req_header().version) {
            upstream_response.insert_header(header::TRANSFER_ENCODING, "chunked")?;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        let Some(exchange) = ctx.aggregation.as_mut() else {
            return Ok(());
        };

        let chunk = body.take();
        match exchange
            .filter
            .on_response_body(chunk, end_of_stream, &mut exchange.pipeline)
        {
            Action::Continue => *body = exchange.pipeline.take_response_body(),
            Action::Pause => exchange.pipeline.pause_response(),
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut ProxyContext) {
        let Some(exchange) = ctx.aggregation.as_ref() else {
            return;
        };

        log::info!(
            "aggregated {} in {:?}: {:?}{}",
            session.req_header().uri.path(),
            ctx.request_start.elapsed(),
            exchange.filter.state(),
            e.map(|e| format!(", error: {e}")).unwrap_or_default()
        );
    }
}
