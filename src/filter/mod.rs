//! Request aggregation filter.
//!
//! On a request whose path matches an aggregation rule, the filter fans out
//! one call per configured target, holds the request until every call has
//! settled, and replaces the response body with the merged documents.

pub mod aggregator;
pub mod coordinator;
pub mod router;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use bytes::Bytes;
use http::header;

use crate::core::host::PATH;
use crate::core::{Action, CallCompletion, CallGateway, CallToken, HttpPipeline};

pub use aggregator::ResponseAggregator;
pub use coordinator::Coordinator;
pub use router::RuleStore;
pub use state::{CallOutcome, RequestCallState, Resolution};

/// Where an exchange stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    /// Request headers not seen yet.
    NoRule,
    /// No rule matched; the exchange is left alone.
    PassThrough,
    /// Calls dispatched, this many still outstanding.
    Waiting(usize),
    /// Every call settled.
    Ready,
}

/// Per-exchange filter context.
///
/// Created for every inbound request and dropped with it. All callbacks for
/// one exchange arrive on the same execution context, one at a time.
pub struct AggregationFilter {
    store: Arc<RuleStore>,
    coordinator: Option<Coordinator>,
    aggregator: ResponseAggregator,
    routed: bool,
    response_headers_paused: bool,
    response_body_paused: bool,
    merged: bool,
}

impl AggregationFilter {
    pub fn new(store: Arc<RuleStore>) -> Self {
        Self {
            store,
            coordinator: None,
            aggregator: ResponseAggregator::default(),
            routed: false,
            response_headers_paused: false,
            response_body_paused: false,
            merged: false,
        }
    }

    pub fn state(&self) -> ExchangeState {
        match &self.coordinator {
            None if self.routed => ExchangeState::PassThrough,
            None => ExchangeState::NoRule,
            Some(c) if c.is_ready() => ExchangeState::Ready,
            Some(c) => ExchangeState::Waiting(c.state().outstanding()),
        }
    }

    /// Whether a rule matched this exchange.
    pub fn is_aggregating(&self) -> bool {
        self.coordinator.is_some()
    }

    pub fn on_request_headers(
        &mut self,
        gateway: &mut dyn CallGateway,
        pipeline: &mut dyn HttpPipeline,
    ) -> Action {
        self.routed = true;

        let path = pipeline.request_header(PATH).unwrap_or_default();
        let Some(rule) = self.store.match_path(&path) else {
            log::debug!("no aggregation rule for {path}");
            return Action::Continue;
        };

        let mut coordinator = Coordinator::new(rule.clone());
        let action = coordinator.start(self.store.call_timeout(), gateway, pipeline);
        self.coordinator = Some(coordinator);
        action
    }

    /// Completion callback for a call dispatched by this exchange.
    pub fn on_http_call_response(
        &mut self,
        token: CallToken,
        completion: CallCompletion,
        gateway: &dyn CallGateway,
        pipeline: &mut dyn HttpPipeline,
    ) {
        let Some(coordinator) = self.coordinator.as_mut() else {
            log::warn!("completion for call {token} on an exchange without calls");
            return;
        };

        if coordinator.on_call_response(token, completion, gateway, pipeline) == Resolution::Ready {
            self.on_ready(pipeline);
        }
    }

    pub fn on_response_headers(&mut self, pipeline: &mut dyn HttpPipeline) -> Action {
        let Some(coordinator) = &self.coordinator else {
            return Action::Continue;
        };

        if !coordinator.is_ready() {
            log::info!("waiting for calls before releasing response headers");
            self.response_headers_paused = true;
            return Action::Pause;
        }

        prepare_response_headers(pipeline);
        Action::Continue
    }

    /// Holds back the response body until its end, then replaces it with
    /// the merged body.
    pub fn on_response_body(
        &mut self,
        chunk: Option<Bytes>,
        end_of_stream: bool,
        pipeline: &mut dyn HttpPipeline,
    ) -> Action {
        let Some(coordinator) = &self.coordinator else {
            return Action::Continue;
        };

        self.aggregator.discard(chunk);
        if !end_of_stream {
            log::debug!("waiting for the end of the response body");
            return Action::Pause;
        }

        if !coordinator.is_ready() {
            self.response_body_paused = true;
            return Action::Pause;
        }

        self.replace_body(pipeline);
        Action::Continue
    }

    fn on_ready(&mut self, pipeline: &mut dyn HttpPipeline) {
        if self.response_headers_paused {
            self.response_headers_paused = false;
            prepare_response_headers(pipeline);
            pipeline.resume_response();
        } else if self.response_body_paused {
            self.response_body_paused = false;
            self.replace_body(pipeline);
            pipeline.resume_response();
        }
    }

    fn replace_body(&mut self, pipeline: &mut dyn HttpPipeline) {
        if self.merged {
            return;
        }
        let Some(coordinator) = &self.coordinator else {
            return;
        };

        let body = ResponseAggregator::merge(coordinator.state());
        log::info!(
            "replacing {} byte response body with {} byte aggregate",
            self.aggregator.discarded_len(),
            body.len()
        );
        pipeline.replace_response_body(body);
        self.merged = true;
    }
}

// The body is about to be replaced, so whatever the upstream announced about
// its length, encoding and version is stale.
fn prepare_response_headers(pipeline: &mut dyn HttpPipeline) {
    pipeline.remove_response_header(header::CONTENT_LENGTH.as_str());
    pipeline.remove_response_header(header::CONTENT_ENCODING.as_str());
    pipeline.remove_response_header(header::ETAG.as_str());
    pipeline.set_response_header(header::CONTENT_TYPE.as_str(), "application/json");
}
