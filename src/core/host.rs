//! Host seams used by the aggregation filter
//!
//! The filter never talks to pingora directly. It issues upstream calls
//! through a [`CallGateway`] and drives the request/response exchange through
//! an [`HttpPipeline`]; completions are fed back one at a time on the same
//! execution context that runs the phases.

use std::time::Duration;

use bytes::Bytes;

use super::error::{ProxyError, ProxyResult};

/// Identifies one dispatched upstream call within an exchange.
pub type CallToken = u32;

/// Pseudo header carrying the request method.
pub const METHOD: &str = ":method";
/// Pseudo header carrying the request path.
pub const PATH: &str = ":path";
/// Pseudo header carrying the request authority.
pub const AUTHORITY: &str = ":authority";

/// Outcome of a phase callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Hand the exchange to the next stage.
    Continue,
    /// Hold the exchange until the filter resumes it.
    Pause,
}

/// Completion signal for one dispatched call.
///
/// A successful completion only carries sizes; the body is fetched through
/// [`CallGateway::call_response_body`] while the completion is being handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCompletion {
    Response {
        num_headers: usize,
        body_size: usize,
        num_trailers: usize,
    },
    Failed(ProxyError),
}

/// Facility for issuing asynchronous upstream calls.
pub trait CallGateway {
    /// Issue one call. A returned error means no completion will ever be
    /// delivered for it.
    fn dispatch_http_call(
        &mut self,
        cluster: &str,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        trailers: Vec<(String, String)>,
        timeout: Duration,
    ) -> ProxyResult<CallToken>;

    /// Status of the call whose completion is being delivered.
    fn call_response_status(&self) -> Option<u16>;

    /// Body bytes of the call whose completion is being delivered.
    fn call_response_body(&self, offset: usize, size: usize) -> ProxyResult<Bytes>;
}

/// The paused request/response exchange the filter runs inside.
pub trait HttpPipeline {
    /// Inbound request header, pseudo headers included.
    fn request_header(&self, name: &str) -> Option<String>;

    /// Release the request phase. Only valid while it is paused.
    fn resume_request(&mut self);

    /// Release the response phase. Only valid while it is paused.
    fn resume_response(&mut self);

    fn set_response_header(&mut self, name: &str, value: &str);

    fn remove_response_header(&mut self, name: &str);

    fn replace_response_body(&mut self, body: Bytes);
}
