//! Core abstractions for pingagg
//!
//! Error taxonomy and the host interfaces the aggregation filter is written
//! against.

pub mod error;
pub mod host;

pub use error::{ProxyError, ProxyResult};
pub use host::{Action, CallCompletion, CallGateway, CallToken, HttpPipeline};
