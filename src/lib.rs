//! Request aggregation proxy built on pingora.
//!
//! Requests whose path matches an aggregation rule fan out to a set of
//! upstream calls; the response body is replaced with the merged JSON
//! documents once every call has settled.

#![allow(clippy::upper_case_acronyms)]

pub mod config;
pub mod core;
pub mod filter;
pub mod logging;
pub mod proxy;
pub mod service;
