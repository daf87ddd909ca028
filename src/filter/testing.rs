//! In-memory host used by the filter tests.

use std::collections::HashSet;
use std::time::Duration;

use bytes::Bytes;

use crate::config::{AggregationRule, Extract, HttpMethod, UpstreamTarget};
use crate::core::host::{METHOD, PATH};
use crate::core::{CallCompletion, CallGateway, CallToken, HttpPipeline, ProxyError, ProxyResult};

pub fn target(id: &str, path: &str) -> UpstreamTarget {
    target_on(id, "test", path)
}

pub fn target_on(id: &str, cluster: &str, path: &str) -> UpstreamTarget {
    UpstreamTarget {
        id: id.to_string(),
        cluster: cluster.to_string(),
        path: path.to_string(),
        method: HttpMethod::GET,
        host: None,
        forward_headers: Vec::new(),
        extract: Vec::new(),
    }
}

pub fn extracting(mut target: UpstreamTarget, fields: &[(&str, &str)]) -> UpstreamTarget {
    target.extract = fields
        .iter()
        .map(|(key, pointer)| Extract {
            key: key.to_string(),
            pointer: pointer.to_string(),
        })
        .collect();
    target
}

pub fn rule(path: &str, targets: Vec<UpstreamTarget>) -> AggregationRule {
    AggregationRule {
        path: path.to_string(),
        targets,
    }
}

#[derive(Debug)]
pub struct Dispatched {
    pub token: CallToken,
    pub cluster: String,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl Dispatched {
    pub fn path(&self) -> &str {
        self.headers
            .iter()
            .find(|(name, _)| name == PATH)
            .map_or("", |(_, value)| value.as_str())
    }
}

/// Records dispatches; the test decides when and how each call completes.
#[derive(Debug, Default)]
pub struct MockGateway {
    pub dispatched: Vec<Dispatched>,
    failing: HashSet<String>,
    next_token: CallToken,
    current: Option<(u16, Option<Bytes>)>,
}

impl MockGateway {
    pub fn fail_cluster(&mut self, cluster: &str) {
        self.failing.insert(cluster.to_string());
    }

    pub fn token_of(&self, target_path: &str) -> CallToken {
        self.dispatched
            .iter()
            .find(|d| d.path() == target_path)
            .map(|d| d.token)
            .unwrap()
    }

    /// Makes a response current and returns the completion announcing it.
    pub fn respond(&mut self, status: u16, body: &str) -> CallCompletion {
        self.current = Some((status, Some(Bytes::copy_from_slice(body.as_bytes()))));
        CallCompletion::Response {
            num_headers: 1,
            body_size: body.len(),
            num_trailers: 0,
        }
    }

    pub fn respond_unreadable(&mut self, status: u16, body_size: usize) -> CallCompletion {
        self.current = Some((status, None));
        CallCompletion::Response {
            num_headers: 1,
            body_size,
            num_trailers: 0,
        }
    }
}

impl CallGateway for MockGateway {
    fn dispatch_http_call(
        &mut self,
        cluster: &str,
        headers: Vec<(String, String)>,
        _body: Option<Bytes>,
        _trailers: Vec<(String, String)>,
        timeout: Duration,
    ) -> ProxyResult<CallToken> {
        if self.failing.contains(cluster) {
            return Err(ProxyError::Dispatch(format!("no healthy node in {cluster}")));
        }
        let token = self.next_token;
        self.next_token += 1;
        self.dispatched.push(Dispatched {
            token,
            cluster: cluster.to_string(),
            headers,
            timeout,
        });
        Ok(token)
    }

    fn call_response_status(&self) -> Option<u16> {
        self.current.as_ref().map(|(status, _)| *status)
    }

    fn call_response_body(&self, offset: usize, size: usize) -> ProxyResult<Bytes> {
        match &self.current {
            Some((_, Some(body))) if offset + size <= body.len() => {
                Ok(body.slice(offset..offset + size))
            }
            _ => Err(ProxyError::BodyRead("body not available".to_string())),
        }
    }
}

/// Exchange double. Tracks pause state the way the surrounding proxy would
/// and records any resume issued while the phase was not paused.
#[derive(Debug, Default)]
pub struct MockPipeline {
    pub path: String,
    pub request_headers: Vec<(String, String)>,
    pub request_paused: bool,
    pub response_paused: bool,
    pub request_resumes: usize,
    pub response_resumes: usize,
    pub response_headers: Vec<(String, String)>,
    pub response_body: Option<Bytes>,
    violations: Vec<&'static str>,
}

impl MockPipeline {
    pub fn running_request(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Default::default()
        }
    }

    pub fn paused_request(path: &str) -> Self {
        Self {
            request_paused: true,
            ..Self::running_request(path)
        }
    }

    pub fn with_request_header(mut self, name: &str, value: &str) -> Self {
        self.request_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_response_header(mut self, name: &str, value: &str) -> Self {
        self.response_headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn response_header(&self, name: &str) -> Option<&str> {
        self.response_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn assert_consistent(&self) {
        assert!(self.violations.is_empty(), "pipeline misuse: {:?}", self.violations);
    }
}

impl HttpPipeline for MockPipeline {
    fn request_header(&self, name: &str) -> Option<String> {
        match name {
            PATH => Some(self.path.clone()),
            METHOD => Some("GET".to_string()),
            _ => self
                .request_headers
                .iter()
                .find(|(n, _)| n.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone()),
        }
    }

    fn resume_request(&mut self) {
        if !self.request_paused {
            self.violations.push("resume_request while not paused");
        }
        self.request_paused = false;
        self.request_resumes += 1;
    }

    fn resume_response(&mut self) {
        if !self.response_paused {
            self.violations.push("resume_response while not paused");
        }
        self.response_paused = false;
        self.response_resumes += 1;
    }

    fn set_response_header(&mut self, name: &str, value: &str) {
        self.remove_response_header(name);
        self.response_headers.push((name.to_string(), value.to_string()));
    }

    fn remove_response_header(&mut self, name: &str) {
        self.response_headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    fn replace_response_body(&mut self, body: Bytes) {
        self.response_body = Some(body);
    }
}
