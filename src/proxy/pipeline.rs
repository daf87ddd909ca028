use bytes::Bytes;
use pingora_error::Result;
use pingora_http::{RequestHeader, ResponseHeader};

use crate::core::host::{AUTHORITY, METHOD, PATH};
use crate::core::HttpPipeline;

enum HeaderEdit {
    Set(String, String),
    Remove(String),
}

/// Exchange seen through the pingora session.
///
/// Holds a snapshot of the inbound request header and records what the
/// filter asks of the response. The plugin applies the recorded edits when
/// pingora reaches the matching phase.
pub struct SessionPipeline {
    request: RequestHeader,
    request_paused: bool,
    response_paused: bool,
    header_edits: Vec<HeaderEdit>,
    body: Option<Bytes>,
}

impl SessionPipeline {
    pub fn new(request: &RequestHeader) -> Self {
        Self {
            request: request.clone(),
            request_paused: false,
            response_paused: false,
            header_edits: Vec::new(),
            body: None,
        }
    }

    pub fn pause_request(&mut self) {
        self.request_paused = true;
    }

    pub fn request_paused(&self) -> bool {
        self.request_paused
    }

    pub fn pause_response(&mut self) {
        self.response_paused = true;
    }

    pub fn response_paused(&self) -> bool {
        self.response_paused
    }

    /// Applies and forgets the recorded header edits.
    pub fn apply_response_headers(&mut self, upstream_response: &mut ResponseHeader) -> Result<()> {
        for edit in self.header_edits.drain(..) {
            match edit {
                HeaderEdit::Set(name, value) => {
                    upstream_response.insert_header(name, value)?;
                }
                HeaderEdit::Remove(name) => {
                    upstream_response.remove_header(&name);
                }
            }
        }
        Ok(())
    }

    pub fn take_response_body(&mut self) -> Option<Bytes> {
        self.body.take()
    }
}

impl HttpPipeline for SessionPipeline {
    fn request_header(&self, name: &str) -> Option<String> {
        match name {
            METHOD => Some(self.request.method.as_str().to_string()),
            PATH => self
                .request
                .uri
                .path_and_query()
                .map(|pq| pq.as_str().to_string()),
            AUTHORITY => self
                .request
                .uri
                .authority()
                .map(|a| a.as_str().to_string())
                .or_else(|| self.request_header(http::header::HOST.as_str())),
            _ => self
                .request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }
    }

    fn resume_request(&mut self) {
        if !self.request_paused {
            log::warn!("request resumed while not held");
        }
        self.request_paused = false;
    }

    fn resume_response(&mut self) {
        if !self.response_paused {
            log::warn!("response resumed while not held");
        }
        self.response_paused = false;
    }

    fn set_response_header(&mut self, name: &str, value: &str) {
        self.header_edits
            .push(HeaderEdit::Set(name.to_string(), value.to_string()));
    }

    fn remove_response_header(&mut self, name: &str) {
        self.header_edits.push(HeaderEdit::Remove(name.to_string()));
    }

    fn replace_response_body(&mut self, body: Bytes) {
        self.body = Some(body);
    }
}
