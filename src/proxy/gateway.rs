use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use http::header;
use pingora_core::{connectors::http::Connector, upstreams::peer::HttpPeer};
use pingora_http::RequestHeader;

use crate::core::host::{AUTHORITY, METHOD, PATH};
use crate::core::{CallCompletion, CallGateway, CallToken, ProxyError, ProxyResult};

use super::cluster::{ClusterRegistry, ProxyCluster};

struct CallResponse {
    status: u16,
    num_headers: usize,
    body: Bytes,
}

type InFlightCall = BoxFuture<'static, (CallToken, ProxyResult<CallResponse>)>;

/// Issues the calls of one exchange over pingora's connection pool.
///
/// Calls run concurrently; their completions come back one at a time through
/// [`PingoraCallGateway::next_completion`], which also makes the delivered
/// response current for the status and body accessors.
pub struct PingoraCallGateway {
    clusters: Arc<ClusterRegistry>,
    connector: Arc<Connector>,
    max_body_size: usize,
    next_token: CallToken,
    in_flight: FuturesUnordered<InFlightCall>,
    current: Option<CallResponse>,
}

impl PingoraCallGateway {
    pub fn new(clusters: Arc<ClusterRegistry>, connector: Arc<Connector>, max_body_size: usize) -> Self {
        Self {
            clusters,
            connector,
            max_body_size,
            next_token: 0,
            in_flight: FuturesUnordered::new(),
            current: None,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Waits for the next call to settle. `None` once nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<(CallToken, CallCompletion)> {
        let (token, result) = self.in_flight.next().await?;
        match result {
            Ok(response) => {
                let completion = CallCompletion::Response {
                    num_headers: response.num_headers,
                    body_size: response.body.len(),
                    num_trailers: 0,
                };
                self.current = Some(response);
                Some((token, completion))
            }
            Err(e) => {
                self.current = None;
                Some((token, CallCompletion::Failed(e)))
            }
        }
    }
}

impl CallGateway for PingoraCallGateway {
    fn dispatch_http_call(
        &mut self,
        cluster: &str,
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
        trailers: Vec<(String, String)>,
        timeout: Duration,
    ) -> ProxyResult<CallToken> {
        let cluster = self
            .clusters
            .get(cluster)
            .ok_or_else(|| ProxyError::Dispatch(format!("unknown cluster '{cluster}'")))?;
        let peer = cluster.select_peer().ok_or_else(|| {
            ProxyError::Dispatch(format!("no node available in cluster '{}'", cluster.id()))
        })?;
        let request = build_call_request(&cluster, headers, body.as_ref())?;

        if !trailers.is_empty() {
            log::warn!("dropping {} trailers, upstream calls do not carry trailers", trailers.len());
        }

        let token = self.next_token;
        self.next_token = self.next_token.wrapping_add(1);

        log::debug!(
            "dispatching call {token} to cluster '{}': {} {}",
            cluster.id(),
            request.method,
            request.uri
        );

        let connector = self.connector.clone();
        let max_body_size = self.max_body_size;
        let call = async move {
            let send = send_call(&connector, &peer, request, body, max_body_size);
            let result = match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => Err(ProxyError::UpstreamTimeout),
            };
            (token, result)
        };
        self.in_flight.push(call.boxed());

        Ok(token)
    }

    fn call_response_status(&self) -> Option<u16> {
        self.current.as_ref().map(|r| r.status)
    }

    fn call_response_body(&self, offset: usize, size: usize) -> ProxyResult<Bytes> {
        let response = self
            .current
            .as_ref()
            .ok_or_else(|| ProxyError::BodyRead("no call response is being delivered".to_string()))?;
        let end = offset
            .checked_add(size)
            .filter(|end| *end <= response.body.len())
            .ok_or_else(|| {
                ProxyError::BodyRead(format!(
                    "range {offset}+{size} exceeds body of {} bytes",
                    response.body.len()
                ))
            })?;
        Ok(response.body.slice(offset..end))
    }
}

fn build_call_request(
    cluster: &ProxyCluster,
    headers: Vec<(String, String)>,
    body: Option<&Bytes>,
) -> ProxyResult<RequestHeader> {
    let invalid = |e: Box<pingora_error::Error>| ProxyError::Dispatch(e.to_string());

    let mut method = String::from("GET");
    let mut path = None;
    let mut authority = None;
    let mut rest = Vec::new();
    for (name, value) in headers {
        match name.as_str() {
            METHOD => method = value,
            PATH => path = Some(value),
            AUTHORITY => authority = Some(value),
            _ => rest.push((name, value)),
        }
    }

    let path = path.ok_or_else(|| ProxyError::Dispatch(format!("call is missing {PATH}")))?;
    let mut request = RequestHeader::build(method.as_str(), path.as_bytes(), None).map_err(invalid)?;

    let authority = authority.unwrap_or_else(|| cluster.authority().to_string());
    request.insert_header(header::HOST, authority).map_err(invalid)?;
    for (name, value) in rest {
        request.append_header(name, value).map_err(invalid)?;
    }
    if let Some(body) = body {
        request
            .insert_header(header::CONTENT_LENGTH, body.len().to_string())
            .map_err(invalid)?;
    }

    Ok(request)
}

async fn send_call(
    connector: &Connector,
    peer: &HttpPeer,
    request: RequestHeader,
    body: Option<Bytes>,
    max_body_size: usize,
) -> ProxyResult<CallResponse> {
    let upstream = |e: Box<pingora_error::Error>| ProxyError::Upstream(e.to_string());

    let (mut session, reused) = connector.get_http_session(peer).await.map_err(upstream)?;
    log::trace!("call connection to {} reused: {}", peer._address, reused);

    session
        .write_request_header(Box::new(request))
        .await
        .map_err(upstream)?;
    if let Some(body) = body {
        session.write_request_body(body, true).await.map_err(upstream)?;
    }
    session.finish_request_body().await.map_err(upstream)?;

    session.read_response_header().await.map_err(upstream)?;
    let (status, num_headers) = match session.response_header() {
        Some(resp) => (resp.status.as_u16(), resp.headers.len()),
        None => return Err(ProxyError::Upstream("no response header".to_string())),
    };

    let mut body = BytesMut::new();
    while let Some(chunk) = session.read_response_body().await.map_err(upstream)? {
        if body.len() + chunk.len() > max_body_size {
            return Err(ProxyError::BodyRead(format!(
                "call response body exceeds {max_body_size} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }

    connector.release_http_session(session, peer, None).await;

    Ok(CallResponse {
        status,
        num_headers,
        body: body.freeze(),
    })
}
