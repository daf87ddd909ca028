use bytes::Bytes;
use serde_json::{json, Map, Value as JsonValue};

use crate::config::UpstreamTarget;
use crate::core::ProxyError;

use super::state::{CallOutcome, RequestCallState};

/// Holds back the original response body and builds the merged body once
/// the call state is complete.
#[derive(Debug, Default)]
pub struct ResponseAggregator {
    discarded: usize,
}

impl ResponseAggregator {
    /// Drops one chunk of the original response body, counting its bytes.
    pub fn discard(&mut self, chunk: Option<Bytes>) {
        if let Some(chunk) = chunk {
            self.discarded += chunk.len();
        }
    }

    pub fn discarded_len(&self) -> usize {
        self.discarded
    }

    /// Builds the merged JSON object from the outcomes, visited in target
    /// declaration order. Arrival order of the completions plays no part.
    ///
    /// A target without extraction contributes `{ "<id>": <document> }`; one
    /// with extraction contributes each extracted key. Failed calls and
    /// bodies that are not JSON become `{ "<id>": { "error": { .. } } }`.
    pub fn merge(state: &RequestCallState) -> Bytes {
        let mut merged = Map::new();

        for (target, outcome) in state.outcomes() {
            match outcome {
                CallOutcome::Succeeded(body) => match serde_json::from_slice::<JsonValue>(body) {
                    Ok(document) => merge_document(&mut merged, target, document),
                    Err(e) => {
                        log::warn!("call '{}' returned an invalid document: {}", target.id, e);
                        let err = ProxyError::Merge(e.to_string());
                        merged.insert(target.id.clone(), failure_marker(&err));
                    }
                },
                CallOutcome::Failed(err) => {
                    merged.insert(target.id.clone(), failure_marker(err));
                }
                CallOutcome::Pending => {
                    let err = ProxyError::Internal("call still pending".to_string());
                    merged.insert(target.id.clone(), failure_marker(&err));
                }
            }
        }

        Bytes::from(JsonValue::Object(merged).to_string())
    }
}

fn merge_document(merged: &mut Map<String, JsonValue>, target: &UpstreamTarget, document: JsonValue) {
    if target.extract.is_empty() {
        merged.insert(target.id.clone(), document);
        return;
    }

    for extract in target.extract.iter() {
        let value = document
            .pointer(&extract.pointer)
            .cloned()
            .unwrap_or(JsonValue::Null);
        merged.insert(extract.key.clone(), value);
    }
}

fn failure_marker(err: &ProxyError) -> JsonValue {
    json!({
        "error": {
            "kind": err.kind(),
            "message": err.to_string(),
        }
    })
}
