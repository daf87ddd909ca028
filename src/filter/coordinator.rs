use std::{collections::HashMap, sync::Arc, time::Duration};

use crate::config::{AggregationRule, UpstreamTarget};
use crate::core::host::{AUTHORITY, METHOD, PATH};
use crate::core::{Action, CallCompletion, CallGateway, CallToken, HttpPipeline, ProxyError};

use super::state::{CallOutcome, RequestCallState, Resolution};

/// Scatter-gather coordinator for one exchange.
///
/// Owns the call state of a matched rule, issues one call per target and
/// folds completions back into their slots. The paused request is resumed
/// once, when the last slot is resolved.
#[derive(Debug)]
pub struct Coordinator {
    state: RequestCallState,
    calls: HashMap<CallToken, usize>,
    paused: bool,
    resumed: bool,
}

impl Coordinator {
    pub fn new(rule: Arc<AggregationRule>) -> Self {
        Self {
            state: RequestCallState::new(rule),
            calls: HashMap::new(),
            paused: false,
            resumed: false,
        }
    }

    /// Dispatches every target of the rule, in declaration order.
    ///
    /// Returns [`Action::Pause`] when at least one call is in flight. A rule
    /// with no targets, or one whose dispatches all failed, has nothing to
    /// wait for and returns [`Action::Continue`].
    pub fn start(
        &mut self,
        timeout: Duration,
        gateway: &mut dyn CallGateway,
        pipeline: &dyn HttpPipeline,
    ) -> Action {
        let rule = self.state.rule().clone();

        for (index, target) in rule.targets.iter().enumerate() {
            log::debug!(
                "dispatching call '{}' to cluster {}{}",
                target.id,
                target.cluster,
                target.path
            );

            let headers = call_headers(target, pipeline);
            match gateway.dispatch_http_call(&target.cluster, headers, None, Vec::new(), timeout) {
                Ok(token) => {
                    self.calls.insert(token, index);
                }
                Err(e) => {
                    log::error!("error dispatching call '{}': {}", target.id, e);
                    let err = match e {
                        ProxyError::Dispatch(_) => e,
                        other => ProxyError::Dispatch(other.to_string()),
                    };
                    self.state.resolve_at(index, CallOutcome::Failed(err));
                }
            }
        }

        if self.state.is_ready() {
            log::debug!("nothing to wait for on {}", rule.path);
            Action::Continue
        } else {
            log::info!(
                "waiting for {} calls on {}",
                self.state.outstanding(),
                rule.path
            );
            self.paused = true;
            Action::Pause
        }
    }

    /// Folds the completion of `token` into its slot.
    ///
    /// A completion that carries a response is read while it is current on
    /// the gateway; a body that cannot be read still resolves the slot.
    pub fn on_call_response(
        &mut self,
        token: CallToken,
        completion: CallCompletion,
        gateway: &dyn CallGateway,
        pipeline: &mut dyn HttpPipeline,
    ) -> Resolution {
        let Some(index) = self.calls.remove(&token) else {
            log::warn!("ignoring completion for unknown call {token}");
            return Resolution::Ignored;
        };

        let outcome = match completion {
            CallCompletion::Failed(e) => CallOutcome::Failed(e),
            CallCompletion::Response { body_size, .. } => match gateway.call_response_status() {
                Some(status) if !(200..300).contains(&status) => {
                    CallOutcome::Failed(ProxyError::Status(status))
                }
                _ => match gateway.call_response_body(0, body_size) {
                    Ok(body) => CallOutcome::Succeeded(body),
                    Err(e) => CallOutcome::Failed(e),
                },
            },
        };

        self.complete(index, outcome, pipeline)
    }

    fn complete(
        &mut self,
        index: usize,
        outcome: CallOutcome,
        pipeline: &mut dyn HttpPipeline,
    ) -> Resolution {
        if let CallOutcome::Failed(e) = &outcome {
            log::warn!("call '{}' failed: {}", self.target_id(index), e);
        } else {
            log::debug!("call '{}' succeeded", self.target_id(index));
        }

        let resolution = self.state.resolve_at(index, outcome);
        if resolution == Resolution::Ready && self.paused && !self.resumed {
            log::info!("all calls settled on {}, resuming request", self.state.rule().path);
            self.resumed = true;
            pipeline.resume_request();
        }
        resolution
    }

    fn target_id(&self, index: usize) -> &str {
        self.state
            .rule()
            .targets
            .get(index)
            .map_or("", |t| t.id.as_str())
    }

    pub fn state(&self) -> &RequestCallState {
        &self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state.is_ready()
    }
}

fn call_headers(target: &UpstreamTarget, pipeline: &dyn HttpPipeline) -> Vec<(String, String)> {
    let mut headers = vec![
        (METHOD.to_string(), target.method.to_string()),
        (PATH.to_string(), target.path.clone()),
    ];
    if let Some(host) = &target.host {
        headers.push((AUTHORITY.to_string(), host.clone()));
    }
    for name in target.forward_headers.iter() {
        // the authority of a call is owned by the gateway
        if name.starts_with(':') || name.eq_ignore_ascii_case(http::header::HOST.as_str()) {
            log::warn!("not forwarding {name} on call '{}'", target.id);
            continue;
        }
        if let Some(value) = pipeline.request_header(name) {
            headers.push((name.to_ascii_lowercase(), value));
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::testing::{rule, target, MockGateway, MockPipeline};

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn coordinator(ids: &[&str]) -> Coordinator {
        let targets = ids.iter().map(|id| target(id, &format!("/{id}"))).collect();
        Coordinator::new(Arc::new(rule("/agg", targets)))
    }

    #[test]
    fn test_start_dispatches_every_target_in_order() {
        let mut gateway = MockGateway::default();
        let pipeline = MockPipeline::paused_request("/agg");
        let mut coordinator = coordinator(&["a", "b", "c"]);

        let action = coordinator.start(TIMEOUT, &mut gateway, &pipeline);

        assert_eq!(Action::Pause, action);
        let paths: Vec<&str> = gateway.dispatched.iter().map(|d| d.path()).collect();
        assert_eq!(vec!["/a", "/b", "/c"], paths);
        assert!(gateway.dispatched.iter().all(|d| d.timeout == TIMEOUT));
        assert_eq!(3, coordinator.state().outstanding());
        assert_eq!(0, pipeline.request_resumes);
        pipeline.assert_consistent();
    }

    #[test]
    fn test_any_arrival_order_resumes_once() {
        let orders: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for order in orders {
            let mut gateway = MockGateway::default();
            let mut pipeline = MockPipeline::paused_request("/agg");
            let mut coordinator = coordinator(&["a", "b", "c"]);
            coordinator.start(TIMEOUT, &mut gateway, &pipeline);

            let tokens: Vec<CallToken> = gateway.dispatched.iter().map(|d| d.token).collect();
            for (step, index) in order.iter().enumerate() {
                let completion = gateway.respond(200, "{}");
                let resolution =
                    coordinator.on_call_response(tokens[*index], completion, &gateway, &mut pipeline);
                if step == 2 {
                    assert_eq!(Resolution::Ready, resolution);
                } else {
                    assert_eq!(Resolution::Recorded(2 - step), resolution);
                }
            }
            assert!(coordinator.is_ready());
            assert_eq!(1, pipeline.request_resumes);
            pipeline.assert_consistent();
        }
    }

    #[test]
    fn test_duplicate_completion_is_ignored() {
        let mut gateway = MockGateway::default();
        let mut pipeline = MockPipeline::paused_request("/agg");
        let mut coordinator = coordinator(&["a", "b"]);
        coordinator.start(TIMEOUT, &mut gateway, &pipeline);
        let a = gateway.dispatched[0].token;
        let b = gateway.dispatched[1].token;

        let completion = gateway.respond(200, r#"{"n":1}"#);
        coordinator.on_call_response(a, completion.clone(), &gateway, &mut pipeline);
        assert_eq!(
            Resolution::Ignored,
            coordinator.on_call_response(a, completion, &gateway, &mut pipeline)
        );
        assert_eq!(1, coordinator.state().outstanding());

        let completion = gateway.respond(200, "{}");
        assert_eq!(
            Resolution::Ready,
            coordinator.on_call_response(b, completion.clone(), &gateway, &mut pipeline)
        );
        assert_eq!(
            Resolution::Ignored,
            coordinator.on_call_response(b, completion, &gateway, &mut pipeline)
        );
        assert_eq!(1, pipeline.request_resumes);
    }

    #[test]
    fn test_zero_targets_never_pauses() {
        let mut gateway = MockGateway::default();
        let pipeline = MockPipeline::running_request("/agg");
        let mut coordinator = coordinator(&[]);

        assert_eq!(Action::Continue, coordinator.start(TIMEOUT, &mut gateway, &pipeline));
        assert!(coordinator.is_ready());
        assert!(gateway.dispatched.is_empty());
        assert_eq!(0, pipeline.request_resumes);
        pipeline.assert_consistent();
    }

    #[test]
    fn test_dispatch_failure_resolves_slot() {
        let mut gateway = MockGateway::default();
        gateway.fail_cluster("broken");
        let mut pipeline = MockPipeline::paused_request("/agg");

        let targets = vec![
            target("a", "/a"),
            crate::filter::testing::target_on("b", "broken", "/b"),
            target("c", "/c"),
        ];
        let mut coordinator = Coordinator::new(Arc::new(rule("/agg", targets)));
        assert_eq!(Action::Pause, coordinator.start(TIMEOUT, &mut gateway, &pipeline));
        assert_eq!(2, coordinator.state().outstanding());

        let tokens: Vec<CallToken> = gateway.dispatched.iter().map(|d| d.token).collect();
        for token in tokens {
            let completion = gateway.respond(200, "{}");
            coordinator.on_call_response(token, completion, &gateway, &mut pipeline);
        }

        assert!(coordinator.is_ready());
        assert_eq!(1, pipeline.request_resumes);
        let (_, outcome) = coordinator.state().outcomes().nth(1).unwrap();
        assert!(matches!(outcome, CallOutcome::Failed(ProxyError::Dispatch(_))));
    }

    #[test]
    fn test_all_dispatches_failed_continues() {
        let mut gateway = MockGateway::default();
        gateway.fail_cluster("test");
        let pipeline = MockPipeline::running_request("/agg");
        let mut coordinator = coordinator(&["a", "b"]);

        assert_eq!(Action::Continue, coordinator.start(TIMEOUT, &mut gateway, &pipeline));
        assert!(coordinator.is_ready());
        assert_eq!(0, pipeline.request_resumes);
        pipeline.assert_consistent();
    }

    #[test]
    fn test_failures_resolve_slots() {
        let mut gateway = MockGateway::default();
        let mut pipeline = MockPipeline::paused_request("/agg");
        let mut coordinator = coordinator(&["timeout", "status", "body"]);
        coordinator.start(TIMEOUT, &mut gateway, &pipeline);
        let tokens: Vec<CallToken> = gateway.dispatched.iter().map(|d| d.token).collect();

        coordinator.on_call_response(
            tokens[0],
            CallCompletion::Failed(ProxyError::UpstreamTimeout),
            &gateway,
            &mut pipeline,
        );
        let completion = gateway.respond(503, "unavailable");
        coordinator.on_call_response(tokens[1], completion, &gateway, &mut pipeline);
        let completion = gateway.respond_unreadable(200, 42);
        coordinator.on_call_response(tokens[2], completion, &gateway, &mut pipeline);

        assert!(coordinator.is_ready());
        assert_eq!(1, pipeline.request_resumes);
        let outcomes: Vec<&CallOutcome> = coordinator.state().outcomes().map(|(_, o)| o).collect();
        assert_eq!(&CallOutcome::Failed(ProxyError::UpstreamTimeout), outcomes[0]);
        assert_eq!(&CallOutcome::Failed(ProxyError::Status(503)), outcomes[1]);
        assert!(matches!(outcomes[2], CallOutcome::Failed(ProxyError::BodyRead(_))));
    }

    #[test]
    fn test_unknown_token_is_ignored() {
        let mut gateway = MockGateway::default();
        let mut pipeline = MockPipeline::paused_request("/agg");
        let mut coordinator = coordinator(&["a"]);
        coordinator.start(TIMEOUT, &mut gateway, &pipeline);

        let completion = gateway.respond(200, "{}");
        assert_eq!(
            Resolution::Ignored,
            coordinator.on_call_response(999, completion, &gateway, &mut pipeline)
        );
        assert_eq!(0, pipeline.request_resumes);
    }

    #[test]
    fn test_call_headers() {
        let mut gateway = MockGateway::default();
        let pipeline = MockPipeline::paused_request("/agg").with_request_header("Authorization", "Bearer t");

        let mut forwarding = target("a", "/a");
        forwarding.host = Some("httpbin.org".to_string());
        forwarding.forward_headers = vec!["Authorization".to_string(), "x-missing".to_string()];
        let mut coordinator = Coordinator::new(Arc::new(rule("/agg", vec![forwarding])));
        coordinator.start(TIMEOUT, &mut gateway, &pipeline);

        let headers = &gateway.dispatched[0].headers;
        assert!(headers.contains(&(METHOD.to_string(), "GET".to_string())));
        assert!(headers.contains(&(PATH.to_string(), "/a".to_string())));
        assert!(headers.contains(&(AUTHORITY.to_string(), "httpbin.org".to_string())));
        assert!(headers.contains(&("authorization".to_string(), "Bearer t".to_string())));
        assert_eq!(4, headers.len());
    }

    #[test]
    fn test_call_headers_skip_authority() {
        let mut gateway = MockGateway::default();
        let pipeline = MockPipeline::paused_request("/agg")
            .with_request_header("Host", "gateway.local")
            .with_request_header("x-trace", "t1");

        let mut forwarding = target("a", "/a");
        forwarding.forward_headers = vec![
            "Host".to_string(),
            PATH.to_string(),
            "x-trace".to_string(),
        ];
        let mut coordinator = Coordinator::new(Arc::new(rule("/agg", vec![forwarding])));
        coordinator.start(TIMEOUT, &mut gateway, &pipeline);

        let headers = &gateway.dispatched[0].headers;
        assert_eq!(
            &vec![
                (METHOD.to_string(), "GET".to_string()),
                (PATH.to_string(), "/a".to_string()),
                ("x-trace".to_string(), "t1".to_string()),
            ],
            headers
        );
    }
}
