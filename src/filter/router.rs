use std::{sync::Arc, time::Duration};

use crate::config::{Aggregate, AggregationRule};

/// Immutable set of aggregation rules, built once at startup and shared by
/// every exchange.
#[derive(Debug, Default)]
pub struct RuleStore {
    rules: Vec<Arc<AggregationRule>>,
    call_timeout: Duration,
}

impl From<&Aggregate> for RuleStore {
    fn from(value: &Aggregate) -> Self {
        for rule in value.rules.iter() {
            log::info!(
                "Configuring aggregation rule: {} ({} targets)",
                rule.path,
                rule.targets.len()
            );
        }

        Self {
            rules: value.rules.iter().cloned().map(Arc::new).collect(),
            call_timeout: Duration::from_millis(value.timeout),
        }
    }
}

impl RuleStore {
    /// Selects the first declared rule whose path equals the request path.
    /// Any query string is ignored.
    pub fn match_path(&self, path: &str) -> Option<&Arc<AggregationRule>> {
        let path = path.split_once('?').map_or(path, |(path, _)| path);
        self.rules.iter().find(|rule| rule.path == path)
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }
}
