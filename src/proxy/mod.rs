pub mod cluster;
pub mod gateway;
pub mod pipeline;
pub mod plugin;

#[cfg(test)]
pub(crate) mod testing;

use std::{sync::Arc, time::Instant};

use plugin::{aggregate::AggregationExchange, PluginExecutor};

/// Proxy context.
///
/// Holds the context for each request.
pub struct ProxyContext {
    pub request_start: Instant,
    pub plugin: Arc<PluginExecutor>,
    pub aggregation: Option<AggregationExchange>,
}

impl ProxyContext {
    pub fn new(plugin: Arc<PluginExecutor>) -> Self {
        Self {
            request_start: Instant::now(),
            plugin,
            aggregation: None,
        }
    }
}
