//! Pluggable interceptors and the ordered registry that dispatches flows

use crate::error::InterceptError;
use crate::flow::{Flow, FlowResponse};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

/// What an interceptor decided for a flow's request.
#[derive(Debug)]
pub enum HookOutcome {
    /// Let the next interceptor (and eventually upstream) see the request.
    Continue,
    /// Answer the client with this response; nothing is sent upstream.
    Respond(FlowResponse),
    /// The interceptor could not handle the flow.
    Fail(InterceptError),
}

#[async_trait]
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str;

    /// Startup check of the interceptor's own options.
    fn validate(&self) -> Result<(), InterceptError> {
        Ok(())
    }

    /// Runs before any byte of the request is sent upstream.
    async fn on_request(&self, _flow: &Flow) -> HookOutcome {
        HookOutcome::Continue
    }

    /// Runs after the upstream response has been read into the flow.
    async fn on_response(&self, _flow: &Flow) {}

    /// Response hooks force the response body to be buffered; only
    /// interceptors returning true here get `on_response` calls.
    fn observes_responses(&self) -> bool {
        false
    }
}

/// Interceptors in registration order.
///
/// Registration takes `&mut self`, so once the registry is shared behind an
/// `Arc` by the running proxy the chain can no longer change.
#[derive(Default)]
pub struct InterceptorRegistry {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn validate(&self) -> Result<(), InterceptError> {
        self.interceptors.iter().try_for_each(|i| i.validate())
    }

    pub fn observes_responses(&self) -> bool {
        self.interceptors.iter().any(|i| i.observes_responses())
    }

    /// Runs every request hook in order.
    ///
    /// The first `Respond` is attached to the flow; later interceptors still
    /// observe the request but cannot replace it. Non-fatal failures are
    /// recorded on the flow. A fatal failure stops dispatch and is returned.
    pub async fn dispatch_request(&self, flow: &mut Flow) -> Result<(), InterceptError> {
        for interceptor in &self.interceptors {
            match interceptor.on_request(flow).await {
                HookOutcome::Continue => {}
                HookOutcome::Respond(response) => {
                    if flow.response.is_some() {
                        debug!(
                            flow_id = %flow.id,
                            interceptor = interceptor.name(),
                            "Flow already answered, ignoring response"
                        );
                        continue;
                    }
                    flow.response = Some(response);
                    flow.intercepted = true;
                    flow.intercepted_by = Some(interceptor.name().to_string());
                }
                HookOutcome::Fail(e) if e.is_fatal() => return Err(e),
                HookOutcome::Fail(e) => {
                    warn!(
                        flow_id = %flow.id,
                        url = %flow.request.url,
                        interceptor = interceptor.name(),
                        error = %e,
                        "Interceptor failed, letting request through"
                    );
                    flow.errors.push(e);
                }
            }
        }
        Ok(())
    }

    pub async fn dispatch_response(&self, flow: &Flow) {
        for interceptor in self.interceptors.iter().filter(|i| i.observes_responses()) {
            interceptor.on_response(flow).await;
        }
    }
}
