//! Request pipeline: turns each proxied request into a [`Flow`], runs the
//! interceptor chain and either answers locally or lets hudsucker forward it.

use crate::admin::Metrics;
use crate::error::InterceptError;
use crate::filter::ScopeMatcher;
use crate::flow::{pretty_url, Flow, FlowRequest, FlowResponse};
use crate::interceptor::InterceptorRegistry;
use crate::proxy::FatalSignal;
use bytes::Bytes;
use hudsucker::{
    hyper::{body, header, Body, Method, Request, Response, StatusCode},
    HttpContext, HttpHandler, RequestOrResponse,
};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// hudsucker clones the handler for every request, so `in_flight` only ever
/// holds the flow of the request this clone is serving.
#[derive(Clone)]
pub struct PipelineHandler {
    registry: Arc<InterceptorRegistry>,
    metrics: Arc<Metrics>,
    scope: Arc<ScopeMatcher>,
    tls_interception: bool,
    fatal: FatalSignal,
    in_flight: Option<Flow>,
}

impl PipelineHandler {
    pub fn new(
        registry: Arc<InterceptorRegistry>,
        metrics: Arc<Metrics>,
        scope: ScopeMatcher,
        tls_interception: bool,
        fatal: FatalSignal,
    ) -> Self {
        Self {
            registry,
            metrics,
            scope: Arc::new(scope),
            tls_interception,
            fatal,
            in_flight: None,
        }
    }

    fn record_failures(&self, flow: &Flow) {
        for e in &flow.errors {
            match e {
                InterceptError::MalformedPayload { .. } => {
                    Metrics::incr(&self.metrics.malformed_payloads)
                }
                InterceptError::Storage { .. } => Metrics::incr(&self.metrics.capture_failures),
                InterceptError::Configuration(_) => {}
            }
        }
    }
}

fn is_upgrade(req: &Request<Body>) -> bool {
    req.headers().contains_key(header::UPGRADE)
}

/// Undoes `Content-Encoding` for parsing; `None` when the body is not encoded
/// or cannot be decoded.
async fn decode_body(headers: &header::HeaderMap, raw: &Bytes) -> Option<Bytes> {
    if !headers.contains_key(header::CONTENT_ENCODING) {
        return None;
    }
    let mut scratch = Request::new(Body::from(raw.clone()));
    *scratch.headers_mut() = headers.clone();
    let decoded = match hudsucker::decode_request(scratch) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(error = %e, "Unsupported content encoding, parsing raw body");
            return None;
        }
    };
    match body::to_bytes(decoded.into_body()).await {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            debug!(error = %e, "Body decoding failed, parsing raw body");
            None
        }
    }
}

#[async_trait::async_trait]
impl HttpHandler for PipelineHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        // Tunnels and protocol upgrades are not flows
        if req.method() == Method::CONNECT || is_upgrade(&req) {
            debug!(method = %req.method(), uri = %req.uri(), "Passing through");
            return RequestOrResponse::Request(req);
        }

        Metrics::incr(&self.metrics.total_flows);

        let (parts, body) = req.into_parts();
        let raw = match body::to_bytes(body).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(uri = %parts.uri, error = %e, "Failed to read request body");
                return RequestOrResponse::Response(
                    FlowResponse::text(StatusCode::BAD_REQUEST, "unreadable request body")
                        .into_hyper(),
                );
            }
        };

        let mut request = FlowRequest::new(
            parts.method.clone(),
            pretty_url(&parts.uri),
            parts.headers.clone(),
            raw.clone(),
        );
        request.decoded_body = decode_body(&parts.headers, &raw).await;
        let mut flow = Flow::new(ctx.client_addr, request);

        if let Err(e) = self.registry.dispatch_request(&mut flow).await {
            Metrics::incr(&self.metrics.fatal_errors);
            error!(flow_id = %flow.id, url = %flow.request.url, error = %e, "Fatal interception error, stopping proxy");
            self.fatal.trip(e.clone());
            return RequestOrResponse::Response(
                FlowResponse::text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_hyper(),
            );
        }
        self.record_failures(&flow);

        if let Some(response) = flow.response.take() {
            Metrics::incr(&self.metrics.intercepted_flows);
            info!(
                flow_id = %flow.id,
                method = %flow.request.method,
                url = %flow.request.url,
                status = response.status.as_u16(),
                "Intercepted by {}",
                flow.intercepted_by.as_deref().unwrap_or("interceptor")
            );
            return RequestOrResponse::Response(response.into_hyper());
        }

        // Forward the bytes exactly as received
        let req = Request::from_parts(parts, Body::from(raw));
        self.in_flight = Some(flow);
        RequestOrResponse::Request(req)
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(flow) = self.in_flight.take() else {
            return res;
        };
        Metrics::incr(&self.metrics.forwarded_flows);
        info!(
            flow_id = %flow.id,
            method = %flow.request.method,
            url = %flow.request.url,
            status = res.status().as_u16(),
            "Forwarded"
        );

        if !self.registry.observes_responses() {
            return res;
        }

        let (parts, body) = res.into_parts();
        let bytes = match body::to_bytes(body).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(flow_id = %flow.id, error = %e, "Failed to read upstream response body");
                return FlowResponse::text(StatusCode::BAD_GATEWAY, "unreadable upstream response")
                    .into_hyper();
            }
        };
        let mut flow = flow;
        flow.response = Some(FlowResponse {
            status: parts.status,
            headers: parts.headers.clone(),
            body: bytes.clone(),
        });
        self.registry.dispatch_response(&flow).await;

        Response::from_parts(parts, Body::from(bytes))
    }

    async fn handle_error(&mut self, _ctx: &HttpContext, err: hudsucker::hyper::Error) -> Response<Body> {
        Metrics::incr(&self.metrics.upstream_errors);
        match self.in_flight.take() {
            Some(flow) => warn!(
                flow_id = %flow.id,
                url = %flow.request.url,
                error = %err,
                "Upstream connection failed"
            ),
            None => warn!(error = %err, "Upstream connection failed"),
        }
        FlowResponse::text(
            StatusCode::BAD_GATEWAY,
            format!("upstream connection failed: {}", err),
        )
        .into_hyper()
    }

    async fn should_intercept(&mut self, _ctx: &HttpContext, req: &Request<Body>) -> bool {
        if !self.tls_interception {
            return false;
        }
        match req.uri().host() {
            Some(host) => {
                let allowed = self.scope.is_allowed(host);
                debug!(host, intercept = allowed, "CONNECT");
                allowed
            }
            None => false,
        }
    }
}
