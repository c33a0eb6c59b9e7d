//! Flows: one request/response exchange owned by the task serving its connection

use crate::error::InterceptError;
use bytes::Bytes;
use hudsucker::hyper::{header, Body, HeaderMap, Method, Response, StatusCode, Uri};
use std::net::SocketAddr;
use time::OffsetDateTime;
use url::Url;
use uuid::Uuid;

pub type FlowId = Uuid;

#[derive(Debug, Clone)]
pub struct FlowRequest {
    pub method: Method,
    /// Absolute URL with default ports omitted
    pub url: String,
    pub headers: HeaderMap,
    /// Body exactly as received from the client
    pub body: Bytes,
    /// Body after undoing `Content-Encoding`, when one was present
    pub decoded_body: Option<Bytes>,
    pub timestamp: OffsetDateTime,
}

impl FlowRequest {
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
            body,
            decoded_body: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// The body interceptors should parse.
    pub fn content(&self) -> &Bytes {
        self.decoded_body.as_ref().unwrap_or(&self.body)
    }
}

#[derive(Debug, Clone)]
pub struct FlowResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl FlowResponse {
    /// `200 OK` with an empty body; the "captured and suppressed" signal.
    pub fn synthetic_ok() -> Self {
        Self::empty(StatusCode::OK)
    }

    pub fn empty(status: StatusCode) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from_static("0"));
        Self {
            status,
            headers,
            body: Bytes::new(),
        }
    }

    pub fn text(status: StatusCode, message: impl Into<String>) -> Self {
        let body = Bytes::from(message.into());
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        headers.insert(header::CONTENT_LENGTH, header::HeaderValue::from(body.len()));
        Self {
            status,
            headers,
            body,
        }
    }

    pub fn into_hyper(self) -> Response<Body> {
        let mut res = Response::new(Body::from(self.body));
        *res.status_mut() = self.status;
        *res.headers_mut() = self.headers;
        res
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub id: FlowId,
    pub client_addr: SocketAddr,
    pub request: FlowRequest,
    pub response: Option<FlowResponse>,
    /// Set once an interceptor supplied the response
    pub intercepted: bool,
    pub intercepted_by: Option<String>,
    /// Non-fatal interceptor failures recorded during dispatch
    pub errors: Vec<InterceptError>,
}

impl Flow {
    pub fn new(client_addr: SocketAddr, request: FlowRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_addr,
            request,
            response: None,
            intercepted: false,
            intercepted_by: None,
            errors: Vec::new(),
        }
    }
}

/// Normalises a request URI the way it is matched against prefixes:
/// `https://host:443/path` becomes `https://host/path`.
pub fn pretty_url(uri: &Uri) -> String {
    let raw = uri.to_string();
    match Url::parse(&raw) {
        Ok(url) => url.to_string(),
        Err(_) => raw,
    }
}
