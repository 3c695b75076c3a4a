//! Transport-neutral view of one intercepted request/response exchange.
//!
//! The transport owns the real connection; the policy engine only ever sees a
//! [`Flow`] borrowed for the duration of one callback.

use hudsucker::hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowRequest {
    pub method: String,
    /// Absolute URL including scheme, authority, path and query.
    pub url: String,
    /// Header bytes exactly as received; values need not be UTF-8.
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FlowRequest {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    /// Replace the body and keep `Content-Length` in step with it.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = body;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl FlowResponse {
    /// Build a complete response; `Content-Length` is derived from `body` unless
    /// `headers` already carries one.
    pub fn make(status: u16, body: Vec<u8>, headers: HeaderMap) -> Self {
        let mut response = Self {
            status,
            headers,
            body,
        };
        if !response.headers.contains_key(CONTENT_LENGTH) {
            let length = HeaderValue::from(response.body.len());
            response.headers.insert(CONTENT_LENGTH, length);
        }
        response
    }

    /// Replace the body and keep `Content-Length` in step with it.
    pub fn set_body(&mut self, body: Vec<u8>) {
        self.headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        self.body = body;
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// One exchange handed to the policy engine by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Flow {
    /// Correlation id for logs only.
    pub id: String,
    pub request: FlowRequest,
    pub response: Option<FlowResponse>,
}

impl Flow {
    pub fn new(request: FlowRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            request,
            response: None,
        }
    }

    pub fn with_response(mut self, response: FlowResponse) -> Self {
        self.response = Some(response);
        self
    }

    pub fn url(&self) -> &str {
        &self.request.url
    }
}
