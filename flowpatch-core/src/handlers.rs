use crate::engine::PolicyEngine;
use crate::flow::{Flow, FlowRequest, FlowResponse};
use hudsucker::{
    decode_response,
    hyper::{
        body::to_bytes,
        header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_LENGTH, TRANSFER_ENCODING},
        http::{request, response},
        Body, Method, Request, Response, StatusCode, Uri,
    },
    HttpContext, HttpHandler, RequestOrResponse,
};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Content encodings decoded before the engine sees a response body.
const DECODED_ENCODINGS: &[&str] = &["gzip", "x-gzip", "deflate", "br"];

/// hudsucker handler feeding every exchange through the [`PolicyEngine`].
///
/// hudsucker clones the handler for each request, so `pending` carries the
/// (possibly rewritten) request from the request phase to the response phase.
#[derive(Clone)]
pub struct InterceptHandler {
    engine: Arc<PolicyEngine>,
    pending: Option<FlowRequest>,
}

impl InterceptHandler {
    pub fn new(engine: Arc<PolicyEngine>) -> Self {
        Self {
            engine,
            pending: None,
        }
    }
}

#[async_trait::async_trait]
impl HttpHandler for InterceptHandler {
    async fn handle_request(&mut self, ctx: &HttpContext, req: Request<Body>) -> RequestOrResponse {
        if req.method() == Method::CONNECT {
            return req.into();
        }

        let (parts, body) = req.into_parts();
        let body = match to_bytes(body).await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!("Failed to read request body from {}: {}", ctx.client_addr, e);
                return bad_gateway("failed to read request body").into();
            }
        };

        let mut flow = Flow::new(flow_request(
            parts.method.as_str(),
            &parts.uri,
            parts.headers.clone(),
            body,
        ));
        debug!("Request [{}] {} {}", flow.id, flow.request.method, flow.request.url);

        let engine = self.engine.clone();
        let original = flow.clone();
        let flow = match tokio::task::spawn_blocking(move || {
            engine.on_request(&mut flow);
            flow
        })
        .await
        {
            Ok(flow) => flow,
            Err(e) => {
                error!("Request policy task failed, forwarding original: {}", e);
                original
            }
        };

        let outcome = forward(parts, &flow);
        if matches!(outcome, RequestOrResponse::Request(_)) {
            self.pending = Some(flow.request);
        }
        outcome
    }

    async fn handle_response(&mut self, _ctx: &HttpContext, res: Response<Body>) -> Response<Body> {
        let Some(request) = self.pending.take() else {
            return res;
        };

        let encoding = res
            .headers()
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase());
        let decoded = encoding
            .as_deref()
            .map_or(false, |e| DECODED_ENCODINGS.contains(&e));

        let res = if decoded {
            match decode_response(res) {
                Ok(res) => res,
                Err(e) => {
                    warn!("Failed to decode response for {}: {}", request.url, e);
                    return bad_gateway("failed to decode upstream response");
                }
            }
        } else {
            res
        };

        let reframe = decoded || res.headers().contains_key(TRANSFER_ENCODING);
        let (parts, body) = res.into_parts();
        let body = match to_bytes(body).await {
            Ok(bytes) => bytes.to_vec(),
            Err(e) => {
                warn!("Failed to read response body for {}: {}", request.url, e);
                return bad_gateway("failed to read upstream response");
            }
        };

        let mut response = FlowResponse {
            status: parts.status.as_u16(),
            headers: parts.headers.clone(),
            body,
        };
        if reframe {
            response.headers.remove(TRANSFER_ENCODING);
            let length = HeaderValue::from(response.body.len());
            response.headers.insert(CONTENT_LENGTH, length);
        }

        let mut flow = Flow::new(request).with_response(response);
        let engine = self.engine.clone();
        let original = flow.clone();
        let flow = match tokio::task::spawn_blocking(move || {
            engine.on_response(&mut flow);
            flow
        })
        .await
        {
            Ok(flow) => flow,
            Err(e) => {
                error!("Response policy task failed, forwarding original: {}", e);
                original
            }
        };

        match flow.response {
            Some(response) => into_hyper_response(parts, response),
            None => bad_gateway("response removed by policy"),
        }
    }
}

fn bad_gateway(message: &'static str) -> Response<Body> {
    let mut res = Response::new(Body::from(message));
    *res.status_mut() = StatusCode::BAD_GATEWAY;
    res
}

/// Absolute URL of an intercepted request. Default ports are left out, so an
/// HTTPS request tunnelled through `CONNECT host:443` reads `https://host/...`.
fn flow_url(uri: &Uri) -> String {
    let (Some(scheme), Some(host)) = (uri.scheme_str(), uri.host()) else {
        return uri.to_string();
    };
    let path = uri.path_and_query().map_or("/", |p| p.as_str());
    match uri.port_u16() {
        Some(443) if scheme == "https" => format!("{}://{}{}", scheme, host, path),
        Some(80) if scheme == "http" => format!("{}://{}{}", scheme, host, path),
        Some(port) => format!("{}://{}:{}{}", scheme, host, port, path),
        None => format!("{}://{}{}", scheme, host, path),
    }
}

fn flow_request(method: &str, uri: &Uri, headers: HeaderMap, body: Vec<u8>) -> FlowRequest {
    let mut request = FlowRequest::new(method, flow_url(uri));
    request.headers = headers;
    request.body = body;
    if request.headers.contains_key(TRANSFER_ENCODING) {
        request.headers.remove(TRANSFER_ENCODING);
        let length = HeaderValue::from(request.body.len());
        request.headers.insert(CONTENT_LENGTH, length);
    }
    request
}

/// What goes back to hudsucker after the request phase: the (possibly
/// rewritten) request, or the response a request-side unit answered with.
fn forward(parts: request::Parts, flow: &Flow) -> RequestOrResponse {
    match &flow.response {
        Some(response) => {
            debug!("Request [{}] answered by policy", flow.id);
            let (response_parts, _) = Response::new(Body::empty()).into_parts();
            into_hyper_response(response_parts, response.clone()).into()
        }
        None => into_hyper_request(parts, &flow.request).into(),
    }
}

fn into_hyper_request(mut parts: request::Parts, request: &FlowRequest) -> Request<Body> {
    match Method::from_bytes(request.method.as_bytes()) {
        Ok(method) => parts.method = method,
        Err(_) => warn!("Ignoring invalid method {}", request.method),
    }
    // Keep the URI hudsucker routes on unless the URL was rewritten
    if request.url != flow_url(&parts.uri) {
        match request.url.parse::<Uri>() {
            Ok(uri) => parts.uri = uri,
            Err(_) => warn!("Ignoring invalid URL {}", request.url),
        }
    }
    parts.headers = request.headers.clone();
    Request::from_parts(parts, Body::from(request.body.clone()))
}

fn into_hyper_response(mut parts: response::Parts, response: FlowResponse) -> Response<Body> {
    match StatusCode::from_u16(response.status) {
        Ok(status) => parts.status = status,
        Err(_) => warn!("Ignoring invalid status {}", response.status),
    }
    parts.headers = response.headers;
    if !parts.headers.contains_key(CONTENT_LENGTH) && !response.body.is_empty() {
        parts.headers.insert(CONTENT_LENGTH, HeaderValue::from(response.body.len()));
    }
    Response::from_parts(parts, Body::from(response.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{Target, TargetMatcher, AUTOPAPER_URL};
    use crate::rules::WatchedRule;
    use std::collections::HashMap;

    fn tunnelled(authority: &str, path: &str) -> Uri {
        Uri::builder()
            .scheme("https")
            .authority(authority)
            .path_and_query(path)
            .build()
            .unwrap()
    }

    #[test]
    fn test_tunnelled_https_url_matches_watched_endpoint() {
        let uri = tunnelled("www.hssenglish.com:443", "/student/quiz/autopaper");

        let request = flow_request("GET", &uri, HeaderMap::new(), Vec::new());
        assert_eq!(request.url, AUTOPAPER_URL);

        let replacements = HashMap::new();
        assert_eq!(
            TargetMatcher::default().classify(&request.url, &replacements),
            Target::Watched(WatchedRule::Autopaper)
        );
    }

    #[test]
    fn test_flow_url_default_ports() {
        let plain: Uri = "http://example.com:80/a?b=1".parse().unwrap();
        assert_eq!(flow_url(&plain), "http://example.com/a?b=1");

        let custom = tunnelled("example.com:8443", "/x");
        assert_eq!(flow_url(&custom), "https://example.com:8443/x");

        let swapped: Uri = "http://example.com:443/".parse().unwrap();
        assert_eq!(flow_url(&swapped), "http://example.com:443/");

        let origin_form: Uri = "/relative".parse().unwrap();
        assert_eq!(flow_url(&origin_form), "/relative");
    }

    #[test]
    fn test_flow_request_reframes_chunked_body() {
        let mut headers = HeaderMap::new();
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("x-trace", HeaderValue::from_static("1"));
        let uri: Uri = "https://www.hssenglish.com/student/user/login".parse().unwrap();

        let request = flow_request("POST", &uri, headers, b"abc".to_vec());

        assert_eq!(request.url, "https://www.hssenglish.com/student/user/login");
        assert!(!request.headers.contains_key(TRANSFER_ENCODING));
        assert_eq!(request.headers[CONTENT_LENGTH], "3");
        assert_eq!(request.headers["x-trace"], "1");
    }

    #[test]
    fn test_non_utf8_header_survives_round_trip() {
        let raw = b"attachment; filename=\"caf\xE9.txt\"";
        let (mut parts, _) = Request::get("https://example.com/file")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
            .headers
            .insert("content-disposition", HeaderValue::from_bytes(raw).unwrap());
        parts.headers.append("set-cookie", HeaderValue::from_static("a=1"));
        parts.headers.append("set-cookie", HeaderValue::from_static("b=2"));

        let request = flow_request("GET", &parts.uri, parts.headers.clone(), Vec::new());
        let rebuilt = into_hyper_request(parts, &request);

        assert_eq!(rebuilt.headers()["content-disposition"].as_bytes(), &raw[..]);
        assert_eq!(rebuilt.headers().get_all("set-cookie").iter().count(), 2);
    }

    #[test]
    fn test_into_hyper_request_applies_rewrites() {
        let (parts, _) = Request::get("https://example.com/a")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let mut request = FlowRequest::new("POST", "https://example.com/b");
        request.set_body(b"userId=u&password=p".to_vec());

        let rebuilt = into_hyper_request(parts, &request);
        assert_eq!(rebuilt.method(), Method::POST);
        assert_eq!(rebuilt.uri(), "https://example.com/b");
        assert_eq!(rebuilt.headers()[CONTENT_LENGTH], "19");
    }

    #[test]
    fn test_unchanged_url_keeps_tunnelled_uri() {
        let uri = tunnelled("www.hssenglish.com:443", "/student/quiz/autopaper");
        let (mut parts, _) = Request::new(Body::empty()).into_parts();
        parts.uri = uri.clone();

        let request = flow_request("GET", &uri, HeaderMap::new(), Vec::new());
        let rebuilt = into_hyper_request(parts, &request);
        assert_eq!(rebuilt.uri(), &uri);
    }

    #[test]
    fn test_forward_returns_response_created_by_request_unit() {
        let (parts, _) = Request::get("https://example.com/blocked")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let flow = Flow::new(FlowRequest::new("GET", "https://example.com/blocked"))
            .with_response(FlowResponse::make(204, Vec::new(), HeaderMap::new()));

        match forward(parts, &flow) {
            RequestOrResponse::Response(res) => assert_eq!(res.status(), StatusCode::NO_CONTENT),
            RequestOrResponse::Request(req) => panic!("request forwarded upstream: {}", req.uri()),
        }
    }

    #[test]
    fn test_forward_passes_request_without_response() {
        let (parts, _) = Request::get("https://example.com/a")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        let flow = Flow::new(FlowRequest::new("GET", "https://example.com/a"));

        assert!(matches!(forward(parts, &flow), RequestOrResponse::Request(_)));
    }

    #[test]
    fn test_into_hyper_response_sets_length() {
        let (parts, _) = Response::new(Body::empty()).into_parts();
        let response = FlowResponse {
            status: 201,
            headers: HeaderMap::new(),
            body: b"hello".to_vec(),
        };

        let rebuilt = into_hyper_response(parts, response);
        assert_eq!(rebuilt.status(), StatusCode::CREATED);
        assert_eq!(rebuilt.headers()[CONTENT_LENGTH], "5");
    }
}
