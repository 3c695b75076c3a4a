//! User-authored transform units.
//!
//! Units are JavaScript snippets run in an embedded QuickJS interpreter. The
//! interpreter exposes no filesystem, process or module loading; the only host
//! capability granted is `http_get(url)`, and only to response-side units.
//!
//! Request code must declare `function custom_request(flow) { ... }` and response
//! code `function custom_response(flow) { ... }`. The flow is handed over as
//!
//! ```text
//! { request:  { method, url, headers: {name: value}, text },
//!   response: { status, headers: {name: value}, text } | null }
//! ```
//!
//! and whatever the function changes is written back to the real flow.

use crate::error::ExtensionError;
use crate::fetch::ContentFetcher;
use crate::flow::{Flow, FlowResponse};
use crate::settings::Settings;
use hudsucker::hyper::header::{HeaderMap, HeaderName, HeaderValue};
use rquickjs::{Context, Ctx, Function, Runtime, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const STACK_LIMIT: usize = 512 * 1024;
const INVOKE_FN: &str = "__flowpatch_invoke";
const HOST_HTTP_GET_FN: &str = "__flowpatch_http_get";

const PRELUDE: &str = r#"
globalThis.__flowpatch_invoke = function (entry, input) {
    const flow = JSON.parse(input);
    globalThis[entry](flow);
    return JSON.stringify(flow);
};
"#;

const HTTP_GET_SHIM: &str = r#"
globalThis.http_get = function (url) {
    return JSON.parse(__flowpatch_http_get(String(url)));
};
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Request,
    Response,
}

impl Side {
    pub fn label(&self) -> &'static str {
        match self {
            Side::Request => "request",
            Side::Response => "response",
        }
    }

    pub fn entry_point(&self) -> &'static str {
        match self {
            Side::Request => "custom_request",
            Side::Response => "custom_response",
        }
    }

    fn source<'a>(&self, settings: &'a Settings) -> &'a str {
        match self {
            Side::Request => &settings.custom_request_code,
            Side::Response => &settings.custom_response_code,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtensionLimits {
    pub time_limit: Duration,
    pub memory_limit: usize,
}

/// Wall-clock deadline checked by the interpreter's interrupt handler.
#[derive(Debug, Clone)]
struct Budget {
    origin: Instant,
    deadline_ms: Arc<AtomicU64>,
}

impl Budget {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: Arc::new(AtomicU64::new(u64::MAX)),
        }
    }

    fn arm(&self, limit: Duration) {
        let deadline = (self.origin.elapsed() + limit).as_millis() as u64;
        self.deadline_ms.store(deadline, Ordering::SeqCst);
    }

    fn disarm(&self) {
        self.deadline_ms.store(u64::MAX, Ordering::SeqCst);
    }

    fn exceeded(&self) -> bool {
        self.origin.elapsed().as_millis() as u64 > self.deadline_ms.load(Ordering::SeqCst)
    }
}

/// Both units compiled from one settings snapshot.
#[derive(Default)]
pub struct LoadedExtensions {
    pub request: Option<TransformUnit>,
    pub response: Option<TransformUnit>,
}

pub struct ExtensionLoader {
    limits: ExtensionLimits,
    fetcher: Arc<dyn ContentFetcher>,
}

impl ExtensionLoader {
    pub fn new(limits: ExtensionLimits, fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self { limits, fetcher }
    }

    /// Compile both sides independently. A side that fails to compile is logged
    /// and treated as absent.
    pub fn load(&self, settings: &Settings) -> LoadedExtensions {
        LoadedExtensions {
            request: self.load_side(settings, Side::Request),
            response: self.load_side(settings, Side::Response),
        }
    }

    /// Compile one side, logging and swallowing failures.
    pub fn load_side(&self, settings: &Settings, side: Side) -> Option<TransformUnit> {
        match self.compile(side, side.source(settings)) {
            Ok(unit) => unit,
            Err(e) => {
                warn!("Failed to load custom {} function: {}", side.label(), e);
                None
            }
        }
    }

    /// Compile `source` for `side`. Empty or whitespace-only source yields `Ok(None)`.
    pub fn compile(&self, side: Side, source: &str) -> Result<Option<TransformUnit>, ExtensionError> {
        if source.trim().is_empty() {
            return Ok(None);
        }

        let compile_error = |message: String| ExtensionError::Compile {
            side: side.label(),
            message,
        };

        let runtime = Runtime::new().map_err(|e| compile_error(e.to_string()))?;
        runtime.set_memory_limit(self.limits.memory_limit);
        runtime.set_max_stack_size(STACK_LIMIT);

        let budget = Budget::new();
        let handler_budget = budget.clone();
        runtime.set_interrupt_handler(Some(Box::new(move || handler_budget.exceeded())));

        let context = Context::full(&runtime).map_err(|e| compile_error(e.to_string()))?;

        budget.arm(self.limits.time_limit);
        let result = context.with(|ctx| -> Result<(), ExtensionError> {
            ctx.eval::<Value, _>(PRELUDE)
                .map_err(|e| compile_error(describe(&ctx, e)))?;

            if side == Side::Response {
                install_http_get(&ctx, self.fetcher.clone())
                    .map_err(|e| compile_error(describe(&ctx, e)))?;
            }

            ctx.eval::<Value, _>(source)
                .map_err(|e| compile_error(describe(&ctx, e)))?;

            let entry: Value = ctx
                .globals()
                .get(side.entry_point())
                .map_err(|e| compile_error(describe(&ctx, e)))?;
            if !entry.is_function() {
                return Err(ExtensionError::MissingEntryPoint {
                    side: side.label(),
                    function: side.entry_point(),
                });
            }
            Ok(())
        });
        budget.disarm();
        result?;

        debug!("Loaded custom {} function", side.label());
        Ok(Some(TransformUnit {
            side,
            time_limit: self.limits.time_limit,
            budget,
            context,
            _runtime: runtime,
        }))
    }
}

/// A compiled transform. Lives on the thread that compiled it for one flow.
pub struct TransformUnit {
    side: Side,
    time_limit: Duration,
    budget: Budget,
    context: Context,
    _runtime: Runtime,
}

impl std::fmt::Debug for TransformUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformUnit")
            .field("side", &self.side)
            .field("time_limit", &self.time_limit)
            .finish_non_exhaustive()
    }
}

impl TransformUnit {
    pub fn side(&self) -> Side {
        self.side
    }

    /// Run the unit against `flow`. On error the flow is left as it was.
    pub fn invoke(&self, flow: &mut Flow) -> Result<(), ExtensionError> {
        let side = self.side.label();
        let before = FlowView::of(flow);
        let input = serde_json::to_string(&before)
            .map_err(|source| ExtensionError::FlowView { side, source })?;

        let runtime_error = |message: String| ExtensionError::Runtime { side, message };

        self.budget.arm(self.time_limit);
        let output = self.context.with(|ctx| -> Result<String, ExtensionError> {
            let invoke: Function = ctx
                .globals()
                .get(INVOKE_FN)
                .map_err(|e| runtime_error(describe(&ctx, e)))?;
            invoke
                .call((self.side.entry_point(), input))
                .map_err(|e| runtime_error(describe(&ctx, e)))
        });
        self.budget.disarm();

        let after: FlowView = serde_json::from_str(&output?)
            .map_err(|source| ExtensionError::FlowView { side, source })?;
        after.apply(flow, &before);
        Ok(())
    }
}

/// Human-readable message for an interpreter error, pulling the pending
/// exception out of the context when there is one.
fn describe(ctx: &Ctx<'_>, error: rquickjs::Error) -> String {
    if !matches!(error, rquickjs::Error::Exception) {
        return error.to_string();
    }

    let thrown = ctx.catch();
    if let Some(exception) = thrown.as_exception() {
        return exception
            .message()
            .unwrap_or_else(|| "uncaught exception".to_string());
    }
    if let Some(text) = thrown.as_string() {
        return text.to_string().unwrap_or_default();
    }
    format!("uncaught {:?}", thrown)
}

#[derive(Serialize)]
struct HttpGetResult {
    ok: bool,
    status: u16,
    content_type: Option<String>,
    text: String,
    error: Option<String>,
}

fn http_get_json(fetcher: &dyn ContentFetcher, url: &str) -> String {
    let result = match fetcher.fetch(url) {
        Ok(content) => HttpGetResult {
            ok: content.status == 200,
            status: content.status,
            content_type: content.content_type,
            text: String::from_utf8_lossy(&content.body).into_owned(),
            error: None,
        },
        Err(e) => HttpGetResult {
            ok: false,
            status: 0,
            content_type: None,
            text: String::new(),
            error: Some(e.to_string()),
        },
    };
    serde_json::to_string(&result)
        .unwrap_or_else(|_| r#"{"ok":false,"status":0,"text":"","error":"unencodable"}"#.to_string())
}

fn install_http_get(ctx: &Ctx<'_>, fetcher: Arc<dyn ContentFetcher>) -> rquickjs::Result<()> {
    let host = Function::new(ctx.clone(), move |url: String| -> String {
        http_get_json(fetcher.as_ref(), &url)
    })?;
    ctx.globals().set(HOST_HTTP_GET_FN, host)?;
    ctx.eval::<Value, _>(HTTP_GET_SHIM)?;
    Ok(())
}

type HeaderView = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FlowView {
    request: RequestView,
    #[serde(default)]
    response: Option<ResponseView>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RequestView {
    method: String,
    url: String,
    #[serde(default)]
    headers: HeaderView,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResponseView {
    #[serde(default = "default_status")]
    status: u16,
    #[serde(default)]
    headers: HeaderView,
    #[serde(default)]
    text: String,
}

fn default_status() -> u16 {
    200
}

/// Text view of `headers` for a unit. The first value of a repeated name wins;
/// values that are not valid UTF-8 are left out and so can never be edited.
fn header_view(headers: &HeaderMap) -> HeaderView {
    let mut view = HeaderView::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            view.entry(name.as_str().to_string())
                .or_insert_with(|| value.to_string());
        }
    }
    view
}

/// Apply only the header edits the unit made, so repeated headers it never
/// touched (e.g. `Set-Cookie`) survive byte for byte.
fn apply_header_edits(target: &mut HeaderMap, before: &HeaderView, after: &HeaderView) {
    for name in before.keys() {
        if !after.contains_key(name) {
            target.remove(name.as_str());
        }
    }
    for (name, value) in after {
        if before.get(name) == Some(value) {
            continue;
        }
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                target.insert(name, value);
            }
            _ => warn!("Ignoring invalid header {} set by transform unit", name),
        }
    }
}

impl FlowView {
    fn of(flow: &Flow) -> Self {
        Self {
            request: RequestView {
                method: flow.request.method.clone(),
                url: flow.request.url.clone(),
                headers: header_view(&flow.request.headers),
                text: String::from_utf8_lossy(&flow.request.body).into_owned(),
            },
            response: flow.response.as_ref().map(|response| ResponseView {
                status: response.status,
                headers: header_view(&response.headers),
                text: response.text(),
            }),
        }
    }

    fn apply(self, flow: &mut Flow, before: &FlowView) {
        let request = &mut flow.request;
        request.method = self.request.method;
        request.url = self.request.url;
        apply_header_edits(&mut request.headers, &before.request.headers, &self.request.headers);
        // Untouched bodies keep their original bytes, binary or not
        if self.request.text != before.request.text {
            request.set_body(self.request.text.into_bytes());
        }

        match (flow.response.as_mut(), before.response.as_ref(), self.response) {
            (Some(response), Some(old), Some(new)) => {
                response.status = new.status;
                apply_header_edits(&mut response.headers, &old.headers, &new.headers);
                if new.text != old.text {
                    response.set_body(new.text.into_bytes());
                }
            }
            (None, _, Some(new)) => {
                let mut headers = HeaderMap::new();
                apply_header_edits(&mut headers, &HeaderView::new(), &new.headers);
                flow.response = Some(FlowResponse::make(new.status, new.text.into_bytes(), headers));
            }
            _ => {}
        }
    }
}
