use flowpatch_core::error::FetchError;
use flowpatch_core::matcher::{AUTOPAPER_URL, STRENGTHEN_NEXT_URL, STUDY_FLOW_NEXT_URL};
use flowpatch_core::rewriter::LOGIN_URL;
use flowpatch_core::{
    ContentFetcher, EngineOptions, FetchedContent, Flow, FlowRequest, FlowResponse, JsonFileStore,
    MemoryStore, PolicyEngine, Settings,
};
use hudsucker::hyper::header::{HeaderMap, HeaderValue};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tempfile::tempdir;

/// Serves canned content per URL; anything else is a transport error.
#[derive(Default)]
struct ScriptedFetcher {
    responses: HashMap<String, FetchedContent>,
}

impl ScriptedFetcher {
    fn serving(mut self, url: &str, status: u16, content_type: Option<&str>, body: &[u8]) -> Self {
        self.responses.insert(
            url.to_string(),
            FetchedContent {
                status,
                content_type: content_type.map(str::to_string),
                body: body.to_vec(),
            },
        );
        self
    }
}

impl ContentFetcher for ScriptedFetcher {
    fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Transport {
                url: url.to_string(),
                message: "connection refused".to_string(),
            })
    }
}

fn options() -> EngineOptions {
    EngineOptions {
        credential_poll_interval_ms: 10,
        credential_timeout_secs: Some(1),
        ..Default::default()
    }
}

fn engine(store: Arc<MemoryStore>, fetcher: ScriptedFetcher) -> PolicyEngine {
    PolicyEngine::new(store, Arc::new(fetcher), &options())
}

fn response_flow(url: &str, body: &[u8]) -> Flow {
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    Flow::new(FlowRequest::new("GET", url)).with_response(FlowResponse::make(
        200,
        body.to_vec(),
        headers,
    ))
}

fn body_json(flow: &Flow) -> Value {
    serde_json::from_slice(&flow.response.as_ref().unwrap().body).unwrap()
}

fn autopaper_body() -> Vec<u8> {
    serde_json::to_vec(&json!({
        "testPaper": {
            "testPaperName": "Unit 1",
            "questionMap": {
                "1": [{"spelling": "apple", "answers": [{"correct": false}, {"correct": false}]}],
                "2": [{"spelling": "pear", "answers": [{"correct": false}]}]
            }
        }
    }))
    .unwrap()
}

proptest! {
    #[test]
    fn unmatched_urls_pass_through_byte_identical(
        path in "[a-zA-Z0-9/_.-]{0,32}",
        body in proptest::collection::vec(any::<u8>(), 0..256),
        opaque in proptest::collection::vec(0x80u8..=0xff, 1..16),
    ) {
        let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
        engine.set_enabled(true);

        let mut original = response_flow(&format!("https://www.hssenglish.com/other/{}", path), &body);
        // Header values outside UTF-8 are carried as raw bytes
        let opaque = HeaderValue::from_bytes(&opaque).unwrap();
        original.request.headers.insert("x-opaque", opaque.clone());
        if let Some(response) = original.response.as_mut() {
            response.headers.insert("content-disposition", opaque);
        }
        let mut flow = original.clone();
        engine.on_request(&mut flow);
        engine.on_response(&mut flow);

        prop_assert_eq!(flow, original);
    }
}

#[test]
fn test_substitution_replaces_response() {
    let source = "https://www.hssenglish.com/static/banner.png";
    let target = "https://cdn.example.com/banner.png";
    let store = Arc::new(MemoryStore::new(Settings {
        url_replacements: HashMap::from([(source.to_string(), target.to_string())]),
        ..Default::default()
    }));
    let engine = engine(
        store,
        ScriptedFetcher::default().serving(target, 200, Some("image/png"), b"PNGDATA"),
    );

    let mut flow = response_flow(source, b"original");
    engine.on_response(&mut flow);

    let response = flow.response.unwrap();
    assert_eq!(response.body, b"PNGDATA");
    assert_eq!(response.headers["content-length"], "7");
    assert_eq!(response.headers["location"], target);
    assert_eq!(engine.metrics().substitutions_applied.load(Ordering::Relaxed), 1);
}

#[test]
fn test_substitution_failure_keeps_original() {
    let source = "https://www.hssenglish.com/static/a.js";
    let store = Arc::new(MemoryStore::new(Settings {
        url_replacements: HashMap::from([
            (source.to_string(), "https://cdn.example.com/missing.js".to_string()),
            (
                "https://www.hssenglish.com/static/b.js".to_string(),
                "https://down.example.com/b.js".to_string(),
            ),
        ]),
        ..Default::default()
    }));
    let engine = engine(
        store,
        ScriptedFetcher::default().serving("https://cdn.example.com/missing.js", 404, None, b"nope"),
    );

    for url in [source, "https://www.hssenglish.com/static/b.js"] {
        let original = response_flow(url, b"console.log(1)");
        let mut flow = original.clone();
        engine.on_response(&mut flow);
        assert_eq!(flow, original);
    }
    assert_eq!(engine.metrics().substitution_failures.load(Ordering::Relaxed), 2);
}

#[test]
fn test_substitution_wins_over_watched_endpoint() {
    let target = "https://cdn.example.com/paper.json";
    let store = Arc::new(MemoryStore::new(Settings {
        url_replacements: HashMap::from([(AUTOPAPER_URL.to_string(), target.to_string())]),
        ..Default::default()
    }));
    let engine = engine(
        store,
        ScriptedFetcher::default().serving(target, 200, Some("application/json"), br#"{"testPaper":{"questionMap":{"1":[{"answers":[{"correct":false}]}]}}}"#),
    );
    engine.set_enabled(true);

    let mut flow = response_flow(AUTOPAPER_URL, &autopaper_body());
    engine.on_response(&mut flow);

    // Served verbatim, the autopaper rule did not run on it
    assert_eq!(
        body_json(&flow)["testPaper"]["questionMap"]["1"][0]["answers"][0]["correct"],
        false
    );
}

#[test]
fn test_watched_endpoints_untouched_while_disabled() {
    let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
    assert!(!engine.is_enabled());

    for url in [AUTOPAPER_URL, STUDY_FLOW_NEXT_URL, STRENGTHEN_NEXT_URL] {
        let original = response_flow(url, &autopaper_body());
        let mut flow = original.clone();
        engine.on_response(&mut flow);
        assert_eq!(flow, original);
    }
}

#[test]
fn test_autopaper_answers_forced_when_enabled() {
    let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
    engine.set_enabled(true);

    let mut flow = response_flow(AUTOPAPER_URL, &autopaper_body());
    engine.on_response(&mut flow);

    let body = body_json(&flow);
    for questions in body["testPaper"]["questionMap"].as_object().unwrap().values() {
        for item in questions.as_array().unwrap() {
            for answer in item["answers"].as_array().unwrap() {
                assert_eq!(answer["correct"], true);
            }
        }
    }
    let response = flow.response.unwrap();
    assert_eq!(
        response.headers["content-length"],
        response.body.len().to_string().as_str()
    );
    assert_eq!(engine.metrics().watched_mutations.load(Ordering::Relaxed), 1);
}

#[test]
fn test_toggle_applies_to_next_response() {
    let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
    let body = br#"{"word":{"syllable":"s1"}}"#;

    engine.set_enabled(true);
    let mut first = response_flow(STRENGTHEN_NEXT_URL, body);
    engine.on_response(&mut first);
    assert_eq!(body_json(&first)["word"]["soundMark"], "a");

    engine.controller().set_enabled(false);
    let mut second = response_flow(STRENGTHEN_NEXT_URL, body);
    engine.on_response(&mut second);
    assert_eq!(second.response.unwrap().body, body.to_vec());
}

#[test]
fn test_study_flow_next_syllable_scenario() {
    let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
    engine.set_enabled(true);

    let mut flow = response_flow(
        STUDY_FLOW_NEXT_URL,
        br#"{"syllable":"x","answers":[{"correct":false}]}"#,
    );
    engine.on_response(&mut flow);

    let body = body_json(&flow);
    assert_eq!(body["meaning"], "a");
    assert_eq!(body["spelling"], "a");
    assert_eq!(body["answers"][0]["correct"], true);
}

#[test]
fn test_malformed_watched_body_is_left_alone() {
    let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
    engine.set_enabled(true);

    let original = response_flow(STUDY_FLOW_NEXT_URL, b"<html>502 Bad Gateway</html>");
    let mut flow = original.clone();
    engine.on_response(&mut flow);

    assert_eq!(flow, original);
    assert_eq!(engine.metrics().malformed_bodies.load(Ordering::Relaxed), 1);
}

#[test]
fn test_login_rewritten_regardless_of_mode() {
    let store = Arc::new(MemoryStore::new(Settings {
        username: "alice".to_string(),
        password: "pw123".to_string(),
        ..Default::default()
    }));
    let engine = engine(store, ScriptedFetcher::default());
    assert!(!engine.is_enabled());

    let mut flow = Flow::new(FlowRequest::new("GET", LOGIN_URL));
    engine.on_request(&mut flow);

    assert_eq!(flow.request.method, "POST");
    assert_eq!(flow.request.body, b"userId=alice&password=pw123");
    assert_eq!(flow.request.headers["content-length"], "27");
    assert_eq!(engine.metrics().login_rewrites.load(Ordering::Relaxed), 1);
}

#[test]
fn test_login_forwarded_unmodified_on_credential_timeout() {
    let engine = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());

    let original = Flow::new(FlowRequest::new("GET", LOGIN_URL));
    let mut flow = original.clone();
    engine.on_request(&mut flow);

    assert_eq!(flow, original);
    assert_eq!(engine.metrics().credential_timeouts.load(Ordering::Relaxed), 1);
}

#[test]
fn test_empty_transform_code_matches_no_extensions() {
    let plain = engine(Arc::new(MemoryStore::default()), ScriptedFetcher::default());
    let blank = engine(
        Arc::new(MemoryStore::new(Settings {
            custom_request_code: "   ".to_string(),
            custom_response_code: "\n".to_string(),
            ..Default::default()
        })),
        ScriptedFetcher::default(),
    );
    plain.set_enabled(true);
    blank.set_enabled(true);

    for url in [AUTOPAPER_URL, "https://www.hssenglish.com/student/home"] {
        let mut a = response_flow(url, &autopaper_body());
        let mut b = a.clone();
        plain.on_request(&mut a);
        plain.on_response(&mut a);
        blank.on_request(&mut b);
        blank.on_response(&mut b);
        assert_eq!(a, b);
    }
    assert_eq!(blank.metrics().extension_failures.load(Ordering::Relaxed), 0);
}

#[test]
fn test_response_unit_runs_before_builtin_rules() {
    let store = Arc::new(MemoryStore::new(Settings {
        custom_response_code: r#"
            function custom_response(flow) {
                flow.response.headers["X-Patched"] = "yes";
                const body = JSON.parse(flow.response.text);
                body.word.extra = "kept";
                flow.response.text = JSON.stringify(body);
            }
        "#
        .to_string(),
        ..Default::default()
    }));
    let engine = engine(store, ScriptedFetcher::default());
    engine.set_enabled(true);

    let mut flow = response_flow(STRENGTHEN_NEXT_URL, br#"{"word":{"syllable":"s1"}}"#);
    engine.on_response(&mut flow);

    let body = body_json(&flow);
    assert_eq!(body["word"]["extra"], "kept");
    assert_eq!(body["word"]["syllable"], "a");
    assert_eq!(flow.response.unwrap().headers["x-patched"], "yes");
}

#[test]
fn test_failing_request_unit_does_not_block_login_rewrite() {
    let store = Arc::new(MemoryStore::new(Settings {
        username: "alice".to_string(),
        password: "pw123".to_string(),
        custom_request_code: "function custom_request(flow) { throw new Error('bad'); }"
            .to_string(),
        ..Default::default()
    }));
    let engine = engine(store, ScriptedFetcher::default());

    let mut flow = Flow::new(FlowRequest::new("GET", LOGIN_URL));
    engine.on_request(&mut flow);

    assert_eq!(flow.request.method, "POST");
    assert_eq!(engine.metrics().extension_failures.load(Ordering::Relaxed), 1);
}

#[test]
fn test_settings_reload_and_last_good_snapshot() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("settings.json");
    let source = "https://www.hssenglish.com/static/app.js";
    let target = "https://cdn.example.com/app.js";

    let store = Arc::new(JsonFileStore::new(&path));
    let engine = PolicyEngine::new(
        store,
        Arc::new(ScriptedFetcher::default().serving(target, 200, None, b"patched()")),
        &options(),
    );

    // No file yet: nothing configured
    let mut flow = response_flow(source, b"original()");
    engine.on_response(&mut flow);
    assert_eq!(flow.response.unwrap().body, b"original()");

    // Hot reload picks up the new table without restarting anything
    std::fs::write(&path, json!({"url_replacements": {source: target}}).to_string()).unwrap();
    let mut flow = response_flow(source, b"original()");
    engine.on_response(&mut flow);
    assert_eq!(flow.response.unwrap().body, b"patched()");

    // A half-written file falls back to the last good snapshot
    std::fs::write(&path, "{\"url_replacements\": {").unwrap();
    let mut flow = response_flow(source, b"original()");
    engine.on_response(&mut flow);
    assert_eq!(flow.response.unwrap().body, b"patched()");
}
