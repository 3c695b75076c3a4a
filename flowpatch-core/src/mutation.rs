//! Response-side mutations: whole-response substitution and per-endpoint body
//! rewriting.

use crate::error::PolicyError;
use crate::fetch::ContentFetcher;
use crate::flow::{Flow, FlowResponse};
use crate::rules::WatchedRule;
use hudsucker::hyper::header::{
    HeaderMap, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_LENGTH,
    CONTENT_TYPE, LOCATION,
};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
const SUBSTITUTION_CACHE_CONTROL: &str = "public, max-age=3600";

/// Outcome of [`ResponseMutator::rewrite_watched`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten,
    /// The flow carried no response (or an empty body); nothing to rewrite.
    NoBody,
}

pub struct ResponseMutator {
    fetcher: Arc<dyn ContentFetcher>,
}

impl ResponseMutator {
    pub fn new(fetcher: Arc<dyn ContentFetcher>) -> Self {
        Self { fetcher }
    }

    /// Replace the flow's response with the content served at `target`.
    ///
    /// Only a 200 answer replaces anything; on any failure the original response
    /// is left exactly as it was and the error is returned for logging.
    pub fn substitute(&self, flow: &mut Flow, target: &str) -> Result<(), PolicyError> {
        let fetched = self.fetcher.fetch(target)?;
        if fetched.status != 200 {
            return Err(PolicyError::FetchStatus {
                url: target.to_string(),
                status: fetched.status,
            });
        }

        let content_type = fetched
            .content_type
            .as_deref()
            .and_then(|v| HeaderValue::from_str(v).ok())
            .unwrap_or_else(|| HeaderValue::from_static(DEFAULT_CONTENT_TYPE));

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, content_type);
        headers.insert(CONTENT_LENGTH, HeaderValue::from(fetched.body.len()));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
        headers.insert(CACHE_CONTROL, HeaderValue::from_static(SUBSTITUTION_CACHE_CONTROL));
        match HeaderValue::from_str(target) {
            Ok(location) => {
                headers.insert(LOCATION, location);
            }
            Err(_) => warn!("Substitution target {} is not a valid Location value", target),
        }

        flow.response = Some(FlowResponse::make(200, fetched.body, headers));
        info!("Replaced {} with content from {}", flow.request.url, target);
        Ok(())
    }

    /// Apply `rule` to the JSON body of the flow's response and re-serialize it.
    ///
    /// A body that does not parse as JSON is left untouched and reported.
    pub fn rewrite_watched(
        &self,
        flow: &mut Flow,
        rule: WatchedRule,
    ) -> Result<RewriteOutcome, PolicyError> {
        let url = flow.request.url.clone();
        let Some(response) = flow.response.as_mut() else {
            return Ok(RewriteOutcome::NoBody);
        };
        if response.body.is_empty() {
            return Ok(RewriteOutcome::NoBody);
        }

        let mut body: serde_json::Value = serde_json::from_slice(&response.body)
            .map_err(|source| PolicyError::MalformedBody {
                url: url.clone(),
                source,
            })?;

        rule.apply(&mut body);

        let serialized = serde_json::to_vec(&body).map_err(|source| PolicyError::MalformedBody {
            url: url.clone(),
            source,
        })?;
        response.set_body(serialized);

        info!("Rewrote {} response of {}", rule.name(), url);
        Ok(RewriteOutcome::Rewritten)
    }
}
