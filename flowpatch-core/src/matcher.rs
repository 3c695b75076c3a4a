//! URL classification for intercepted flows.
//!
//! Matching is exact string equality on the full request URL. No trailing-slash,
//! query-string or case normalization is applied.

use crate::rules::WatchedRule;
use std::collections::HashMap;

pub const AUTOPAPER_URL: &str = "https://www.hssenglish.com/student/quiz/autopaper";
pub const STUDY_FLOW_NEXT_URL: &str = "https://www.hssenglish.com/student/studyFlow/next";
pub const STRENGTHEN_NEXT_URL: &str =
    "https://www.hssenglish.com/student/studyFlow/strengthenNext";

/// What the response phase should do with a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target<'a> {
    None,
    Watched(WatchedRule),
    /// Replace the response with the content fetched from this URL.
    Substitution(&'a str),
}

/// Fixed set of watched endpoints, defined at startup.
#[derive(Debug, Clone)]
pub struct TargetMatcher {
    watched: Vec<(String, WatchedRule)>,
}

impl Default for TargetMatcher {
    fn default() -> Self {
        Self::new(vec![
            (AUTOPAPER_URL.to_string(), WatchedRule::Autopaper),
            (STUDY_FLOW_NEXT_URL.to_string(), WatchedRule::StudyFlowNext),
            (STRENGTHEN_NEXT_URL.to_string(), WatchedRule::StrengthenNext),
        ])
    }
}

impl TargetMatcher {
    pub fn new(watched: Vec<(String, WatchedRule)>) -> Self {
        Self { watched }
    }

    pub fn watched_rule(&self, url: &str) -> Option<WatchedRule> {
        self.watched
            .iter()
            .find(|(endpoint, _)| endpoint == url)
            .map(|(_, rule)| *rule)
    }

    /// Classify `url`. A substitution entry wins over a watched endpoint.
    pub fn classify<'a>(&self, url: &str, substitutions: &'a HashMap<String, String>) -> Target<'a> {
        if let Some(replacement) = substitutions.get(url) {
            return Target::Substitution(replacement.as_str());
        }

        match self.watched_rule(url) {
            Some(rule) => Target::Watched(rule),
            None => Target::None,
        }
    }
}
