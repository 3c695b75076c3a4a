//! The policy engine: the single entry point the transport calls for every
//! intercepted request and response.
//!
//! Both callbacks are synchronous and may block (credential wait, substitution
//! fetch), so callers on an async runtime must run them on a blocking pool.
//! Neither callback returns an error; every failure is logged, counted and
//! leaves the flow as it was before the failing step.

use crate::admin::Metrics;
use crate::config::EngineOptions;
use crate::controller::ModeController;
use crate::error::PolicyError;
use crate::extension::{ExtensionLimits, ExtensionLoader, Side, TransformUnit};
use crate::fetch::ContentFetcher;
use crate::flow::Flow;
use crate::matcher::{Target, TargetMatcher};
use crate::mutation::{ResponseMutator, RewriteOutcome};
use crate::rewriter::LoginRewriter;
use crate::settings::{ConfigStore, Settings};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct PolicyEngine {
    store: Arc<dyn ConfigStore>,
    controller: ModeController,
    matcher: TargetMatcher,
    rewriter: LoginRewriter,
    mutator: ResponseMutator,
    loader: ExtensionLoader,
    metrics: Arc<Metrics>,
    last_good: RwLock<Arc<Settings>>,
}

impl PolicyEngine {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        fetcher: Arc<dyn ContentFetcher>,
        options: &EngineOptions,
    ) -> Self {
        let limits = ExtensionLimits {
            time_limit: options.extension_time_limit(),
            memory_limit: options.extension_memory_limit,
        };

        Self {
            store,
            controller: ModeController::new(),
            matcher: TargetMatcher::default(),
            rewriter: LoginRewriter::new(
                options.credential_poll_interval(),
                options.credential_timeout(),
            ),
            mutator: ResponseMutator::new(fetcher.clone()),
            loader: ExtensionLoader::new(limits, fetcher),
            metrics: Arc::new(Metrics::default()),
            last_good: RwLock::new(Arc::new(Settings::default())),
        }
    }

    /// Share an existing mode switch instead of the engine's own.
    pub fn with_controller(mut self, controller: ModeController) -> Self {
        self.controller = controller;
        self
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.controller.set_enabled(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.controller.is_enabled()
    }

    pub fn controller(&self) -> &ModeController {
        &self.controller
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// Request phase: custom request unit, then the login rewrite.
    pub fn on_request(&self, flow: &mut Flow) {
        Metrics::incr(&self.metrics.total_requests);
        let settings = self.snapshot();

        if let Some(unit) = self.loader.load_side(&settings, Side::Request) {
            self.run_unit(&unit, flow);
        }

        if !self.rewriter.matches(&flow.request.url) {
            return;
        }

        match self.rewriter.rewrite(flow, self.store.as_ref(), &settings) {
            Ok(()) => Metrics::incr(&self.metrics.login_rewrites),
            Err(PolicyError::CredentialTimeout(limit)) => {
                Metrics::incr(&self.metrics.credential_timeouts);
                warn!(
                    "No credentials after {:?}, forwarding login request [{}] unmodified",
                    limit, flow.id
                );
            }
            Err(e) => warn!("Login rewrite failed for [{}]: {}", flow.id, e),
        }
    }

    /// Response phase: custom response unit, then substitution or the watched
    /// endpoint rule.
    pub fn on_response(&self, flow: &mut Flow) {
        Metrics::incr(&self.metrics.total_responses);
        let settings = self.snapshot();

        if let Some(unit) = self.loader.load_side(&settings, Side::Response) {
            self.run_unit(&unit, flow);
        }

        let url = flow.request.url.clone();
        match self.matcher.classify(&url, &settings.url_replacements) {
            Target::Substitution(target) => match self.mutator.substitute(flow, target) {
                Ok(()) => Metrics::incr(&self.metrics.substitutions_applied),
                Err(e) => {
                    Metrics::incr(&self.metrics.substitution_failures);
                    warn!("Substitution of {} failed, keeping original: {}", url, e);
                }
            },
            Target::Watched(rule) => {
                if !self.controller.is_enabled() {
                    debug!("Rewrite mode disabled, passing {} through", url);
                    return;
                }
                match self.mutator.rewrite_watched(flow, rule) {
                    Ok(RewriteOutcome::Rewritten) => Metrics::incr(&self.metrics.watched_mutations),
                    Ok(RewriteOutcome::NoBody) => debug!("No response body for {}", url),
                    Err(e @ PolicyError::MalformedBody { .. }) => {
                        Metrics::incr(&self.metrics.malformed_bodies);
                        warn!("{}", e);
                    }
                    Err(e) => warn!("{} rule failed for {}: {}", rule.name(), url, e),
                }
            }
            Target::None => {}
        }
    }

    /// Load settings for one flow, falling back to the last good snapshot.
    fn snapshot(&self) -> Arc<Settings> {
        match self.store.load() {
            Ok(settings) => {
                let settings = Arc::new(settings);
                *self.last_good.write() = settings.clone();
                settings
            }
            Err(e) => {
                warn!("Failed to load settings, using last good snapshot: {}", e);
                self.last_good.read().clone()
            }
        }
    }

    fn run_unit(&self, unit: &TransformUnit, flow: &mut Flow) {
        if let Err(e) = unit.invoke(flow) {
            Metrics::incr(&self.metrics.extension_failures);
            warn!(
                "Custom {} function failed for [{}]: {}",
                unit.side().label(),
                flow.id,
                e
            );
        }
    }
}
