use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

/// Runtime switch for the watched-endpoint rules.
///
/// Cloning shares the flag, so the admin API, an embedding UI and the policy
/// engine can all hold a handle. Starts disabled.
#[derive(Debug, Clone, Default)]
pub struct ModeController {
    enabled: Arc<AtomicBool>,
}

impl ModeController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Turn rewriting on or off. Idempotent.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if enabled {
            info!("Rewrite mode enabled - watched endpoint rules active");
        } else {
            info!("Rewrite mode disabled - watched endpoint rules paused");
        }
    }

    /// Current value; never blocks.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
