//! The process-wide tracker the interception layer reports to.

use std::sync::OnceLock;

use crate::{config::PROPAGATE_PRELOAD_ENV, Config, ObjectInspector, Tracker, TrackerBuilder};

static GLOBAL: OnceLock<Tracker> = OnceLock::new();

/// Builds the tracker from the environment on first call and sets up
/// reporting; later calls return the same tracker.
pub fn install(inspector: impl ObjectInspector + 'static) -> &'static Tracker {
    install_with(|| Tracker::builder(Config::from_env()).inspector(inspector))
}

/// Like [`install`], with a custom builder.
pub fn install_with(builder: impl FnOnce() -> TrackerBuilder) -> &'static Tracker {
    let mut fresh = false;
    let tracker = GLOBAL.get_or_init(|| {
        fresh = true;
        builder().build()
    });
    if fresh {
        startup(tracker);
    }
    tracker
}

pub fn get() -> Option<&'static Tracker> {
    GLOBAL.get()
}

#[cfg(unix)]
fn install_triggers(tracker: &'static Tracker) {
    if let Err(err) = crate::trigger::install(tracker) {
        log::warn!("object-track report triggers unavailable: {err}");
        tracker.warn(&format!("Warning: report triggers are not available: {err}"));
    }
}

#[cfg(not(unix))]
fn install_triggers(tracker: &'static Tracker) {
    tracker.warn("Warning: report triggers are not available on this platform");
}

fn startup(tracker: &'static Tracker) {
    install_triggers(tracker);
    // keep child processes out of the interception
    if std::env::var_os(PROPAGATE_PRELOAD_ENV).is_none() {
        std::env::remove_var("LD_PRELOAD");
    }
    log::debug!("object-track installed with {:?}", tracker.config());
}
