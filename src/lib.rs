//! Lifecycle tracking for reference-counted objects.
//!
//! An interception layer in front of an object system forwards every
//! creation, ref, unref and finalization to a [`Tracker`]. The tracker keeps
//! the set of live objects and the delta since the last checkpoint, optionally
//! aggregates the call stacks reference changes come from, and writes reports
//! to a diagnostic stream when asked to (see [`trigger`] for the signal
//! driven variant installed by [`global::install`]).
use std::{cell::Cell, fmt};

pub mod config;
pub mod error;
pub mod global;
pub mod origin;
#[cfg(unix)]
pub mod real;
pub mod registry;
pub mod report;
pub mod sink;
pub mod stack;
mod tracker;
#[cfg(unix)]
pub mod trigger;

pub use config::{Config, DisplayFlags, OriginEviction};
pub use error::{Error, Result};
pub use origin::{OriginPath, OriginTrie, RefKind};
pub use registry::RegistrySnapshot;
pub use report::{CheckpointReport, FinalReport, LiveEntry, LiveReport, ObjectList};
pub use stack::{Frame, NoCapture, StackCapture};
#[cfg(feature = "backtrace")]
pub use stack::BacktraceCapture;
pub use tracker::{Tracker, TrackerBuilder, Trigger};

/// Identity of a tracked object, its address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub usize);

impl<T> From<*const T> for ObjectId {
    fn from(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

impl<T> From<*mut T> for ObjectId {
    fn from(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// What the object system currently says about a live object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub type_name: String,
    pub ref_count: u32,
}

/// Reads type name and reference count of a tracked object at report time.
///
/// Implemented by the interception layer. Only called for identities that are
/// registered, with the tracker's state lock held.
pub trait ObjectInspector: Send + Sync {
    fn inspect(&self, id: ObjectId) -> Option<ObjectInfo>;
}

/// Inspector for when nothing can be read back; reports only carry totals.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInspector;

impl ObjectInspector for NoInspector {
    fn inspect(&self, _id: ObjectId) -> Option<ObjectInfo> {
        None
    }
}

thread_local! {
    /// Set while this thread is inside the tracker, so that object events
    /// caused by the tracker itself (inspection, printing) pass through
    /// instead of deadlocking on the state lock.
    static IN_TRACKER: Cell<bool> = const { Cell::new(false) };
}

fn in_tracker() -> bool {
    IN_TRACKER.with(|x| x.get())
}

struct RestoreFlag(bool);

impl Drop for RestoreFlag {
    fn drop(&mut self) {
        IN_TRACKER.with(|x| x.set(self.0));
    }
}

fn enter_tracker<T>(func: impl FnOnce() -> T) -> T {
    let _restore = RestoreFlag(in_tracker());
    IN_TRACKER.with(|x| x.set(true));
    func()
}
