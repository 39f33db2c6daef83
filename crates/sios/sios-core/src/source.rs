use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

bitflags! {
    /// The events a source wants to be scheduled for. `READ` and `WRITE`
    /// require a valid fd; `TIMER` rides the writer pump's wait budget.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SourceKind: u8 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const TIMER = 1 << 2;
    }
}

/// What a handler is being dispatched for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    Read,
    Write,
    Timeout,
}

/// Handler verdict: `Remove` unlinks the source from the dispatching
/// list, `Keep` leaves it eligible for the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Keep,
    Remove,
}

/// Dispatch priorities. Lower number means dispatched earlier within a
/// pump tick; there is no preemption.
pub mod priority {
    pub const MAX: i32 = -999;
    pub const HIGH: i32 = -100;
    pub const DEFAULT: i32 = 0;
    pub const LOW: i32 = 100;
}

/// Source event handler. Runs on a pump thread with no list lock held;
/// it may add or remove sources (including its own) through the
/// registry, and may re-arm its own period via [`Source::set_period_us`].
/// Handlers are expected to be short and non-blocking.
pub type SourceHandler = Box<dyn FnMut(&Source, SourceEvent) -> Dispatch + Send>;

struct SourceInner {
    owner: String,
    kinds: SourceKind,
    priority: i32,
    fd: RawFd,
    period_us: AtomicU64,
    handler: Mutex<SourceHandler>,
}

/// A registered interest in fd readiness and/or a periodic timeout.
///
/// Cloning is cheap and clones refer to the same source; registry
/// membership is keyed on that shared identity, so the handle a module
/// keeps is the same one it later passes to `remove`. The registry never
/// owns module state beyond the handler closure.
#[derive(Clone)]
pub struct Source {
    inner: Arc<SourceInner>,
}

impl Source {
    /// Builds a source. `owner` is the owning object's name, used for
    /// logging only. `fd` must be a valid descriptor when `kinds`
    /// contains `READ` or `WRITE`; timer-only sources pass -1.
    pub fn new(
        owner: impl Into<String>,
        kinds: SourceKind,
        priority: i32,
        fd: RawFd,
        period_us: u64,
        handler: SourceHandler,
    ) -> Self {
        debug_assert!(!kinds.is_empty());
        Self {
            inner: Arc::new(SourceInner {
                owner: owner.into(),
                kinds,
                priority,
                fd,
                period_us: AtomicU64::new(period_us),
                handler: Mutex::new(handler),
            }),
        }
    }

    pub fn owner(&self) -> &str {
        &self.inner.owner
    }

    pub fn kinds(&self) -> SourceKind {
        self.inner.kinds
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn fd(&self) -> RawFd {
        self.inner.fd
    }

    /// Minimum microseconds between dispatches; 0 means whenever ready.
    pub fn period_us(&self) -> u64 {
        self.inner.period_us.load(Ordering::Relaxed)
    }

    /// Re-arms the period. Safe to call from the source's own handler;
    /// takes effect from the next pump tick.
    pub fn set_period_us(&self, period_us: u64) {
        self.inner.period_us.store(period_us, Ordering::Relaxed);
    }

    pub(crate) fn same(&self, other: &Source) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn run_handler(&self, event: SourceEvent) -> Dispatch {
        let mut handler = self
            .inner
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        (handler)(self, event)
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source")
            .field("owner", &self.inner.owner)
            .field("kinds", &self.inner.kinds)
            .field("priority", &self.inner.priority)
            .field("fd", &self.inner.fd)
            .field("period_us", &self.period_us())
            .finish()
    }
}
