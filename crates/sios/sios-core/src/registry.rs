use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::poll;
use crate::pump::{READ_WAIT_BUDGET_US, WRITE_WAIT_BUDGET_US};
use crate::source::{Dispatch, Source, SourceEvent, SourceKind};

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source is already on a pump list. Re-adding is a no-op so a
    /// module may blindly re-arm a source from its message handlers.
    #[error("source already registered")]
    AlreadyRegistered,
}

/// A source's membership on one pump list, with the scheduling state
/// that pump owns. A READ|WRITE source has one entry on each list and
/// each pump accounts elapsed time independently.
struct Active {
    source: Source,
    /// Microseconds of measured wait time since this entry's last
    /// dispatch (or since it was armed, for periodic writers).
    elapsed_us: u64,
    /// Scratch for the writer tick: the period had elapsed when the
    /// wait set was assembled, so a writable fd dispatches this entry.
    armed: bool,
}

enum PumpList {
    Readers,
    Writers,
}

/// The two priority-ordered lists of active sources, one per pump.
///
/// Both lists are kept sorted ascending by priority; insertion goes
/// before the first strictly greater entry so equal priorities dispatch
/// in arrival order. The lists are independent (the pumps run
/// concurrently) and each is guarded by its own mutex; neither lock is
/// held while a handler runs.
pub struct SourceRegistry {
    readers: Mutex<Vec<Active>>,
    writers: Mutex<Vec<Active>>,
}

fn lock<'a>(list: &'a Mutex<Vec<Active>>) -> MutexGuard<'a, Vec<Active>> {
    list.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn insert_sorted(list: &mut Vec<Active>, source: &Source) {
    let pos = list
        .iter()
        .position(|a| a.source.priority() > source.priority())
        .unwrap_or(list.len());
    list.insert(
        pos,
        Active {
            source: source.clone(),
            elapsed_us: 0,
            armed: false,
        },
    );
}

fn unlink(list: &mut Vec<Active>, source: &Source) {
    if let Some(pos) = list.iter().position(|a| a.source.same(source)) {
        list.remove(pos);
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            readers: Mutex::new(Vec::new()),
            writers: Mutex::new(Vec::new()),
        }
    }

    /// Puts a source on the pump list(s) its kinds select: `READ` on the
    /// readers list, `WRITE` and/or `TIMER` on the writers list. A
    /// source that is already active anywhere is refused with a warning.
    pub fn add(&self, source: &Source) -> Result<(), SourceError> {
        if self.exists(source) {
            warn!(owner = source.owner(), "source already registered");
            return Err(SourceError::AlreadyRegistered);
        }

        let kinds = source.kinds();
        if kinds.contains(SourceKind::READ) {
            insert_sorted(&mut lock(&self.readers), source);
        }
        if kinds.intersects(SourceKind::WRITE | SourceKind::TIMER) {
            insert_sorted(&mut lock(&self.writers), source);
        }
        Ok(())
    }

    /// Unlinks a source from whichever lists hold it. Idempotent; the
    /// source itself stays with its owner and may be re-added later.
    pub fn remove(&self, source: &Source) {
        unlink(&mut lock(&self.readers), source);
        unlink(&mut lock(&self.writers), source);
    }

    /// True while the source is on either pump list.
    pub fn exists(&self, source: &Source) -> bool {
        lock(&self.readers)
            .iter()
            .chain(lock(&self.writers).iter())
            .any(|a| a.source.same(source))
    }

    /// One reader pump tick: wait up to the fixed reader budget for any
    /// registered fd to become readable, credit the measured wait to
    /// every entry, then dispatch the ready ones in list order.
    pub fn execute_readers(&self) {
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        {
            let readers = lock(&self.readers);
            for active in readers.iter() {
                pollfds.push(libc::pollfd {
                    fd: active.source.fd(),
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
        }

        let (res, waited_us) = poll::wait_us(&mut pollfds, READ_WAIT_BUDGET_US);
        if let Err(err) = res {
            if err.kind() != io::ErrorKind::Interrupted {
                debug!(%err, "reader wait failed");
            }
            return;
        }

        let ready = ready_by_fd(&pollfds, libc::POLLIN);

        let mut plan: Vec<Source> = Vec::new();
        {
            let mut readers = lock(&self.readers);
            for active in readers.iter_mut() {
                active.elapsed_us += waited_us;
                if ready.contains_key(&active.source.fd()) {
                    plan.push(active.source.clone());
                    active.elapsed_us = 0;
                }
            }
        }

        for source in plan {
            self.dispatch(PumpList::Readers, &source, SourceEvent::Read);
        }
    }

    /// One writer pump tick. The wait budget starts at the writer cap
    /// and shrinks to the smallest `period - elapsed` so the next due
    /// source is not overshot. A periodic writer enters the wait set
    /// only once its period has elapsed, at which point its elapsed is
    /// zeroed eagerly; timer sources fire whenever their period has
    /// elapsed, independent of fd readiness.
    pub fn execute_writers(&self) {
        let mut budget_us = WRITE_WAIT_BUDGET_US;
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        {
            let mut writers = lock(&self.writers);
            for active in writers.iter_mut() {
                active.armed = false;
                let period = active.source.period_us();
                if active.source.kinds().contains(SourceKind::WRITE) {
                    if period == 0 || active.elapsed_us >= period {
                        if period != 0 {
                            active.elapsed_us = 0;
                        }
                        active.armed = true;
                        pollfds.push(libc::pollfd {
                            fd: active.source.fd(),
                            events: libc::POLLOUT,
                            revents: 0,
                        });
                    }
                }
                if period > 0 {
                    budget_us = budget_us.min(period.saturating_sub(active.elapsed_us));
                }
            }
        }

        let (res, waited_us) = poll::wait_us(&mut pollfds, budget_us);
        if let Err(err) = res {
            if err.kind() != io::ErrorKind::Interrupted {
                debug!(%err, "writer wait failed");
            }
            return;
        }

        let writable = ready_by_fd(&pollfds, libc::POLLOUT);

        let mut plan: Vec<(Source, SourceEvent)> = Vec::new();
        {
            let mut writers = lock(&self.writers);
            for active in writers.iter_mut() {
                active.elapsed_us += waited_us;
                if active.armed && writable.contains_key(&active.source.fd()) {
                    plan.push((active.source.clone(), SourceEvent::Write));
                    active.elapsed_us = 0;
                }
                // The write dispatch above already zeroed elapsed, so a
                // WRITE|TIMER source cannot double-fire in one tick.
                if active.source.kinds().contains(SourceKind::TIMER)
                    && active.elapsed_us >= active.source.period_us()
                {
                    plan.push((active.source.clone(), SourceEvent::Timeout));
                    active.elapsed_us = 0;
                }
            }
        }

        for (source, event) in plan {
            self.dispatch(PumpList::Writers, &source, event);
        }
    }

    /// Runs one handler. The source may have been removed by an earlier
    /// handler in the same tick, in which case it is skipped; a `Remove`
    /// verdict unlinks it from the dispatching list only.
    fn dispatch(&self, list: PumpList, source: &Source, event: SourceEvent) {
        let list = match list {
            PumpList::Readers => &self.readers,
            PumpList::Writers => &self.writers,
        };

        if !lock(list).iter().any(|a| a.source.same(source)) {
            return;
        }

        if source.run_handler(event) == Dispatch::Remove {
            debug!(owner = source.owner(), "handler requested removal");
            unlink(&mut lock(list), source);
        }
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps fds the wait reported as ready back to their revents bits.
/// Error and hangup conditions count as ready so the owning handler
/// observes the failing read/write and can decide what to do.
fn ready_by_fd(pollfds: &[libc::pollfd], want: i16) -> HashMap<RawFd, i16> {
    let mut ready = HashMap::new();
    for pfd in pollfds {
        if pfd.revents & (want | libc::POLLERR | libc::POLLHUP) != 0 {
            *ready.entry(pfd.fd).or_insert(0) |= pfd.revents;
        }
    }
    ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::priority;

    fn noop_source(kinds: SourceKind, prio: i32, fd: RawFd) -> Source {
        Source::new("test", kinds, prio, fd, 0, Box::new(|_, _| Dispatch::Keep))
    }

    #[test]
    fn add_remove_roundtrip() {
        let registry = SourceRegistry::new();
        let src = noop_source(SourceKind::READ, priority::DEFAULT, 0);

        assert!(!registry.exists(&src));
        registry.add(&src).unwrap();
        assert!(registry.exists(&src));
        registry.remove(&src);
        assert!(!registry.exists(&src));
        // idempotent
        registry.remove(&src);
        assert!(!registry.exists(&src));
    }

    #[test]
    fn duplicate_add_is_refused() {
        let registry = SourceRegistry::new();
        let src = noop_source(SourceKind::WRITE, priority::DEFAULT, 1);

        registry.add(&src).unwrap();
        assert!(matches!(
            registry.add(&src),
            Err(SourceError::AlreadyRegistered)
        ));
        // still present exactly once
        registry.remove(&src);
        assert!(!registry.exists(&src));
    }

    #[test]
    fn readers_sorted_by_priority_with_fifo_ties() {
        let registry = SourceRegistry::new();
        let low = noop_source(SourceKind::READ, priority::LOW, 3);
        let high = noop_source(SourceKind::READ, priority::HIGH, 4);
        let first_default = noop_source(SourceKind::READ, priority::DEFAULT, 5);
        let second_default = noop_source(SourceKind::READ, priority::DEFAULT, 6);

        registry.add(&low).unwrap();
        registry.add(&first_default).unwrap();
        registry.add(&second_default).unwrap();
        registry.add(&high).unwrap();

        let readers = lock(&registry.readers);
        let fds: Vec<RawFd> = readers.iter().map(|a| a.source.fd()).collect();
        assert_eq!(fds, vec![4, 5, 6, 3]);
    }

    #[test]
    fn timer_only_source_rides_the_writers_list() {
        let registry = SourceRegistry::new();
        let timer = Source::new(
            "tick",
            SourceKind::TIMER,
            priority::DEFAULT,
            -1,
            1_000,
            Box::new(|_, _| Dispatch::Keep),
        );

        registry.add(&timer).unwrap();
        assert!(lock(&registry.readers).is_empty());
        assert_eq!(lock(&registry.writers).len(), 1);
    }

    #[test]
    fn dual_kind_source_lands_on_both_lists() {
        let registry = SourceRegistry::new();
        let both = noop_source(SourceKind::READ | SourceKind::WRITE, priority::DEFAULT, 7);

        registry.add(&both).unwrap();
        assert_eq!(lock(&registry.readers).len(), 1);
        assert_eq!(lock(&registry.writers).len(), 1);

        registry.remove(&both);
        assert!(!registry.exists(&both));
    }
}
