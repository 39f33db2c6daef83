//! Event dispatch core: source contexts, the two pump threads that
//! multiplex-wait on them, and the shutdown token shared by every
//! long-running loop on the platform.
//!
//! A module that wants to react to fd readiness or a periodic timeout
//! builds a [`Source`] (fd, kind set, priority, period, handler) and adds
//! it to the [`SourceRegistry`]. The reader pump dispatches readable
//! sources; the writer pump dispatches writable and timer sources while
//! honoring each source's period. Handlers run on the pump threads and
//! must not block.

mod poll;
mod pump;
mod registry;
mod shutdown;
mod source;

pub use pump::{Pumps, READ_WAIT_BUDGET_US, WRITE_WAIT_BUDGET_US};
pub use registry::{SourceError, SourceRegistry};
pub use shutdown::ShutdownToken;
pub use source::{priority, Dispatch, Source, SourceEvent, SourceHandler, SourceKind};
