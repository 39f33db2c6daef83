//! Bench fixtures for the scheduling core.

use sios_core::{priority, Dispatch, Source, SourceKind};

/// Timer-only sources with a 1 µs period: every writer tick arms and
/// dispatches all of them, which is the dispatch-overhead worst case.
pub fn timer_sources(count: usize) -> Vec<Source> {
    (0..count)
        .map(|i| {
            Source::new(
                format!("bench{i}"),
                SourceKind::TIMER,
                priority::DEFAULT,
                -1,
                1,
                Box::new(|_, _| Dispatch::Keep),
            )
        })
        .collect()
}

/// Sources spread over the priority bands, for insert-position costs.
pub fn banded_sources(count: usize) -> Vec<Source> {
    let bands = [priority::MAX, priority::HIGH, priority::DEFAULT, priority::LOW];
    (0..count)
        .map(|i| {
            Source::new(
                format!("bench{i}"),
                SourceKind::TIMER,
                bands[i % bands.len()],
                -1,
                1_000,
                Box::new(|_, _| Dispatch::Keep),
            )
        })
        .collect()
}
