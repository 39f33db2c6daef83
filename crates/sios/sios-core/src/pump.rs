use std::io;
use std::sync::Arc;
use std::thread;

use tracing::info;

use crate::registry::SourceRegistry;
use crate::shutdown::ShutdownToken;

/// Fixed wait budget of the reader pump, in microseconds.
pub const READ_WAIT_BUDGET_US: u64 = 500;

/// Upper bound on the writer pump's wait budget, in microseconds. The
/// actual budget shrinks to the nearest due period each tick.
pub const WRITE_WAIT_BUDGET_US: u64 = 10_000;

/// The two pump threads. Each loops on its half of the registry until
/// the shutdown token fires; [`Pumps::join`] then reaps both.
pub struct Pumps {
    reader: thread::JoinHandle<()>,
    writer: thread::JoinHandle<()>,
}

impl Pumps {
    pub fn spawn(registry: Arc<SourceRegistry>, shutdown: ShutdownToken) -> io::Result<Pumps> {
        let reader = {
            let registry = registry.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("sios-reader".into())
                .spawn(move || {
                    info!("reader pump started");
                    while !shutdown.is_halted() {
                        registry.execute_readers();
                    }
                })?
        };

        let writer = thread::Builder::new()
            .name("sios-writer".into())
            .spawn(move || {
                info!("writer pump started");
                while !shutdown.is_halted() {
                    registry.execute_writers();
                }
            })?;

        Ok(Pumps { reader, writer })
    }

    /// Waits for both pumps to exit. Call after halting the shutdown
    /// token; each pump leaves within one wait budget plus whatever
    /// handler is in flight.
    pub fn join(self) {
        let _ = self.reader.join();
        let _ = self.writer.join();
    }
}
