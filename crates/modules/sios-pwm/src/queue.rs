use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::{Mutex, MutexGuard};

use tracing::error;

use sios_core::{Dispatch, Source};

use crate::words::{PwmFrame, PWM_BUFSIZE};

/// Queued frames for one PWM channel. OSC handlers push; the writer
/// source drains one frame per dispatch, pacing itself with the
/// next frame's delay and retiring once the queue runs dry.
pub(crate) struct FrameQueue {
    frames: Mutex<VecDeque<PwmFrame>>,
}

fn lock(frames: &Mutex<VecDeque<PwmFrame>>) -> MutexGuard<'_, VecDeque<PwmFrame>> {
    frames
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_all(fd: RawFd, data: &[u8]) -> io::Result<()> {
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl FrameQueue {
    pub(crate) fn new() -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn len(&self) -> usize {
        lock(&self.frames).len()
    }

    pub(crate) fn push(&self, frame: PwmFrame) -> bool {
        let mut frames = lock(&self.frames);
        if frames.len() >= PWM_BUFSIZE - 1 {
            return false;
        }
        frames.push_back(frame);
        true
    }

    /// The writer source handler body: one frame out per dispatch.
    pub(crate) fn drain_one(&self, src: &Source, device: &str) -> Dispatch {
        let mut frames = lock(&self.frames);
        let Some(frame) = frames.pop_front() else {
            return Dispatch::Keep;
        };

        if let Err(err) = write_all(src.fd(), &frame.data) {
            error!("write error '{device}': {err}");
        }

        if let Some(next) = frames.front() {
            src.set_period_us(next.delay_ms.max(0) as u64 * 1_000);
        }

        if frames.is_empty() {
            Dispatch::Remove
        } else {
            Dispatch::Keep
        }
    }
}
