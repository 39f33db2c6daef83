use std::io;
use std::time::Instant;

/// Blocks in the OS multiplex-wait for at most `budget_us` microseconds
/// and reports the measured wait duration alongside the poll result.
/// The measured duration, not the budget, is what feeds the per-source
/// elapsed accounting: an interrupted or early-returning wait must not
/// over-credit the sources.
pub(crate) fn wait_us(fds: &mut [libc::pollfd], budget_us: u64) -> (io::Result<usize>, u64) {
    let start = Instant::now();
    let rc = do_poll(fds, budget_us);
    let res = if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    };
    let waited_us = start.elapsed().as_micros().min(u64::MAX as u128) as u64;
    (res, waited_us)
}

#[cfg(target_os = "linux")]
fn do_poll(fds: &mut [libc::pollfd], budget_us: u64) -> libc::c_int {
    let ts = libc::timespec {
        tv_sec: (budget_us / 1_000_000) as libc::time_t,
        tv_nsec: ((budget_us % 1_000_000) * 1_000) as libc::c_long,
    };
    let ptr = if fds.is_empty() {
        std::ptr::null_mut()
    } else {
        fds.as_mut_ptr()
    };
    unsafe { libc::ppoll(ptr, fds.len() as libc::nfds_t, &ts, std::ptr::null()) }
}

// No ppoll outside Linux; round the budget up to whole milliseconds.
#[cfg(not(target_os = "linux"))]
fn do_poll(fds: &mut [libc::pollfd], budget_us: u64) -> libc::c_int {
    let ms = budget_us.div_ceil(1_000).min(i32::MAX as u64) as libc::c_int;
    let ptr = if fds.is_empty() {
        std::ptr::null_mut()
    } else {
        fds.as_mut_ptr()
    };
    unsafe { libc::poll(ptr, fds.len() as libc::nfds_t, ms) }
}
