//! PWM beep module: queued notes and frequency sweeps on the beeper
//! channel.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;

use tracing::{info, warn};

use sios_core::{priority, Dispatch, Source, SourceEvent, SourceKind, SourceRegistry};
use sios_module::{
    params, version, Module, ModuleCtx, ModuleError, ModuleSpec, ParamError, Platform,
    PLATFORM_VERSION,
};
use sios_osc::{int_args, MethodDesc, Object, OscRequest};

use crate::queue::FrameQueue;
use crate::words::{
    self, BEEP_BASE_NOTE, BEEP_MAX_DUTY, PWM_MAX_DURATION, PWM_MAX_FREQ,
};

const PWM_BEEP_DEV: &str = "/dev/sios_pwm0";
const FREQ_MIN_DURATION: i32 = 10;

pub const SPEC: ModuleSpec = ModuleSpec {
    basename: "pwm_beep",
    version: version(1, 0, 0),
    version_str: "1.0.0",
    platform_version: PLATFORM_VERSION,
    ctor: new_module,
};

fn new_module() -> Box<dyn Module> {
    Box::new(BeepModule::default())
}

struct BeepShared {
    queue: FrameQueue,
    min_delay: i32,
    max_steps: i32,
}

impl BeepShared {
    fn put_beep(&self, note: i32, duty: i32, delay_ms: i32) -> bool {
        let Some((note, duty)) = check_note(note, duty) else {
            return false;
        };
        self.queue
            .push(words::note_frame(note, duty, delay_ms.max(self.min_delay)))
    }

    fn put_beep_time(&self, note: i32, duty: i32, duration: i32, delay_ms: i32) -> bool {
        let Some((note, duty)) = check_note(note, duty) else {
            return false;
        };
        if duration < 0 || duration > PWM_MAX_DURATION as i32 {
            return false;
        }
        self.queue.push(words::note_time_frame(
            note,
            duty,
            duration as u16,
            delay_ms.max(self.min_delay),
        ))
    }

    /// Ramps frequency and duty from one pair to the other over
    /// `duration` ms, one controller frame per step, ending with a
    /// duty-off frame unless sustained.
    fn put_sweep(&self, f1: i32, f2: i32, d1: i32, d2: i32, duration: i32, sustain: bool) {
        let f1 = f1.clamp(1, PWM_MAX_FREQ as i32);
        let f2 = f2.clamp(1, PWM_MAX_FREQ as i32);
        let d1 = d1.clamp(0, BEEP_MAX_DUTY as i32);
        let d2 = d2.clamp(0, BEEP_MAX_DUTY as i32);
        if duration <= 0 {
            return;
        }
        let duration = duration.max(self.min_delay);

        let steps = (duration / FREQ_MIN_DURATION).clamp(1, self.max_steps.max(1));
        let delay = duration / steps;

        let df = f2 - f1;
        let dd = d2 - d1;
        let skip_f = if df != 0 { steps / df.abs() + 1 } else { 0 };
        let skip_d = if dd != 0 { steps / dd.abs() + 1 } else { 0 };
        let step_f = df / steps + df.signum();
        let step_d = dd / steps + dd.signum();

        let (mut f, mut d) = (f1, d1);
        for i in 0..=steps {
            if skip_f != 0 && i % skip_f == 0 {
                f += step_f;
            }
            if skip_d != 0 && i % skip_d == 0 {
                d += step_d;
            }
            self.queue.push(words::freq_duty_frame(
                f.clamp(1, PWM_MAX_FREQ as i32) as u16,
                d.clamp(0, BEEP_MAX_DUTY as i32) as u8,
                FREQ_MIN_DURATION as u16,
                delay,
            ));
        }
        if !sustain {
            self.queue.push(words::duty_frame(0, self.min_delay));
        }
    }
}

fn check_note(note: i32, duty: i32) -> Option<(u8, u8)> {
    if note < BEEP_BASE_NOTE as i32 || note > 0x7f {
        return None;
    }
    if !(0..=BEEP_MAX_DUTY as i32).contains(&duty) {
        return None;
    }
    Some((note as u8, duty as u8))
}

fn build_methods(
    shared: &Arc<BeepShared>,
    source: &Source,
    sources: &Arc<SourceRegistry>,
) -> Vec<MethodDesc> {
    let beep_shared = shared.clone();
    let beep_source = source.clone();
    let beep_sources = sources.clone();
    let beep = MethodDesc::new(
        "beep",
        "",
        None,
        "send beep",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("beep: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [note, duty, delay] => {
                    beep_shared.put_beep(*note, *duty, *delay);
                }
                [note, duty, duration, delay] => {
                    beep_shared.put_beep_time(*note, *duty, *duration, *delay);
                }
                _ => warn!("beep: wrong amount of arguments"),
            }
            // keep the drain source running; a re-add while active is
            // a no-op
            let _ = beep_sources.add(&beep_source);
            0
        }),
    );

    let sweep_shared = shared.clone();
    let sweep_source = source.clone();
    let sweep_sources = sources.clone();
    let sweep = MethodDesc::new(
        "sweep",
        "",
        None,
        "sweep to frequency",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("sweep: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [f1, f2, d1, d2, _freq_duration, duration] => {
                    sweep_shared.put_sweep(*f1, *f2, *d1, *d2, *duration, false);
                }
                [f1, f2, d1, d2, _freq_duration, duration, sustain] => {
                    sweep_shared.put_sweep(*f1, *f2, *d1, *d2, *duration, *sustain != 0);
                }
                _ => warn!("sweep: wrong amount of arguments"),
            }
            let _ = sweep_sources.add(&sweep_source);
            0
        }),
    );

    vec![beep, sweep]
}

pub struct BeepModule {
    device: String,
    max_steps: i32,
    min_delay: i32,
    object: Option<Arc<Object>>,
    source: Option<Source>,
    _file: Option<File>,
}

impl Default for BeepModule {
    fn default() -> Self {
        Self {
            device: PWM_BEEP_DEV.to_string(),
            max_steps: 20,
            min_delay: 10,
            object: None,
            source: None,
            _file: None,
        }
    }
}

impl Module for BeepModule {
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        match name {
            "device" => params::set_copystring(&mut self.device, value, 36),
            "max_steps" => params::set_i32(&mut self.max_steps, value),
            "min_delay" => params::set_i32(&mut self.min_delay, value),
            other => Err(ParamError::Unknown(other.to_string())),
        }
    }

    fn init(&mut self, platform: &Platform, ctx: &ModuleCtx) -> Result<(), ModuleError> {
        info!("opening pwm device: {}", self.device);
        let file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.device)
            .map_err(|source| ModuleError::Device {
                device: self.device.clone(),
                source,
            })?;

        let shared = Arc::new(BeepShared {
            queue: FrameQueue::new(),
            min_delay: self.min_delay,
            max_steps: self.max_steps,
        });

        let handler_shared = shared.clone();
        let device = self.device.clone();
        let source = Source::new(
            &ctx.name,
            SourceKind::WRITE,
            priority::DEFAULT,
            file.as_raw_fd(),
            self.min_delay.max(0) as u64 * 1_000,
            Box::new(move |src, event| {
                if event != SourceEvent::Write {
                    return Dispatch::Keep;
                }
                handler_shared.queue.drain_one(src, &device)
            }),
        );

        let object = Object::new(&ctx.name, &ctx.description);
        platform.namespace.register_object(&object, &ctx.class);
        platform
            .osc
            .add_methods(&object, build_methods(&shared, &source, &platform.sources))?;

        self.object = Some(object);
        self.source = Some(source);
        self._file = Some(file);
        Ok(())
    }

    fn exit(&mut self, platform: &Platform) {
        if let Some(source) = self.source.take() {
            platform.sources.remove(&source);
        }
        self._file = None;
        if let Some(object) = self.object.take() {
            platform.osc.remove_object_methods(&object);
            platform.namespace.deregister_object(&object);
        }
    }

    fn object(&self) -> Option<Arc<Object>> {
        self.object.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> BeepShared {
        BeepShared {
            queue: FrameQueue::new(),
            min_delay: 10,
            max_steps: 20,
        }
    }

    #[test]
    fn beep_bounds_are_enforced() {
        let s = shared();
        assert!(s.put_beep(60, 80, 100));
        // below the base note, above 7 bits, duty over 100
        assert!(!s.put_beep(10, 80, 100));
        assert!(!s.put_beep(200, 80, 100));
        assert!(!s.put_beep(60, 101, 100));
        assert_eq!(s.queue.len(), 1);
    }

    #[test]
    fn short_delays_stretch_to_min_delay() {
        let s = shared();
        s.put_beep(60, 80, 1);
        let src = Source::new(
            "pwm_beep",
            SourceKind::WRITE,
            priority::DEFAULT,
            open_scratch(),
            99_000,
            Box::new(|_, _| Dispatch::Keep),
        );
        s.put_beep(61, 80, 1);
        // draining re-arms the period from the next frame's stretched
        // delay
        assert_eq!(s.queue.drain_one(&src, "test"), Dispatch::Keep);
        assert_eq!(src.period_us(), 10_000);
        assert_eq!(s.queue.drain_one(&src, "test"), Dispatch::Remove);
    }

    #[test]
    fn sweep_ends_with_a_duty_off_frame() {
        let s = shared();
        s.put_sweep(100, 400, 0, 80, 200, false);
        let n = s.queue.len();
        assert!(n > 2, "sweep queued only {n} frames");

        // drain to the last frame
        let src = Source::new(
            "pwm_beep",
            SourceKind::WRITE,
            priority::DEFAULT,
            open_scratch(),
            10_000,
            Box::new(|_, _| Dispatch::Keep),
        );
        for _ in 0..n - 1 {
            assert_eq!(s.queue.drain_one(&src, "test"), Dispatch::Keep);
        }
        assert_eq!(s.queue.drain_one(&src, "test"), Dispatch::Remove);
    }

    #[test]
    fn sustained_sweep_skips_the_off_frame() {
        let quiet = shared();
        quiet.put_sweep(100, 200, 10, 10, 100, false);
        let sustained = shared();
        sustained.put_sweep(100, 200, 10, 10, 100, true);
        assert_eq!(quiet.queue.len(), sustained.queue.len() + 1);
    }

    fn open_scratch() -> std::os::fd::RawFd {
        // write target for drain tests; leaked fds are fine here
        let path = std::env::temp_dir().join(format!(
            "sios_pwm_test_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .unwrap();
        let fd = file.as_raw_fd();
        std::mem::forget(file);
        fd
    }
}
