//! PWM buzz module: duty-only pulses for the vibration motor. The
//! motor's PWM frequency is fixed once when the device opens; after
//! that only duty and delay words go out.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
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
use crate::words::{self, BEEP_MAX_DUTY, BUZZ_FREQ, PWM_BUFSIZE, PWM_MAX_DURATION};

const PWM_BUZZ_DEV: &str = "/dev/sios_pwm1";
const DEFAULT_DELAY_MS: i32 = 1000;

pub const SPEC: ModuleSpec = ModuleSpec {
    basename: "pwm_buzz",
    version: version(1, 1, 1),
    version_str: "1.1.1",
    platform_version: PLATFORM_VERSION,
    ctor: new_module,
};

fn new_module() -> Box<dyn Module> {
    Box::new(BuzzModule::default())
}

struct BuzzShared {
    queue: FrameQueue,
    min_delay: i32,
    max_steps: i32,
}

impl BuzzShared {
    fn put_buzz(&self, duty: i32, delay_ms: i32) -> bool {
        let Some(duty) = check_duty(duty) else {
            return false;
        };
        self.queue
            .push(words::duty_frame(duty, delay_ms.max(self.min_delay)))
    }

    fn put_buzz_time(&self, duty: i32, duration: i32, delay_ms: i32) -> bool {
        let Some(duty) = check_duty(duty) else {
            return false;
        };
        if duration < 0 || duration > PWM_MAX_DURATION as i32 {
            return false;
        }
        self.queue.push(words::duty_time_frame(
            duty,
            duration as u16,
            delay_ms.max(self.min_delay),
        ))
    }

    /// Walks duty from `d1` to `d2` over `duration` ms, bounded by the
    /// queue space and the configured step count, then shuts the motor
    /// up.
    fn put_sweep(&self, d1: i32, d2: i32, duration: i32) {
        if duration < self.min_delay {
            return;
        }
        let delta = d2 - d1;
        if delta == 0 {
            return;
        }

        let mut room = PWM_BUFSIZE as i32 - self.queue.len() as i32 - 2;
        if room > self.max_steps {
            room = self.max_steps - 1;
        }
        if room <= 0 {
            return;
        }

        let direction = delta.signum();
        let mut steps = delta.abs().min(room);
        let step_size = (delta.abs() / steps).max(1);

        let mut delay = duration / steps;
        if delay < self.min_delay {
            steps = (duration / self.min_delay).max(1);
            delay = self.min_delay;
        }

        let mut duty = d1;
        for _ in 0..=steps {
            self.put_buzz_time(duty.clamp(0, BEEP_MAX_DUTY as i32), delay, delay);
            duty += step_size * direction;
        }
        self.put_buzz_time(0, 1, self.min_delay);
    }
}

fn check_duty(duty: i32) -> Option<u8> {
    if (0..=BEEP_MAX_DUTY as i32).contains(&duty) {
        Some(duty as u8)
    } else {
        None
    }
}

fn build_methods(
    shared: &Arc<BuzzShared>,
    source: &Source,
    sources: &Arc<SourceRegistry>,
) -> Vec<MethodDesc> {
    let buzz_shared = shared.clone();
    let buzz_source = source.clone();
    let buzz_sources = sources.clone();
    let buzz = MethodDesc::new(
        "buzz",
        "",
        None,
        "put buzz",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("buzz: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [duty] => {
                    buzz_shared.put_buzz(*duty, DEFAULT_DELAY_MS);
                }
                [duty, duration] => {
                    buzz_shared.put_buzz_time(*duty, *duration, DEFAULT_DELAY_MS);
                }
                _ => warn!("buzz: wrong amount of arguments"),
            }
            let _ = buzz_sources.add(&buzz_source);
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
        "put sweep buzz",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("sweep: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [d1, d2, duration] => sweep_shared.put_sweep(*d1, *d2, *duration),
                _ => warn!("sweep: wrong amount of arguments"),
            }
            let _ = sweep_sources.add(&sweep_source);
            0
        }),
    );

    vec![buzz, sweep]
}

pub struct BuzzModule {
    device: String,
    max_steps: i32,
    min_delay: i32,
    object: Option<Arc<Object>>,
    source: Option<Source>,
    _file: Option<File>,
}

impl Default for BuzzModule {
    fn default() -> Self {
        Self {
            device: PWM_BUZZ_DEV.to_string(),
            max_steps: 20,
            min_delay: 20,
            object: None,
            source: None,
            _file: None,
        }
    }
}

impl Module for BuzzModule {
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
        let mut file = OpenOptions::new()
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.device)
            .map_err(|source| ModuleError::Device {
                device: self.device.clone(),
                source,
            })?;

        // set the motor's PWM frequency once, it stays set
        file.write_all(&words::freq_word(BUZZ_FREQ))
            .map_err(|source| ModuleError::Device {
                device: self.device.clone(),
                source,
            })?;

        let shared = Arc::new(BuzzShared {
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
