//! Accelerometer/magnetometer sensor module. Each configured device
//! is a pair of character devices (`<base><n>a`, `<base><n>m`)
//! delivering packed 6-byte x/y/z samples; each fd is a read source on
//! the reader pump. Accelerometer and magnetometer data fan out to
//! two independent listener lists. The magnetometer supports an
//! offset calibration driven by the mag-pulse sysfs attribute.

mod calibrate;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use sios_core::{priority, Dispatch, Source, SourceEvent, SourceKind};
use sios_module::{
    params, version, Module, ModuleCtx, ModuleError, ModuleSpec, ParamError, Platform,
    PLATFORM_VERSION,
};
use sios_osc::{
    endpoint_from_request, int_args, listener, ListenerSet, MethodDesc, Object, OscRequest,
    OscServer, OscType,
};

use calibrate::{CalStep, Calibration};

const ACCMAG_DEV_BASE: &str = "/dev/sios_accmag";
const ACCMAG_SYS_BASE: &str = "/sys/class/sensors/sios_accmag";
const SAMPLE_SIZE: usize = 6;

pub const SPEC: ModuleSpec = ModuleSpec {
    basename: "accmag",
    version: version(2, 0, 1),
    version_str: "2.0.1",
    platform_version: PLATFORM_VERSION,
    ctor: new_module,
};

fn new_module() -> Box<dyn Module> {
    Box::new(AccmagModule::default())
}

/// One packed device sample, three little 16-bit axes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Sample {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl Sample {
    fn from_bytes(raw: &[u8; SAMPLE_SIZE]) -> Sample {
        Sample {
            x: i16::from_ne_bytes([raw[0], raw[1]]),
            y: i16::from_ne_bytes([raw[2], raw[3]]),
            z: i16::from_ne_bytes([raw[4], raw[5]]),
        }
    }
}

struct AccmagShared {
    osc: Arc<OscServer>,
    acc_listeners: ListenerSet,
    mag_listeners: ListenerSet,
    acc_path: String,
    mag_path: String,
    sys_base: String,
    verbose: bool,
    /// Calibration state, one per magnetometer.
    mags: Vec<Mutex<Calibration>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AccmagShared {
    fn list(&self, mag: bool) -> &ListenerSet {
        if mag {
            &self.mag_listeners
        } else {
            &self.acc_listeners
        }
    }

    fn stream(&self, mag: bool) -> &str {
        if mag {
            "magnetometer"
        } else {
            "accelerometer"
        }
    }

    fn fan_out(&self, mag: bool, num: usize, sample: Sample) {
        let listeners = self
            .list(mag)
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listeners.is_empty() {
            return;
        }

        let path = if mag { &self.mag_path } else { &self.acc_path };
        let args = vec![
            OscType::Int(num as i32),
            OscType::Int(sample.x as i32),
            OscType::Int(sample.y as i32),
            OscType::Int(sample.z as i32),
        ];
        for endpoint in listeners.iter() {
            if let Err(err) = self.osc.send(endpoint, path, args.clone()) {
                warn!("accmag send to {endpoint} failed: {err}");
            }
        }
        if self.verbose {
            info!(
                "{} data: {}\t{}\t{}",
                if mag { "mag" } else { "acc" },
                sample.x,
                sample.y,
                sample.z
            );
        }
    }

    /// Flips the mag-pulse attribute of one magnetometer.
    fn toggle_magpulse(&self, num: usize) {
        let mut cal = lock(&self.mags[num]);
        cal.pulse = !cal.pulse;
        let path = format!("{}{}m/mag_pulse", self.sys_base, num);
        info!("toggling mag_pulse {path} ({num}, {})", cal.pulse as i32);
        if let Err(err) = std::fs::write(&path, if cal.pulse { "1" } else { "0" }) {
            error!("error writing '{path}': {err}");
        }
    }

    fn handle_sample(&self, mag: bool, num: usize, mut sample: Sample) {
        if mag {
            let step = {
                let mut cal = lock(&self.mags[num]);
                if cal.running() {
                    Some(cal.step(sample))
                } else {
                    sample.x = sample.x.wrapping_add(cal.offset.x);
                    sample.y = sample.y.wrapping_add(cal.offset.y);
                    sample.z = sample.z.wrapping_add(cal.offset.z);
                    None
                }
            };
            match step {
                Some(CalStep::TogglePulse) => {
                    info!("captured enough normal samples");
                    self.toggle_magpulse(num);
                    return;
                }
                Some(CalStep::Finished) => {
                    self.toggle_magpulse(num);
                    let cal = lock(&self.mags[num]);
                    info!(
                        "have offsets ({}, {}, {})",
                        cal.offset.x, cal.offset.y, cal.offset.z
                    );
                    return;
                }
                Some(CalStep::Continue) => return,
                None => {}
            }
        }
        self.fan_out(mag, num, sample);
    }

    fn calibrate(&self, num: usize, samples: usize) {
        let Some(mag) = self.mags.get(num) else {
            warn!("no magnetometer {num}");
            return;
        };
        info!("calibration request {num}, {samples}");
        if !lock(mag).start(samples) {
            warn!("already in calibration sequence");
        }
    }
}

fn accmag_read(shared: &AccmagShared, mag: bool, num: usize, src: &Source) -> Dispatch {
    let mut raw = [0u8; SAMPLE_SIZE];
    let n = unsafe { libc::read(src.fd(), raw.as_mut_ptr().cast(), SAMPLE_SIZE) };
    if n < 0 {
        error!("read error: {}", io::Error::last_os_error());
        return Dispatch::Keep;
    }
    if (n as usize) < SAMPLE_SIZE {
        warn!("read only {n} bytes, ignoring");
        return Dispatch::Keep;
    }
    shared.handle_sample(mag, num, Sample::from_bytes(&raw));
    Dispatch::Keep
}

fn listen_method(
    shared: &Arc<AccmagShared>,
    name: &str,
    addr: &str,
    mag: bool,
    add: bool,
) -> MethodDesc {
    let shared = shared.clone();
    MethodDesc::new(
        name,
        addr,
        None,
        if add {
            "start data transfer"
        } else {
            "stop data transfer"
        },
        Arc::new(move |req: &OscRequest<'_>| {
            let endpoint = endpoint_from_request(req);
            if add {
                match listener::add_listener(shared.list(mag), shared.stream(mag), endpoint) {
                    Ok(()) => 0,
                    Err(_) => -1,
                }
            } else {
                listener::del_listener(shared.list(mag), shared.stream(mag), &endpoint);
                0
            }
        }),
    )
}

fn build_methods(shared: &Arc<AccmagShared>, default_samples: i32) -> Vec<MethodDesc> {
    let cal_shared = shared.clone();
    let calibrate = MethodDesc::new(
        "mag_calibrate",
        "mag/calibrate",
        None,
        "calibrate magnetometer",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("calibrate: integer arguments expected");
                return -1;
            };
            let (dev, samples) = match args.as_slice() {
                [dev] => (*dev, default_samples),
                [dev, samples] => (*dev, *samples),
                _ => return -1,
            };
            if dev < 0 || samples <= 0 {
                return -1;
            }
            cal_shared.calibrate(dev as usize, samples as usize);
            0
        }),
    );

    vec![
        listen_method(shared, "acc_listen", "acc/listen", false, true),
        listen_method(shared, "mag_listen", "mag/listen", true, true),
        listen_method(shared, "acc_silence", "acc/silence", false, false),
        listen_method(shared, "mag_silence", "mag/silence", true, false),
        calibrate,
    ]
}

pub struct AccmagModule {
    device_base: String,
    sys_base: String,
    devices: i32,
    calibration_samples: i32,
    verbose: bool,
    object: Option<Arc<Object>>,
    sources: Vec<Source>,
    files: Vec<File>,
}

impl Default for AccmagModule {
    fn default() -> Self {
        Self {
            device_base: ACCMAG_DEV_BASE.to_string(),
            sys_base: ACCMAG_SYS_BASE.to_string(),
            devices: 1,
            calibration_samples: 3,
            verbose: false,
            object: None,
            sources: Vec::new(),
            files: Vec::new(),
        }
    }
}

impl Module for AccmagModule {
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        match name {
            "device_base" => params::set_copystring(&mut self.device_base, value, 32),
            "sys_base" => params::set_string(&mut self.sys_base, value),
            "devices" => params::set_i32(&mut self.devices, value),
            "calibration_samples" => params::set_i32(&mut self.calibration_samples, value),
            "verbose" => params::set_bool(&mut self.verbose, value),
            other => Err(ParamError::Unknown(other.to_string())),
        }
    }

    fn init(&mut self, platform: &Platform, ctx: &ModuleCtx) -> Result<(), ModuleError> {
        if self.devices <= 0 {
            return Err(ModuleError::Failed("no devices configured".into()));
        }

        // open every fd before touching the registry so a failed open
        // leaves nothing behind; one fd per sensor, <base><n>a then
        // <base><n>m
        let mut files = Vec::new();
        for i in 0..(self.devices as usize * 2) {
            let mag = i % 2 == 1;
            let device = format!("{}{}{}", self.device_base, i / 2, if mag { 'm' } else { 'a' });
            info!(
                "opening {} dev: {device}",
                if mag { "mag" } else { "acc" }
            );
            let file = OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&device)
                .map_err(|source| ModuleError::Device {
                    device: device.clone(),
                    source,
                })?;
            files.push((file, device));
        }

        let object = Object::new(&ctx.name, &ctx.description);
        platform.namespace.register_object(&object, &ctx.class);

        let shared = Arc::new(AccmagShared {
            osc: platform.osc.clone(),
            acc_listeners: ListenerSet::default(),
            mag_listeners: ListenerSet::default(),
            acc_path: format!("{}/acc/data", object.path()),
            mag_path: format!("{}/mag/data", object.path()),
            sys_base: self.sys_base.clone(),
            verbose: self.verbose,
            mags: (0..self.devices).map(|_| Mutex::new(Calibration::new())).collect(),
        });

        for (i, (file, device)) in files.into_iter().enumerate() {
            let num = i / 2;
            let mag = i % 2 == 1;
            let handler_shared = shared.clone();
            let source = Source::new(
                &ctx.name,
                SourceKind::READ,
                priority::DEFAULT,
                file.as_raw_fd(),
                0,
                Box::new(move |src, event| {
                    if event != SourceEvent::Read {
                        return Dispatch::Keep;
                    }
                    accmag_read(&handler_shared, mag, num, src)
                }),
            );
            if platform.sources.add(&source).is_err() {
                warn!("error adding source for {device}");
            }
            self.sources.push(source);
            self.files.push(file);
        }

        platform
            .osc
            .add_methods(&object, build_methods(&shared, self.calibration_samples))?;

        self.object = Some(object);
        Ok(())
    }

    fn exit(&mut self, platform: &Platform) {
        for source in self.sources.drain(..) {
            platform.sources.remove(&source);
        }
        self.files.clear();
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

    #[test]
    fn sample_unpacks_native_order() {
        let mut raw = [0u8; SAMPLE_SIZE];
        raw[0..2].copy_from_slice(&100i16.to_ne_bytes());
        raw[2..4].copy_from_slice(&(-200i16).to_ne_bytes());
        raw[4..6].copy_from_slice(&300i16.to_ne_bytes());
        assert_eq!(
            Sample::from_bytes(&raw),
            Sample {
                x: 100,
                y: -200,
                z: 300
            }
        );
    }

    fn test_shared(devices: usize, sys_base: String) -> AccmagShared {
        let shutdown = sios_core::ShutdownToken::new();
        AccmagShared {
            osc: OscServer::bind(0, false, false, shutdown).unwrap(),
            acc_listeners: ListenerSet::default(),
            mag_listeners: ListenerSet::default(),
            acc_path: "/sios/sensors/accmag/acc/data".into(),
            mag_path: "/sios/sensors/accmag/mag/data".into(),
            sys_base,
            verbose: false,
            mags: (0..devices).map(|_| Mutex::new(Calibration::new())).collect(),
        }
    }

    #[test]
    fn calibration_toggles_the_pulse_attribute() {
        let dir = std::env::temp_dir().join(format!("sios_accmag_test_{}", std::process::id()));
        std::fs::create_dir_all(dir.join("0m")).unwrap();
        let sys_base = format!("{}/", dir.display());

        let shared = test_shared(1, sys_base);
        shared.calibrate(0, 1);

        // one normal sample finishes the normal phase and flips pulse
        shared.handle_sample(true, 0, Sample { x: 10, y: 10, z: 10 });
        let pulse_path = dir.join("0m").join("mag_pulse");
        assert_eq!(std::fs::read_to_string(&pulse_path).unwrap(), "1");

        // stale flip sample, then the inverted sample completes it
        shared.handle_sample(true, 0, Sample { x: 99, y: 99, z: 99 });
        shared.handle_sample(true, 0, Sample { x: -10, y: -10, z: -10 });
        assert_eq!(std::fs::read_to_string(&pulse_path).unwrap(), "0");

        let cal = lock(&shared.mags[0]);
        assert!(!cal.running());
        // actual = (10 - -10)/2 = 10; offset = 10 - 10 = 0
        assert_eq!(cal.offset, Sample::default());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn offsets_apply_to_mag_data_only_after_calibration() {
        let shared = test_shared(1, "/nonexistent/".into());
        {
            let mut cal = lock(&shared.mags[0]);
            cal.offset = Sample { x: 5, y: -5, z: 0 };
        }
        // no listeners are registered, so this only exercises the
        // offset path without sending anything
        shared.handle_sample(true, 0, Sample { x: 1, y: 1, z: 1 });
        shared.handle_sample(false, 0, Sample { x: 1, y: 1, z: 1 });
    }

    #[test]
    fn out_of_range_calibration_requests_are_ignored() {
        let shared = test_shared(1, "/nonexistent/".into());
        shared.calibrate(5, 3);
        assert!(!lock(&shared.mags[0]).running());
    }
}
