//! RGB light actuator module. Each light is a write-only character
//! device taking 2-byte big-endian color words; besides plain colors
//! the module runs blink (ping-pong) and transition (one-way) ramps on
//! the writer pump, plus a sub-light flash source at maximum priority
//! sharing the same fd.

mod color;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info, warn};

use sios_core::{priority, Dispatch, Source, SourceEvent, SourceKind, SourceRegistry};
use sios_module::{
    params, version, Module, ModuleCtx, ModuleError, ModuleSpec, ParamError, Platform,
    PLATFORM_VERSION,
};
use sios_osc::{int_args, MethodDesc, Object, OscRequest};

const LIGHT_DEV_BASE: &str = "/dev/sios_light";
const MAX_LIGHTS: i32 = 8;
const RAMP_LEN: usize = 16;
const WRITE_MIN_DELAY_US: u64 = 20_000;

pub const SPEC: ModuleSpec = ModuleSpec {
    basename: "light",
    version: version(3, 0, 0),
    version_str: "3.0.0",
    platform_version: PLATFORM_VERSION,
    ctor: new_module,
};

fn new_module() -> Box<dyn Module> {
    Box::new(LightModule::default())
}

struct Ramp {
    rgb: [u16; RAMP_LEN],
    steps: i16,
    step: i16,
    direction: i16,
    delay_us: u64,
}

enum Pattern {
    Single { rgb: u16, delay_us: u64 },
    Blink(Ramp),
    Transition(Ramp),
}

struct Flash {
    active: bool,
    intensity: u16,
    delay_us: u64,
}

struct LightDev {
    pattern: Pattern,
    flash: Flash,
    current: u16,
}

/// Interpolated color ramp between two colors, one entry per step of
/// the largest changing channel. Channels advance every
/// `(steps+1)/delta`-th entry so all three arrive together.
fn build_ramp(
    from: (u16, u16, u16),
    to: (u16, u16, u16),
    duration_ms: i32,
) -> Option<Ramp> {
    let (r1, g1, b1) = (
        from.0.min(color::MAX_RGB) as i16,
        from.1.min(color::MAX_RGB) as i16,
        from.2.min(color::MAX_RGB) as i16,
    );
    let (r2, g2, b2) = (
        to.0.min(color::MAX_RGB) as i16,
        to.1.min(color::MAX_RGB) as i16,
        to.2.min(color::MAX_RGB) as i16,
    );

    let (dr, dg, db) = (r2 - r1, g2 - g1, b2 - b1);
    let steps = dr.abs().max(dg.abs()).max(db.abs());
    if steps == 0 {
        return None;
    }

    let skip_r = if dr != 0 { (steps + 1) / dr } else { 0 };
    let skip_g = if dg != 0 { (steps + 1) / dg } else { 0 };
    let skip_b = if db != 0 { (steps + 1) / db } else { 0 };

    let mut rgb = [0u16; RAMP_LEN];
    rgb[0] = color::rgb_word(r1 as u16, g1 as u16, b1 as u16);
    rgb[steps as usize] = color::rgb_word(r2 as u16, g2 as u16, b2 as u16);

    let (mut r, mut g, mut b) = (r1, g1, b1);
    for i in 1..steps {
        if skip_r != 0 && i % skip_r == 0 {
            r += dr.signum();
        }
        if skip_g != 0 && i % skip_g == 0 {
            g += dg.signum();
        }
        if skip_b != 0 && i % skip_b == 0 {
            b += db.signum();
        }
        rgb[i as usize] = color::rgb_word(r as u16, g as u16, b as u16);
    }

    Some(Ramp {
        rgb,
        steps,
        step: 1,
        direction: 1,
        delay_us: (duration_ms.max(0) as u64 / steps as u64) * 1_000,
    })
}

/// Ping-pong stepping; transitions stop being scheduled before the
/// bounce matters.
fn advance(ramp: &mut Ramp) {
    if ramp.step >= ramp.steps || ramp.step <= 0 {
        ramp.direction = -ramp.direction;
    }
    ramp.step += ramp.direction;
}

fn write_word(fd: RawFd, word: u16) -> io::Result<()> {
    let data = word.to_be_bytes();
    let n = unsafe { libc::write(fd, data.as_ptr().cast(), data.len()) };
    if n < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn light_write(dev: &mut LightDev, src: &Source, device: &str) -> Dispatch {
    let (word, delay_us, no_repeat) = match &mut dev.pattern {
        Pattern::Single { rgb, delay_us } => (*rgb, *delay_us, true),
        Pattern::Blink(ramp) => {
            let word = ramp.rgb[ramp.step as usize];
            let delay = ramp.delay_us;
            advance(ramp);
            (word, delay, false)
        }
        Pattern::Transition(ramp) => {
            let word = ramp.rgb[ramp.step as usize];
            let delay = ramp.delay_us;
            let done = ramp.step >= ramp.steps;
            advance(ramp);
            (word, delay, done)
        }
    };

    if let Err(err) = write_word(src.fd(), word) {
        error!("write error '{device}': {err}");
        return Dispatch::Keep;
    }

    dev.current = word;
    if delay_us != src.period_us() {
        src.set_period_us(delay_us);
    }
    if no_repeat {
        Dispatch::Remove
    } else {
        Dispatch::Keep
    }
}

/// One flash = one intensity write held for the flash duration, then
/// one zero write, then the source retires itself.
fn flash_write(dev: &mut LightDev, src: &Source, device: &str) -> Dispatch {
    let (word, verdict) = if dev.flash.active {
        src.set_period_us(dev.flash.delay_us);
        dev.flash.active = false;
        (color::sub_word(dev.flash.intensity), Dispatch::Keep)
    } else {
        src.set_period_us(WRITE_MIN_DELAY_US);
        dev.flash.active = true;
        (color::sub_word(0), Dispatch::Remove)
    };

    if let Err(err) = write_word(src.fd(), word) {
        error!("flash write error '{device}': {err}");
        return Dispatch::Keep;
    }
    verdict
}

struct Dev {
    state: Arc<Mutex<LightDev>>,
    source: Source,
    flash_source: Source,
    _file: File,
}

struct Shared {
    devs: Vec<Dev>,
    sources: Arc<SourceRegistry>,
}

fn setup_device(file: File, owner: &str, device: String) -> Dev {
    let fd = file.as_raw_fd();
    let state = Arc::new(Mutex::new(LightDev {
        pattern: Pattern::Single {
            rgb: 0,
            delay_us: WRITE_MIN_DELAY_US,
        },
        flash: Flash {
            active: false,
            intensity: 0,
            delay_us: WRITE_MIN_DELAY_US,
        },
        current: 0,
    }));

    let write_state = state.clone();
    let write_device = device.clone();
    let source = Source::new(
        owner,
        SourceKind::WRITE,
        priority::HIGH,
        fd,
        WRITE_MIN_DELAY_US,
        Box::new(move |src, event| {
            if event != SourceEvent::Write {
                return Dispatch::Keep;
            }
            light_write(&mut lock(&write_state), src, &write_device)
        }),
    );

    let flash_state = state.clone();
    let flash_source = Source::new(
        owner,
        SourceKind::WRITE,
        priority::MAX,
        fd,
        WRITE_MIN_DELAY_US,
        Box::new(move |src, event| {
            if event != SourceEvent::Write {
                return Dispatch::Keep;
            }
            flash_write(&mut lock(&flash_state), src, &device)
        }),
    );

    Dev {
        state,
        source,
        flash_source,
        _file: file,
    }
}

impl Shared {
    fn put_color(&self, index: usize, r: u16, g: u16, b: u16) {
        let Some(dev) = self.devs.get(index) else {
            warn!("no light device {index}");
            return;
        };
        lock(&dev.state).pattern = Pattern::Single {
            rgb: color::rgb_word(r, g, b),
            delay_us: WRITE_MIN_DELAY_US,
        };
        let _ = self.sources.add(&dev.source);
    }

    /// `from = None` ramps away from the device's current color.
    fn put_ramp(
        &self,
        index: usize,
        from: Option<(u16, u16, u16)>,
        to: (u16, u16, u16),
        duration_ms: i32,
        blink: bool,
    ) {
        let Some(dev) = self.devs.get(index) else {
            warn!("no light device {index}");
            return;
        };
        {
            let mut state = lock(&dev.state);
            let from = from.unwrap_or((
                color::red(state.current),
                color::green(state.current),
                color::blue(state.current),
            ));
            let Some(ramp) = build_ramp(from, to, duration_ms) else {
                return;
            };
            state.pattern = if blink {
                Pattern::Blink(ramp)
            } else {
                Pattern::Transition(ramp)
            };
        }
        let _ = self.sources.add(&dev.source);
    }

    fn flash(&self, index: usize, intensity: u16, duration_ms: i32) {
        let Some(dev) = self.devs.get(index) else {
            warn!("no light device {index}");
            return;
        };
        {
            let mut state = lock(&dev.state);
            state.flash = Flash {
                active: true,
                intensity: intensity.min(color::MAX_INTENSITY),
                delay_us: duration_ms.max(0) as u64 * 1_000,
            };
        }
        let _ = self.sources.add(&dev.flash_source);
    }
}

fn as_component(value: i32) -> u16 {
    value.clamp(0, color::MAX_RGB as i32) as u16
}

fn build_methods(shared: &Arc<Shared>) -> Vec<MethodDesc> {
    let rgb_shared = shared.clone();
    let rgb = MethodDesc::new(
        "rgb",
        "",
        None,
        "set rgb color",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("rgb: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [r, g, b] => {
                    for index in 0..rgb_shared.devs.len() {
                        rgb_shared.put_color(
                            index,
                            as_component(*r),
                            as_component(*g),
                            as_component(*b),
                        );
                    }
                }
                [dev, r, g, b] => rgb_shared.put_color(
                    (*dev).max(0) as usize,
                    as_component(*r),
                    as_component(*g),
                    as_component(*b),
                ),
                _ => warn!("rgb: wrong number of arguments: {}", args.len()),
            }
            0
        }),
    );

    let blink = ramp_method(shared, "blink", "blink colors", true);
    let trans = ramp_method(shared, "trans", "smooth fading to color", false);

    let flash_shared = shared.clone();
    let flash = MethodDesc::new(
        "flash",
        "",
        None,
        "flash",
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("flash: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [intensity, duration] => {
                    for index in 0..flash_shared.devs.len() {
                        flash_shared.flash(index, (*intensity).max(0) as u16, *duration);
                    }
                }
                [dev, intensity, duration] => {
                    flash_shared.flash((*dev).max(0) as usize, (*intensity).max(0) as u16, *duration)
                }
                _ => warn!("flash: wrong number of arguments: {}", args.len()),
            }
            0
        }),
    );

    vec![rgb, blink, trans, flash]
}

fn ramp_method(shared: &Arc<Shared>, name: &str, desc: &str, blink: bool) -> MethodDesc {
    let shared = shared.clone();
    let label = name.to_string();
    MethodDesc::new(
        name,
        "",
        None,
        desc,
        Arc::new(move |req: &OscRequest<'_>| {
            let Some(args) = int_args(req.args) else {
                warn!("{label}: integer arguments expected");
                return -1;
            };
            match args.as_slice() {
                [r, g, b, duration] => {
                    let to = (as_component(*r), as_component(*g), as_component(*b));
                    for index in 0..shared.devs.len() {
                        shared.put_ramp(index, None, to, *duration, blink);
                    }
                }
                [dev, r, g, b, duration] => {
                    let to = (as_component(*r), as_component(*g), as_component(*b));
                    shared.put_ramp((*dev).max(0) as usize, None, to, *duration, blink);
                }
                [r1, g1, b1, r2, g2, b2, duration] => {
                    let from = (as_component(*r1), as_component(*g1), as_component(*b1));
                    let to = (as_component(*r2), as_component(*g2), as_component(*b2));
                    for index in 0..shared.devs.len() {
                        shared.put_ramp(index, Some(from), to, *duration, blink);
                    }
                }
                [dev, r1, g1, b1, r2, g2, b2, duration] => {
                    let from = (as_component(*r1), as_component(*g1), as_component(*b1));
                    let to = (as_component(*r2), as_component(*g2), as_component(*b2));
                    shared.put_ramp((*dev).max(0) as usize, Some(from), to, *duration, blink);
                }
                _ => warn!("{label}: wrong number of arguments: {}", args.len()),
            }
            0
        }),
    )
}

pub struct LightModule {
    device_base: String,
    devices: i32,
    auto_blink: bool,
    auto_blink_speed: i32,
    object: Option<Arc<Object>>,
    shared: Option<Arc<Shared>>,
}

impl Default for LightModule {
    fn default() -> Self {
        Self {
            device_base: LIGHT_DEV_BASE.to_string(),
            devices: 1,
            auto_blink: false,
            auto_blink_speed: 2000,
            object: None,
            shared: None,
        }
    }
}

impl Module for LightModule {
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        match name {
            "device_base" => params::set_copystring(&mut self.device_base, value, 32),
            "devices" => params::set_i32(&mut self.devices, value),
            "auto_blink" => params::set_bool(&mut self.auto_blink, value),
            "auto_blink_speed" => params::set_i32(&mut self.auto_blink_speed, value),
            other => Err(ParamError::Unknown(other.to_string())),
        }
    }

    fn init(&mut self, platform: &Platform, ctx: &ModuleCtx) -> Result<(), ModuleError> {
        let count = self.devices.clamp(0, MAX_LIGHTS);
        let mut devs = Vec::new();
        for num in 0..count {
            let device = format!("{}{}", self.device_base, num);
            info!("opening dev: {device}");
            let file = OpenOptions::new()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(&device)
                .map_err(|source| ModuleError::Device {
                    device: device.clone(),
                    source,
                })?;
            devs.push(setup_device(file, &ctx.name, device));
        }

        let shared = Arc::new(Shared {
            devs,
            sources: platform.sources.clone(),
        });

        let object = Object::new(&ctx.name, &ctx.description);
        platform.namespace.register_object(&object, &ctx.class);
        platform.osc.add_methods(&object, build_methods(&shared))?;

        if self.auto_blink {
            for index in 0..shared.devs.len() {
                shared.put_ramp(index, Some((0, 0, 1)), (0, 0, 15), self.auto_blink_speed, true);
            }
        }

        self.object = Some(object);
        self.shared = Some(shared);
        Ok(())
    }

    fn exit(&mut self, platform: &Platform) {
        if let Some(shared) = self.shared.take() {
            for dev in &shared.devs {
                platform.sources.remove(&dev.source);
                platform.sources.remove(&dev.flash_source);
            }
        }
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

    fn ramp_components(ramp: &Ramp) -> Vec<(u16, u16, u16)> {
        ramp.rgb[..=ramp.steps as usize]
            .iter()
            .map(|w| (color::red(*w), color::green(*w), color::blue(*w)))
            .collect()
    }

    #[test]
    fn ramp_spans_both_endpoints() {
        let ramp = build_ramp((0, 0, 1), (0, 0, 15), 2000).unwrap();
        assert_eq!(ramp.steps, 14);
        let steps = ramp_components(&ramp);
        assert_eq!(steps.first(), Some(&(0, 0, 1)));
        assert_eq!(steps.last(), Some(&(0, 0, 15)));
        // duration spreads over the steps
        assert_eq!(ramp.delay_us, (2000 / 14) * 1000);
    }

    #[test]
    fn ramp_to_same_color_is_refused() {
        assert!(build_ramp((3, 3, 3), (3, 3, 3), 1000).is_none());
    }

    #[test]
    fn advance_ping_pongs_between_the_ends() {
        let mut ramp = build_ramp((0, 0, 0), (0, 0, 3), 300).unwrap();
        let mut seen = Vec::new();
        for _ in 0..8 {
            seen.push(ramp.step);
            advance(&mut ramp);
        }
        assert_eq!(seen, vec![1, 2, 3, 2, 1, 0, 1, 2]);
    }

    fn scratch_dev() -> (Dev, std::path::PathBuf) {
        let path = std::env::temp_dir().join(format!(
            "sios_light_test_{}_{:?}",
            std::process::id(),
            std::thread::current().id()
        ));
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (setup_device(file, "light", path.display().to_string()), path)
    }

    #[test]
    fn single_color_write_retires_the_source() {
        let (dev, path) = scratch_dev();
        lock(&dev.state).pattern = Pattern::Single {
            rgb: color::rgb_word(1, 2, 3),
            delay_us: WRITE_MIN_DELAY_US,
        };

        let verdict = light_write(&mut lock(&dev.state), &dev.source, "test");
        assert_eq!(verdict, Dispatch::Remove);
        assert_eq!(lock(&dev.state).current, color::rgb_word(1, 2, 3));

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written, color::rgb_word(1, 2, 3).to_be_bytes());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn blink_keeps_the_source_and_walks_the_ramp() {
        let (dev, path) = scratch_dev();
        lock(&dev.state).pattern = Pattern::Blink(build_ramp((0, 0, 0), (0, 0, 4), 400).unwrap());

        for _ in 0..10 {
            let verdict = light_write(&mut lock(&dev.state), &dev.source, "test");
            assert_eq!(verdict, Dispatch::Keep);
        }
        // the ramp delay became the source period
        assert_eq!(dev.source.period_us(), (400 / 4) * 1000);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn flash_writes_intensity_then_clears_and_retires() {
        let (dev, path) = scratch_dev();
        lock(&dev.state).flash = Flash {
            active: true,
            intensity: 2,
            delay_us: 30_000,
        };

        let first = flash_write(&mut lock(&dev.state), &dev.flash_source, "test");
        assert_eq!(first, Dispatch::Keep);
        assert_eq!(dev.flash_source.period_us(), 30_000);

        let second = flash_write(&mut lock(&dev.state), &dev.flash_source, "test");
        assert_eq!(second, Dispatch::Remove);

        let written = std::fs::read(&path).unwrap();
        let mut expected = color::sub_word(2).to_be_bytes().to_vec();
        expected.extend_from_slice(&color::sub_word(0).to_be_bytes());
        assert_eq!(written, expected);
        let _ = std::fs::remove_file(&path);
    }
}
