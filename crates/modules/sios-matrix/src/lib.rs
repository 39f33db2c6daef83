//! Pressure-matrix sensor module. The device delivers 64 cells of 12
//! bits as a 128-byte frame, possibly split over several short reads;
//! complete frames fan out to the module's private listener list as
//! one 64-int message. The matrix runs its own reader thread on a
//! 50 ms cadence instead of riding the reader pump.

use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::sync::Arc;
use std::thread;

use tracing::{error, info, warn};

use sios_core::ShutdownToken;
use sios_module::{
    params, version, Module, ModuleCtx, ModuleError, ModuleSpec, ParamError, Platform,
    PLATFORM_VERSION,
};
use sios_osc::{
    endpoint_from_request, listener, ListenerSet, MethodDesc, Object, OscRequest, OscServer,
    OscType,
};

const MATRIX_DEV: &str = "/dev/sios_matrix";
const MAX_CELLS: usize = 64;
const MAX_ROWS: i32 = 8;
const MAX_COLS: i32 = 8;
const BUFSIZE: usize = MAX_CELLS * 2;
const POLL_MS: i32 = 50;

pub const SPEC: ModuleSpec = ModuleSpec {
    basename: "matrix",
    version: version(1, 0, 2),
    version_str: "1.0.2",
    platform_version: PLATFORM_VERSION,
    ctor: new_module,
};

fn new_module() -> Box<dyn Module> {
    Box::new(MatrixModule::default())
}

fn unpack_frame(frame: &[u8; BUFSIZE]) -> [u16; MAX_CELLS] {
    let mut values = [0u16; MAX_CELLS];
    for (i, value) in values.iter_mut().enumerate() {
        *value = (((frame[2 * i] as u16) << 8) | frame[2 * i + 1] as u16) & 0x0fff;
    }
    values
}

/// Orders the scanned cells for the wire. 8x8 boards report in scan
/// order; the 4x16 strip is wired column-major from the far end, in
/// two 8-column halves.
fn order_values(rows: i32, cols: i32, values: &[u16; MAX_CELLS]) -> Option<Vec<i32>> {
    if rows == 8 && cols == 8 {
        return Some(values.iter().map(|v| *v as i32).collect());
    }
    if rows == 4 && cols == 16 {
        let mut out = Vec::with_capacity(MAX_CELLS);
        for row in 0..4usize {
            for col in 0..16usize {
                let index = if col < 8 {
                    63 - row - 8 * col
                } else {
                    59 - row - 8 * (col - 8)
                };
                out.push(values[index] as i32);
            }
        }
        return Some(out);
    }
    None
}

struct MatrixShared {
    listeners: ListenerSet,
    osc: Arc<OscServer>,
    data_path: String,
    rows: i32,
    cols: i32,
}

impl MatrixShared {
    fn fan_out(&self, frame: &[u8; BUFSIZE]) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listeners.is_empty() {
            return;
        }

        let values = unpack_frame(frame);
        let Some(ordered) = order_values(self.rows, self.cols, &values) else {
            return;
        };
        let args: Vec<OscType> = ordered.into_iter().map(OscType::Int).collect();

        for endpoint in listeners.iter() {
            if let Err(err) = self.osc.send(endpoint, &self.data_path, args.clone()) {
                warn!("matrix send to {endpoint} failed: {err}");
            }
        }
    }
}

fn reader_loop(shared: Arc<MatrixShared>, file: File, halt: ShutdownToken, device: String) {
    info!("matrix reader loop started");
    let fd = file.as_raw_fd();
    let mut frame = [0u8; BUFSIZE];
    let mut filled = 0usize;

    while !halt.is_halted() {
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, POLL_MS) };
        if n <= 0 {
            continue;
        }
        if pfd.revents & (libc::POLLIN | libc::POLLERR | libc::POLLHUP) == 0 {
            continue;
        }

        let read = unsafe {
            libc::read(
                fd,
                frame[filled..].as_mut_ptr().cast(),
                BUFSIZE - filled,
            )
        };
        if read < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                error!("matrix read error '{device}': {err}");
            }
            continue;
        }

        filled += read as usize;
        if filled < BUFSIZE {
            // short read, wait for the rest of the frame
            continue;
        }

        shared.fan_out(&frame);
        frame = [0u8; BUFSIZE];
        filled = 0;
    }
}

fn build_methods(shared: &Arc<MatrixShared>) -> Vec<MethodDesc> {
    let listen_shared = shared.clone();
    let listen = MethodDesc::new(
        "listen",
        "",
        None,
        "start data transfer",
        Arc::new(move |req: &OscRequest<'_>| {
            let endpoint = endpoint_from_request(req);
            match listener::add_listener(&listen_shared.listeners, "matrix", endpoint) {
                Ok(()) => 0,
                Err(_) => -1,
            }
        }),
    );

    let silence_shared = shared.clone();
    let silence = MethodDesc::new(
        "silence",
        "",
        None,
        "stop data transfer",
        Arc::new(move |req: &OscRequest<'_>| {
            let endpoint = endpoint_from_request(req);
            listener::del_listener(&silence_shared.listeners, "matrix", &endpoint);
            0
        }),
    );

    vec![listen, silence]
}

pub struct MatrixModule {
    device: String,
    rows: i32,
    cols: i32,
    object: Option<Arc<Object>>,
    halt: Option<ShutdownToken>,
    reader: Option<thread::JoinHandle<()>>,
}

impl Default for MatrixModule {
    fn default() -> Self {
        Self {
            device: MATRIX_DEV.to_string(),
            rows: MAX_ROWS,
            cols: MAX_COLS,
            object: None,
            halt: None,
            reader: None,
        }
    }
}

impl Module for MatrixModule {
    fn set_param(&mut self, name: &str, value: &str) -> Result<(), ParamError> {
        match name {
            "device" => params::set_copystring(&mut self.device, value, 36),
            "rows" => params::set_i32(&mut self.rows, value),
            "cols" => params::set_i32(&mut self.cols, value),
            other => Err(ParamError::Unknown(other.to_string())),
        }
    }

    fn init(&mut self, platform: &Platform, ctx: &ModuleCtx) -> Result<(), ModuleError> {
        let object = Object::new(&ctx.name, &ctx.description);
        platform.namespace.register_object(&object, &ctx.class);

        info!("opening matrix device: {}", self.device);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&self.device)
            .map_err(|source| {
                platform.namespace.deregister_object(&object);
                ModuleError::Device {
                    device: self.device.clone(),
                    source,
                }
            })?;

        let shared = Arc::new(MatrixShared {
            listeners: ListenerSet::default(),
            osc: platform.osc.clone(),
            data_path: format!("{}/data", object.path()),
            rows: self.rows,
            cols: self.cols,
        });
        platform.osc.add_methods(&object, build_methods(&shared))?;

        let halt = ShutdownToken::new();
        let loop_halt = halt.clone();
        let device = self.device.clone();
        let reader = match thread::Builder::new()
            .name("sios-matrix".into())
            .spawn(move || reader_loop(shared, file, loop_halt, device))
        {
            Ok(handle) => handle,
            Err(err) => {
                platform.osc.remove_object_methods(&object);
                platform.namespace.deregister_object(&object);
                return Err(ModuleError::Failed(format!(
                    "cannot start matrix reader: {err}"
                )));
            }
        };

        self.object = Some(object);
        self.halt = Some(halt);
        self.reader = Some(reader);
        Ok(())
    }

    fn exit(&mut self, platform: &Platform) {
        if let Some(halt) = self.halt.take() {
            halt.halt();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
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

    #[test]
    fn unpack_masks_to_twelve_bits() {
        let mut frame = [0u8; BUFSIZE];
        frame[0] = 0xff;
        frame[1] = 0xff;
        frame[2] = 0x01;
        frame[3] = 0x23;
        let values = unpack_frame(&frame);
        assert_eq!(values[0], 0x0fff);
        assert_eq!(values[1], 0x0123);
        assert_eq!(values[63], 0);
    }

    #[test]
    fn square_board_keeps_scan_order() {
        let mut values = [0u16; MAX_CELLS];
        for (i, v) in values.iter_mut().enumerate() {
            *v = i as u16;
        }
        let ordered = order_values(8, 8, &values).unwrap();
        assert_eq!(ordered[0], 0);
        assert_eq!(ordered[63], 63);
    }

    #[test]
    fn strip_board_remaps_column_major() {
        let mut values = [0u16; MAX_CELLS];
        for (i, v) in values.iter_mut().enumerate() {
            *v = i as u16;
        }
        let ordered = order_values(4, 16, &values).unwrap();
        // first output row walks the high end of each scan column
        assert_eq!(ordered[0], 63);
        assert_eq!(ordered[1], 55);
        assert_eq!(ordered[7], 7);
        assert_eq!(ordered[8], 59);
        assert_eq!(ordered[15], 3);
        // last cell of the last row
        assert_eq!(ordered[63], 0);
        // every cell appears exactly once
        let mut seen = ordered.clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..64).collect::<Vec<i32>>());
    }

    #[test]
    fn unsupported_layouts_stay_silent() {
        let values = [0u16; MAX_CELLS];
        assert!(order_values(2, 32, &values).is_none());
    }
}
