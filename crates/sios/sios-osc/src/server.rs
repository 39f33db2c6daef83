use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use rosc::{OscMessage, OscPacket, OscType};
use tracing::{debug, info, warn};

use sios_core::ShutdownToken;

use crate::endpoint::Endpoint;
use crate::listener;
use crate::method::{type_tag, typespec_matches, MethodDesc, OscRequest};
use crate::object::Object;

const RECV_POLL: Duration = Duration::from_millis(10);

/// Upper bound on one framed TCP packet; anything larger is a broken
/// peer.
const MAX_TCP_FRAME: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed binding {proto} port {port}")]
    Bind {
        proto: &'static str,
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("a method is already registered at '{0}'")]
    DuplicatePath(String),

    #[error("object has no path yet (register it with its class first)")]
    UnregisteredObject,

    #[error("osc encode failed: {0:?}")]
    Encode(rosc::OscError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Clone)]
struct Registered {
    object: Arc<Object>,
    desc: Arc<MethodDesc>,
}

/// The OSC front-end: inbound UDP/TCP servers sharing one port, the
/// absolute-path dispatch table, and the outbound socket used for all
/// sends to listeners.
pub struct OscServer {
    port: u16,
    methods: Mutex<HashMap<String, Registered>>,
    out_sock: UdpSocket,
    shutdown: ShutdownToken,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl OscServer {
    /// Binds the configured servers and starts one receive thread per
    /// protocol. With `port` 0 an ephemeral UDP port is chosen (tests).
    pub fn bind(
        port: u16,
        do_udp: bool,
        do_tcp: bool,
        shutdown: ShutdownToken,
    ) -> Result<Arc<OscServer>, ServerError> {
        let out_sock = UdpSocket::bind(("0.0.0.0", 0))?;

        let udp_sock = if do_udp {
            let sock = UdpSocket::bind(("0.0.0.0", port)).map_err(|source| ServerError::Bind {
                proto: "udp",
                port,
                source,
            })?;
            sock.set_read_timeout(Some(RECV_POLL))?;
            Some(sock)
        } else {
            None
        };

        let bound_port = match &udp_sock {
            Some(sock) => sock.local_addr()?.port(),
            None => port,
        };

        let tcp_listener = if do_tcp {
            let listener =
                TcpListener::bind(("0.0.0.0", bound_port)).map_err(|source| ServerError::Bind {
                    proto: "tcp",
                    port: bound_port,
                    source,
                })?;
            listener.set_nonblocking(true)?;
            Some(listener)
        } else {
            None
        };

        let server = Arc::new(OscServer {
            port: bound_port,
            methods: Mutex::new(HashMap::new()),
            out_sock,
            shutdown,
            threads: Mutex::new(Vec::new()),
        });

        if let Some(sock) = udp_sock {
            let srv = server.clone();
            let handle = thread::Builder::new()
                .name("sios-osc-udp".into())
                .spawn(move || udp_loop(srv, sock))?;
            lock(&server.threads).push(handle);
        }

        if let Some(listener) = tcp_listener {
            let srv = server.clone();
            let handle = thread::Builder::new()
                .name("sios-osc-tcp".into())
                .spawn(move || tcp_loop(srv, listener))?;
            lock(&server.threads).push(handle);
        }

        Ok(server)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Joins the receive threads. Call after the shutdown token fired.
    pub fn join(&self) {
        let handles: Vec<_> = lock(&self.threads).drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }

    /// Registers a method under `<object-path>/<addr>`.
    pub fn add_method(&self, object: &Arc<Object>, desc: MethodDesc) -> Result<(), ServerError> {
        let path = self.desc_path(object, &desc.addr)?;
        let desc = Arc::new(desc);
        self.insert(path, object, &desc)?;
        object.record_method(desc);
        Ok(())
    }

    /// Registers a batch; individual failures are logged and the rest
    /// still go in.
    pub fn add_methods(
        &self,
        object: &Arc<Object>,
        descs: Vec<MethodDesc>,
    ) -> Result<(), ServerError> {
        for desc in descs {
            if let Err(err) = self.add_method(object, desc) {
                warn!(object = object.name(), %err, "method registration failed");
            }
        }
        Ok(())
    }

    /// Parameters register like methods but are always addressed by
    /// name and tracked on the object's parameter list.
    pub fn add_param(&self, object: &Arc<Object>, desc: MethodDesc) -> Result<(), ServerError> {
        let path = self.desc_path(object, &desc.name)?;
        let desc = Arc::new(desc);
        self.insert(path, object, &desc)?;
        object.record_param(desc);
        Ok(())
    }

    /// Installs the generic `listen`/`silence` pair on an object,
    /// wiring the object's own listener set.
    pub fn add_listener_handlers(&self, object: &Arc<Object>) -> Result<(), ServerError> {
        let listen_obj = object.clone();
        let listen = MethodDesc::new(
            "listen",
            "",
            None,
            "start data transfer",
            Arc::new(move |req: &OscRequest<'_>| {
                let endpoint = endpoint_from_request(req);
                match listener::add_listener(&listen_obj.listeners, listen_obj.name(), endpoint) {
                    Ok(()) => 0,
                    Err(_) => -1,
                }
            }),
        );

        let silence_obj = object.clone();
        let silence = MethodDesc::new(
            "silence",
            "",
            None,
            "stop data transfer",
            Arc::new(move |req: &OscRequest<'_>| {
                let endpoint = endpoint_from_request(req);
                listener::del_listener(&silence_obj.listeners, silence_obj.name(), &endpoint);
                0
            }),
        );

        self.add_method(object, listen)?;
        self.add_method(object, silence)?;
        Ok(())
    }

    /// Removes every path registered for this object and forgets its
    /// descriptors, reversing registration.
    pub fn remove_object_methods(&self, object: &Arc<Object>) {
        lock(&self.methods).retain(|_, reg| !Arc::ptr_eq(&reg.object, object));
        object.clear_descriptors();
    }

    fn desc_path(&self, object: &Arc<Object>, addr: &str) -> Result<String, ServerError> {
        let base = object.path();
        if base.is_empty() {
            return Err(ServerError::UnregisteredObject);
        }
        Ok(format!("{base}/{addr}"))
    }

    fn insert(
        &self,
        path: String,
        object: &Arc<Object>,
        desc: &Arc<MethodDesc>,
    ) -> Result<(), ServerError> {
        debug!("method path: {path}");
        let mut methods = lock(&self.methods);
        if methods.contains_key(&path) {
            return Err(ServerError::DuplicatePath(path));
        }
        methods.insert(
            path,
            Registered {
                object: object.clone(),
                desc: desc.clone(),
            },
        );
        Ok(())
    }

    /// Routes one decoded packet. Bundles dispatch element-wise; a
    /// message goes to the method whose absolute path equals its
    /// address.
    pub fn dispatch_packet(&self, packet: OscPacket, source: SocketAddr) {
        match packet {
            OscPacket::Message(msg) => self.dispatch_message(msg, source),
            OscPacket::Bundle(bundle) => {
                for packet in bundle.content {
                    self.dispatch_packet(packet, source);
                }
            }
        }
    }

    fn dispatch_message(&self, msg: OscMessage, source: SocketAddr) {
        let Some(registered) = lock(&self.methods).get(&msg.addr).cloned() else {
            debug!(addr = %msg.addr, "no method registered");
            return;
        };

        if !typespec_matches(registered.desc.typespec.as_deref(), &msg.args) {
            let tags: String = msg.args.iter().map(type_tag).collect();
            warn!(
                addr = %msg.addr,
                got = %tags,
                want = registered.desc.typespec.as_deref().unwrap_or(""),
                "typespec mismatch, message dropped"
            );
            return;
        }

        let request = OscRequest {
            path: &msg.addr,
            args: &msg.args,
            source,
        };
        let status = (registered.desc.handler)(&request);
        if status != 0 {
            debug!(addr = %msg.addr, status, "handler reported failure");
        }
    }

    /// Encodes and sends one message to one endpoint over the shared
    /// outbound socket.
    pub fn send(&self, endpoint: &Endpoint, path: &str, args: Vec<OscType>) -> Result<(), ServerError> {
        let addr = endpoint.socket_addr()?;
        let buf = rosc::encoder::encode(&OscPacket::Message(OscMessage {
            addr: path.to_string(),
            args,
        }))
        .map_err(ServerError::Encode)?;
        self.out_sock.send_to(&buf, addr)?;
        Ok(())
    }

    /// Fans one pre-built message out to every listener of an object,
    /// under the object's listener lock. Send failures are logged and
    /// do not affect the module.
    pub fn broadcast(&self, object: &Object, path: &str, args: Vec<OscType>) {
        let buf = match rosc::encoder::encode(&OscPacket::Message(OscMessage {
            addr: path.to_string(),
            args,
        })) {
            Ok(buf) => buf,
            Err(err) => {
                warn!(path, "osc encode failed: {err:?}");
                return;
            }
        };

        let listeners = object
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for endpoint in listeners.iter() {
            if let Err(err) = self.send_raw(endpoint, &buf) {
                debug!(%endpoint, %err, "listener send failed");
            }
        }
    }

    pub(crate) fn send_raw(&self, endpoint: &Endpoint, buf: &[u8]) -> io::Result<()> {
        let addr = endpoint.socket_addr()?;
        self.out_sock.send_to(buf, addr)?;
        Ok(())
    }
}

/// Endpoint named by a request: explicit `(host, port)` arguments when
/// present (`(s,s)` or `(s,i)`), the sender otherwise.
pub fn endpoint_from_request(req: &OscRequest<'_>) -> Endpoint {
    if req.args.len() >= 2 {
        if let OscType::String(host) = &req.args[0] {
            match &req.args[1] {
                OscType::String(port) => return Endpoint::new(host.clone(), port.clone()),
                OscType::Int(port) => return Endpoint::new(host.clone(), port.to_string()),
                _ => {}
            }
        }
    }
    Endpoint::from_addr(req.source)
}

fn udp_loop(server: Arc<OscServer>, sock: UdpSocket) {
    info!(port = server.port, "osc udp server listening");
    let mut buf = [0u8; rosc::decoder::MTU];
    while !server.shutdown.is_halted() {
        match sock.recv_from(&mut buf) {
            Ok((len, source)) => match rosc::decoder::decode_udp(&buf[..len]) {
                Ok((_, packet)) => server.dispatch_packet(packet, source),
                Err(err) => warn!(%source, "dropping undecodable packet: {err:?}"),
            },
            Err(err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(%err, "udp receive failed");
                thread::sleep(RECV_POLL);
            }
        }
    }
}

struct TcpConn {
    stream: TcpStream,
    peer: SocketAddr,
    buf: Vec<u8>,
}

impl TcpConn {
    /// Reads whatever is pending and dispatches complete int32-framed
    /// packets (OSC 1.0 stream framing). False drops the connection.
    fn pump(&mut self, server: &OscServer) -> bool {
        let mut chunk = [0u8; 2048];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(peer = %self.peer, %err, "tcp read failed");
                    return false;
                }
            }
        }

        while self.buf.len() >= 4 {
            let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if len == 0 {
                self.buf.drain(..4);
                continue;
            }
            if len > MAX_TCP_FRAME {
                warn!(peer = %self.peer, len, "oversized tcp frame, dropping connection");
                return false;
            }
            if self.buf.len() < 4 + len {
                break;
            }
            let frame: Vec<u8> = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            match rosc::decoder::decode_udp(&frame) {
                Ok((_, packet)) => server.dispatch_packet(packet, self.peer),
                Err(err) => warn!(peer = %self.peer, "dropping undecodable packet: {err:?}"),
            }
        }
        true
    }
}

fn tcp_loop(server: Arc<OscServer>, listener: TcpListener) {
    info!(port = server.port, "osc tcp server listening");
    let mut conns: Vec<TcpConn> = Vec::new();
    while !server.shutdown.is_halted() {
        match listener.accept() {
            Ok((stream, peer)) => {
                if stream.set_nonblocking(true).is_ok() {
                    conns.push(TcpConn {
                        stream,
                        peer,
                        buf: Vec::new(),
                    });
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(%err, "tcp accept failed"),
        }

        conns.retain_mut(|conn| conn.pump(&server));
        thread::sleep(RECV_POLL);
    }
}
