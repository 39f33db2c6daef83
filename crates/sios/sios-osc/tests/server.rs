//! End-to-end front-end tests over real UDP sockets: method dispatch,
//! listen/silence bookkeeping and listener fan-out.

use std::net::UdpSocket;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rosc::{OscMessage, OscPacket, OscType};
use sios_core::ShutdownToken;
use sios_osc::{MethodDesc, Namespace, Object, OscServer};

fn wait_for(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not reached within 2s");
}

fn send_msg(sock: &UdpSocket, port: u16, addr: &str, args: Vec<OscType>) {
    let buf = rosc::encoder::encode(&OscPacket::Message(OscMessage {
        addr: addr.to_string(),
        args,
    }))
    .unwrap();
    sock.send_to(&buf, ("127.0.0.1", port)).unwrap();
}

struct Fixture {
    server: Arc<OscServer>,
    object: Arc<Object>,
    shutdown: ShutdownToken,
}

impl Fixture {
    fn new() -> Fixture {
        let shutdown = ShutdownToken::new();
        let server = OscServer::bind(0, true, false, shutdown.clone()).unwrap();

        let namespace = Namespace::new("/sios");
        let class = namespace.register_class("sensors").unwrap();
        let object = Object::new("dummy", "test sensor");
        namespace.register_object(&object, &class);

        Fixture {
            server,
            object,
            shutdown,
        }
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.halt();
        self.server.join();
    }
}

#[test]
fn inbound_message_dispatches_to_the_registered_method() {
    let fx = Fixture::new();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    fx.server
        .add_method(
            &fx.object,
            MethodDesc::new(
                "ping",
                "",
                Some("i"),
                "count pings",
                Arc::new(move |req| {
                    assert_eq!(req.args.len(), 1);
                    counter.fetch_add(1, Ordering::SeqCst);
                    0
                }),
            ),
        )
        .unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_msg(
        &client,
        fx.server.port(),
        "/sios/sensors/dummy/ping",
        vec![OscType::Int(7)],
    );
    wait_for(|| calls.load(Ordering::SeqCst) == 1);

    // typespec mismatch is dropped
    send_msg(
        &client,
        fx.server.port(),
        "/sios/sensors/dummy/ping",
        vec![OscType::Float(1.0)],
    );
    // unknown address is ignored
    send_msg(&client, fx.server.port(), "/sios/sensors/dummy/nope", vec![]);
    send_msg(
        &client,
        fx.server.port(),
        "/sios/sensors/dummy/ping",
        vec![OscType::Int(8)],
    );
    wait_for(|| calls.load(Ordering::SeqCst) == 2);
}

#[test]
fn listen_silence_track_the_sender() {
    let fx = Fixture::new();
    fx.server.add_listener_handlers(&fx.object).unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    let listen_path = "/sios/sensors/dummy/listen";
    let silence_path = "/sios/sensors/dummy/silence";

    send_msg(&client, fx.server.port(), listen_path, vec![]);
    wait_for(|| fx.object.listeners.lock().unwrap().len() == 1);

    // the duplicate is refused, the set stays at one
    send_msg(&client, fx.server.port(), listen_path, vec![]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(fx.object.listeners.lock().unwrap().len(), 1);

    send_msg(&client, fx.server.port(), silence_path, vec![]);
    wait_for(|| fx.object.listeners.lock().unwrap().is_empty());
}

#[test]
fn explicit_endpoint_receives_the_broadcast() {
    let fx = Fixture::new();
    fx.server.add_listener_handlers(&fx.object).unwrap();

    let sink = UdpSocket::bind("127.0.0.1:0").unwrap();
    sink.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let sink_port = sink.local_addr().unwrap().port();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    send_msg(
        &client,
        fx.server.port(),
        "/sios/sensors/dummy/listen",
        vec![
            OscType::String("127.0.0.1".to_string()),
            OscType::Int(sink_port as i32),
        ],
    );
    wait_for(|| fx.object.listeners.lock().unwrap().len() == 1);

    fx.server.broadcast(
        &fx.object,
        "/sios/sensors/dummy/data",
        vec![OscType::Int(1), OscType::Int(2), OscType::Int(3)],
    );

    let mut buf = [0u8; 1536];
    let (len, _) = sink.recv_from(&mut buf).unwrap();
    let (_, packet) = rosc::decoder::decode_udp(&buf[..len]).unwrap();
    match packet {
        OscPacket::Message(msg) => {
            assert_eq!(msg.addr, "/sios/sensors/dummy/data");
            assert_eq!(
                msg.args,
                vec![OscType::Int(1), OscType::Int(2), OscType::Int(3)]
            );
        }
        other => panic!("unexpected packet {other:?}"),
    }
}
