#[allow(dead_code)]
mod common;

use std::net::SocketAddr;
use std::thread;
use std::time;

use kestrel::frame::Descriptor;
use kestrel::{Client, Config, Server, State};

use common::{wait_until, CLIENT_ADDR, SERVER_ADDR, EventLog, MemoryNet};

#[test]
fn duplicate_connect_accepted_once() {
    common::init_tracing();

    let net = MemoryNet::new();
    let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
    let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();

    // Each CONNECT from the client arrives three times
    net.set_filter(move |d| {
        if d.from == client_addr && d.packet().descriptor.contains(Descriptor::CONNECT) {
            vec![d.clone(), d.clone(), d]
        } else {
            vec![d]
        }
    });

    let server = Server::new(Config {
        listener_count: 2,
        ..common::test_config()
    })
    .unwrap();

    let server_connects = EventLog::new();
    {
        let server_connects = server_connects.clone();
        server.on_connect(move |peer, payload| server_connects.push((peer.addr(), payload.to_vec())));
    }
    server.start(net.endpoint(SERVER_ADDR)).unwrap();

    let client = Client::new(common::test_config()).unwrap();
    let client_connects = EventLog::new();
    {
        let client_connects = client_connects.clone();
        client.on_connect(move |peer, payload| client_connects.push((peer.addr(), payload.to_vec())));
    }
    client
        .connect_with(net.endpoint(CLIENT_ADDR), server_addr, b"hello")
        .unwrap();

    assert!(wait_until(2000, || client_connects.len() == 1));
    thread::sleep(time::Duration::from_millis(200));

    assert_eq!(server_connects.snapshot(), vec![(client_addr, b"hello".to_vec())]);
    assert_eq!(client_connects.snapshot(), vec![(server_addr, Vec::new())]);

    assert_eq!(server.connection_count(), 1);
    assert_eq!(server.stats().snapshot().connects, 1);
    assert_eq!(client.stats().snapshot().connects, 1);

    let peer = server.peer(&client_addr).unwrap();
    assert_eq!(peer.state(), State::Connected);
    assert_eq!(client.server().unwrap().state(), State::Connected);
}

#[test]
fn validation_denies_connect() {
    common::init_tracing();

    let net = MemoryNet::new();
    let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();

    let server = Server::new(common::test_config()).unwrap();
    server.on_validate(|_, payload| payload == b"secret");

    let server_connects = EventLog::new();
    {
        let server_connects = server_connects.clone();
        server.on_connect(move |_, _| server_connects.push(()));
    }
    server.start(net.endpoint(SERVER_ADDR)).unwrap();

    let client = Client::new(common::test_config()).unwrap();
    let client_events = EventLog::new();
    {
        let client_events = client_events.clone();
        client.on_connect(move |_, _| client_events.push("connect"));
    }
    {
        let client_events = client_events.clone();
        client.on_timeout(move |_| client_events.push("timeout"));
    }
    {
        let client_events = client_events.clone();
        client.on_disconnect(move |_, _| client_events.push("disconnect"));
    }

    client
        .connect_with(net.endpoint(CLIENT_ADDR), server_addr, b"guess")
        .unwrap();

    assert!(wait_until(3000, || client_events.len() == 2));
    assert_eq!(client_events.snapshot(), vec!["timeout", "disconnect"]);

    assert!(wait_until(1000, || !client.is_running()));

    assert_eq!(server_connects.len(), 0);
    assert_eq!(server.connection_count(), 0);
    assert!(server.stats().snapshot().denied_connects >= 1);
}

#[test]
fn validation_accepts_connect() {
    common::init_tracing();

    let net = MemoryNet::new();
    let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();
    let server_addr: SocketAddr = SERVER_ADDR.parse().unwrap();

    let server = Server::new(common::test_config()).unwrap();
    server.on_validate(|_, payload| payload == b"secret");
    server.on_connect(|peer, _| peer.set("greeting", String::from("welcome")));
    server.start(net.endpoint(SERVER_ADDR)).unwrap();

    let client = Client::new(common::test_config()).unwrap();
    let connected = EventLog::new();
    {
        let connected = connected.clone();
        client.on_connect(move |_, _| connected.push(()));
    }

    client
        .connect_with(net.endpoint(CLIENT_ADDR), server_addr, b"secret")
        .unwrap();

    assert!(wait_until(2000, || connected.len() == 1));

    // The server's connect callback may still be running when the client sees the reply
    assert!(wait_until(1000, || server
        .peer(&client_addr)
        .map_or(false, |peer| peer.get::<String>("greeting").is_some())));

    let peer = server.peer(&client_addr).unwrap();
    assert_eq!(
        peer.get::<String>("greeting").as_deref().map(String::as_str),
        Some("welcome")
    );
    assert_eq!(server.stats().snapshot().denied_connects, 0);
}

#[test]
fn client_refuses_inbound_connect() {
    common::init_tracing();

    let net = MemoryNet::new();
    let client_addr: SocketAddr = CLIENT_ADDR.parse().unwrap();

    // A client host with no validation callback never accepts
    let a = Client::new(common::test_config()).unwrap();
    let b = Client::new(common::test_config()).unwrap();

    let b_transport = net.endpoint(CLIENT_ADDR);
    b.host().start(b_transport).unwrap();

    a.connect_with(net.endpoint(SERVER_ADDR), client_addr, b"")
        .unwrap();

    assert!(wait_until(3000, || !a.is_running()));

    assert_eq!(b.host().connection_count(), 0);
    assert!(b.stats().snapshot().denied_connects >= 1);
}
