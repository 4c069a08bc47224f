#[allow(dead_code)]
mod common;

use kestrel::{Channel, Client, Config, Server};

use common::{wait_until, EventLog};

#[test]
fn loopback_echo() {
    common::init_tracing();

    let config = Config {
        receive_timeout_ms: 50,
        ..Default::default()
    };

    let server = Server::new(config.clone()).unwrap();
    server.on_receive(|peer, data, channel| {
        let _ = peer.send(channel, data);
    });
    server.listen("127.0.0.1:0").unwrap();

    let server_addr = server.local_addr().unwrap();

    let client = Client::new(config).unwrap();
    let connected = EventLog::new();
    {
        let connected = connected.clone();
        client.on_connect(move |_, _| connected.push(()));
    }
    let echoes = EventLog::new();
    {
        let echoes = echoes.clone();
        client.on_receive(move |_, data, channel| echoes.push((data.to_vec(), channel)));
    }

    let peer = client.connect(server_addr, b"").unwrap();
    assert!(wait_until(3000, || connected.len() == 1));

    assert_ne!(client.local_addr().unwrap().port(), 0);

    for i in 0..10u8 {
        peer.send_reliable_ordered(&[b'o', i]).unwrap();
    }

    assert!(wait_until(3000, || echoes.len() == 10));

    let expected = (0..10u8)
        .map(|i| (vec![b'o', i], Channel::ReliableOrdered))
        .collect::<Vec<_>>();
    assert_eq!(echoes.snapshot(), expected);

    peer.send_reliable(b"r").unwrap();
    assert!(wait_until(3000, || echoes.len() == 11));
    assert_eq!(echoes.snapshot()[10], (b"r".to_vec(), Channel::Reliable));

    assert!(server.stats().snapshot().received_bytes > 0);
    assert!(client.stats().snapshot().sent_bytes > 0);

    client.disconnect(b"").unwrap();
    assert!(wait_until(2000, || server.connection_count() == 0));
}
