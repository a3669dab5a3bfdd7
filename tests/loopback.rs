//! End-to-end loopback test: a client and server session, wired over a real
//! (or soft-RoCE) RDMA device reachable at `127.0.0.1`.
//!
//! Requires an RDMA-capable NIC, so it does not run in ordinary CI. Bring up
//! `rdma_rxe` against a loopback interface (or point `dev`/`gid` at a real
//! card) before running with `cargo test --test loopback -- --ignored`.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use rdma_fabric::fabric::{ClientSession, Config, ServerSession};

fn scenario_config(port: u16) -> Config {
    Config {
        port,
        ioengine_num: 1,
        cq_num: 1,
        host_num: 1,
        ..Config::default()
    }
}

#[test]
#[ignore = "requires an RDMA-capable NIC reachable at 127.0.0.1"]
fn single_call_round_trips() {
    let port = 19527;
    let server_cfg = scenario_config(port);
    let client_cfg = scenario_config(port);

    let mut server = ServerSession::init(
        server_cfg,
        Arc::new(|_ctx: u64, req: &[u8]| {
            assert_eq!(req, b"SOMETHING");
            b"HELLOWORLD".to_vec()
        }),
    )
    .expect("server init");
    server
        .start(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .expect("server start");

    let mut client = ClientSession::init(client_cfg).expect("client init");
    client
        .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .expect("client connect");
    client.start();

    let (tx, rx) = mpsc::channel();
    let engine = client.get_engine(0);
    engine.send(
        Ipv4Addr::LOCALHOST,
        42,
        b"SOMETHING".to_vec(),
        Box::new(move |ctx, payload| {
            tx.send((ctx, payload.to_vec())).unwrap();
        }),
    );

    let (ctx, payload) = rx.recv_timeout(Duration::from_secs(5)).expect("reply");
    assert_eq!(ctx, 42);
    assert_eq!(&payload, b"HELLOWORLD");
}

#[test]
#[ignore = "requires an RDMA-capable NIC reachable at 127.0.0.1"]
fn forty_sequential_calls_all_complete() {
    let port = 19528;
    let server_cfg = scenario_config(port);
    let client_cfg = scenario_config(port);

    let mut server = ServerSession::init(
        server_cfg,
        Arc::new(|ctx: u64, _req: &[u8]| ctx.to_le_bytes().to_vec()),
    )
    .expect("server init");
    server
        .start(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .expect("server start");

    let mut client = ClientSession::init(client_cfg).expect("client init");
    client
        .connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .expect("client connect");
    client.start();

    let (tx, rx) = mpsc::channel();
    let engine = client.get_engine(0);
    for i in 0..40u64 {
        let tx = tx.clone();
        engine.send(
            Ipv4Addr::LOCALHOST,
            i,
            b"SOMETHING".to_vec(),
            Box::new(move |ctx, _payload| {
                tx.send(ctx).unwrap();
            }),
        );
    }

    let mut seen: Vec<u64> = (0..40)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("reply"))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..40).collect::<Vec<_>>());
}
