// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Two in-process endpoints over a loopback transport, exchanging one
// tiny message. Exercises connect -> isend -> irecv -> wait end to end.
//
// Usage: demo_send_recv

use std::time::{Duration, Instant};

use open_mx_core::config::Config;
use open_mx_core::transport::LoopbackTransport;
use open_mx_core::Endpoint;

fn main() {
    env_logger::init();

    let mut mesh = LoopbackTransport::mesh(2);
    let recv_transport = mesh.pop().unwrap();
    let send_transport = mesh.pop().unwrap();

    let mut sender = Endpoint::open(Config::default(), send_transport, 0);
    let mut receiver = Endpoint::open(Config::default(), recv_transport, 0);

    let connect_req = sender.connect(1).expect("send connect");
    let deadline = Instant::now() + Duration::from_secs(1);
    while !sender.test(connect_req) && Instant::now() < deadline {
        receiver.progress(Instant::now());
        sender.progress(Instant::now());
    }
    println!("connected");

    let recv_req = receiver.irecv(64, 0xC0FFEE, u64::MAX, 0);
    let send_req = sender
        .isend(1, b"hello from open-mx-core".to_vec(), 0, 0xC0FFEE, 0)
        .expect("isend");

    let deadline = Instant::now() + Duration::from_secs(1);
    while (!sender.test(send_req) || !receiver.test(recv_req)) && Instant::now() < deadline {
        receiver.progress(Instant::now());
        sender.progress(Instant::now());
    }

    let outcome = receiver.outcome(recv_req).expect("recv outcome");
    let body = receiver.recv_buffer(recv_req).expect("recv buffer");
    println!(
        "received {} bytes, status {:?}: {:?}",
        outcome.xfer_length,
        outcome.status,
        String::from_utf8_lossy(body)
    );
}
