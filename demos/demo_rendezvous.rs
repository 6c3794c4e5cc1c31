// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Drives a large (rendezvous-strategy) transfer across the pull engine
// end to end over a loopback transport, printing block/frame progress.
//
// Usage: demo_rendezvous [length-bytes]

use std::time::{Duration, Instant};

use open_mx_core::config::Config;
use open_mx_core::transport::LoopbackTransport;
use open_mx_core::Endpoint;

fn main() {
    env_logger::init();

    let length: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(2_000_000);

    let mut mesh = LoopbackTransport::mesh(2);
    let recv_transport = mesh.pop().unwrap();
    let send_transport = mesh.pop().unwrap();

    let mut sender = Endpoint::open(Config::default(), send_transport, 0);
    let mut receiver = Endpoint::open(Config::default(), recv_transport, 0);

    let payload = vec![0x5Au8; length];
    let recv_req = receiver.irecv(length as u32, 0xBEEF, u64::MAX, 0);
    let send_req = sender
        .isend(1, payload, 0, 0xBEEF, 0)
        .expect("isend rendezvous");

    let start = Instant::now();
    let deadline = start + Duration::from_secs(30);
    let mut ticks = 0u64;
    while (!sender.test(send_req) || !receiver.test(recv_req)) && Instant::now() < deadline {
        let now = Instant::now();
        receiver.progress(now);
        sender.progress(now);
        ticks += 1;
        if ticks % 1000 == 0 {
            println!("{ticks} progress ticks elapsed");
        }
    }

    if !receiver.test(recv_req) {
        eprintln!("rendezvous transfer did not complete within deadline");
        std::process::exit(1);
    }

    let outcome = receiver.outcome(recv_req).expect("recv outcome");
    let body = receiver.recv_buffer(recv_req).expect("recv buffer");
    let bytes_ok = body.iter().all(|&b| b == 0x5A);
    println!(
        "transferred {} of {length} bytes in {:?} over {ticks} ticks, status {:?}, bytes_ok={bytes_ok}",
        outcome.xfer_length,
        start.elapsed(),
        outcome.status
    );
}
