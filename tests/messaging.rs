// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end tests against the public Endpoint API, covering scenarios
// the per-module unit tests don't: small-strategy sends, per-partner FIFO
// ordering across several in-flight sends, and probe-then-irecv ordering.

use std::time::{Duration, Instant};

use open_mx_core::config::Config;
use open_mx_core::transport::LoopbackTransport;
use open_mx_core::Endpoint;

fn connected_pair() -> (Endpoint<LoopbackTransport>, Endpoint<LoopbackTransport>) {
    let mut mesh = LoopbackTransport::mesh(2);
    let b_t = mesh.pop().unwrap();
    let a_t = mesh.pop().unwrap();
    let mut a = Endpoint::open(Config::default(), a_t, 0);
    let mut b = Endpoint::open(Config::default(), b_t, 0);

    let creq = a.connect(1).unwrap();
    let deadline = Instant::now() + Duration::from_secs(1);
    while !a.test(creq) && Instant::now() < deadline {
        let now = Instant::now();
        b.progress(now);
        a.progress(now);
    }
    assert!(a.test(creq), "connect handshake never completed");
    (a, b)
}

fn drive_until<F>(a: &mut Endpoint<LoopbackTransport>, b: &mut Endpoint<LoopbackTransport>, mut done: F)
where
    F: FnMut(&Endpoint<LoopbackTransport>, &Endpoint<LoopbackTransport>) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done(a, b) && Instant::now() < deadline {
        let now = Instant::now();
        a.progress(now);
        b.progress(now);
    }
}

#[test]
fn small_message_round_trips() {
    let (mut a, mut b) = connected_pair();
    let payload = vec![0x11u8; 100]; // above tiny_max, within small_max
    let rreq = b.irecv(256, 1, u64::MAX, 0);
    let sreq = a.isend(1, payload.clone(), 0, 1, 0).unwrap();

    drive_until(&mut a, &mut b, |a, b| a.test(sreq) && b.test(rreq));

    assert!(a.test(sreq));
    assert!(b.test(rreq));
    assert_eq!(b.outcome(rreq).unwrap().xfer_length, payload.len() as u32);
    assert_eq!(b.recv_buffer(rreq).unwrap(), payload.as_slice());
}

#[test]
fn truncation_caps_delivered_length() {
    let (mut a, mut b) = connected_pair();
    let rreq = b.irecv(8, 2, u64::MAX, 0); // buffer smaller than message
    let sreq = a.isend(1, vec![0x22u8; 40], 0, 2, 0).unwrap();

    drive_until(&mut a, &mut b, |a, b| a.test(sreq) && b.test(rreq));

    let outcome = b.outcome(rreq).unwrap();
    assert_eq!(outcome.xfer_length, 8);
    assert_eq!(outcome.msg_length, 40);
    assert_eq!(b.recv_buffer(rreq).unwrap(), &[0x22u8; 8]);
}

#[test]
fn three_sends_are_matched_in_fifo_order() {
    let (mut a, mut b) = connected_pair();

    let s1 = a.isend(1, b"first".to_vec(), 0, 100, 0).unwrap();
    let s2 = a.isend(1, b"second".to_vec(), 0, 100, 0).unwrap();
    let s3 = a.isend(1, b"third".to_vec(), 0, 100, 0).unwrap();

    drive_until(&mut a, &mut b, |a, _| a.test(s1) && a.test(s2) && a.test(s3));

    // All three land as unexpected (no posted receive yet); irecv then
    // drains them oldest-first, matching per-partner FIFO order.
    let r1 = b.irecv(64, 100, u64::MAX, 0);
    let r2 = b.irecv(64, 100, u64::MAX, 0);
    let r3 = b.irecv(64, 100, u64::MAX, 0);

    assert!(b.test(r1) && b.test(r2) && b.test(r3));
    assert_eq!(b.recv_buffer(r1).unwrap(), b"first");
    assert_eq!(b.recv_buffer(r2).unwrap(), b"second");
    assert_eq!(b.recv_buffer(r3).unwrap(), b"third");
}

#[test]
fn probe_sees_unexpected_without_consuming_it() {
    let (mut a, mut b) = connected_pair();
    a.isend(1, b"peekaboo".to_vec(), 0, 55, 0).unwrap();
    drive_until(&mut a, &mut b, |_, b| b.probe(55, u64::MAX).is_some());

    assert!(b.probe(55, u64::MAX).is_some());
    assert!(b.probe(55, u64::MAX).is_some(), "probe must not consume");

    let rreq = b.irecv(64, 55, u64::MAX, 0);
    assert!(b.test(rreq));
    assert!(b.probe(55, u64::MAX).is_none(), "irecv must consume");
}

#[test]
fn cancel_unmatched_receive_then_later_send_goes_unexpected() {
    let (mut a, mut b) = connected_pair();
    let rreq = b.irecv(64, 9, u64::MAX, 0);
    assert!(b.cancel(rreq));
    assert!(b.test(rreq));

    let sreq = a.isend(1, b"late".to_vec(), 0, 9, 0).unwrap();
    drive_until(&mut a, &mut b, |a, _| a.test(sreq));
    assert!(a.test(sreq));
    assert!(b.probe(9, u64::MAX).is_some(), "message should sit unexpected, not crash");
}

#[test]
fn large_rendezvous_transfer_delivers_exact_bytes() {
    let (mut a, mut b) = connected_pair();
    let payload: Vec<u8> = (0..250_000u32).map(|i| (i % 251) as u8).collect();
    let rreq = b.irecv(300_000, 77, u64::MAX, 0);
    let sreq = a.isend(1, payload.clone(), 0, 77, 0).unwrap();

    drive_until(&mut a, &mut b, |a, b| a.test(sreq) && b.test(rreq));

    assert!(a.test(sreq), "sender side of rendezvous never completed");
    assert!(b.test(rreq), "receiver side of rendezvous never completed");
    assert_eq!(b.outcome(rreq).unwrap().xfer_length, payload.len() as u32);
    assert_eq!(b.recv_buffer(rreq).unwrap(), payload.as_slice());
}
