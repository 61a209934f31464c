//! Exercises the soft/hard timeout and overflow-budget behavior of the call
//! fabric against a stub broker with a controllable reply delay.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_client::{ClientError, ClientFabric, ClientFabricConfig};
use dispatch_protocol::Job;
use tempfile::TempDir;

fn config(endpoint: String) -> ClientFabricConfig {
    ClientFabricConfig {
        endpoint,
        soft_timeout: Duration::from_millis(1000),
        hard_timeout: Duration::from_millis(1500),
        overflow_budget: 1,
    }
}

#[test]
fn fast_reply_keeps_overflow_counter_at_zero() {
    let dir = TempDir::new().unwrap();
    let endpoint = support::ipc_endpoint(&dir, "fast.ipc");
    let context = zmq::Context::new();
    let stop = Arc::new(AtomicBool::new(false));
    let broker = support::spawn_stub_broker(&context, &endpoint, "w1", Duration::from_millis(10), Arc::clone(&stop));

    let fabric = ClientFabric::connect_with_config(config(endpoint)).unwrap();
    let job = Job::new("square", vec![b"7".to_vec()]);
    let result = fabric.execute(&job).unwrap();
    assert_eq!(result, b"49");

    stop.store(true, Ordering::SeqCst);
    broker.join().unwrap();
}

#[test]
fn one_slow_reply_is_tolerated_then_the_next_times_out() {
    // soft=1000ms, hard=1500ms, budget=1, worker delay=1200ms: every call
    // overflows, so the first call (counter 0->1) still returns the result,
    // and the second (counter 1->2) is surfaced as a Timeout.
    let dir = TempDir::new().unwrap();
    let endpoint = support::ipc_endpoint(&dir, "slow.ipc");
    let context = zmq::Context::new();
    let stop = Arc::new(AtomicBool::new(false));
    let broker = support::spawn_stub_broker(&context, &endpoint, "w1", Duration::from_millis(1200), Arc::clone(&stop));

    let fabric = ClientFabric::connect_with_config(config(endpoint)).unwrap();
    let job = Job::new("square", vec![b"7".to_vec()]);

    let first = fabric.execute(&job);
    assert_eq!(first.unwrap(), b"49");

    let second = fabric.execute(&job);
    assert!(matches!(second, Err(ClientError::Timeout)));

    stop.store(true, Ordering::SeqCst);
    broker.join().unwrap();
}

#[test]
fn a_subsequent_fast_reply_resets_the_overflow_counter() {
    let dir = TempDir::new().unwrap();
    let endpoint = support::ipc_endpoint(&dir, "recover.ipc");
    let context = zmq::Context::new();

    // First round: one slow reply (overflow, tolerated).
    let stop = Arc::new(AtomicBool::new(false));
    let broker = support::spawn_stub_broker(&context, &endpoint, "w1", Duration::from_millis(1200), Arc::clone(&stop));
    let fabric = ClientFabric::connect_with_config(config(endpoint.clone())).unwrap();
    let job = Job::new("square", vec![b"7".to_vec()]);
    assert_eq!(fabric.execute(&job).unwrap(), b"49");
    stop.store(true, Ordering::SeqCst);
    broker.join().unwrap();

    // Second round: the worker recovers (fast replies); the next call should
    // succeed and reset the counter rather than inheriting the prior count.
    let stop2 = Arc::new(AtomicBool::new(false));
    let broker2 = support::spawn_stub_broker(&context, &endpoint, "w1", Duration::from_millis(10), Arc::clone(&stop2));
    assert_eq!(fabric.execute(&job).unwrap(), b"49");
    assert_eq!(fabric.execute(&job).unwrap(), b"49");

    stop2.store(true, Ordering::SeqCst);
    broker2.join().unwrap();
}
