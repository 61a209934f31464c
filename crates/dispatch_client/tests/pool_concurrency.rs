//! Exercises pool-level checkout/execute/checkin under concurrent callers.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dispatch_client::{ClientFabricConfig, ClientPool};
use dispatch_protocol::Job;
use tempfile::TempDir;

#[test]
fn sixteen_callers_share_four_fabrics_and_all_succeed() {
    let dir = TempDir::new().unwrap();
    let endpoint = support::ipc_endpoint(&dir, "pool.ipc");
    let context = zmq::Context::new();
    let stop = Arc::new(AtomicBool::new(false));
    let broker = support::spawn_stub_broker(&context, &endpoint, "w1", Duration::from_millis(50), Arc::clone(&stop));

    let config = ClientFabricConfig {
        endpoint,
        soft_timeout: Duration::from_millis(500),
        hard_timeout: Duration::from_millis(2000),
        overflow_budget: 1,
    };
    let pool = Arc::new(ClientPool::new(config, 4).unwrap());
    assert_eq!(pool.size(), 4);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let job = Job::new("square", vec![i.to_string().into_bytes()]);
                let result = pool.execute(&job, Duration::from_secs(5)).unwrap();
                let expected = (i * i).to_string();
                assert_eq!(String::from_utf8(result).unwrap(), expected);
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(pool.len(), 4);

    stop.store(true, Ordering::SeqCst);
    broker.join().unwrap();
}
