//! Load testing for the load balancer.

use std::time::{Duration, Instant};

use futures_util::future::join_all;
use lb_proxy::config::ExhaustedPolicy;

mod common;

async fn busy_backend() -> common::MockBackend {
    common::start_programmable_backend(|_| async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        (200, "Hello from backend".into())
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connections_never_exceed_capacity() {
    let capacity = 4;
    let first = busy_backend().await;
    let second = busy_backend().await;

    let mut config = common::proxy_config(&[first.url(), second.url()]);
    config.pool.max_connections_per_backend = capacity;
    config.proxy.exhausted_policy = ExhaustedPolicy::Wait;
    config.proxy.pool_wait_timeout_ms = 10_000;
    let lb = common::start_proxy(config);

    let client = common::client();
    let url = format!("http://{}/", lb.local_addr());
    let total = 64;

    let start = Instant::now();
    let responses = join_all((0..total).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let res = client.get(&url).send().await.unwrap();
            let status = res.status().as_u16();
            let body = res.text().await.unwrap();
            (status, body)
        }
    }))
    .await;
    let duration = start.elapsed();

    for (status, body) in &responses {
        assert_eq!(*status, 200);
        assert_eq!(body, "Hello from backend");
    }

    println!("--- Load Test Results ---");
    println!("Total Requests: {}", total);
    println!("Total Duration: {:?}", duration);
    println!("Requests/sec: {:.2}", total as f64 / duration.as_secs_f64());
    println!("Peak concurrency: {} / {}", first.stats.peak(), second.stats.peak());

    assert_eq!(first.stats.requests() + second.stats.requests(), total);
    for backend in [&first, &second] {
        assert!(backend.stats.peak() <= capacity, "peak {}", backend.stats.peak());
        assert!(backend.stats.connections() <= capacity);
    }
    for backend in lb.registry().list_backends() {
        assert_eq!(backend.open_connections(), 0);
        assert!(backend.pooled_connections() <= capacity);
    }

    lb.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_load_spreads_across_backends() {
    let first = busy_backend().await;
    let second = busy_backend().await;
    let lb = common::start_proxy(common::proxy_config(&[first.url(), second.url()]));

    let client = common::client();
    let url = format!("http://{}/", lb.local_addr());

    let statuses = join_all((0..32).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move { client.get(&url).send().await.unwrap().status().as_u16() }
    }))
    .await;

    assert!(statuses.iter().all(|s| *s == 200));
    assert!(first.stats.requests() > 0, "first backend idle");
    assert!(second.stats.requests() > 0, "second backend idle");
    lb.stop().await.unwrap();
}
