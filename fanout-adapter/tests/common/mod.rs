//! Shared harness: a cluster of adapters over one in-memory stream.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use fanout_adapter::{Adapter, AdapterConfig};
use fanout_core::MockHost;
use fanout_stream::CappedMemoryLog;

pub struct TestInstance {
    pub adapter: Arc<Adapter>,
    pub host: Arc<MockHost>,
}

pub struct TestCluster {
    pub store: Arc<CappedMemoryLog<Value>>,
    pub instances: Vec<TestInstance>,
}

impl TestCluster {
    pub fn instance(&self, index: usize) -> &TestInstance {
        &self.instances[index]
    }

    pub async fn close(self) {
        for instance in &self.instances {
            instance.adapter.close().await;
        }
    }
}

/// Test config: fast heartbeats, a heartbeat timeout long enough that
/// nothing is swept by accident, and a deadline short enough for tests.
pub fn test_config() -> AdapterConfig {
    AdapterConfig::default()
        .with_heartbeat(Duration::from_millis(50), Duration::from_secs(5))
        .with_requests_timeout(Duration::from_secs(2))
}

/// Config with heartbeats far apart, for tests that assert on the exact
/// contents of the stream. Peers still meet through the initial
/// heartbeat exchange.
pub fn quiet_config() -> AdapterConfig {
    test_config().with_heartbeat(Duration::from_secs(60), Duration::from_secs(120))
}

/// Spin up `n` adapters for namespace `/` over one shared stream.
pub async fn cluster(n: usize) -> TestCluster {
    cluster_with(n, test_config).await
}

/// Same, with a per-instance config factory.
pub async fn cluster_with(n: usize, config: impl Fn() -> AdapterConfig) -> TestCluster {
    let store: Arc<CappedMemoryLog<Value>> = Arc::new(CappedMemoryLog::new(4096));
    let mut instances = Vec::with_capacity(n);
    for _ in 0..n {
        let host = Arc::new(MockHost::new());
        let adapter = Adapter::new(store.clone(), host.clone(), "/", config());
        adapter.init().await.expect("adapter init");
        instances.push(TestInstance { adapter, host });
    }
    // Let the initial heartbeat exchange converge.
    settle().await;
    TestCluster { store, instances }
}

/// Give listeners time to drain the stream.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(150)).await;
}
