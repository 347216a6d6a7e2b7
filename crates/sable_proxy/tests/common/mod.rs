//! Shared helpers for integration tests.

use std::sync::Once;

use sable_proxy::{SimCluster, SimClusterConfig};

/// Install a test-friendly tracing subscriber once per process.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Start a default in-process cluster.
pub async fn start_cluster() -> SimCluster {
    start_cluster_with(SimClusterConfig::default()).await
}

/// Start an in-process cluster with custom configuration.
pub async fn start_cluster_with(config: SimClusterConfig) -> SimCluster {
    init_tracing();
    SimCluster::start(config).await.expect("cluster start")
}
