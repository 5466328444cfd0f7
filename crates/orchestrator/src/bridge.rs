//! The [`Bridge`] seam and the loop that drives every bridge.

use std::{fmt, future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::errors::{BridgeError, BridgeResult};

/// How long the runner waits between iterations.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// One direction-agnostic bridge driven by the [`BridgeRunner`].
#[async_trait]
pub trait Bridge: Send + Sync + fmt::Debug {
    /// Name used in logs and checkpoint keys.
    fn name(&self) -> &str;

    /// Registers answer handlers with the network. The leader asks, so it registers none.
    async fn init(&self) -> BridgeResult<()>;

    /// Scans for new work and, on the leader, pushes pending items forward.
    async fn run_iteration(&self) -> BridgeResult<()>;
}

/// Runs bridges one after another on a fixed interval.
#[derive(Debug)]
pub struct BridgeRunner {
    bridges: Vec<Arc<dyn Bridge>>,
    poll_interval: Duration,
}

impl BridgeRunner {
    /// Creates a runner over `bridges`.
    pub fn new(bridges: Vec<Arc<dyn Bridge>>, poll_interval: Duration) -> Self {
        Self {
            bridges,
            poll_interval,
        }
    }

    /// Calls every bridge's `init`. A bridge that cannot register its handlers is fatal.
    pub async fn init(&self) -> BridgeResult<()> {
        for bridge in &self.bridges {
            bridge.init().await?;
            info!(bridge = bridge.name(), "bridge initialized");
        }
        Ok(())
    }

    /// Runs one iteration of every bridge. Errors are logged and do not stop the others.
    pub async fn run_once(&self) {
        for bridge in &self.bridges {
            match bridge.run_iteration().await {
                Ok(()) => {}
                Err(e @ BridgeError::StuckBatch(_)) => {
                    error!(bridge = bridge.name(), %e, "bridge needs manual intervention")
                }
                Err(e) => warn!(bridge = bridge.name(), %e, "bridge iteration failed"),
            }
        }
    }

    /// Initializes the bridges, then iterates until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> BridgeResult<()>
    where
        F: Future<Output = ()> + Send,
    {
        self.init().await?;
        tokio::pin!(shutdown);
        loop {
            self.run_once().await;
            tokio::select! {
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = &mut shutdown => {
                    info!("shutting down bridge runner");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug, Default)]
    struct Counting {
        inits: AtomicUsize,
        iterations: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Bridge for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn init(&self) -> BridgeResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn run_iteration(&self) -> BridgeResult<()> {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(BridgeError::invalid("boom"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_bridge_does_not_stop_the_others() {
        let failing = Arc::new(Counting {
            fail: true,
            ..Default::default()
        });
        let healthy = Arc::new(Counting::default());
        let runner = BridgeRunner::new(
            vec![failing.clone(), healthy.clone()],
            Duration::from_millis(1),
        );

        runner.run_once().await;
        runner.run_once().await;

        assert_eq!(failing.iterations.load(Ordering::SeqCst), 2);
        assert_eq!(healthy.iterations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stops_on_shutdown_after_one_init() {
        let bridge = Arc::new(Counting::default());
        let runner = BridgeRunner::new(vec![bridge.clone()], Duration::from_millis(5));

        runner
            .run(tokio::time::sleep(Duration::from_millis(30)))
            .await
            .unwrap();

        assert_eq!(bridge.inits.load(Ordering::SeqCst), 1);
        assert!(bridge.iterations.load(Ordering::SeqCst) >= 1);
    }
}
