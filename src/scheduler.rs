use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::error::Result;

/// Handed to a daemon on every tick.
#[allow(dead_code)]
pub(crate) struct Context {
    pub run_id: u64,
    pub shutdown: broadcast::Receiver<()>,
}

/// A store daemon driven on a fixed interval: persistor, evictor/swapper,
/// LSS cleaner. Implementations must tolerate overlapping state changes from
/// foreground writers; every tick re-reads the world.
#[async_trait::async_trait]
pub(crate) trait Daemon: Send + Sync {
    /// Daemon name for logging.
    fn name(&self) -> &'static str;

    /// Tick interval.
    fn interval(&self) -> Duration;

    /// Run one tick.
    async fn tick(&self, ctx: Context) -> Result<()>;
}

/// Runs daemons on their intervals with a broadcast shutdown handshake:
/// `shutdown()` signals every loop, then joins them.
pub(crate) struct Scheduler {
    handles: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            handles: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a daemon and start its tick loop.
    pub fn register<D: Daemon + 'static>(&self, daemon: Arc<D>) {
        let handle = self.spawn_tick_loop(daemon);
        self.handles.lock().unwrap().push(handle);
    }

    fn spawn_tick_loop<D: Daemon + 'static>(&self, daemon: Arc<D>) -> JoinHandle<()> {
        let interval = daemon.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = daemon.tick(ctx).await {
                            tracing::error!(
                                daemon = daemon.name(),
                                error = %e,
                                "daemon tick failed"
                            );
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        tracing::debug!(daemon = daemon.name(), "daemon shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signal every daemon and wait for the loops to exit.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send(()).ok();
        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "daemon join failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDaemon {
        ticks: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl Daemon for CountingDaemon {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(5)
        }

        async fn tick(&self, _ctx: Context) -> Result<()> {
            self.ticks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_daemon_ticks_and_stops() {
        let scheduler = Scheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        scheduler.register(Arc::new(CountingDaemon {
            ticks: ticks.clone(),
        }));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(ticks.load(Ordering::SeqCst) > 0);

        scheduler.shutdown().await;
        let after = ticks.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(after, ticks.load(Ordering::SeqCst));
    }
}
