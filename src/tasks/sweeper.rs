//! Background maintenance: expires finished tasks and stale cancellation markers.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::engine::TaskEngine;

pub fn start_sweeper(engine: Arc<TaskEngine>, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        sweeper_loop(engine, shutdown).await;
    })
}

async fn sweeper_loop(engine: Arc<TaskEngine>, shutdown: CancellationToken) {
    let period = engine.config().sweep_interval();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tracing::debug!(period_ms = period.as_millis() as u64, "Sweeper started");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                engine.sweep().await;
            }
        }
    }
    tracing::debug!("Sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::engine::tests::{engine_with, VID};
    use crate::upstream::scripted::ScriptedUpstream;
    use std::time::Duration;

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let engine = engine_with(Arc::new(ScriptedUpstream::succeeding()), 1, |_| {}).await;
        let shutdown = CancellationToken::new();
        let handle = start_sweeper(Arc::clone(&engine), shutdown.clone());

        engine.cancel("test-key", VID).await.unwrap();
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
