//! Replay scheduling and batch broadcast
//!
//! Drives the batcher output through time: the first batch goes out
//! immediately, each following batch after
//! `max((t2 - t1) / speed_factor, min_delay)`. The delay wait is cancellable
//! so shutdown never has to sit out a pending gap.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::batch::{Batch, Batcher, Record};
use crate::error::Result;
use crate::subscriber::SubscriberRegistry;

/// Tagged wire envelope. Receivers must tolerate unknown `type` values.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    /// One replayed batch: every trade sharing one exact timestamp.
    Trades {
        timestamp: String,
        trades: Vec<Map<String, Value>>,
    },
    /// Periodic informational heartbeat.
    Info {
        timestamp: String,
        subscribers: usize,
    },
}

impl WireMessage {
    pub fn trades(batch: Batch) -> Self {
        Self::Trades {
            timestamp: format_timestamp(batch.timestamp),
            trades: batch.records.into_iter().map(|r| r.fields).collect(),
        }
    }

    pub fn info(subscribers: usize) -> Self {
        Self::Info {
            timestamp: format_timestamp(Utc::now()),
            subscribers,
        }
    }
}

/// ISO-8601 UTC with a trailing `Z`.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

/// `max(gap / speed_factor, floor)`.
///
/// `speed_factor` is validated positive and finite at startup, and the
/// batcher guarantees `next >= previous`.
pub fn inter_batch_delay(
    previous: DateTime<Utc>,
    next: DateTime<Utc>,
    speed_factor: f64,
    floor: Duration,
) -> Duration {
    let gap = (next - previous).to_std().unwrap_or_default();
    Duration::try_from_secs_f64(gap.as_secs_f64() / speed_factor)
        .unwrap_or(Duration::MAX)
        .max(floor)
}

/// Replay pacing loop over the shared registry.
pub struct ReplayEngine {
    registry: Arc<SubscriberRegistry>,
    speed_factor: f64,
    min_delay: Duration,
    shutdown: CancellationToken,
}

impl ReplayEngine {
    pub fn new(
        registry: Arc<SubscriberRegistry>,
        speed_factor: f64,
        min_delay: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            registry,
            speed_factor,
            min_delay,
            shutdown,
        }
    }

    /// Replay the full record sequence once.
    ///
    /// Returns when the sequence is exhausted or the shutdown token fires
    /// mid-delay. An ordering violation in the input aborts the replay.
    pub async fn run(&self, records: Vec<Record>) -> Result<()> {
        let mut previous: Option<DateTime<Utc>> = None;
        let mut delivered_batches = 0usize;

        for batch in Batcher::new(records.into_iter()) {
            let batch = batch?;

            if let Some(previous) = previous {
                let delay =
                    inter_batch_delay(previous, batch.timestamp, self.speed_factor, self.min_delay);
                if !delay.is_zero() {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {
                            info!(delivered_batches, "replay interrupted by shutdown");
                            return Ok(());
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            previous = Some(batch.timestamp);

            let timestamp = batch.timestamp;
            let trades = batch.records.len();
            let message = serde_json::to_string(&WireMessage::trades(batch))?;
            let delivered = self.registry.broadcast(&message).await;
            delivered_batches += 1;
            debug!(%timestamp, trades, delivered, "broadcast batch");
        }

        info!(delivered_batches, "replay complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ReplayError;
    use crate::subscriber::Subscriber;
    use tokio::sync::mpsc;

    fn record(ts: &str, label: &str) -> Record {
        let mut fields = Map::new();
        fields.insert("label".to_string(), Value::String(label.to_string()));
        Record {
            timestamp: ts.parse().expect("test timestamp"),
            fields,
        }
    }

    fn ts(text: &str) -> DateTime<Utc> {
        text.parse().expect("test timestamp")
    }

    async fn engine_with_subscriber(
        speed_factor: f64,
        min_delay: Duration,
        shutdown: CancellationToken,
    ) -> (ReplayEngine, mpsc::UnboundedReceiver<String>) {
        let registry = Arc::new(SubscriberRegistry::new(10));
        let (tx, rx) = mpsc::unbounded_channel();
        registry.add(Subscriber::new(tx)).await.unwrap();
        (
            ReplayEngine::new(registry, speed_factor, min_delay, shutdown),
            rx,
        )
    }

    #[test]
    fn delay_scales_with_the_speed_factor() {
        let t1 = ts("2024-01-02T10:00:00Z");
        let t2 = ts("2024-01-02T10:00:05Z");

        assert_eq!(
            inter_batch_delay(t1, t2, 5.0, Duration::ZERO),
            Duration::from_secs(1)
        );
        assert_eq!(
            inter_batch_delay(t1, t2, 1.0, Duration::ZERO),
            Duration::from_secs(5)
        );
        assert_eq!(
            inter_batch_delay(t1, t2, 0.5, Duration::ZERO),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn delay_floor_wins_over_small_gaps() {
        let t1 = ts("2024-01-02T10:00:00Z");
        let t2 = ts("2024-01-02T10:00:00.500Z");

        assert_eq!(
            inter_batch_delay(t1, t2, 1.0, Duration::from_secs(2)),
            Duration::from_secs(2)
        );
        assert_eq!(inter_batch_delay(t1, t1, 1.0, Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn trades_envelope_shape() {
        let batch = Batch {
            timestamp: ts("2024-01-02T10:00:00Z"),
            records: vec![
                record("2024-01-02T10:00:00Z", "a"),
                record("2024-01-02T10:00:00Z", "b"),
            ],
        };

        let value: Value =
            serde_json::from_str(&serde_json::to_string(&WireMessage::trades(batch)).unwrap())
                .unwrap();

        assert_eq!(value["type"], "trades");
        assert_eq!(value["timestamp"], "2024-01-02T10:00:00Z");
        assert_eq!(value["trades"].as_array().unwrap().len(), 2);
        assert_eq!(value["trades"][0]["label"], "a");
    }

    #[test]
    fn info_envelope_is_distinguishable_from_trades() {
        let value: Value =
            serde_json::from_str(&serde_json::to_string(&WireMessage::info(3)).unwrap()).unwrap();
        assert_eq!(value["type"], "info");
        assert_eq!(value["subscribers"], 3);
    }

    #[tokio::test(start_paused = true)]
    async fn replays_batches_with_scaled_delays() {
        let (engine, mut rx) =
            engine_with_subscriber(5.0, Duration::ZERO, CancellationToken::new()).await;

        let start = tokio::time::Instant::now();
        engine
            .run(vec![
                record("2024-01-02T10:00:00Z", "A"),
                record("2024-01-02T10:00:00Z", "B"),
                record("2024-01-02T10:00:05Z", "C"),
            ])
            .await
            .unwrap();

        // A 5s gap at speed 5.0 replays in 1s.
        assert_eq!(start.elapsed(), Duration::from_secs(1));

        let first: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "trades");
        assert_eq!(first["trades"].as_array().unwrap().len(), 2);

        let second: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(second["trades"].as_array().unwrap().len(), 1);
        assert_eq!(second["trades"][0]["label"], "C");
    }

    #[tokio::test(start_paused = true)]
    async fn first_batch_goes_out_immediately() {
        let (engine, mut rx) =
            engine_with_subscriber(1.0, Duration::ZERO, CancellationToken::new()).await;

        let start = tokio::time::Instant::now();
        engine
            .run(vec![record("2030-06-01T00:00:00Z", "future")])
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn min_delay_floor_overrides_the_timestamp_gap() {
        let (engine, _rx) =
            engine_with_subscriber(1.0, Duration::from_secs(2), CancellationToken::new()).await;

        let start = tokio::time::Instant::now();
        engine
            .run(vec![
                record("2024-01-02T10:00:00Z", "a"),
                record("2024-01-02T10:00:00.500Z", "b"),
            ])
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_delivers_nothing() {
        let (engine, mut rx) =
            engine_with_subscriber(1.0, Duration::ZERO, CancellationToken::new()).await;

        engine.run(Vec::new()).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_a_pending_delay() {
        let shutdown = CancellationToken::new();
        let (engine, mut rx) = engine_with_subscriber(1.0, Duration::ZERO, shutdown.clone()).await;

        let handle = tokio::spawn(async move {
            engine
                .run(vec![
                    record("2024-01-02T10:00:00Z", "now"),
                    record("2024-01-02T11:00:00Z", "one hour later"),
                ])
                .await
        });

        // First batch arrives with no delay.
        assert!(rx.recv().await.is_some());

        shutdown.cancel();
        handle.await.unwrap().unwrap();

        // The second batch was never delivered.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn ordering_violation_aborts_the_replay() {
        let (engine, _rx) = engine_with_subscriber(1.0, Duration::ZERO, CancellationToken::new()).await;

        let result = engine
            .run(vec![
                record("2024-01-02T10:00:05Z", "a"),
                record("2024-01-02T10:00:00Z", "late"),
            ])
            .await;

        assert!(matches!(
            result,
            Err(ReplayError::OrderingViolation { .. })
        ));
    }
}
