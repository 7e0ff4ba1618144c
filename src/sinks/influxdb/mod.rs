//! Upload pump: drains the durable buffer into InfluxDB in acknowledged
//! batches. Rows are only deleted after the write succeeds; a failed
//! cycle releases the batch lease so the rows ride a later batch
//! (at-least-once, absorbed remotely by idempotent point identity).

pub mod client;
pub mod encoder;

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::{BufferError, DurableBuffer, UploadBatch};
use crate::config::UploadSettings;
use client::{InfluxSink, SinkError};
use encoder::{analytics_point, sample_point, EncodeError, Point};

/// What one pump cycle did, surfaced for logs and tests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CycleOutcome {
    /// Nothing unprocessed in the buffer.
    Idle,
    /// Batch written and deleted.
    Sent { samples: usize, analytics: usize },
    /// Retries exhausted; the lease was released for a later cycle.
    Deferred,
}

pub struct UploadPump {
    buffer: DurableBuffer,
    sink: Arc<dyn InfluxSink>,
    settings: UploadSettings,
}

impl UploadPump {
    pub fn new(buffer: DurableBuffer, sink: Arc<dyn InfluxSink>, settings: UploadSettings) -> Self {
        Self {
            buffer,
            sink,
            settings,
        }
    }

    /// Runs until cancelled, draining one batch per interval.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.settings.send_interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            message = "Upload pump started.",
            send_interval_secs = self.settings.send_interval_secs,
            batch_size = self.settings.batch_size
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.cycle().await {
                        Ok(CycleOutcome::Sent { samples, analytics }) => {
                            info!(message = "Batch uploaded.", samples, analytics);
                        }
                        Ok(CycleOutcome::Idle) => debug!(message = "No data to upload."),
                        Ok(CycleOutcome::Deferred) => {
                            warn!(message = "Upload deferred; batch left in buffer.");
                        }
                        Err(error) => {
                            error!(message = "Upload cycle failed.", %error);
                        }
                    }
                }
            }
        }
        info!(message = "Upload pump stopped.");
    }

    /// One cycle: lease a batch, encode it, write with bounded retries.
    pub async fn cycle(&self) -> Result<CycleOutcome, PumpError> {
        let Some(batch) = self
            .buffer
            .next_batch(self.settings.batch_size, self.settings.analytics_batch_size)
            .await?
        else {
            return Ok(CycleOutcome::Idle);
        };

        let points = match self.encode_batch(&batch) {
            Ok(points) => points,
            Err(error) => {
                // Release the lease before surfacing the error.
                self.buffer.release_batch(&batch.batch_id).await?;
                return Err(error.into());
            }
        };
        let retry_delay = Duration::from_secs(self.settings.retry_delay_secs);

        for attempt in 1..=self.settings.max_retry_attempts.max(1) {
            // A cheap liveness probe precedes every send attempt; a
            // failed probe consumes the attempt.
            if let Err(error) = self.sink.ping().await {
                warn!(
                    message = "Remote store liveness probe failed.",
                    attempt,
                    %error
                );
                counter!("upload_ping_failures_total").increment(1);
            } else {
                match self.sink.write(&points).await {
                    Ok(()) => {
                        self.buffer.mark_processed(&batch.batch_id).await?;
                        self.buffer.delete_batch(&batch.batch_id).await?;
                        counter!("upload_batches_total").increment(1);
                        counter!("upload_points_total").increment(points.len() as u64);
                        return Ok(CycleOutcome::Sent {
                            samples: batch.samples.len(),
                            analytics: batch.analytics.len(),
                        });
                    }
                    Err(error) => {
                        warn!(
                            message = "Remote write failed.",
                            attempt,
                            batch_id = %batch.batch_id,
                            %error
                        );
                        counter!("upload_failures_total").increment(1);
                    }
                }
            }
            if attempt < self.settings.max_retry_attempts.max(1) {
                tokio::time::sleep(retry_delay).await;
            }
        }

        // Unassign so the rows are eligible for a later batch instead of
        // being skipped by the lease filter.
        self.buffer.release_batch(&batch.batch_id).await?;
        Ok(CycleOutcome::Deferred)
    }

    fn encode_batch(&self, batch: &UploadBatch) -> Result<Vec<Point>, PumpError> {
        let prefix = self.settings.measurement_prefix.as_str();
        let mut points = Vec::with_capacity(batch.samples.len() + batch.analytics.len());
        for sample in &batch.samples {
            points.push(sample_point(prefix, sample)?);
        }
        for record in &batch.analytics {
            points.push(analytics_point(prefix, record)?);
        }
        Ok(points)
    }
}

#[derive(Debug, snafu::Snafu)]
pub enum PumpError {
    #[snafu(context(false), display("{source}"))]
    Buffer { source: BufferError },
    #[snafu(context(false), display("{source}"))]
    Encode { source: EncodeError },
    #[snafu(context(false), display("{source}"))]
    Sink { source: SinkError },
}
