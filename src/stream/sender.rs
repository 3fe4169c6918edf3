//! Output sender
//!
//! Drains the frame queue into `TERMINAL_BATCH` frames. A batch goes out when
//! the flush interval has passed or when it has grown past the size threshold.

use std::sync::Arc;
use std::time::Duration;

use serde_json::value::RawValue;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::FrameSink;
use crate::errors::SendError;
use crate::protocol::OutputFrame;
use crate::queue::FrameQueue;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);
const SEND_RETRY_DELAY: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Batch {
    messages: Vec<Box<RawValue>>,
    bytes: usize,
}

impl Batch {
    fn push(&mut self, frame: Box<RawValue>) {
        // Each entry costs its encoded length plus a separator.
        self.bytes += frame.get().len() + 1;
        self.messages.push(frame);
    }

    fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    fn take(&mut self) -> Vec<Box<RawValue>> {
        self.bytes = 0;
        std::mem::take(&mut self.messages)
    }
}

pub struct OutputSender {
    session_id: String,
    queue: Arc<FrameQueue>,
    sink: Arc<dyn FrameSink>,
    cancel: CancellationToken,
    flush_interval: Duration,
    threshold: usize,
}

impl OutputSender {
    pub fn new(
        session_id: impl Into<String>,
        queue: Arc<FrameQueue>,
        sink: Arc<dyn FrameSink>,
        cancel: CancellationToken,
        flush_interval: Duration,
        threshold: usize,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            queue,
            sink,
            cancel,
            flush_interval,
            threshold: threshold.max(1),
        }
    }

    pub async fn run(self) {
        info!("[sender:{}] Output sender started", self.session_id);

        let mut batch = Batch::default();
        let mut last_flush = Instant::now();
        let mut batches_sent: usize = 0;

        while self.sink.is_open() {
            let polled = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                frame = self.queue.poll(POLL_TIMEOUT) => frame,
            };

            if let Some(frame) = polled {
                batch.push(frame);
                while batch.bytes < self.threshold {
                    match self.queue.try_pop() {
                        Some(frame) => batch.push(frame),
                        None => break,
                    }
                }
            }

            let due = last_flush.elapsed() >= self.flush_interval || batch.bytes >= self.threshold;
            if batch.is_empty() || !due {
                continue;
            }

            let messages = batch.take();
            let count = messages.len();
            last_flush = Instant::now();
            match self.send_batch(messages).await {
                Ok(()) => batches_sent += 1,
                Err(SendError::Closing) => {
                    debug!("[sender:{}] Channel is closing, stopping", self.session_id);
                    return;
                }
                Err(e) => {
                    warn!(
                        "[sender:{}] Failed to send batch, dropped {} frames: {}",
                        self.session_id, count, e
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(SEND_RETRY_DELAY) => {}
                    }
                }
            }
        }

        if !batch.is_empty() && self.sink.is_open() {
            match self.send_batch(batch.take()).await {
                Ok(()) => batches_sent += 1,
                Err(e) => debug!("[sender:{}] Final flush failed: {}", self.session_id, e),
            }
        }

        info!(
            "[sender:{}] Output sender finished. Total: {} batches",
            self.session_id, batches_sent
        );
    }

    async fn send_batch(&self, messages: Vec<Box<RawValue>>) -> Result<(), SendError> {
        let text = match (OutputFrame::Batch { messages }).to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("[sender:{}] Failed to encode batch: {}", self.session_id, e);
                return Ok(());
            }
        };
        self.sink.send_text(text).await
    }
}
