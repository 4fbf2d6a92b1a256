//! Outbound write queue.
//!
//! Messages are appended as they are produced and written by a single drain
//! cycle at a time. A message leaves the queue only after the transport
//! accepted it, so a failed send leaves it at the head for the next cycle.

use crate::state::ConnectionMetrics;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::VecDeque;
use takstream_core::Result;
use tracing::trace;

/// Written after each batch to push buffered bytes out.
pub const FLUSH_SIGNAL: &str = "\n";

/// Lets other tasks run between batches of a long drain.
pub async fn yield_to_scheduler() {
    tokio::task::yield_now().await;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<String>,
    writing: bool,
}

/// FIFO of encoded messages with a single-flight drain.
#[derive(Debug, Default)]
pub struct WriteQueue {
    state: Mutex<QueueState>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message. Safe while a drain is running.
    pub fn push(&self, message: String) {
        self.state.lock().pending.push_back(message);
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    /// True while a drain cycle owns the queue.
    pub fn is_writing(&self) -> bool {
        self.state.lock().writing
    }

    /// Writes queued messages to `transport` until the queue is empty.
    ///
    /// Returns the number of messages sent, or `Ok(0)` at once if another
    /// cycle is already draining or there is nothing to send. On a failed
    /// send the cycle stops, the message stays at the head and the error is
    /// returned.
    pub async fn drain(&self, transport: &dyn Transport, metrics: &ConnectionMetrics) -> Result<usize> {
        let mut cycle = match DrainCycle::claim(&self.state) {
            Some(cycle) => cycle,
            None => return Ok(0),
        };

        let mut sent = 0;
        loop {
            while let Some(message) = self.head() {
                let payload = format!("{}\n", message);
                transport.send(&payload).await?;

                self.state.lock().pending.pop_front();
                metrics.record_bytes_sent(payload.len() as u64);
                metrics.record_message_sent();
                sent += 1;
            }

            transport.send(FLUSH_SIGNAL).await?;

            if cycle.finish_if_empty() {
                trace!(sent, "Write queue drained");
                return Ok(sent);
            }

            // Messages arrived during the flush write
            yield_to_scheduler().await;
        }
    }

    fn head(&self) -> Option<String> {
        self.state.lock().pending.front().cloned()
    }
}

/// Ownership of the `writing` flag for one drain. Dropping it releases the
/// flag, so an error return or a cancelled drain leaves the queue drainable.
struct DrainCycle<'a> {
    state: &'a Mutex<QueueState>,
    released: bool,
}

impl<'a> DrainCycle<'a> {
    fn claim(state: &'a Mutex<QueueState>) -> Option<Self> {
        let mut guard = state.lock();
        if guard.writing || guard.pending.is_empty() {
            return None;
        }
        guard.writing = true;
        Some(Self {
            state,
            released: false,
        })
    }

    /// Releases the flag if nothing is left. Checked and released under one
    /// lock so a concurrent push either lands in this cycle or starts the
    /// next one.
    fn finish_if_empty(&mut self) -> bool {
        let mut guard = self.state.lock();
        if guard.pending.is_empty() {
            guard.writing = false;
            self.released = true;
            true
        } else {
            false
        }
    }
}

impl Drop for DrainCycle<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.state.lock().writing = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportHandlers;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use takstream_core::{ConnectionError, TakStreamError};

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<String>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn set_handlers(&self, _handlers: TransportHandlers) {}

        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, payload: &str) -> Result<()> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail.load(Ordering::SeqCst) {
                return Err(ConnectionError::NotConnected.into());
            }
            self.sent.lock().push(payload.to_string());
            Ok(())
        }

        fn destroy(&self) {}
    }

    impl RecordingTransport {
        fn messages(&self) -> Vec<String> {
            self.sent
                .lock()
                .iter()
                .filter(|payload| payload.as_str() != FLUSH_SIGNAL)
                .cloned()
                .collect()
        }
    }

    #[tokio::test]
    async fn test_drain_sends_in_order_then_flushes() {
        let queue = WriteQueue::new();
        let transport = RecordingTransport::default();
        let metrics = ConnectionMetrics::new();

        queue.push("<event>1</event>".into());
        queue.push("<event>2</event>".into());

        assert_eq!(queue.drain(&transport, &metrics).await.unwrap(), 2);
        assert_eq!(
            *transport.sent.lock(),
            vec!["<event>1</event>\n", "<event>2</event>\n", "\n"]
        );
        assert!(queue.is_empty());
        assert!(!queue.is_writing());
        assert_eq!(metrics.messages_sent(), 2);
    }

    #[tokio::test]
    async fn test_empty_queue_sends_nothing() {
        let queue = WriteQueue::new();
        let transport = RecordingTransport::default();
        assert_eq!(queue.drain(&transport, &ConnectionMetrics::new()).await.unwrap(), 0);
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_drains_are_single_flight() {
        let queue = Arc::new(WriteQueue::new());
        let transport = Arc::new(RecordingTransport::default());
        let metrics = ConnectionMetrics::new();

        let mut tasks = Vec::new();
        for n in 0..10 {
            queue.push(format!("<event>{}</event>", n));
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            let metrics = metrics.clone();
            tasks.push(tokio::spawn(async move {
                queue.drain(transport.as_ref(), &metrics).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let expected: Vec<String> = (0..10).map(|n| format!("<event>{}</event>\n", n)).collect();
        assert_eq!(transport.messages(), expected);
        assert_eq!(transport.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_push_during_drain_is_picked_up() {
        let queue = Arc::new(WriteQueue::new());
        let transport = Arc::new(RecordingTransport::default());
        let metrics = ConnectionMetrics::new();

        queue.push("<event>a</event>".into());
        let drain = {
            let queue = Arc::clone(&queue);
            let transport = Arc::clone(&transport);
            let metrics = metrics.clone();
            tokio::spawn(async move { queue.drain(transport.as_ref(), &metrics).await })
        };

        tokio::task::yield_now().await;
        queue.push("<event>b</event>".into());
        // A second drain either runs the message itself or finds the first
        // cycle still busy and leaves it to that cycle
        queue.drain(transport.as_ref(), &metrics).await.unwrap();
        drain.await.unwrap().unwrap();

        assert_eq!(
            transport.messages(),
            vec!["<event>a</event>\n".to_string(), "<event>b</event>\n".to_string()]
        );
        assert!(queue.is_empty());
        assert!(!queue.is_writing());
    }

    #[tokio::test]
    async fn test_failed_send_keeps_head() {
        let queue = WriteQueue::new();
        let transport = RecordingTransport::default();
        let metrics = ConnectionMetrics::new();

        queue.push("<event>first</event>".into());
        queue.push("<event>second</event>".into());
        transport.fail.store(true, Ordering::SeqCst);

        let err = queue.drain(&transport, &metrics).await.unwrap_err();
        assert!(matches!(err, TakStreamError::Connection(ConnectionError::NotConnected)));
        assert_eq!(queue.len(), 2);
        assert!(!queue.is_writing());

        transport.fail.store(false, Ordering::SeqCst);
        assert_eq!(queue.drain(&transport, &metrics).await.unwrap(), 2);
        assert_eq!(
            transport.messages(),
            vec!["<event>first</event>\n".to_string(), "<event>second</event>\n".to_string()]
        );
    }
}
