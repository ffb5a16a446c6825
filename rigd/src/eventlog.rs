//! Per-environment append-only event log.
//!
//! Two slices share one monotonic sequence counter: "lifecycle" events
//! (low volume, scanned by `wait_for` and the snapshot endpoint) and
//! "log" events (service output and observe traffic, high volume, never
//! scanned by waiters). Publishers never block: subscribers that cannot
//! keep up lose events and are expected to replay via `since` on
//! reconnect.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rig_api::events::{Event, EventClass};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

const SUBSCRIBER_BUFFER: usize = 256;

pub type EventFilter = Box<dyn Fn(&Event) -> bool + Send>;

#[derive(Default)]
struct Inner {
    lifecycle: Vec<Event>,
    lines: Vec<Event>,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

pub struct EventLog {
    environment: String,
    inner: Mutex<Inner>,
    /// Carries the seq of the most recent publish; waiters subscribe and
    /// re-scan whenever it moves.
    notify: watch::Sender<u64>,
}

impl EventLog {
    pub fn new(environment: impl Into<String>) -> Arc<Self> {
        let (notify, _) = watch::channel(0);
        Arc::new(EventLog {
            environment: environment.into(),
            inner: Mutex::new(Inner {
                next_seq: 1,
                ..Default::default()
            }),
            notify,
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Append an event: assign the next seq, stamp the environment and a
    /// monotonic timestamp, notify waiters. Returns the assigned seq.
    pub fn publish(&self, mut event: Event) -> u64 {
        let seq = {
            let mut inner = self.inner.lock().unwrap();
            event.seq = inner.next_seq;
            inner.next_seq += 1;
            if event.environment.is_empty() {
                event.environment = self.environment.clone();
            }
            let now = Utc::now();
            let ts = match (event.timestamp, inner.last_timestamp) {
                (Some(provided), Some(last)) => provided.max(last),
                (Some(provided), None) => provided,
                (None, Some(last)) => now.max(last),
                (None, None) => now,
            };
            event.timestamp = Some(ts);
            inner.last_timestamp = Some(ts);

            let seq = event.seq;
            match event.class() {
                EventClass::Lifecycle => inner.lifecycle.push(event),
                EventClass::Log => inner.lines.push(event),
            }
            seq
        };
        // send_replace never blocks and does not care whether anyone
        // listens.
        self.notify.send_replace(seq);
        seq
    }

    /// Full snapshot, both slices merged by seq.
    pub fn events(&self) -> Vec<Event> {
        self.since(0)
    }

    pub fn lifecycle_events(&self) -> Vec<Event> {
        self.inner.lock().unwrap().lifecycle.clone()
    }

    /// Merged snapshot of everything with `seq > cursor`.
    pub fn since(&self, cursor: u64) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        let a = &inner.lifecycle[inner.lifecycle.partition_point(|e| e.seq <= cursor)..];
        let b = &inner.lines[inner.lines.partition_point(|e| e.seq <= cursor)..];

        let mut merged = Vec::with_capacity(a.len() + b.len());
        let (mut i, mut j) = (0, 0);
        while i < a.len() && j < b.len() {
            if a[i].seq < b[j].seq {
                merged.push(a[i].clone());
                i += 1;
            } else {
                merged.push(b[j].clone());
                j += 1;
            }
        }
        merged.extend_from_slice(&a[i..]);
        merged.extend_from_slice(&b[j..]);
        merged
    }

    /// The last `n` log lines of one service.
    pub fn service_log_tail(&self, service: &str, n: usize) -> Vec<Event> {
        let inner = self.inner.lock().unwrap();
        let mut tail: Vec<Event> = inner
            .lines
            .iter()
            .rev()
            .filter(|e| e.service.as_deref() == Some(service))
            .take(n)
            .cloned()
            .collect();
        tail.reverse();
        tail
    }

    pub fn last_seq(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.next_seq - 1
    }

    /// Fan-out subscription: replays everything after `from_seq`, then
    /// streams live events until cancellation. The channel is bounded;
    /// when the subscriber lags, events are dropped rather than slowing
    /// any publisher.
    pub fn subscribe(
        self: &Arc<Self>,
        cancel: CancellationToken,
        from_seq: u64,
        filter: Option<EventFilter>,
    ) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let log = Arc::clone(self);
        tokio::spawn(async move {
            let mut watch_rx = log.notify.subscribe();
            let mut cursor = from_seq;
            loop {
                let batch = log.since(cursor);
                if batch.is_empty() {
                    tokio::select! {
                        // Cancellation still delivers anything already
                        // published (the terminal environment.down in
                        // particular), because the drain above runs
                        // before this wait on every iteration.
                        _ = cancel.cancelled() => {
                            for event in log.since(cursor) {
                                if filter.as_ref().map_or(true, |f| f(&event)) {
                                    let _ = tx.try_send(event);
                                }
                            }
                            break;
                        }
                        changed = watch_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                    continue;
                }
                for event in batch {
                    cursor = event.seq;
                    if filter.as_ref().map_or(true, |f| f(&event)) {
                        // Deliberate drop under backpressure.
                        let _ = tx.try_send(event);
                    }
                }
                if tx.is_closed() {
                    break;
                }
            }
        });
        rx
    }

    /// Block until a lifecycle event matching `pred` exists (history
    /// counts) or the token is cancelled. Log lines are never scanned.
    pub async fn wait_for(
        &self,
        cancel: &CancellationToken,
        mut pred: impl FnMut(&Event) -> bool,
    ) -> anyhow::Result<Event> {
        let mut watch_rx = self.notify.subscribe();
        let mut cursor = 0u64;
        loop {
            let found = {
                let inner = self.inner.lock().unwrap();
                let start = inner.lifecycle.partition_point(|e| e.seq <= cursor);
                if let Some(last) = inner.lifecycle.last() {
                    cursor = last.seq.max(cursor);
                }
                inner.lifecycle[start..].iter().find(|e| pred(e)).cloned()
            };
            if let Some(event) = found {
                return Ok(event);
            }
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled while waiting for event"),
                changed = watch_rx.changed() => {
                    if changed.is_err() {
                        anyhow::bail!("event log dropped while waiting");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_api::events::{EventType, LogLinePayload, LogStream};
    use std::time::Duration;

    fn log_line(service: &str, line: &str) -> Event {
        let mut event = Event::service(EventType::ServiceLog, service);
        event.line = Some(LogLinePayload {
            stream: LogStream::Stdout,
            line: line.to_string(),
        });
        event
    }

    #[tokio::test]
    async fn seq_is_gap_free_across_slices() {
        let log = EventLog::new("t");
        log.publish(Event::service(EventType::ServiceStarting, "a"));
        log.publish(log_line("a", "hello"));
        log.publish(Event::service(EventType::ServiceHealthy, "a"));
        log.publish(log_line("a", "world"));

        let events = log.events();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);

        // Timestamps never go backwards.
        for pair in events.windows(2) {
            assert!(pair[0].timestamp.unwrap() <= pair[1].timestamp.unwrap());
        }

        // Lifecycle view skips the log lines but keeps original seqs.
        let lifecycle: Vec<u64> = log.lifecycle_events().iter().map(|e| e.seq).collect();
        assert_eq!(lifecycle, vec![1, 3]);
    }

    #[tokio::test]
    async fn since_replays_identical_subsequences() {
        let log = EventLog::new("t");
        for i in 0..10 {
            if i % 2 == 0 {
                log.publish(Event::service(EventType::ServiceStarting, format!("s{i}")));
            } else {
                log.publish(log_line("s", "x"));
            }
        }
        let all = log.events();
        let from_4 = log.since(4);
        assert_eq!(from_4.len(), 6);
        assert_eq!(
            all[4..].iter().map(|e| e.seq).collect::<Vec<_>>(),
            from_4.iter().map(|e| e.seq).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn wait_for_sees_history_and_future() {
        let log = EventLog::new("t");
        log.publish(Event::service(EventType::ServiceReady, "db"));

        let cancel = CancellationToken::new();
        // Already-published event is found without waiting.
        let found = log
            .wait_for(&cancel, |e| {
                e.kind == EventType::ServiceReady && e.service.as_deref() == Some("db")
            })
            .await
            .unwrap();
        assert_eq!(found.seq, 1);

        // A future event wakes the waiter.
        let log2 = Arc::clone(&log);
        let waiter = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            log2.wait_for(&cancel, |e| {
                e.kind == EventType::ServiceReady && e.service.as_deref() == Some("api")
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.publish(Event::service(EventType::ServiceReady, "api"));
        let found = waiter.await.unwrap().unwrap();
        assert_eq!(found.service.as_deref(), Some("api"));
    }

    #[tokio::test]
    async fn wait_for_ignores_log_lines() {
        let log = EventLog::new("t");
        log.publish(log_line("db", "ready")); // red herring

        let cancel = CancellationToken::new();
        let waiter = {
            let log = Arc::clone(&log);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                log.wait_for(&cancel, |e| e.kind == EventType::ServiceReady)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        cancel.cancel();
        assert!(waiter.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn subscribe_replays_then_streams() {
        let log = EventLog::new("t");
        log.publish(Event::service(EventType::ServiceStarting, "a"));
        log.publish(Event::service(EventType::ServiceHealthy, "a"));

        let cancel = CancellationToken::new();
        let mut rx = log.subscribe(cancel.clone(), 0, None);
        assert_eq!(rx.recv().await.unwrap().seq, 1);
        assert_eq!(rx.recv().await.unwrap().seq, 2);

        log.publish(Event::service(EventType::ServiceReady, "a"));
        assert_eq!(rx.recv().await.unwrap().seq, 3);

        cancel.cancel();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_drops_but_publisher_never_blocks() {
        let log = EventLog::new("t");
        let cancel = CancellationToken::new();
        let mut rx = log.subscribe(cancel.clone(), 0, None);

        // Way beyond the subscriber buffer, published without any reader.
        for i in 0..(SUBSCRIBER_BUFFER * 4) {
            log.publish(log_line("s", &format!("line {i}")));
        }
        // Let the forwarder finish its pass: it advances past events it
        // cannot deliver, so the overflow is dropped for good.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let mut received = 0usize;
        while let Ok(event) = rx.try_recv() {
            assert!(event.seq > 0);
            received += 1;
        }
        assert!(received <= SUBSCRIBER_BUFFER, "received {received}");
        assert!(received > 0);
        // The dropped suffix stays recoverable through replay.
        assert_eq!(log.since(0).len(), SUBSCRIBER_BUFFER * 4);
        cancel.cancel();
    }

    #[tokio::test]
    async fn service_log_tail_filters_and_limits() {
        let log = EventLog::new("t");
        for i in 0..5 {
            log.publish(log_line("a", &format!("a{i}")));
            log.publish(log_line("b", &format!("b{i}")));
        }
        let tail = log.service_log_tail("a", 3);
        assert_eq!(tail.len(), 3);
        let lines: Vec<&str> = tail
            .iter()
            .map(|e| e.line.as_ref().unwrap().line.as_str())
            .collect();
        assert_eq!(lines, vec!["a2", "a3", "a4"]);
    }
}
