//! Per-stream broadcast hub
//!
//! The hub retains every line it has been handed (the capture history) and
//! fans each new line out to live subscribers. Subscriber queues are bounded
//! and a full queue blocks the producer: lines are never dropped.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

/// One captured output line, without its trailing newline.
pub type Line = Vec<u8>;

#[derive(Default)]
struct HubState {
    history: Vec<Line>,
    subscribers: Vec<Sender<Line>>,
    closed: bool,
}

/// Fan-out of a single output stream
#[derive(Default)]
pub struct Hub {
    state: Mutex<HubState>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A hub that is already closed and holds no history.
    pub fn closed() -> Self {
        let hub = Self::new();
        hub.close();
        hub
    }

    /// Subscribes to lines sent from now on.
    pub fn register(&self, buf_size: usize) -> Subscription {
        let mut state = self.state.lock();
        if state.closed {
            return Subscription::closed();
        }
        let (tx, rx) = bounded(buf_size);
        state.subscribers.push(tx);
        Subscription { rx }
    }

    /// Returns the history so far together with a subscription whose first
    /// line is the one right after that history.
    pub fn connect(&self, buf_size: usize) -> (Vec<Line>, Subscription) {
        let mut state = self.state.lock();
        let history = state.history.clone();
        if state.closed {
            return (history, Subscription::closed());
        }
        let (tx, rx) = bounded(buf_size);
        state.subscribers.push(tx);
        (history, Subscription { rx })
    }

    /// Records `line` and delivers it to every live subscriber.
    ///
    /// Blocks while a subscriber's queue is full. Subscribers whose receiving
    /// side is gone are dropped.
    pub fn send(&self, line: Line) {
        let subscribers = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.history.push(line.clone());
            state.subscribers.clone()
        };

        // Deliver outside the lock so a slow subscriber cannot stall readers.
        let mut gone = Vec::new();
        for (idx, tx) in subscribers.iter().enumerate() {
            if tx.send(line.clone()).is_err() {
                gone.push(idx);
            }
        }

        if !gone.is_empty() {
            let mut state = self.state.lock();
            state.subscribers.retain(|tx| {
                !gone
                    .iter()
                    .any(|&idx| subscribers[idx].same_channel(tx))
            });
        }
    }

    /// Marks the hub terminal and ends every subscription.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Copy of the retained lines.
    pub fn history(&self) -> Vec<Line> {
        self.state.lock().history.clone()
    }

    /// Copy of the last `n` retained lines.
    pub fn tail(&self, n: usize) -> Vec<Line> {
        let state = self.state.lock();
        let start = state.history.len().saturating_sub(n);
        state.history[start..].to_vec()
    }

    /// Retained lines joined with a single `\n` between entries.
    pub fn joined(&self) -> Vec<u8> {
        let state = self.state.lock();
        state.history.join(&b'\n')
    }
}

/// Live feed of lines from a [`Hub`]
///
/// Ends (yields `None`) once the hub is closed and the queue is drained.
#[derive(Debug, Clone)]
pub struct Subscription {
    rx: Receiver<Line>,
}

impl Subscription {
    fn closed() -> Self {
        let (_, rx) = bounded(0);
        Subscription { rx }
    }

    /// Blocks until the next line, or `None` when the stream has ended.
    pub fn recv(&self) -> Option<Line> {
        self.rx.recv().ok()
    }

    pub fn try_recv(&self) -> Result<Option<Line>, Closed> {
        match self.rx.try_recv() {
            Ok(line) => Ok(Some(line)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Closed),
        }
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<Line>, Closed> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Ok(Some(line)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(Closed),
        }
    }

    /// The underlying channel, for use with `crossbeam_channel::select!`.
    pub fn receiver(&self) -> &Receiver<Line> {
        &self.rx
    }
}

impl Iterator for Subscription {
    type Item = Line;

    fn next(&mut self) -> Option<Line> {
        self.recv()
    }
}

/// The stream behind a [`Subscription`] has ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Closed;

impl std::fmt::Display for Closed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("subscription closed")
    }
}

impl std::error::Error for Closed {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn line(s: &str) -> Line {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_history_and_joined() {
        let hub = Hub::new();
        hub.send(line("a"));
        hub.send(line("b"));
        assert_eq!(hub.history(), vec![line("a"), line("b")]);
        assert_eq!(hub.joined(), b"a\nb".to_vec());
        assert_eq!(hub.tail(1), vec![line("b")]);
        assert_eq!(hub.tail(10).len(), 2);
        assert!(hub.tail(0).is_empty());
    }

    #[test]
    fn test_register_sees_only_future_lines() {
        let hub = Hub::new();
        hub.send(line("old"));
        let sub = hub.register(4);
        hub.send(line("new"));
        hub.close();
        assert_eq!(sub.collect::<Vec<_>>(), vec![line("new")]);
    }

    #[test]
    fn test_connect_has_no_gap_or_overlap() {
        let hub = Arc::new(Hub::new());
        for i in 0..5 {
            hub.send(line(&i.to_string()));
        }
        let (history, sub) = hub.connect(0);

        let producer = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || {
                for i in 5..10 {
                    hub.send(line(&i.to_string()));
                }
                hub.close();
            })
        };

        let mut all = history;
        all.extend(sub);
        producer.join().unwrap();

        let expected: Vec<Line> = (0..10).map(|i| line(&i.to_string())).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn test_closed_hub_yields_closed_subscription() {
        let hub = Hub::new();
        hub.send(line("x"));
        hub.close();

        let sub = hub.register(1);
        assert_eq!(sub.recv(), None);
        assert_eq!(sub.try_recv(), Err(Closed));

        let (history, sub) = hub.connect(1);
        assert_eq!(history, vec![line("x")]);
        assert_eq!(sub.recv(), None);

        // lines after close are not retained
        hub.send(line("y"));
        assert_eq!(hub.history().len(), 1);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let hub = Hub::new();
        let sub = hub.register(0);
        drop(sub);
        hub.send(line("a"));
        assert!(hub.state.lock().subscribers.is_empty());
    }

    #[test]
    fn test_slow_subscriber_loses_nothing() {
        let hub = Arc::new(Hub::new());
        let sub = hub.register(1);

        let producer = {
            let hub = Arc::clone(&hub);
            thread::spawn(move || {
                for i in 0..50 {
                    hub.send(line(&i.to_string()));
                }
                hub.close();
            })
        };

        let mut received = Vec::new();
        while let Some(l) = sub.recv() {
            thread::sleep(Duration::from_millis(1));
            received.push(l);
        }
        producer.join().unwrap();
        assert_eq!(received.len(), 50);
        assert_eq!(received, hub.history());
    }
}
