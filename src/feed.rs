//! # Change Feed & Subscriptions
//!
//! Every accepted mutation is published here after it is persisted. One
//! background task drains the feed and hands each record to every
//! subscriber, in revision order.
//!
//! ```text
//!  writers (inside the gate)
//!        │ reserve slot, persist, send
//!        ▼
//!  ┌───────────────────────┐
//!  │ bounded mpsc (1024)   │  full ⇒ writers wait
//!  └───────────┬───────────┘
//!              ▼
//!  ┌───────────────────────┐
//!  │ drain task            │  awaits each subscriber in turn
//!  └──┬─────────┬──────────┘
//!     ▼         ▼
//!  ┌──────┐  ┌──────┐
//!  │sub 1 │  │sub N │   bounded per-subscriber buffers
//!  └──────┘  └──────┘
//! ```
//!
//! ## No Loss, Real Backpressure
//!
//! Nothing is ever dropped. The drain waits for a slow subscriber instead of
//! skipping it, the feed fills up behind it, and eventually writers block
//! when they try to reserve a slot. A stalled watcher therefore throttles
//! the whole store; drop subscriptions you no longer read.
//!
//! Closed subscribers are pruned the first time a send to them fails.
//!
//! ## Catch-Up
//!
//! [`CatchUpSubscription`] starts with a replayed backlog and then switches to
//! a live [`Subscription`] that was registered *before* the replay was read.
//! Live records at or below the last replayed revision are skipped, so the
//! handoff has neither gaps nor duplicates.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::types::{KeyPattern, KeyValue, Revision};

// =============================================================================
// Feed
// =============================================================================

#[derive(Clone)]
struct Subscriber {
    tx: mpsc::Sender<KeyValue>,
    filter: Option<KeyPattern>,
}

impl Subscriber {
    fn wants(&self, record: &KeyValue) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |pattern| pattern.matches(&record.key))
    }
}

type SubscriberList = Arc<Mutex<Vec<Subscriber>>>;

/// The bounded queue plus its fan-out task.
pub(crate) struct ChangeFeed {
    publisher: mpsc::Sender<KeyValue>,
    subscribers: SubscriberList,
    subscriber_buffer: usize,
    shutdown: CancellationToken,
}

impl ChangeFeed {
    /// Creates the feed and spawns its drain task. The task stops when
    /// `shutdown` is cancelled or every publisher is dropped; either way all
    /// subscriptions then end.
    pub(crate) fn spawn(
        capacity: usize,
        subscriber_buffer: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (publisher, rx) = mpsc::channel(capacity);
        let subscribers: SubscriberList = Arc::new(Mutex::new(Vec::new()));

        let handle = tokio::spawn(drain(rx, Arc::clone(&subscribers), shutdown.clone()));

        let feed = Self {
            publisher,
            subscribers,
            subscriber_buffer,
            shutdown,
        };
        (feed, handle)
    }

    /// A sender writers reserve slots on.
    pub(crate) fn publisher(&self) -> mpsc::Sender<KeyValue> {
        self.publisher.clone()
    }

    /// Registers a live subscriber. Records published after this call are
    /// delivered; nothing earlier is.
    pub(crate) fn subscribe(&self, filter: Option<KeyPattern>) -> Result<Subscription> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Closed);
        }

        let (tx, rx) = mpsc::channel(self.subscriber_buffer);
        let mut subscribers = self
            .subscribers
            .lock()
            .map_err(|_| Error::Internal("subscriber list lock poisoned".to_string()))?;
        subscribers.push(Subscriber { tx, filter });

        debug!(subscribers = subscribers.len(), "subscriber registered");
        Ok(Subscription { rx })
    }

    /// Subscribers currently registered, including any closed but not yet
    /// pruned.
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

fn snapshot(subscribers: &SubscriberList) -> Vec<Subscriber> {
    subscribers
        .lock()
        .map(|list| list.clone())
        .unwrap_or_default()
}

async fn drain(
    mut rx: mpsc::Receiver<KeyValue>,
    subscribers: SubscriberList,
    shutdown: CancellationToken,
) {
    'feed: loop {
        let record = tokio::select! {
            biased;
            record = rx.recv() => match record {
                Some(record) => record,
                None => break 'feed,
            },
            _ = shutdown.cancelled() => break 'feed,
        };

        trace!(key = %record.key, revision = %record.revision, "fanning out");

        let mut saw_closed = false;
        for subscriber in snapshot(&subscribers) {
            if !subscriber.wants(&record) {
                continue;
            }

            let delivered = tokio::select! {
                biased;
                sent = subscriber.tx.send(record.clone()) => sent.is_ok(),
                _ = shutdown.cancelled() => break 'feed,
            };
            if !delivered {
                saw_closed = true;
            }
        }

        if saw_closed {
            if let Ok(mut list) = subscribers.lock() {
                list.retain(|s| !s.tx.is_closed());
                debug!(subscribers = list.len(), "pruned closed subscribers");
            }
        }
    }

    // Dropping the senders ends every subscription.
    if let Ok(mut list) = subscribers.lock() {
        list.clear();
    }
    debug!("change feed stopped");
}

// =============================================================================
// Subscription
// =============================================================================

/// A live stream of accepted mutations, in revision order.
///
/// Ends (yields `None`) when the store closes.
///
/// # Example
///
/// ```rust,ignore
/// let mut sub = store.subscribe_pattern("config/%")?;
/// while let Some(record) = sub.next().await {
///     println!("{} -> rev {}", record.key, record.revision);
/// }
/// ```
pub struct Subscription {
    rx: mpsc::Receiver<KeyValue>,
}

impl Subscription {
    /// Waits for the next record. `None` once the feed has stopped.
    pub async fn next(&mut self) -> Option<KeyValue> {
        self.rx.recv().await
    }

    /// Like [`Subscription::next`], with closure reported as
    /// `Error::SubscriptionClosed`.
    pub async fn recv(&mut self) -> Result<KeyValue> {
        self.rx.recv().await.ok_or(Error::SubscriptionClosed)
    }

    /// Returns a buffered record without waiting, if there is one.
    pub fn try_next(&mut self) -> Option<KeyValue> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = KeyValue;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

// =============================================================================
// Catch-Up Subscription
// =============================================================================

/// Replayed history followed by live records, without gaps or duplicates.
pub struct CatchUpSubscription {
    backlog: VecDeque<KeyValue>,
    replayed_through: Revision,
    live: Subscription,
}

impl CatchUpSubscription {
    /// `live` must have been registered before `backlog` was read, and
    /// `replayed_through` is the revision the backlog was read at.
    pub(crate) fn new(backlog: Vec<KeyValue>, replayed_through: Revision, live: Subscription) -> Self {
        Self {
            backlog: backlog.into(),
            replayed_through,
            live,
        }
    }

    /// Waits for the next record: backlog first, then live.
    pub async fn next(&mut self) -> Option<KeyValue> {
        if let Some(record) = self.backlog.pop_front() {
            return Some(record);
        }

        loop {
            let record = self.live.next().await?;
            if record.revision > self.replayed_through {
                return Some(record);
            }
        }
    }

    /// True once the backlog has been fully delivered.
    pub fn is_live(&self) -> bool {
        self.backlog.is_empty()
    }

    /// Revision the backlog was replayed through.
    pub fn replayed_through(&self) -> Revision {
        self.replayed_through
    }
}

impl Stream for CatchUpSubscription {
    type Item = KeyValue;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(record) = self.backlog.pop_front() {
            return Poll::Ready(Some(record));
        }

        loop {
            match Pin::new(&mut self.live).poll_next(cx) {
                Poll::Ready(Some(record)) if record.revision <= self.replayed_through => continue,
                other => return other,
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
