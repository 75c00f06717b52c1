//! Serialized one-to-many event delivery with bounded replay
//!
//! [`BroadcastBus`] delivers each emitted value to every currently-subscribed
//! consumer and does not admit the next emission until the previous one has
//! been fully processed by all of them. Late subscribers first receive up to
//! `replay_capacity` of the most recent past values, then live ones.
//!
//! Delivery to each subscriber is a rendezvous handoff, which is what makes
//! an emission a completion barrier rather than a fire-and-forget: a slow
//! subscriber delays the emitter, never the other way around.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::Result;
use crate::sync::rendezvous::RendezvousChannel;

/// A multicast event bus with serialized emissions.
///
/// Cloning the handle shares the same bus.
pub struct BroadcastBus<E> {
    inner: Arc<BusInner<E>>,
}

struct BusInner<E> {
    state: Mutex<BusState<E>>,
    /// Serializes emitters so emissions can never interleave.
    emit_gate: tokio::sync::Mutex<()>,
    replay_capacity: usize,
}

struct BusState<E> {
    subscribers: Vec<SubscriberEntry<E>>,
    replay: VecDeque<E>,
    closed: bool,
    next_id: u64,
}

struct SubscriberEntry<E> {
    id: u64,
    channel: RendezvousChannel<E>,
}

impl<E: Clone + Send + 'static> BroadcastBus<E> {
    /// A bus without a replay buffer: late subscribers only see live values.
    pub fn new() -> Self {
        Self::with_replay(0)
    }

    /// A bus that replays up to `replay_capacity` of the most recent values
    /// to each new subscriber.
    pub fn with_replay(replay_capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                state: Mutex::new(BusState {
                    subscribers: Vec::new(),
                    replay: VecDeque::new(),
                    closed: false,
                    next_id: 0,
                }),
                emit_gate: tokio::sync::Mutex::new(()),
                replay_capacity,
            }),
        }
    }

    /// Delivers `value` to every subscriber registered when the emission
    /// starts, returning only once each of them has taken it.
    ///
    /// With no subscribers (or after [`close`](Self::close)) this is a no-op
    /// that returns immediately; the value still lands in the replay buffer
    /// while the bus is open.
    pub async fn emit(&self, value: E) -> Result<()> {
        let _serialized = self.inner.emit_gate.lock().await;

        let targets = {
            let mut state = self.inner.state.lock().unwrap();
            if state.closed {
                return Ok(());
            }
            if self.inner.replay_capacity > 0 {
                if state.replay.len() == self.inner.replay_capacity {
                    state.replay.pop_front();
                }
                state.replay.push_back(value.clone());
            }
            state
                .subscribers
                .iter()
                .map(|entry| (entry.id, entry.channel.clone()))
                .collect::<Vec<_>>()
        };

        for (id, channel) in targets {
            if let Err(error) = channel.send(value.clone()).await {
                if error.is_cancelled() {
                    // The subscription was dropped or the bus closed while we
                    // were delivering; it no longer counts toward the barrier.
                    debug!(subscriber = id, "dropping cancelled subscriber");
                    self.remove_subscriber(id);
                } else {
                    return Err(error);
                }
            }
        }
        Ok(())
    }

    /// Registers a new subscriber and returns its lazy value sequence.
    pub fn subscribe(&self) -> Subscription<E> {
        let channel = RendezvousChannel::new();
        let (id, pending) = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.next_id;
            state.next_id += 1;
            if state.closed {
                // A subscription against a closed bus terminates immediately.
                channel.cancel();
                (id, VecDeque::new())
            } else {
                state.subscribers.push(SubscriberEntry {
                    id,
                    channel: channel.clone(),
                });
                (id, state.replay.iter().cloned().collect())
            }
        };
        Subscription {
            bus: Arc::clone(&self.inner),
            id,
            channel,
            pending,
        }
    }

    /// Cancels every active subscription and turns later emits into no-ops.
    pub fn close(&self) {
        let subscribers = {
            let mut state = self.inner.state.lock().unwrap();
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        for entry in subscribers {
            entry.channel.cancel();
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.state.lock().unwrap().subscribers.len()
    }

    fn remove_subscriber(&self, id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        state.subscribers.retain(|entry| entry.id != id);
    }
}

impl<E: Clone + Send + 'static> Default for BroadcastBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for BroadcastBus<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> std::fmt::Debug for BroadcastBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock().unwrap();
        f.debug_struct("BroadcastBus")
            .field("subscribers", &state.subscribers.len())
            .field("replayed", &state.replay.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// A lazy, cancellable sequence of broadcast values.
///
/// Dropping the subscription removes it from the bus without blocking
/// in-flight or future emissions.
pub struct Subscription<E> {
    bus: Arc<BusInner<E>>,
    id: u64,
    channel: RendezvousChannel<E>,
    /// Replayed values, delivered before any live value.
    pending: VecDeque<E>,
}

impl<E: Clone + Send + 'static> Subscription<E> {
    /// Returns the next value, replayed values first. Fails with
    /// [`crate::Error::Cancelled`] once the bus is closed.
    pub async fn recv(&mut self) -> Result<E> {
        if let Some(value) = self.pending.pop_front() {
            return Ok(value);
        }
        self.channel.receive(|value| async move { value }).await
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.channel.cancel();
        let mut state = self.bus.state.lock().unwrap();
        state.subscribers.retain(|entry| entry.id != self.id);
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::time::{sleep, timeout};

    use crate::error::Error;

    #[tokio::test]
    async fn emit_without_subscribers_returns_immediately() {
        let bus: BroadcastBus<u32> = BroadcastBus::new();
        timeout(Duration::from_millis(50), bus.emit(1))
            .await
            .expect("emit with no subscribers must not block")
            .unwrap();
    }

    #[tokio::test]
    async fn every_subscriber_sees_the_same_ordered_sequence() {
        let bus: BroadcastBus<u32> = BroadcastBus::new();

        let mut collectors = Vec::new();
        for _ in 0..4 {
            let mut subscription = bus.subscribe();
            collectors.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..10 {
                    seen.push(subscription.recv().await.unwrap());
                }
                seen
            }));
        }

        for value in 0..10 {
            bus.emit(value).await.unwrap();
        }

        let expected: Vec<u32> = (0..10).collect();
        for collector in collectors {
            assert_eq!(collector.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn emit_waits_for_a_slow_subscriber() {
        let bus: BroadcastBus<u32> = BroadcastBus::new();
        let mut subscription = bus.subscribe();

        // Nobody is receiving yet, so the emission barrier cannot complete.
        let pending = {
            let bus = bus.clone();
            timeout(Duration::from_millis(50), bus.emit(5)).await
        };
        assert!(pending.is_err(), "emit returned before delivery completed");

        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(5).await })
        };
        assert_eq!(subscription.recv().await.unwrap(), 5);
        emitter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn late_subscribers_get_replayed_values_first() {
        let bus: BroadcastBus<u32> = BroadcastBus::with_replay(2);

        bus.emit(1).await.unwrap();
        bus.emit(2).await.unwrap();
        bus.emit(3).await.unwrap();

        let mut late = bus.subscribe();
        // Capacity 2: the oldest emission fell out of the buffer.
        assert_eq!(late.recv().await.unwrap(), 2);
        assert_eq!(late.recv().await.unwrap(), 3);

        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(4).await })
        };
        assert_eq!(late.recv().await.unwrap(), 4);
        emitter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_cancels_subscriptions_and_silences_emit() {
        let bus: BroadcastBus<u32> = BroadcastBus::new();
        let mut subscription = bus.subscribe();

        let blocked = tokio::spawn(async move { subscription.recv().await });
        sleep(Duration::from_millis(10)).await;
        bus.close();

        assert!(matches!(blocked.await.unwrap(), Err(Error::Cancelled)));

        // Emissions after close are documented no-ops.
        timeout(Duration::from_millis(50), bus.emit(9))
            .await
            .expect("emit after close must not block")
            .unwrap();

        let mut after_close = bus.subscribe();
        assert!(matches!(after_close.recv().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn a_dropped_subscription_does_not_stall_the_emitter() {
        let bus: BroadcastBus<u32> = BroadcastBus::new();
        let mut live = bus.subscribe();
        let dead = bus.subscribe();
        drop(dead);

        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(11).await })
        };
        assert_eq!(live.recv().await.unwrap(), 11);
        emitter.await.unwrap().unwrap();
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn a_subscription_dropped_mid_emission_is_removed() {
        let bus: BroadcastBus<u32> = BroadcastBus::new();
        let first = bus.subscribe();
        let mut second = bus.subscribe();

        let emitter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(13).await })
        };
        // The emitter is blocked handing off to the first subscriber; drop it.
        sleep(Duration::from_millis(10)).await;
        drop(first);

        assert_eq!(second.recv().await.unwrap(), 13);
        emitter.await.unwrap().unwrap();
        assert_eq!(bus.subscriber_count(), 1);
    }
}
