//! Single-slot blocking handoff between independently scheduled tasks
//!
//! A rendezvous requires sender and receiver to be present simultaneously:
//! [`RendezvousChannel::send`] does not return until a receiver has taken the
//! value *and* finished processing it, which gives the sender back-pressure
//! and a completion guarantee. There is no internal queue.

use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// A single-slot, cancellable handoff channel.
///
/// Sends are strictly serialized: a second `send` is not matched before the
/// first has been received and fully processed. [`cancel`](Self::cancel) is
/// terminal; it fails every blocked and future operation with
/// [`Error::Cancelled`]. Cloning the handle shares the same channel.
pub struct RendezvousChannel<E> {
    shared: Arc<Shared<E>>,
}

struct Shared<E> {
    slot: Mutex<Option<Offer<E>>>,
    /// Wakes a receiver when an offer lands in the slot.
    offer_ready: Notify,
    /// Serializes senders in FIFO order.
    send_gate: tokio::sync::Mutex<()>,
    /// Serializes receivers so exactly one can match an offer at a time.
    recv_gate: tokio::sync::Mutex<()>,
    cancelled: CancellationToken,
}

struct Offer<E> {
    value: E,
    /// Completed once the receiver's handler has returned.
    done: oneshot::Sender<()>,
}

impl<E> RendezvousChannel<E> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                offer_ready: Notify::new(),
                send_gate: tokio::sync::Mutex::new(()),
                recv_gate: tokio::sync::Mutex::new(()),
                cancelled: CancellationToken::new(),
            }),
        }
    }

    /// Offers `value` and suspends until a receiver has taken it and its
    /// handler has completed.
    pub async fn send(&self, value: E) -> Result<()> {
        let shared = &self.shared;
        if shared.cancelled.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _permit = tokio::select! {
            _ = shared.cancelled.cancelled() => return Err(Error::Cancelled),
            permit = shared.send_gate.lock() => permit,
        };

        let (done_tx, done_rx) = oneshot::channel();
        {
            let mut slot = shared.slot.lock().unwrap();
            debug_assert!(slot.is_none(), "send gate admitted two offers");
            *slot = Some(Offer {
                value,
                done: done_tx,
            });
        }
        // If this send is abandoned before the handoff completes, the offer
        // must not linger for a later receiver.
        let mut withdraw = WithdrawOnDrop {
            shared: shared.as_ref(),
            armed: true,
        };
        shared.offer_ready.notify_one();

        let result = tokio::select! {
            _ = shared.cancelled.cancelled() => Err(Error::Cancelled),
            outcome = done_rx => match outcome {
                Ok(()) => Ok(()),
                // Receiver vanished mid-handoff (its task was cancelled).
                Err(_) => Err(Error::Cancelled),
            },
        };
        if result.is_ok() {
            withdraw.armed = false;
        }
        result
    }

    /// Suspends until a value is offered, invokes `handler` on it, and
    /// unblocks the sender only after the handler returns.
    ///
    /// Cancelling the channel while a handler is already running does not
    /// interrupt the handler; it finishes on its own schedule.
    pub async fn receive<R, F, Fut>(&self, handler: F) -> Result<R>
    where
        F: FnOnce(E) -> Fut,
        Fut: Future<Output = R>,
    {
        let shared = &self.shared;
        if shared.cancelled.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let _permit = tokio::select! {
            _ = shared.cancelled.cancelled() => return Err(Error::Cancelled),
            permit = shared.recv_gate.lock() => permit,
        };

        let offer = loop {
            // Register interest before checking the slot so a notify between
            // the check and the await is not lost.
            let notified = shared.offer_ready.notified();
            if let Some(offer) = shared.slot.lock().unwrap().take() {
                break offer;
            }
            tokio::select! {
                _ = shared.cancelled.cancelled() => return Err(Error::Cancelled),
                _ = notified => {}
            }
        };

        let result = handler(offer.value).await;
        let _ = offer.done.send(());
        Ok(result)
    }

    /// Fails every blocked and future send/receive with [`Error::Cancelled`].
    pub fn cancel(&self) {
        self.shared.cancelled.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.is_cancelled()
    }
}

impl<E> Default for RendezvousChannel<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for RendezvousChannel<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<E> std::fmt::Debug for RendezvousChannel<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RendezvousChannel")
            .field("cancelled", &self.shared.cancelled.is_cancelled())
            .finish()
    }
}

struct WithdrawOnDrop<'a, E> {
    shared: &'a Shared<E>,
    armed: bool,
}

impl<E> Drop for WithdrawOnDrop<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            // Harmless if the receiver already took the offer: the slot is
            // empty and no other sender can have refilled it while the send
            // gate is still held.
            self.shared.slot.lock().unwrap().take();
        }
    }
}
