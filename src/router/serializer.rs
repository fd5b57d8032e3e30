//! One unicast vendor send in flight at a time
//!
//! A unicast send claims the in-flight slot and keeps it until a reply or
//! timeout for the same target arrives, the send fails, or the slot is older
//! than the ceiling and gets reclaimed. Group sends bypass the slot.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::Result;
use crate::mesh::{Address, MeshTransport, OutboundMessage};

/// Serializer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingSend {
    Idle,
    InFlight { target: Address, started: Instant },
}

/// Gate for unicast vendor sends
pub struct SendSerializer {
    transport: Arc<dyn MeshTransport>,
    state: Mutex<PendingSend>,
    settled: Notify,
    ceiling: Duration,
    recheck: Duration,
}

impl SendSerializer {
    #[must_use]
    pub fn new(transport: Arc<dyn MeshTransport>, ceiling: Duration, recheck: Duration) -> Self {
        Self {
            transport,
            state: Mutex::new(PendingSend::Idle),
            settled: Notify::new(),
            ceiling,
            recheck,
        }
    }

    /// Send `message`, waiting for any in-flight unicast send to settle first
    ///
    /// Waits at most the ceiling: an in-flight send older than that is
    /// assumed lost and its slot is taken over.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the message never left this device;
    /// the in-flight slot is released in that case.
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        if !message.dst.is_unicast() {
            return self.transport.send(message).await;
        }

        let target = message.dst;
        loop {
            // Created before the check so a release in between still wakes us
            let settled = self.settled.notified();
            if self.claim(target) {
                break;
            }
            tokio::select! {
                () = settled => {}
                () = tokio::time::sleep(self.recheck) => {}
            }
        }

        self.dispatch(message).await
    }

    /// Send `message` only if nothing is in flight
    ///
    /// Returns `Ok(false)` without sending when the slot is taken. Group
    /// destinations go straight out without touching the slot.
    ///
    /// # Errors
    ///
    /// Returns the transport error if the message never left this device
    pub async fn try_send(&self, message: OutboundMessage) -> Result<bool> {
        if !message.dst.is_unicast() {
            return self.transport.send(message).await.map(|()| true);
        }
        {
            let mut state = self.lock();
            if *state != PendingSend::Idle {
                return Ok(false);
            }
            *state = PendingSend::InFlight {
                target: message.dst,
                started: Instant::now(),
            };
        }
        self.dispatch(message).await.map(|()| true)
    }

    /// A reply arrived from `source`; releases the slot if it was waiting on it
    pub fn on_reply(&self, source: Address) -> bool {
        self.release_if(source)
    }

    /// The transport gave up on `target`; releases the slot if it was waiting on it
    ///
    /// Returns false for timeouts that match nothing in flight, such as the
    /// expected timeout of a group send.
    pub fn on_timeout(&self, target: Address) -> bool {
        self.release_if(target)
    }

    /// The transport reported a send to `target` failed after the request was accepted
    pub fn on_send_failed(&self, target: Address) -> bool {
        self.release_if(target)
    }

    /// Release the slot unconditionally
    pub fn force_clear(&self) {
        let previous = std::mem::replace(&mut *self.lock(), PendingSend::Idle);
        if let PendingSend::InFlight { target, .. } = previous {
            tracing::debug!(%target, "in-flight send force-cleared");
        }
        self.settled.notify_waiters();
    }

    /// Wait up to `max` for the slot to become idle
    ///
    /// Returns whether it did.
    pub async fn wait_idle(&self, max: Duration) -> bool {
        let deadline = Instant::now() + max;
        loop {
            if !self.is_busy() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(self.recheck.min(deadline - now)).await;
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        *self.lock() != PendingSend::Idle
    }

    /// Target of the send in flight, if any
    #[must_use]
    pub fn in_flight(&self) -> Option<Address> {
        match *self.lock() {
            PendingSend::Idle => None,
            PendingSend::InFlight { target, .. } => Some(target),
        }
    }

    #[must_use]
    pub fn state(&self) -> PendingSend {
        *self.lock()
    }

    fn claim(&self, target: Address) -> bool {
        let mut state = self.lock();
        match *state {
            PendingSend::Idle => {}
            PendingSend::InFlight {
                target: stuck,
                started,
            } if started.elapsed() >= self.ceiling => {
                tracing::warn!(
                    %stuck,
                    waited_ms = started.elapsed().as_millis(),
                    "in-flight send exceeded ceiling, reclaiming"
                );
            }
            PendingSend::InFlight { .. } => return false,
        }
        *state = PendingSend::InFlight {
            target,
            started: Instant::now(),
        };
        true
    }

    async fn dispatch(&self, message: OutboundMessage) -> Result<()> {
        let target = message.dst;
        if let Err(e) = self.transport.send(message).await {
            tracing::warn!(%target, error = %e, "send rejected by transport");
            self.release_if(target);
            return Err(e);
        }
        tracing::debug!(%target, "send in flight");
        Ok(())
    }

    fn release_if(&self, target: Address) -> bool {
        let released = {
            let mut state = self.lock();
            match *state {
                PendingSend::InFlight { target: t, .. } if t == target => {
                    *state = PendingSend::Idle;
                    true
                }
                _ => false,
            }
        };
        if released {
            self.settled.notify_waiters();
        }
        released
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PendingSend> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
