//! Periodic status polling of one node

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::serializer::SendSerializer;
use crate::bridge::ResponseBridge;
use crate::mesh::{Address, Opcode, OutboundMessage};

/// Poller state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Idle,
    Armed { target: Address, awaiting_reply: bool },
}

/// Sends `read` to the armed target every interval
///
/// A tick is skipped while the previous poll is unanswered or another
/// unicast send is in flight.
pub struct MonitorPoller {
    state: Arc<Mutex<MonitorState>>,
    serializer: Arc<SendSerializer>,
    bridge: ResponseBridge,
    interval: Duration,
    reply_timeout: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl MonitorPoller {
    #[must_use]
    pub fn new(
        serializer: Arc<SendSerializer>,
        bridge: ResponseBridge,
        interval: Duration,
        reply_timeout: Duration,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(MonitorState::Idle)),
            serializer,
            bridge,
            interval,
            reply_timeout,
            ticker: Mutex::new(None),
        }
    }

    /// Start polling `target`, replacing any previous target
    pub fn arm(&self, target: Address) {
        *lock(&self.state) = MonitorState::Armed {
            target,
            awaiting_reply: false,
        };

        let state = Arc::clone(&self.state);
        let serializer = Arc::clone(&self.serializer);
        let bridge = self.bridge.clone();
        let period = self.interval;
        let reply_timeout = self.reply_timeout;

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                poll_once(&state, &serializer, &bridge, reply_timeout).await;
            }
        });

        if let Some(previous) = lock(&self.ticker).replace(handle) {
            previous.abort();
        }
        tracing::info!(%target, interval_ms = period.as_millis(), "monitor armed");
    }

    /// Stop polling; a poll already sent may still be answered
    pub fn disarm(&self) {
        let previous = std::mem::replace(&mut *lock(&self.state), MonitorState::Idle);
        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
        }
        if let MonitorState::Armed { target, .. } = previous {
            tracing::info!(%target, "monitor disarmed");
        }
    }

    /// A reply or timeout for `source` settles the outstanding poll
    pub fn settle(&self, source: Address) {
        clear_awaiting(&self.state, source);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        matches!(*lock(&self.state), MonitorState::Armed { .. })
    }

    #[must_use]
    pub fn state(&self) -> MonitorState {
        *lock(&self.state)
    }
}

impl Drop for MonitorPoller {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.ticker).take() {
            handle.abort();
        }
    }
}

async fn poll_once(
    state: &Mutex<MonitorState>,
    serializer: &SendSerializer,
    bridge: &ResponseBridge,
    reply_timeout: Duration,
) {
    let target = {
        let mut state = lock(state);
        match &mut *state {
            MonitorState::Armed {
                target,
                awaiting_reply,
            } if !*awaiting_reply => {
                *awaiting_reply = true;
                *target
            }
            _ => return,
        }
    };

    let poll = OutboundMessage {
        dst: target,
        opcode: Opcode::VendorSend,
        payload: b"read".to_vec(),
        timeout: reply_timeout,
    };

    match serializer.try_send(poll).await {
        Ok(true) => tracing::trace!(%target, "monitor poll sent"),
        Ok(false) => {
            tracing::trace!(%target, "send in flight, skipping poll");
            clear_awaiting(state, target);
        }
        Err(e) => {
            tracing::warn!(%target, error = %e, "monitor poll failed");
            clear_awaiting(state, target);
            bridge.status("ERROR:MESH_SEND_FAIL").await;
        }
    }
}

fn clear_awaiting(state: &Mutex<MonitorState>, source: Address) {
    if let MonitorState::Armed {
        target,
        awaiting_reply,
    } = &mut *lock(state)
        && *target == source
    {
        *awaiting_reply = false;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
