//! Data stream pool
//!
//! The pool owns a fixed number of slots, one per configured data stream. Each slot is in exactly
//! one [`SlotState`]; idle connections wait in a queue that the scheduler pulls from with
//! [`StreamPool::acquire_idle_stream`]. Slots start out `Reconnecting { attempt: 0 }` so the
//! initial connections go through the same path as reconnects.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy { chunk: Option<u64> },
    Reconnecting { attempt: u32 },
    Dead { reason: String },
}

/// A connection checked out of the pool. Dropping it closes the connection.
#[derive(Debug)]
pub struct StreamHandle<S> {
    pub id: u32,
    pub conn: S,
    pub assigned: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamOutcome {
    Healthy,
    Dead(String),
}

/// What became of a released or failed slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Released {
    Idle,
    /// The caller should reconnect slot `id`; `attempt` counts reconnects of this slot
    Reconnect { id: u32, attempt: u32 },
    /// The slot is permanently out of service
    Retired,
}

#[derive(Debug, thiserror::Error)]
#[error("no data streams left")]
pub struct PoolExhausted;

#[derive(Debug)]
struct Slots {
    states: Vec<SlotState>,
    reconnects: Vec<u32>,
}

#[derive(Debug)]
pub struct StreamPool<S> {
    slots: std::sync::Mutex<Slots>,
    idle_tx: async_channel::Sender<StreamHandle<S>>,
    idle_rx: async_channel::Receiver<StreamHandle<S>>,
    max_reconnects: u32,
}

impl<S> StreamPool<S> {
    pub fn new(stream_count: u32, max_reconnects: u32) -> Self {
        let (idle_tx, idle_rx) = async_channel::unbounded();
        let count = stream_count as usize;
        Self {
            slots: std::sync::Mutex::new(Slots {
                states: vec![SlotState::Reconnecting { attempt: 0 }; count],
                reconnects: vec![0; count],
            }),
            idle_tx,
            idle_rx,
            max_reconnects,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Slots waiting for a connection, as `(id, attempt)`.
    pub fn pending_connects(&self) -> Vec<(u32, u32)> {
        self.lock()
            .states
            .iter()
            .enumerate()
            .filter_map(|(id, state)| match state {
                SlotState::Reconnecting { attempt } => Some((id as u32, *attempt)),
                _ => None,
            })
            .collect()
    }

    /// Waits for an idle stream. Fails once every slot is dead.
    ///
    /// Cancel-safe: a handle is either returned or stays queued.
    pub async fn acquire_idle_stream(&self) -> Result<StreamHandle<S>, PoolExhausted> {
        let handle = self.idle_rx.recv().await.map_err(|_| PoolExhausted)?;
        if let Some(state) = self.lock().states.get_mut(handle.id as usize) {
            *state = SlotState::Busy { chunk: None };
        }
        Ok(handle)
    }

    /// Records that `handle` now carries `chunk`.
    pub fn assign(&self, handle: &mut StreamHandle<S>, chunk: u64) {
        handle.assigned = Some(chunk);
        if let Some(state) = self.lock().states.get_mut(handle.id as usize) {
            *state = SlotState::Busy { chunk: Some(chunk) };
        }
    }

    /// Returns a handle to the pool. A dead handle is dropped, closing its connection, and the
    /// slot is scheduled for reconnection while its reconnect budget lasts.
    pub fn release(&self, mut handle: StreamHandle<S>, outcome: StreamOutcome) -> Released {
        let id = handle.id;
        match outcome {
            StreamOutcome::Healthy => {
                handle.assigned = None;
                if let Some(state) = self.lock().states.get_mut(id as usize) {
                    *state = SlotState::Idle;
                }
                match self.idle_tx.try_send(handle) {
                    Ok(()) => Released::Idle,
                    Err(_) => {
                        tracing::debug!("stream {id} released after the pool was closed");
                        self.retire(id, "pool closed");
                        Released::Retired
                    }
                }
            }
            StreamOutcome::Dead(reason) => {
                drop(handle);
                self.schedule_reconnect(id, reason)
            }
        }
    }

    /// A connection attempt for slot `id` failed.
    pub fn connect_failed(&self, id: u32, reason: String) -> Released {
        self.schedule_reconnect(id, reason)
    }

    fn schedule_reconnect(&self, id: u32, reason: String) -> Released {
        let mut slots = self.lock();
        let Some(used) = slots.reconnects.get(id as usize).copied() else {
            return Released::Retired;
        };
        if used < self.max_reconnects {
            let attempt = used + 1;
            slots.reconnects[id as usize] = attempt;
            slots.states[id as usize] = SlotState::Reconnecting { attempt };
            tracing::info!("stream {id} lost ({reason}), reconnect attempt {attempt}");
            Released::Reconnect { id, attempt }
        } else {
            drop(slots);
            tracing::warn!("stream {id} retired: {reason}");
            self.retire(id, &reason);
            Released::Retired
        }
    }

    /// Puts a (re)connected stream into service.
    pub fn restore(&self, id: u32, conn: S) {
        {
            let mut slots = self.lock();
            match slots.states.get_mut(id as usize) {
                Some(state) if matches!(state, SlotState::Reconnecting { .. }) => {
                    *state = SlotState::Idle
                }
                _ => {
                    tracing::debug!("ignoring connection for slot {id} which is not reconnecting");
                    return;
                }
            }
        }
        let handle = StreamHandle {
            id,
            conn,
            assigned: None,
        };
        if self.idle_tx.try_send(handle).is_err() {
            self.retire(id, "pool closed");
        }
    }

    /// Takes slot `id` permanently out of service.
    pub fn retire(&self, id: u32, reason: &str) {
        let all_dead = {
            let mut slots = self.lock();
            if let Some(state) = slots.states.get_mut(id as usize) {
                *state = SlotState::Dead {
                    reason: reason.to_string(),
                };
            }
            slots
                .states
                .iter()
                .all(|state| matches!(state, SlotState::Dead { .. }))
        };
        if all_dead {
            self.idle_tx.close();
        }
    }

    /// Streams that are connected: idle or carrying a chunk.
    pub fn live_streams(&self) -> usize {
        self.lock()
            .states
            .iter()
            .filter(|state| matches!(state, SlotState::Idle | SlotState::Busy { .. }))
            .count()
    }

    /// Streams that may still carry data: live or reconnecting.
    pub fn usable_streams(&self) -> usize {
        self.lock()
            .states
            .iter()
            .filter(|state| !matches!(state, SlotState::Dead { .. }))
            .count()
    }

    pub fn retired_streams(&self) -> usize {
        self.lock()
            .states
            .iter()
            .filter(|state| matches!(state, SlotState::Dead { .. }))
            .count()
    }

    /// Total reconnect attempts made across all slots.
    pub fn reconnects(&self) -> u64 {
        self.lock().reconnects.iter().map(|n| u64::from(*n)).sum()
    }

    #[cfg(test)]
    fn slot_states(&self) -> Vec<SlotState> {
        self.lock().states.clone()
    }

    /// Closes the pool and hands back all idle connections for an orderly shutdown.
    pub fn close(&self) -> Vec<StreamHandle<S>> {
        self.idle_tx.close();
        let mut idle = Vec::new();
        while let Ok(handle) = self.idle_rx.try_recv() {
            idle.push(handle);
        }
        idle
    }
}
