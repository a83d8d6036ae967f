use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::{AgentError, Result};

/// Identity of one engine as seen by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineKey {
    pub max_frame_size: usize,
    pub engine_id: String,
    pub conn_id: u64,
}

#[derive(Default)]
struct RegistryState {
    active: HashMap<EngineKey, usize>,
    by_conn: HashMap<u64, EngineKey>,
}

/// Active stream counters per engine, shared by all connections of an agent.
///
/// A stream counts as active from the moment its NOTIFY is dispatched until
/// its ACK is written or it is aborted.
pub struct EngineRegistry {
    state: Mutex<RegistryState>,
    max_streams: Option<usize>,
}

impl EngineRegistry {
    /// `max_streams` caps the active streams of one engine; `None` = unbounded.
    pub fn new(max_streams: Option<usize>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            max_streams,
        }
    }

    /// Record the engine of a connection.
    ///
    /// Registering the same engine again is a no-op. A different engine id
    /// for an already registered connection is a protocol violation.
    pub fn register(&self, key: EngineKey) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(existing) = state.by_conn.get(&key.conn_id) {
            if existing.engine_id != key.engine_id {
                return Err(AgentError::EngineChanged {
                    conn_id: key.conn_id,
                    previous: existing.engine_id.clone(),
                    current: key.engine_id,
                });
            }
            return Ok(());
        }
        state.by_conn.insert(key.conn_id, key.clone());
        state.active.insert(key, 0);
        Ok(())
    }

    /// Count one more active stream, or refuse it at the ceiling.
    pub fn begin_stream(&self, conn_id: u64) -> Result<()> {
        let mut state = self.state.lock();
        let RegistryState { active, by_conn } = &mut *state;
        let Some(key) = by_conn.get(&conn_id) else {
            return Err(AgentError::ProtocolViolation(format!(
                "connection {conn_id} has no registered engine"
            )));
        };
        let count = active.entry(key.clone()).or_insert(0);
        if let Some(limit) = self.max_streams {
            if *count >= limit {
                return Err(AgentError::CapacityExceeded {
                    engine_id: key.engine_id.clone(),
                    limit,
                });
            }
        }
        *count += 1;
        Ok(())
    }

    pub fn end_stream(&self, conn_id: u64) {
        let mut state = self.state.lock();
        let RegistryState { active, by_conn } = &mut *state;
        if let Some(count) = by_conn.get(&conn_id).and_then(|key| active.get_mut(key)) {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop a connection's entry. Returns the streams still counted active.
    pub fn unregister(&self, conn_id: u64) -> usize {
        let mut state = self.state.lock();
        match state.by_conn.remove(&conn_id) {
            Some(key) => state.active.remove(&key).unwrap_or(0),
            None => 0,
        }
    }

    pub fn active_streams(&self, conn_id: u64) -> usize {
        let state = self.state.lock();
        state
            .by_conn
            .get(&conn_id)
            .and_then(|key| state.active.get(key))
            .copied()
            .unwrap_or(0)
    }

    /// Number of registered engines.
    pub fn len(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every engine key with its active stream count.
    pub fn snapshot(&self) -> Vec<(EngineKey, usize)> {
        self.state
            .lock()
            .active
            .iter()
            .map(|(key, count)| (key.clone(), *count))
            .collect()
    }
}

impl Default for EngineRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}
