//! TCP port allocation for tenant backends.
//!
//! Ports are handed out from a fixed, configured range. A port is only
//! considered free if we can actually bind a listening socket on it; the
//! socket is closed again immediately, which leaves a small window where
//! another process can steal the port before the backend binds it. The
//! window is accepted, see DESIGN.md.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no available ports in range {start}..={end}")]
    Exhausted { start: u16, end: u16 },
}

struct AllocatorState {
    start: u16,
    range: u16,
    allocated: HashMap<u16, ()>,
}

/// Mutex-guarded table of allocated ports. Entries exist only while the
/// owning [`WebApp`](crate::tenant::WebApp) is alive.
pub struct PortAllocator {
    state: Mutex<AllocatorState>,
}

impl PortAllocator {
    pub fn new(start: u16, range: u16) -> Self {
        PortAllocator {
            state: Mutex::new(AllocatorState {
                start,
                range,
                allocated: HashMap::new(),
            }),
        }
    }

    /// Scan the range in order and return the first port that is neither
    /// allocated by us nor bound by another process.
    pub fn allocate(&self) -> Result<u16, PortError> {
        let mut state = self.state.lock().unwrap();
        let end = state.start.saturating_add(state.range);
        for port in state.start..=end {
            if state.allocated.contains_key(&port) {
                continue;
            }
            // Confirm availability by binding a listener and dropping it.
            if TcpListener::bind(("0.0.0.0", port)).is_err() {
                debug!(port, "port is in use by another process, skipping");
                continue;
            }
            state.allocated.insert(port, ());
            debug!(port, "allocated port");
            return Ok(port);
        }
        Err(PortError::Exhausted {
            start: state.start,
            end,
        })
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        if self.state.lock().unwrap().allocated.remove(&port).is_some() {
            debug!(port, "released port");
        }
    }

    /// Adopt a new range on config reload. Ports already allocated outside
    /// the new range stay allocated until released.
    pub fn update_range(&self, start: u16, range: u16) {
        let mut state = self.state.lock().unwrap();
        state.start = start;
        state.range = range;
    }

    #[cfg(test)]
    pub(crate) fn allocated_count(&self) -> usize {
        self.state.lock().unwrap().allocated.len()
    }
}
