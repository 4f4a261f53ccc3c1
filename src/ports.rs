//! Collision-free port leasing for executors on one host.
//!
//! Ports are drawn round-robin from one inclusive range. The cursor only
//! moves forward (wrapping at the end of the range) so a port released a
//! moment ago is the last candidate to be handed out again. Ports are
//! recycled only when [`PortAllocator::release`] is called, never on a timer.

use std::collections::HashMap;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::PortRange;
use crate::error::{MinerError, Result};
use crate::executor::ExecutorId;

/// Who holds a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOwner {
    Executor(ExecutorId),
    /// Bound by a worker left over from a previous run that could not be
    /// reclaimed. Never released during this process lifetime.
    Orphan,
}

#[derive(Debug)]
struct PortPool {
    /// Offset into the range where the next scan starts
    cursor: u32,
    leases: HashMap<u16, LeaseOwner>,
}

#[derive(Debug)]
pub struct PortAllocator {
    range: PortRange,
    probe: bool,
    pool: Mutex<PortPool>,
}

impl PortAllocator {
    /// Allocator that trusts its own bookkeeping only.
    pub fn new(range: PortRange) -> Self {
        Self {
            range,
            probe: false,
            pool: Mutex::new(PortPool {
                cursor: 0,
                leases: HashMap::new(),
            }),
        }
    }

    /// Additionally skip ports some other process on the host is bound to.
    pub fn with_probe(mut self, probe: bool) -> Self {
        self.probe = probe;
        self
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    fn pool(&self) -> MutexGuard<'_, PortPool> {
        // Bookkeeping stays consistent across a panic: every mutation is a
        // single map insert or remove.
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the next free port to `owner`.
    ///
    /// Returns [`MinerError::PortsExhausted`] when every port in the range is
    /// leased (or fails the bind probe).
    pub fn acquire(&self, owner: ExecutorId) -> Result<u16> {
        let len = self.range.len();
        let mut pool = self.pool();

        for step in 0..len {
            let offset = (pool.cursor + step) % len;
            let port = self.port_at(offset);
            if pool.leases.contains_key(&port) {
                continue;
            }
            if self.probe && !Self::is_bindable(port) {
                tracing::debug!(port, "Port is bound by another process, skipping");
                continue;
            }

            pool.leases.insert(port, LeaseOwner::Executor(owner));
            pool.cursor = (offset + 1) % len;
            tracing::debug!(port, executor_id = %owner, "Port leased");
            return Ok(port);
        }

        Err(MinerError::PortsExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }

    /// Return a port to the pool. Releasing a free, quarantined or foreign
    /// port is a no-op. Returns whether a lease was dropped.
    pub fn release(&self, port: u16) -> bool {
        let mut pool = self.pool();
        match pool.leases.get(&port) {
            Some(LeaseOwner::Executor(owner)) => {
                tracing::debug!(port, executor_id = %owner, "Port released");
                pool.leases.remove(&port);
                true
            }
            Some(LeaseOwner::Orphan) | None => false,
        }
    }

    /// Keep `port` out of circulation because an unreclaimed worker may
    /// still be bound to it.
    pub fn quarantine(&self, port: u16) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let mut pool = self.pool();
        if pool.leases.contains_key(&port) {
            return false;
        }
        pool.leases.insert(port, LeaseOwner::Orphan);
        tracing::warn!(port, "Port quarantined");
        true
    }

    pub fn owner(&self, port: u16) -> Option<LeaseOwner> {
        self.pool().leases.get(&port).copied()
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.pool().leases.contains_key(&port)
    }

    /// Number of ports currently leased, quarantined ones included.
    pub fn leased(&self) -> usize {
        self.pool().leases.len()
    }

    /// Number of ports not leased.
    pub fn available(&self) -> usize {
        self.range.len() as usize - self.leased()
    }

    fn port_at(&self, offset: u32) -> u16 {
        // offset < len, so the sum stays within `start..=end`
        (u32::from(self.range.start) + offset) as u16
    }

    fn is_bindable(port: u16) -> bool {
        TcpListener::bind((Ipv4Addr::UNSPECIFIED, port)).is_ok()
    }
}
