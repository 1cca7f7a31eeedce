//! Centralized port allocation.
//!
//! Ports are the one resource shared by every harness in a test run, so
//! they are handed out by a single [`PortAllocator`].  Within a process all
//! harnesses go through [`PortAllocator::global`]; across processes the
//! allocator probes each candidate with a bind before handing it out.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::{Mutex, OnceLock};

use tracing::debug;

use crate::config::PortConfig;
use crate::errors::{HarnessError, Result};

static GLOBAL: OnceLock<PortAllocator> = OnceLock::new();

#[derive(Debug)]
struct Inner {
    cursor: u16,
    handed_out: BTreeSet<u16>,
}

/// Hands out ports from `start..end`, never the same one twice until it
/// is released.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    inner: Mutex<Inner>,
}

impl PortAllocator {
    /// Create an allocator over `start..end` with the cursor at `start`.
    pub fn new(start: u16, end: u16) -> Self {
        Self::with_cursor(start, end, start)
    }

    fn with_cursor(start: u16, end: u16, cursor: u16) -> Self {
        Self {
            start,
            end,
            inner: Mutex::new(Inner {
                cursor,
                handed_out: BTreeSet::new(),
            }),
        }
    }

    /// Install the process-wide allocator over `config`'s range.
    ///
    /// The first call wins; later calls return the existing allocator.
    /// The starting cursor is offset by the process id so that separate
    /// test binaries running at the same time begin in different regions.
    pub fn init_global(config: &PortConfig) -> &'static PortAllocator {
        GLOBAL.get_or_init(|| {
            let span = config.end.saturating_sub(config.start).max(1);
            let offset = (std::process::id() % 100) as u16 * (span / 100).max(1);
            let cursor = config.start + offset % span;
            PortAllocator::with_cursor(config.start, config.end, cursor)
        })
    }

    /// The process-wide allocator, created with the default range on first use.
    pub fn global() -> &'static PortAllocator {
        Self::init_global(&PortConfig::default())
    }

    /// Allocate a port that is neither handed out nor currently bound.
    pub fn allocate(&self) -> Result<u16> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let span = self.end.saturating_sub(self.start);
        for _ in 0..span {
            let candidate = inner.cursor;
            inner.cursor = if candidate + 1 >= self.end {
                self.start
            } else {
                candidate + 1
            };
            if inner.handed_out.contains(&candidate) || !is_bindable(candidate) {
                continue;
            }
            inner.handed_out.insert(candidate);
            debug!("Allocated port {}", candidate);
            return Ok(candidate);
        }
        Err(HarnessError::PortsExhausted {
            start: self.start,
            end: self.end,
        })
    }

    /// Allocate `count` ports at once.
    pub fn allocate_many(&self, count: usize) -> Result<Vec<u16>> {
        (0..count).map(|_| self.allocate()).collect()
    }

    /// Return `port` to the pool.
    pub fn release(&self, port: u16) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.handed_out.remove(&port);
    }

    /// Allocate `count` ports that go back to the pool when the lease drops.
    pub fn lease(&'static self, count: usize) -> Result<PortLease> {
        let mut lease = PortLease {
            allocator: self,
            ports: Vec::with_capacity(count),
        };
        for _ in 0..count {
            lease.ports.push(self.allocate()?);
        }
        Ok(lease)
    }

    /// Number of ports currently handed out.
    pub fn allocated(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .handed_out
            .len()
    }
}

/// Ports held by one harness.
#[derive(Debug)]
pub struct PortLease {
    allocator: &'static PortAllocator,
    ports: Vec<u16>,
}

impl PortLease {
    pub fn ports(&self) -> &[u16] {
        &self.ports
    }

    /// Take one more port into the lease.
    pub fn extend(&mut self) -> Result<u16> {
        let port = self.allocator.allocate()?;
        self.ports.push(port);
        Ok(port)
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        for port in self.ports.drain(..) {
            self.allocator.release(port);
        }
    }
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}
