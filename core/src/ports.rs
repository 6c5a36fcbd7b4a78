//! Local port allocation for concurrent probes.
//!
//! A bind-then-release availability check is racy on its own: two probes can
//! both see the same port as free before either launches its engine process.
//! The allocator closes that window inside the process by keeping a claimed
//! set under one mutex; the bind test runs while the lock is held and the
//! port stays claimed until its [`PortClaim`] is dropped.

use std::collections::HashSet;
use std::net::TcpListener;
use std::ops::RangeInclusive;
use std::sync::{Arc, Mutex};

use rand::{thread_rng, Rng};
use tracing::debug;

use crate::error::{RankError, Result};

/// Dynamic/private port range, per IANA.
const PORT_RANGE: RangeInclusive<u16> = 49152..=65535;

/// Termination is overwhelmingly probable long before this; hitting the
/// bound means the range is effectively exhausted.
const MAX_ATTEMPTS: u32 = 4096;

/// Process-wide allocator of currently-unbound local TCP ports.
/// Cheap to clone; clones share the claimed set.
#[derive(Clone, Default)]
pub struct PortAllocator {
    claimed: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim one currently-unbound local port.
    pub fn allocate(&self) -> Result<PortClaim> {
        for _ in 0..MAX_ATTEMPTS {
            let port = thread_rng().gen_range(PORT_RANGE);
            let mut claimed = self
                .claimed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if claimed.contains(&port) {
                continue;
            }
            // Exclusive bind test on loopback; the listener is dropped right
            // away but the port is already in the claimed set at that point.
            if TcpListener::bind(("127.0.0.1", port)).is_err() {
                continue;
            }
            claimed.insert(port);
            drop(claimed);
            debug!(port, "claimed local port");
            return Ok(PortClaim {
                claimed: Arc::clone(&self.claimed),
                port,
            });
        }
        Err(RankError::PortAllocation {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Claim the control/data port pair for one probe.
    pub fn binding(&self) -> Result<LocalBinding> {
        let http = self.allocate()?;
        let socks = self.allocate()?;
        Ok(LocalBinding { http, socks })
    }

    #[cfg(test)]
    fn claimed_count(&self) -> usize {
        self.claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// A claimed port. The claim is released when dropped, so hold it for as
/// long as the engine process may be listening.
pub struct PortClaim {
    claimed: Arc<Mutex<HashSet<u16>>>,
    port: u16,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        claimed.remove(&self.port);
    }
}

impl std::fmt::Debug for PortClaim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PortClaim").field(&self.port).finish()
    }
}

/// The two local ports backing one probe attempt: an http-style control
/// port and the socks data port the canary request goes through.
#[derive(Debug)]
pub struct LocalBinding {
    pub http: PortClaim,
    pub socks: PortClaim,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn allocated_port_is_in_dynamic_range() {
        let alloc = PortAllocator::new();
        let claim = alloc.allocate().unwrap();
        assert!(PORT_RANGE.contains(&claim.port()));
    }

    #[test]
    fn binding_ports_are_distinct() {
        let alloc = PortAllocator::new();
        let binding = alloc.binding().unwrap();
        assert_ne!(binding.http.port(), binding.socks.port());
    }

    #[test]
    fn concurrent_claims_never_collide() {
        let alloc = PortAllocator::new();
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let alloc = alloc.clone();
                thread::spawn(move || {
                    (0..4)
                        .map(|_| alloc.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let claims: Vec<PortClaim> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let mut ports: Vec<u16> = claims.iter().map(|c| c.port()).collect();
        let total = ports.len();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), total, "two live claims shared a port");
    }

    #[test]
    fn drop_releases_claim() {
        let alloc = PortAllocator::new();
        let claim = alloc.allocate().unwrap();
        assert_eq!(alloc.claimed_count(), 1);
        drop(claim);
        assert_eq!(alloc.claimed_count(), 0);
    }
}
