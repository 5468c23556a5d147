//! Loopback port allocator
//!
//! Transcoders write their MPEG-TS output to a loopback TCP port owned by the
//! broker. Ports are leased from a bounded range and returned on channel
//! teardown. The allocator skips ports some other process already holds, so
//! unrelated services inside the range never collide with a channel.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;

use crate::error::{BrokerError, Result};

/// Lease/return tracker for loopback TCP ports
///
/// `lease` is atomic against concurrent callers: the internal lock is held
/// across the whole scan, so no two callers ever receive the same port. The
/// lock is a sync mutex and is never held across an await point.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    end: u16,
    leased: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over the half-open range `start..end`
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            leased: Mutex::new(HashSet::new()),
        }
    }

    /// Lease the first free port in the range
    ///
    /// Skips ports already leased and ports currently bound by any process on
    /// the host (checked with a loopback bind probe).
    ///
    /// # Errors
    /// - `BrokerError::NoPortAvailable` - every port in the range is taken
    pub fn lease(&self) -> Result<u16> {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());

        for port in self.start..self.end {
            if leased.contains(&port) {
                continue;
            }
            if !probe_free(port) {
                continue;
            }

            leased.insert(port);
            tracing::debug!(port = port, "Leased loopback port");
            return Ok(port);
        }

        Err(BrokerError::NoPortAvailable {
            start: self.start,
            end: self.end,
        })
    }

    /// Return a port to the pool; idempotent
    pub fn release(&self, port: u16) {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        if leased.remove(&port) {
            tracing::debug!(port = port, "Released loopback port");
        }
    }

    /// Whether a port is currently leased
    pub fn is_leased(&self, port: u16) -> bool {
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    /// Number of currently leased ports
    pub fn leased_count(&self) -> usize {
        self.leased.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Check whether a loopback port is bindable right now
///
/// Binding and immediately dropping a listener is the portable way to consult
/// the host's active-listener state. The probe socket is closed before the
/// caller binds for real, which leaves a small window; the leased set closes
/// that window for broker-owned ports.
fn probe_free(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_returns_distinct_ports() {
        let alloc = PortAllocator::new(21000, 21010);

        let a = alloc.lease().unwrap();
        let b = alloc.lease().unwrap();

        assert_ne!(a, b);
        assert!(alloc.is_leased(a));
        assert!(alloc.is_leased(b));
        assert_eq!(alloc.leased_count(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let alloc = PortAllocator::new(21020, 21030);

        let port = alloc.lease().unwrap();
        alloc.release(port);
        alloc.release(port);

        assert!(!alloc.is_leased(port));
        assert_eq!(alloc.leased_count(), 0);
    }

    #[test]
    fn test_released_port_can_be_leased_again() {
        let alloc = PortAllocator::new(21040, 21042);

        let a = alloc.lease().unwrap();
        let b = alloc.lease().unwrap();
        assert!(alloc.lease().is_err());

        alloc.release(a);
        let c = alloc.lease().unwrap();

        assert_eq!(a, c);
        assert_ne!(b, c);
    }

    #[test]
    fn test_exhaustion() {
        let alloc = PortAllocator::new(21050, 21052);

        alloc.lease().unwrap();
        alloc.lease().unwrap();

        assert!(matches!(
            alloc.lease(),
            Err(BrokerError::NoPortAvailable {
                start: 21050,
                end: 21052
            })
        ));
    }

    #[test]
    fn test_skips_ports_bound_elsewhere() {
        // Occupy the first port of the range with an unrelated listener.
        let holder =
            TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let held = holder.local_addr().unwrap().port();

        let alloc = PortAllocator::new(held, held.checked_add(4).unwrap());
        let leased = alloc.lease().unwrap();

        assert_ne!(leased, held);
        drop(holder);
    }
}
