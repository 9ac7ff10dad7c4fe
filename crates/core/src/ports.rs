//! UDP port allocation for RTP/RTCP pairs.
//!
//! RTP convention (RFC 3550 §11) wants the RTP port even and RTCP on the
//! next odd port. The OS hands out arbitrary ephemeral ports, so pair
//! allocation samples one, rounds an odd port down, and tries to bind both;
//! a conflict on either port retries with a fresh sample, up to a bounded
//! attempt budget.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::LazyLock;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};

/// Attempt budget for consecutive pair allocation.
pub const MAX_ATTEMPTS: u32 = 10;

/// A bound consecutive (even RTP, odd RTCP) UDP socket pair.
///
/// Sockets are blocking `std` sockets; async consumers set nonblocking and
/// convert with `tokio::net::UdpSocket::from_std`.
#[derive(Debug)]
pub struct UdpPortPair {
    pub rtp: UdpSocket,
    pub rtcp: UdpSocket,
    pub rtp_port: u16,
    pub rtcp_port: u16,
}

/// Serialized UDP port allocator.
///
/// Shared across the process (see [`global`]); operations hold an internal
/// lock so two streams cannot race for the same pair.
pub struct PortAllocator {
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Allocate a consecutive (even, odd) UDP port pair.
    ///
    /// Fails with [`EngineError::NoPortAvailable`] only after
    /// [`MAX_ATTEMPTS`] samples could not be bound.
    pub fn allocate_rtp_rtcp_pair(&self) -> Result<UdpPortPair> {
        let _guard = self.lock.lock();

        for _ in 0..MAX_ATTEMPTS {
            // Sample any ephemeral port, then release it immediately; the
            // pair bind below revalidates availability.
            let probe = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let sampled = match probe.local_addr() {
                Ok(addr) => addr.port(),
                Err(_) => continue,
            };
            drop(probe);

            let base = if sampled % 2 == 1 {
                sampled - 1
            } else {
                sampled
            };
            if base == 0 {
                continue;
            }

            let rtp = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, base)) {
                Ok(s) => s,
                Err(_) => continue,
            };
            let rtcp = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, base + 1)) {
                Ok(s) => s,
                Err(_) => continue,
            };

            tracing::trace!(rtp_port = base, rtcp_port = base + 1, "allocated UDP pair");
            return Ok(UdpPortPair {
                rtp,
                rtcp,
                rtp_port: base,
                rtcp_port: base + 1,
            });
        }

        Err(EngineError::NoPortAvailable {
            attempts: MAX_ATTEMPTS,
        })
    }

    /// Allocate a single ephemeral UDP socket.
    pub fn allocate_single(&self) -> Result<(UdpSocket, u16)> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let port = socket.local_addr()?.port();
        Ok((socket, port))
    }

    /// Allocate the first bindable UDP port in `[min, max]`.
    pub fn allocate_in_range(&self, min: u16, max: u16) -> Result<(UdpSocket, u16)> {
        let _guard = self.lock.lock();

        for port in min..=max {
            if let Ok(socket) = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))) {
                return Ok((socket, port));
            }
        }

        Err(EngineError::NoPortAvailable {
            attempts: u32::from(max - min) + 1,
        })
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL: LazyLock<PortAllocator> = LazyLock::new(PortAllocator::new);

/// The process-wide allocator. The only process-wide state in the engine.
pub fn global() -> &'static PortAllocator {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_is_even_odd_consecutive() {
        let allocator = PortAllocator::new();
        let pair = allocator.allocate_rtp_rtcp_pair().unwrap();
        assert_eq!(pair.rtp_port % 2, 0, "RTP port must be even");
        assert_eq!(pair.rtcp_port, pair.rtp_port + 1);
        assert_eq!(pair.rtp.local_addr().unwrap().port(), pair.rtp_port);
        assert_eq!(pair.rtcp.local_addr().unwrap().port(), pair.rtcp_port);
    }

    #[test]
    fn pairs_do_not_collide() {
        let allocator = PortAllocator::new();
        let a = allocator.allocate_rtp_rtcp_pair().unwrap();
        let b = allocator.allocate_rtp_rtcp_pair().unwrap();
        assert_ne!(a.rtp_port, b.rtp_port);
    }

    #[test]
    fn single_allocation() {
        let allocator = PortAllocator::new();
        let (socket, port) = allocator.allocate_single().unwrap();
        assert!(port > 0);
        assert_eq!(socket.local_addr().unwrap().port(), port);
    }

    #[test]
    fn in_range_respects_bounds() {
        let allocator = PortAllocator::new();
        let (_socket, port) = allocator.allocate_in_range(40000, 40050).unwrap();
        assert!((40000..=40050).contains(&port));
    }

    #[test]
    fn in_range_exhaustion() {
        let allocator = PortAllocator::new();
        // Occupy one port, then ask for a range of exactly that port.
        let (held, port) = allocator.allocate_single().unwrap();
        let err = allocator.allocate_in_range(port, port).unwrap_err();
        assert!(matches!(err, EngineError::NoPortAvailable { .. }));
        drop(held);
    }
}
