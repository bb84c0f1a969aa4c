//! UDP port reservation.
//!
//! Ports are found by binding a throwaway socket, reading back the port and
//! closing it again. The allocator remembers what it handed out so that
//! concurrent sessions in this process never receive the same port, but it
//! cannot stop other processes from grabbing a port between the probe and
//! the transcoder binding it.

use std::collections::HashSet;
use std::io;
use std::net::{SocketAddr, UdpSocket};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::IpFamily;
use crate::config::PortConfig;

/// Number of ports a reservation covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortSpan {
    Single,
    /// `port` and `port + 1`, for RTP and its RTCP companion
    Pair,
}

/// Checks whether a UDP port can be bound.
pub trait PortProbe: Send + Sync {
    /// Binds `port` (0 for an OS-assigned one), releases it and returns the
    /// port that was bound.
    fn probe(&self, family: IpFamily, port: u16) -> io::Result<u16>;
}

/// Probes with a real socket on the family's wildcard address.
#[derive(Debug, Default, Clone, Copy)]
pub struct UdpProbe;

impl PortProbe for UdpProbe {
    fn probe(&self, family: IpFamily, port: u16) -> io::Result<u16> {
        let socket = UdpSocket::bind(SocketAddr::new(family.unspecified(), port))?;
        Ok(socket.local_addr()?.port())
    }
}

/// Process-wide table of reserved UDP ports.
pub struct PortAllocator {
    in_use: Mutex<HashSet<u16>>,
    probe: Box<dyn PortProbe>,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(config: &PortConfig) -> Self {
        Self::with_probe(config, UdpProbe)
    }

    pub fn with_probe(config: &PortConfig, probe: impl PortProbe + 'static) -> Self {
        Self {
            in_use: Mutex::new(HashSet::new()),
            probe: Box::new(probe),
            max_attempts: config.max_attempts,
        }
    }

    /// Reserves a free port, or a free consecutive pair.
    ///
    /// For [`PortSpan::Pair`] the returned port is the first of the pair and
    /// `port + 1` is reserved with it. Returns `None` when no reservation
    /// succeeded within the configured number of attempts; nothing stays
    /// marked in that case.
    pub fn reserve(&self, family: IpFamily, span: PortSpan) -> Option<u16> {
        let mut in_use = self.in_use.lock();

        for attempt in 1..=self.max_attempts {
            let first = match self.probe.probe(family, 0) {
                Ok(port) => port,
                Err(e) => {
                    debug!(attempt, error = %e, "Ephemeral port probe failed");
                    continue;
                }
            };

            if !in_use.insert(first) {
                debug!(attempt, port = first, "Probed port already reserved");
                continue;
            }

            if span == PortSpan::Single {
                debug!(%family, port = first, "Reserved UDP port");
                return Some(first);
            }

            let Some(second) = first.checked_add(1) else {
                in_use.remove(&first);
                continue;
            };

            if in_use.contains(&second) {
                in_use.remove(&first);
                continue;
            }

            match self.probe.probe(family, second) {
                Ok(_) => {
                    in_use.insert(second);
                    debug!(%family, rtp = first, rtcp = second, "Reserved UDP port pair");
                    return Some(first);
                }
                Err(e) => {
                    debug!(attempt, port = second, error = %e, "Companion port unavailable");
                    in_use.remove(&first);
                }
            }
        }

        warn!(
            %family,
            ?span,
            attempts = self.max_attempts,
            "No free UDP port found"
        );
        None
    }

    /// Releases `port`, whoever reserved it. Returns whether it was reserved.
    ///
    /// Pairs are released one port at a time.
    pub fn cancel(&self, port: u16) -> bool {
        let removed = self.in_use.lock().remove(&port);
        if removed {
            debug!(port, "Released UDP port");
        }
        removed
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.in_use.lock().contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.in_use.lock().len()
    }
}

impl std::fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocator")
            .field("in_use", &*self.in_use.lock())
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Hands out scripted ephemeral ports and refuses explicit binds to a
    /// configured set.
    struct ScriptedProbe {
        ephemeral: Mutex<VecDeque<u16>>,
        refused: HashSet<u16>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedProbe {
        fn new(ephemeral: &[u16], refused: &[u16]) -> Self {
            Self {
                ephemeral: Mutex::new(ephemeral.iter().copied().collect()),
                refused: refused.iter().copied().collect(),
                calls: Arc::default(),
            }
        }
    }

    impl PortProbe for ScriptedProbe {
        fn probe(&self, _family: IpFamily, port: u16) -> io::Result<u16> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if port == 0 {
                return self
                    .ephemeral
                    .lock()
                    .pop_front()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
            }
            if self.refused.contains(&port) {
                return Err(io::Error::from(io::ErrorKind::AddrInUse));
            }
            Ok(port)
        }
    }

    fn allocator(probe: ScriptedProbe) -> PortAllocator {
        PortAllocator::with_probe(&PortConfig::default(), probe)
    }

    #[test]
    fn test_single_reservation_skips_ports_in_use() {
        let ports = allocator(ScriptedProbe::new(&[40000, 40000, 40002], &[]));

        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Single), Some(40000));
        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Single), Some(40002));
        assert_eq!(ports.reserved_count(), 2);
    }

    #[test]
    fn test_pair_is_consecutive() {
        let ports = allocator(ScriptedProbe::new(&[50010], &[]));

        let first = ports.reserve(IpFamily::V4, PortSpan::Pair).unwrap();

        assert_eq!(first, 50010);
        assert!(ports.is_reserved(50010));
        assert!(ports.is_reserved(50011));
    }

    #[test]
    fn test_pair_retries_when_companion_unavailable() {
        let ports = allocator(ScriptedProbe::new(&[50020, 50030], &[50021]));

        assert_eq!(ports.reserve(IpFamily::V6, PortSpan::Pair), Some(50030));
        assert!(!ports.is_reserved(50020));
        assert!(!ports.is_reserved(50021));
        assert_eq!(ports.reserved_count(), 2);
    }

    #[test]
    fn test_pair_skips_companion_already_reserved() {
        let ports = allocator(ScriptedProbe::new(&[50041, 50040, 50050], &[]));

        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Single), Some(50041));
        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Pair), Some(50050));
        assert!(!ports.is_reserved(50040));
    }

    #[test]
    fn test_exhaustion_after_attempt_limit() {
        let refused: Vec<u16> = (0..20).map(|i| 60001 + i * 2).collect();
        let ephemeral: Vec<u16> = (0..20).map(|i| 60000 + i * 2).collect();
        let probe = ScriptedProbe::new(&ephemeral, &refused);
        let calls = Arc::clone(&probe.calls);
        let ports = allocator(probe);

        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Pair), None);

        // Ten attempts, each an ephemeral probe plus a companion probe
        assert_eq!(calls.load(Ordering::SeqCst), 20);
        assert_eq!(ports.reserved_count(), 0);
    }

    #[test]
    fn test_probe_errors_count_as_attempts() {
        let probe = ScriptedProbe::new(&[], &[]);
        let calls = Arc::clone(&probe.calls);
        let ports = allocator(probe);

        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Single), None);
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_cancel_releases_any_port() {
        let ports = allocator(ScriptedProbe::new(&[41000, 41000], &[]));
        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Single), Some(41000));

        assert!(ports.cancel(41000));
        assert!(!ports.cancel(41000));
        assert!(!ports.cancel(12345));

        assert_eq!(ports.reserve(IpFamily::V4, PortSpan::Single), Some(41000));
    }

    #[test]
    fn test_real_udp_pair_is_bindable() {
        let ports = PortAllocator::new(&PortConfig::default());

        let Some(first) = ports.reserve(IpFamily::V4, PortSpan::Pair) else {
            // Port exhaustion on the host is not a failure of the allocator
            return;
        };

        UdpSocket::bind(("127.0.0.1", first)).unwrap();
        UdpSocket::bind(("127.0.0.1", first + 1)).unwrap();
    }
}
