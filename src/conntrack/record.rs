use crate::packet::IpPkt;
use smoltcp::wire::IpProtocol;
use std::fmt::{Display, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

/// Orientation of one packet relative to the first packet of its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnDir {
    Original,
    Reply,
}

/// The original-direction 5-tuple of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowTuple {
    pub proto: u8,
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

impl FlowTuple {
    /// Derive the tuple of this packet as sent. Requires the source and
    /// destination port fields of the transport header to be present.
    pub fn from_packet(pkt: &IpPkt) -> Option<FlowTuple> {
        let proto = match pkt.protocol() {
            IpProtocol::Tcp => u8::from(IpProtocol::Tcp),
            IpProtocol::Udp => u8::from(IpProtocol::Udp),
            _ => return None,
        };
        let transport = pkt.packet_payload();
        if transport.len() < 4 {
            return None;
        }
        let src_port = u16::from_be_bytes([transport[0], transport[1]]);
        let dst_port = u16::from_be_bytes([transport[2], transport[3]]);
        Some(FlowTuple {
            proto,
            src: SocketAddr::new(pkt.src_addr(), src_port),
            dst: SocketAddr::new(pkt.dst_addr(), dst_port),
        })
    }

    pub fn reversed(&self) -> FlowTuple {
        FlowTuple {
            proto: self.proto,
            src: self.dst,
            dst: self.src,
        }
    }
}

impl Display for FlowTuple {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let proto = match IpProtocol::from(self.proto) {
            IpProtocol::Tcp => "tcp",
            IpProtocol::Udp => "udp",
            _ => "ip",
        };
        write!(f, "{} {}->{}", proto, self.src, self.dst)
    }
}

/// Classification state of one connection. Transitions:
/// `Unclassified -> Captured` (single winner, bootstrap runs),
/// `Unclassified -> Bypassed` (not tunnel traffic),
/// `Captured -> Bypassed` (bootstrap winner aborting a failed setup).
/// A state is never cleared back to `Unclassified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Unclassified = 0,
    Captured = 1,
    Bypassed = 2,
}

/// Lock-free holder of [`ConnState`]. Packets of the same new connection race
/// on this; every transition goes through compare-and-swap, never through
/// read-modify-write.
#[derive(Debug, Default)]
pub struct ConnStatus(AtomicU8);

impl ConnStatus {
    pub fn get(&self) -> ConnState {
        Self::decode(self.0.load(Ordering::Acquire))
    }

    /// Attempt the one `Unclassified -> Captured` transition. Exactly one
    /// caller per connection ever sees `true`; that caller owns bootstrap.
    pub fn try_capture(&self) -> bool {
        self.0
            .compare_exchange(
                ConnState::Unclassified as u8,
                ConnState::Captured as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Mark the connection as permanently out of scope for the engine. Does
    /// nothing when the connection was already captured.
    pub fn bypass(&self) -> bool {
        self.0
            .compare_exchange(
                ConnState::Unclassified as u8,
                ConnState::Bypassed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Downgrade a won capture to bypass. Only the caller that won
    /// `try_capture` may use this, on bootstrap failure.
    pub(crate) fn abort_capture(&self) {
        self.0.store(ConnState::Bypassed as u8, Ordering::Release);
    }

    fn decode(v: u8) -> ConnState {
        match v {
            1 => ConnState::Captured,
            2 => ConnState::Bypassed,
            _ => ConnState::Unclassified,
        }
    }
}

/// One tracked bidirectional flow. Owned by the [`Conntrack`] table; the
/// engine only ever holds a transient reference for the duration of a single
/// packet and manipulates the status through its atomic operations.
///
/// [`Conntrack`]: super::Conntrack
#[derive(Debug)]
pub struct ConnRecord {
    tuple: FlowTuple,
    status: ConnStatus,
    redirect: OnceLock<SocketAddr>,
    // milliseconds since the owning table's epoch
    last_seen_ms: AtomicU64,
}

impl ConnRecord {
    pub(crate) fn new(tuple: FlowTuple, now_ms: u64) -> Self {
        Self {
            tuple,
            status: ConnStatus::default(),
            redirect: OnceLock::new(),
            last_seen_ms: AtomicU64::new(now_ms),
        }
    }

    pub fn tuple(&self) -> &FlowTuple {
        &self.tuple
    }

    pub fn status(&self) -> &ConnStatus {
        &self.status
    }

    /// Relay endpoint this connection was retargeted to, if any.
    pub fn redirect_target(&self) -> Option<SocketAddr> {
        self.redirect.get().copied()
    }

    /// Record the relay endpoint; idempotent for the same endpoint, fails
    /// with the existing one otherwise.
    pub(crate) fn record_redirect(&self, target: SocketAddr) -> Result<(), SocketAddr> {
        let existing = *self.redirect.get_or_init(|| target);
        if existing == target {
            Ok(())
        } else {
            Err(existing)
        }
    }

    pub(crate) fn touch(&self, now_ms: u64) {
        self.last_seen_ms.store(now_ms, Ordering::Relaxed);
    }

    pub(crate) fn is_expired(&self, now_ms: u64, threshold: Duration) -> bool {
        now_ms.saturating_sub(self.last_seen_ms.load(Ordering::Relaxed)) > threshold.as_millis() as u64
    }
}
