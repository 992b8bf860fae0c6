mod record;

pub use record::{ConnDir, ConnRecord, ConnState, ConnStatus, FlowTuple};

use crate::packet::IpPkt;
use dashmap::DashMap;
use smoltcp::wire::IpProtocol;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Direction-agnostic table key: both orientations of a flow map to the same
/// entry, direction is recovered by comparing against the record's original
/// tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    proto: u8,
    lo: SocketAddr,
    hi: SocketAddr,
}

impl FlowKey {
    fn of(tuple: &FlowTuple) -> FlowKey {
        let (lo, hi) = if tuple.src <= tuple.dst {
            (tuple.src, tuple.dst)
        } else {
            (tuple.dst, tuple.src)
        };
        FlowKey {
            proto: tuple.proto,
            lo,
            hi,
        }
    }
}

/// Flow table. Creation and destruction of records happen here, driven by the
/// ingress path; the classification engine itself only performs lookups.
pub struct Conntrack {
    records: Arc<DashMap<FlowKey, Arc<ConnRecord>>>,
    epoch: Instant,
    tcp_stale_time: Duration,
    udp_stale_time: Duration,
}

impl Default for Conntrack {
    fn default() -> Self {
        Self::new()
    }
}

impl Conntrack {
    pub fn new() -> Self {
        // 2MSL for TCP
        Self::with_stale_times(Duration::from_secs(120), Duration::from_secs(45))
    }

    pub fn with_stale_times(tcp_stale_time: Duration, udp_stale_time: Duration) -> Self {
        Self {
            records: Default::default(),
            epoch: Instant::now(),
            tcp_stale_time,
            udp_stale_time,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Find the record this packet belongs to, refreshing its idle timer.
    /// `None` when the tuple cannot be derived or the flow is untracked.
    pub fn lookup(&self, pkt: &IpPkt) -> Option<(Arc<ConnRecord>, ConnDir)> {
        let tuple = FlowTuple::from_packet(pkt)?;
        let record = self.records.get(&FlowKey::of(&tuple))?.clone();
        record.touch(self.now_ms());
        Some(self.orient(record, &tuple))
    }

    /// Like [`lookup`](Self::lookup), creating the record on first sight with
    /// this packet's tuple as the original direction.
    pub fn lookup_or_create(&self, pkt: &IpPkt) -> Option<(Arc<ConnRecord>, ConnDir)> {
        let tuple = FlowTuple::from_packet(pkt)?;
        let now = self.now_ms();
        let record = self
            .records
            .entry(FlowKey::of(&tuple))
            .or_insert_with(|| Arc::new(ConnRecord::new(tuple, now)))
            .clone();
        record.touch(now);
        Some(self.orient(record, &tuple))
    }

    fn orient(&self, record: Arc<ConnRecord>, tuple: &FlowTuple) -> (Arc<ConnRecord>, ConnDir) {
        let dir = if record.tuple() == tuple {
            ConnDir::Original
        } else {
            ConnDir::Reply
        };
        (record, dir)
    }

    pub fn get(&self, tuple: &FlowTuple) -> Option<Arc<ConnRecord>> {
        self.records.get(&FlowKey::of(tuple)).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Evict all idle flows.
    pub fn flush(&self) {
        let now = self.now_ms();
        let tcp_stale = self.tcp_stale_time;
        let udp_stale = self.udp_stale_time;
        self.records.retain(|key, record| {
            let threshold = if key.proto == u8::from(IpProtocol::Tcp) {
                tcp_stale
            } else {
                udp_stale
            };
            !record.is_expired(now, threshold)
        });
    }

    pub fn flush_with_interval(&self, dura: Duration) -> JoinHandle<()> {
        let shallow_copy = Self {
            records: self.records.clone(),
            epoch: self.epoch,
            tcp_stale_time: self.tcp_stale_time,
            udp_stale_time: self.udp_stale_time,
        };
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(dura);
            loop {
                interval.tick().await;
                shallow_copy.flush();
            }
        })
    }
}
