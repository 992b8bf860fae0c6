use crate::conntrack::{ConnRecord, FlowTuple};
use crate::packet::IpPkt;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RedirectError {
    #[error("Connection already redirected to {0}")]
    AlreadyRedirected(SocketAddr),
    #[error("Conflicting mapping for {tuple}: already targets {existing}")]
    Conflict {
        tuple: FlowTuple,
        existing: SocketAddr,
    },
}

/// Retargets a connection toward a relay endpoint. Must be non-blocking: the
/// engine calls this inline on the packet path.
pub trait Redirector: Send + Sync {
    fn setup_redirect(&self, conn: &ConnRecord, relay: SocketAddr) -> Result<(), RedirectError>;
}

/// Destination NAT table: original flow tuple -> relay endpoint. The ingress
/// side registers mappings through [`Redirector::setup_redirect`]; the egress
/// side consumes them via [`translate`](Self::translate) or rewrites packets
/// directly with [`rewrite`](Self::rewrite).
#[derive(Default)]
pub struct DnatTable {
    mappings: DashMap<FlowTuple, SocketAddr>,
}

impl DnatTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn translate(&self, tuple: &FlowTuple) -> Option<SocketAddr> {
        self.mappings.get(tuple).map(|m| *m)
    }

    pub fn remove(&self, tuple: &FlowTuple) -> Option<SocketAddr> {
        self.mappings.remove(tuple).map(|(_, v)| v)
    }

    /// Apply the registered mapping to a packet of the flow, in place.
    /// Returns false when the flow has no mapping or the rewrite is not
    /// applicable to this packet.
    pub fn rewrite(&self, pkt: &mut IpPkt) -> bool {
        let Some(tuple) = FlowTuple::from_packet(pkt) else {
            return false;
        };
        let Some(relay) = self.translate(&tuple) else {
            return false;
        };
        pkt.rewrite_dst(relay)
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }
}

impl Redirector for DnatTable {
    fn setup_redirect(&self, conn: &ConnRecord, relay: SocketAddr) -> Result<(), RedirectError> {
        let tuple = *conn.tuple();
        match self.mappings.entry(tuple) {
            Entry::Occupied(occupied) => {
                let existing = *occupied.get();
                if existing != relay {
                    return Err(RedirectError::Conflict { tuple, existing });
                }
                conn.record_redirect(relay)
                    .map_err(RedirectError::AlreadyRedirected)
            }
            Entry::Vacant(vacant) => {
                conn.record_redirect(relay)
                    .map_err(RedirectError::AlreadyRedirected)?;
                vacant.insert(relay);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conntrack::Conntrack;
    use crate::packet::testutil::build_tcp4;
    use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};

    fn v4(a: [u8; 4], port: u16) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(a), port)
    }

    #[test]
    fn test_setup_and_translate() {
        let ct = Conntrack::new();
        let pkt = build_tcp4(v4([10, 0, 0, 1], 4000), v4([10, 0, 0, 2], 443), true, false, &[]);
        let (conn, _) = ct.lookup_or_create(&pkt).unwrap();

        let table = DnatTable::new();
        let relay: SocketAddr = "10.0.0.5:8443".parse().unwrap();
        table.setup_redirect(&conn, relay).unwrap();
        assert_eq!(table.translate(conn.tuple()), Some(relay));
        assert_eq!(conn.redirect_target(), Some(relay));
        // idempotent for the same relay
        table.setup_redirect(&conn, relay).unwrap();
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_conflicting_relay_fails() {
        let ct = Conntrack::new();
        let pkt = build_tcp4(v4([10, 0, 0, 1], 4000), v4([10, 0, 0, 2], 443), true, false, &[]);
        let (conn, _) = ct.lookup_or_create(&pkt).unwrap();

        let table = DnatTable::new();
        let relay: SocketAddr = "10.0.0.5:8443".parse().unwrap();
        table.setup_redirect(&conn, relay).unwrap();
        let err = table
            .setup_redirect(&conn, "10.0.0.6:8443".parse().unwrap())
            .unwrap_err();
        assert!(matches!(err, RedirectError::Conflict { existing, .. } if existing == relay));
    }

    #[test]
    fn test_rewrite_applies_mapping() {
        let ct = Conntrack::new();
        let src = v4([10, 0, 0, 1], 4000);
        let dst = v4([10, 0, 0, 2], 443);
        let first = build_tcp4(src, dst, true, false, &[]);
        let (conn, _) = ct.lookup_or_create(&first).unwrap();

        let table = DnatTable::new();
        table
            .setup_redirect(&conn, "10.0.0.5:8443".parse().unwrap())
            .unwrap();

        // a later packet of the same flow gets retargeted
        let mut follow_up = build_tcp4(src, dst, false, true, &[]);
        assert!(table.rewrite(&mut follow_up));
        assert_eq!(follow_up.dst_addr(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)));
        assert!(follow_up.verify_transport_checksum());

        // unrelated flows are untouched
        let mut other = build_tcp4(v4([10, 0, 0, 9], 4000), dst, true, false, &[]);
        assert!(!table.rewrite(&mut other));
    }
}
