//! The pre-routing classifier and bootstrap engine.
//!
//! Runs once per packet before address translation. First qualifying packets
//! of a flow drive the one-time bootstrap (server selection + redirect
//! setup); everything after that takes the marked fast path. Correct under
//! concurrent delivery of packets of the same new connection: all shared
//! state lives in the connection record's atomic status.

use crate::codec;
use crate::config::ForwardConfig;
use crate::conntrack::{ConnDir, ConnRecord, ConnState, Conntrack};
use crate::packet::{
    ChecksumState, IpPkt, TcpView, UdpView, TCP_MIN_HEADER_LEN, UDP_HEADER_LEN,
};
use crate::redirect::Redirector;
use crate::server::{ServerPool, ServerSelect};
use smoltcp::wire::IpProtocol;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Routing marker placed on accepted packets of captured connections.
/// Downstream consumers key their processing off its presence and never
/// re-inspect the payload.
pub const MARK_NATCAP: u32 = 0x99;

/// Control packets: marker right after the UDP header.
pub const CTRL_MAGIC: u32 = 0xFFFE_0099;
/// Encoded-TCP-over-UDP: marker at payload offset 8, doubling as the first
/// four bytes of the embedded TCP-style header.
pub const UDP_ENCODE_MAGIC: u32 = 0xFFFF_0099;

const CTRL_MIN_PAYLOAD: usize = 12;
const UDP_ENCODE_OFFSET: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Drop,
}

enum UdpKind {
    Ctrl,
    Encoded,
    Other,
}

enum Bootstrap {
    Done,
    NoServer,
    Failed,
}

pub struct ForwardEngine {
    enabled: AtomicBool,
    servers: Arc<dyn ServerSelect>,
    redirector: Arc<dyn Redirector>,
}

impl ForwardEngine {
    pub fn new(
        config: &ForwardConfig,
        servers: Arc<dyn ServerSelect>,
        redirector: Arc<dyn Redirector>,
    ) -> Self {
        Self {
            enabled: AtomicBool::new(config.enabled),
            servers,
            redirector,
        }
    }

    /// Convenience constructor wiring a fresh [`ServerPool`] from the config;
    /// the pool is returned so callers can replace the server set at runtime.
    pub fn with_config(
        config: &ForwardConfig,
        redirector: Arc<dyn Redirector>,
    ) -> (Self, Arc<ServerPool>) {
        let pool = Arc::new(ServerPool::with_servers(config.servers.clone()));
        (Self::new(config, pool.clone(), redirector), pool)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Classify one inbound packet. Non-blocking and bounded: header parsing
    /// and the collaborator calls are the only variable-cost work.
    pub fn classify(&self, pkt: &mut IpPkt, ct: &Conntrack) -> Verdict {
        if !self.is_enabled() {
            return Verdict::Accept;
        }
        let proto = pkt.protocol();
        if proto != IpProtocol::Tcp && proto != IpProtocol::Udp {
            return Verdict::Accept;
        }
        let Some((conn, dir)) = ct.lookup(pkt) else {
            return Verdict::Accept;
        };
        match conn.status().get() {
            ConnState::Bypassed => return Verdict::Accept,
            ConnState::Captured => {
                // steady-state fast path
                pkt.set_mark(MARK_NATCAP);
                return Verdict::Accept;
            }
            ConnState::Unclassified => {}
        }
        if dir != ConnDir::Original {
            return Verdict::Accept;
        }

        if proto == IpProtocol::Tcp {
            self.classify_tcp(pkt, &conn)
        } else {
            self.classify_udp(pkt, &conn)
        }
    }

    fn classify_tcp(&self, pkt: &mut IpPkt, conn: &ConnRecord) -> Verdict {
        let ihl = pkt.ip_header_len();
        if !pkt.ensure_writable(ihl + TCP_MIN_HEADER_LEN) {
            return Verdict::Drop;
        }
        let header_len = match TcpView::minimal(pkt.packet_payload()) {
            Some(tcp) => tcp.header_len(),
            None => return Verdict::Drop,
        };
        if !pkt.ensure_writable(ihl + header_len) {
            return Verdict::Drop;
        }
        let (first, dst_port) = {
            let Some(tcp) = TcpView::new(pkt.packet_payload()) else {
                return Verdict::Drop;
            };
            (tcp.syn() && !tcp.ack(), tcp.dst_port())
        };
        if !first {
            tracing::info!("[Forward] {}: first packet in but not syn", conn.tuple());
            conn.status().bypass();
            return Verdict::Accept;
        }

        let decoded = TcpView::new(pkt.packet_payload())
            .as_ref()
            .and_then(codec::decode_tunnel_header);
        let Some(header) = decoded else {
            conn.status().bypass();
            return Verdict::Accept;
        };
        tracing::trace!("[Forward] {}: decoded tunnel header {}", conn.tuple(), header);

        if conn.status().try_capture() {
            match self.bootstrap(pkt, conn, dst_port) {
                Bootstrap::Done => {}
                Bootstrap::NoServer => return Verdict::Accept,
                Bootstrap::Failed => return Verdict::Drop,
            }
        }
        pkt.set_mark(MARK_NATCAP);
        tracing::debug!("[Forward] {}: after decode", conn.tuple());
        Verdict::Accept
    }

    fn classify_udp(&self, pkt: &mut IpPkt, conn: &ConnRecord) -> Verdict {
        let ihl = pkt.ip_header_len();
        if !pkt.ensure_writable(ihl + UDP_HEADER_LEN) {
            return Verdict::Drop;
        }
        // Two sub-protocols multiplexed over UDP, told apart purely by their
        // fixed-offset magic markers, never by port number.
        let kind = {
            let Some(udp) = UdpView::new(pkt.packet_payload()) else {
                return Verdict::Drop;
            };
            let payload = udp.payload();
            if payload.len() >= CTRL_MIN_PAYLOAD && read_be_u32(payload, 0) == Some(CTRL_MAGIC) {
                UdpKind::Ctrl
            } else if payload.len() >= UDP_ENCODE_OFFSET + TCP_MIN_HEADER_LEN
                && read_be_u32(payload, UDP_ENCODE_OFFSET) == Some(UDP_ENCODE_MAGIC)
            {
                UdpKind::Encoded
            } else {
                UdpKind::Other
            }
        };

        match kind {
            UdpKind::Ctrl => {
                // control packets are checksum-sensitive; verify here once
                // and record it so downstream layers do not redo the work
                if pkt.checksum_state() == ChecksumState::NotVerified {
                    if !pkt.verify_transport_checksum() {
                        tracing::warn!(
                            "[Forward] {}: checksum verification failed",
                            conn.tuple()
                        );
                        return Verdict::Drop;
                    }
                    pkt.set_checksum_verified();
                }
                let dst_port = match UdpView::new(pkt.packet_payload()) {
                    Some(udp) => udp.dst_port(),
                    None => return Verdict::Drop,
                };
                if conn.status().try_capture() {
                    match self.bootstrap(pkt, conn, dst_port) {
                        Bootstrap::Done => {}
                        Bootstrap::NoServer => return Verdict::Accept,
                        Bootstrap::Failed => return Verdict::Drop,
                    }
                }
                tracing::info!("[Forward] {}: pass ctrl decode", conn.tuple());
            }
            UdpKind::Encoded => {
                let inner_header_len = {
                    let Some(udp) = UdpView::new(pkt.packet_payload()) else {
                        return Verdict::Drop;
                    };
                    match TcpView::minimal(&udp.payload()[UDP_ENCODE_OFFSET..]) {
                        Some(inner) => inner.header_len(),
                        None => return Verdict::Drop,
                    }
                };
                if !pkt.ensure_writable(
                    ihl + UDP_HEADER_LEN + UDP_ENCODE_OFFSET + inner_header_len,
                ) {
                    return Verdict::Drop;
                }
                let (first, dst_port) = {
                    let Some(udp) = UdpView::new(pkt.packet_payload()) else {
                        return Verdict::Drop;
                    };
                    let Some(inner) = TcpView::new(&udp.payload()[UDP_ENCODE_OFFSET..]) else {
                        return Verdict::Drop;
                    };
                    (inner.syn() && !inner.ack(), udp.dst_port())
                };
                if !first {
                    tracing::info!(
                        "[Forward] {}: UDP first packet in but not syn",
                        conn.tuple()
                    );
                } else {
                    let decoded = UdpView::new(pkt.packet_payload())
                        .and_then(|udp| TcpView::new(&udp.payload()[UDP_ENCODE_OFFSET..]))
                        .as_ref()
                        .and_then(codec::decode_tunnel_header);
                    if let Some(header) = decoded {
                        tracing::trace!(
                            "[Forward] {}: decoded tunnel header {}",
                            conn.tuple(),
                            header
                        );
                        if conn.status().try_capture() {
                            match self.bootstrap(pkt, conn, dst_port) {
                                Bootstrap::Done => {}
                                Bootstrap::NoServer => return Verdict::Accept,
                                Bootstrap::Failed => return Verdict::Drop,
                            }
                        }
                        tracing::info!("[Forward] {}: pass UDP encoded data", conn.tuple());
                    }
                }
            }
            UdpKind::Other => {}
        }

        // Shared finalize for every UDP outcome that reaches this point: a
        // first packet that did not capture the connection permanently
        // excludes it from re-examination.
        if conn.status().get() == ConnState::Captured {
            pkt.set_mark(MARK_NATCAP);
        } else {
            conn.status().bypass();
            tracing::debug!("[Forward] {}: first packet in but not ctrl code", conn.tuple());
        }
        Verdict::Accept
    }

    /// One-time setup, run only by the caller that won `try_capture`.
    fn bootstrap(&self, pkt: &IpPkt, conn: &ConnRecord, dst_port: u16) -> Bootstrap {
        let Some(server) = self.servers.select_server(pkt.dst_addr(), dst_port) else {
            tracing::debug!("[Forward] {}: no server found", conn.tuple());
            conn.status().abort_capture();
            return Bootstrap::NoServer;
        };
        tracing::info!(
            "[Forward] {}: new connection, target={}",
            conn.tuple(),
            server
        );
        if let Err(err) = self.redirector.setup_redirect(conn, server) {
            tracing::error!(
                "[Forward] {}: redirect setup failed, target={}: {}",
                conn.tuple(),
                server,
                err
            );
            conn.status().abort_capture();
            return Bootstrap::Failed;
        }
        Bootstrap::Done
    }
}

fn read_be_u32(buf: &[u8], offset: usize) -> Option<u32> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
