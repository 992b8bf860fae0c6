//! Tunnel header codec.
//!
//! The real destination of a natcap connection rides inside the TCP options
//! area of the first packet (or of the TCP-shaped header embedded in the
//! UDP-encoded sub-protocol) as a single option:
//!
//! ```text
//! +------+-----+-------------+---------------------+-----------+
//! | 0x99 | 10  | 0x99 0x09   | real dest IPv4 (4B) | port (2B) |
//! +------+-----+-------------+---------------------+-----------+
//! ```
//!
//! All multi-byte fields are big-endian. Encoders pad with two NOPs so the
//! header length stays 32-bit aligned.

use crate::packet::TcpView;
use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddrV4};

pub const TUNNEL_OPTION_KIND: u8 = 0x99;
pub const TUNNEL_OPTION_LEN: usize = 10;
const TUNNEL_OPTION_MAGIC: u16 = 0x9909;

const OPT_END: u8 = 0x00;
const OPT_NOP: u8 = 0x01;

/// Decoded real destination of a tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelHeader {
    pub target: SocketAddrV4,
}

impl Display for TunnelHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "target={}", self.target)
    }
}

/// Walk the options area of a transport header and extract the tunnel option.
/// Returns `None` for headers without the option as well as for structurally
/// broken option lists; callers treat both as "not tunnel traffic".
pub fn decode_tunnel_header(tcp: &TcpView) -> Option<TunnelHeader> {
    let opts = tcp.options();
    let mut i = 0;
    while i < opts.len() {
        match opts[i] {
            OPT_END => return None,
            OPT_NOP => i += 1,
            kind => {
                let len = *opts.get(i + 1)? as usize;
                if len < 2 || i + len > opts.len() {
                    return None;
                }
                if kind == TUNNEL_OPTION_KIND && len == TUNNEL_OPTION_LEN {
                    let body = &opts[i + 2..i + len];
                    if u16::from_be_bytes([body[0], body[1]]) != TUNNEL_OPTION_MAGIC {
                        return None;
                    }
                    let ip = Ipv4Addr::new(body[2], body[3], body[4], body[5]);
                    let port = u16::from_be_bytes([body[6], body[7]]);
                    return Some(TunnelHeader {
                        target: SocketAddrV4::new(ip, port),
                    });
                }
                i += len;
            }
        }
    }
    None
}

/// Emit the tunnel option (NOP-padded to 12 bytes) for `target`. Used by test
/// traffic generators and by peers producing first packets.
pub fn encode_tunnel_header(target: SocketAddrV4) -> [u8; 12] {
    let ip = target.ip().octets();
    let port = target.port().to_be_bytes();
    let magic = TUNNEL_OPTION_MAGIC.to_be_bytes();
    [
        TUNNEL_OPTION_KIND,
        TUNNEL_OPTION_LEN as u8,
        magic[0],
        magic[1],
        ip[0],
        ip[1],
        ip[2],
        ip[3],
        port[0],
        port[1],
        OPT_NOP,
        OPT_NOP,
    ]
}
