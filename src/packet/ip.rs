use bytes::BytesMut;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv6Address, Ipv6Packet, TcpPacket, UdpPacket,
    UdpRepr,
};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, SocketAddr};

/// Whether the transport checksum of this packet has already been verified
/// somewhere on the delivery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChecksumState {
    #[default]
    NotVerified,
    Verified,
}

pub struct IpPktContent {
    pub handle: BytesMut,
    // out-of-band routing marker read by downstream consumers
    pub mark: u32,
    pub checksum_state: ChecksumState,
}

pub enum IpPkt {
    V4(IpPktContent),
    V6(IpPktContent),
}

impl Display for IpPkt {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (version, src, dst, len, proto) = match self {
            Self::V4(_) => {
                let d = Ipv4Packet::new_unchecked(self.packet_data());
                (
                    4,
                    IpAddr::V4(d.src_addr().into()),
                    IpAddr::V4(d.dst_addr().into()),
                    d.payload().len(),
                    d.next_header(),
                )
            }
            Self::V6(_) => {
                let d = Ipv6Packet::new_unchecked(self.packet_data());
                (
                    6,
                    IpAddr::V6(d.src_addr().into()),
                    IpAddr::V6(d.dst_addr().into()),
                    d.payload().len(),
                    d.next_header(),
                )
            }
        };
        write!(
            f,
            "[version={}, src={}, dst={}, len={}, proto={:?}]",
            version, src, dst, len, proto
        )
    }
}

impl IpPkt {
    /// Build a validated view over one wire packet. The whole IP datagram must
    /// be present: header length and total length fields are checked against
    /// the buffer before any accessor may slice by them.
    pub fn parse(handle: BytesMut) -> Option<IpPkt> {
        let content = IpPktContent {
            handle,
            mark: 0,
            checksum_state: ChecksumState::NotVerified,
        };
        match content.handle.first()? >> 4 {
            4 => {
                Ipv4Packet::new_checked(content.handle.as_ref()).ok()?;
                Some(Self::V4(content))
            }
            6 => {
                Ipv6Packet::new_checked(content.handle.as_ref()).ok()?;
                Some(Self::V6(content))
            }
            _ => None,
        }
    }

    pub fn inner(&self) -> &IpPktContent {
        match self {
            IpPkt::V4(inner) => inner,
            IpPkt::V6(inner) => inner,
        }
    }

    pub fn inner_mut(&mut self) -> &mut IpPktContent {
        match self {
            IpPkt::V4(inner) => inner,
            IpPkt::V6(inner) => inner,
        }
    }

    pub fn src_addr(&self) -> IpAddr {
        match self {
            IpPkt::V4(_) => IpAddr::V4(
                Ipv4Packet::new_unchecked(self.packet_data())
                    .src_addr()
                    .into(),
            ),
            IpPkt::V6(_) => IpAddr::V6(
                Ipv6Packet::new_unchecked(self.packet_data())
                    .src_addr()
                    .into(),
            ),
        }
    }

    pub fn dst_addr(&self) -> IpAddr {
        match self {
            IpPkt::V4(_) => IpAddr::V4(
                Ipv4Packet::new_unchecked(self.packet_data())
                    .dst_addr()
                    .into(),
            ),
            IpPkt::V6(_) => IpAddr::V6(
                Ipv6Packet::new_unchecked(self.packet_data())
                    .dst_addr()
                    .into(),
            ),
        }
    }

    pub fn protocol(&self) -> IpProtocol {
        match self {
            IpPkt::V4(_) => Ipv4Packet::new_unchecked(self.packet_data()).next_header(),
            IpPkt::V6(_) => Ipv6Packet::new_unchecked(self.packet_data()).next_header(),
        }
    }

    pub fn ip_header_len(&self) -> usize {
        match self {
            IpPkt::V4(_) => Ipv4Packet::new_unchecked(self.packet_data()).header_len() as usize,
            IpPkt::V6(_) => Ipv6Packet::new_unchecked(self.packet_data()).header_len(),
        }
    }

    pub fn pkt_total_len(&self) -> usize {
        match self {
            IpPkt::V4(_) => Ipv4Packet::new_unchecked(self.packet_data()).total_len() as usize,
            IpPkt::V6(_) => Ipv6Packet::new_unchecked(self.packet_data()).total_len(),
        }
    }

    pub fn packet_data(&self) -> &[u8] {
        self.inner().handle.as_ref()
    }

    pub fn packet_data_mut(&mut self) -> &mut [u8] {
        self.inner_mut().handle.as_mut()
    }

    /// Transport-layer slice: everything between the IP header and the end of
    /// the datagram as declared by the IP header. Recomputed on every call;
    /// never cache the result across a mutation.
    pub fn packet_payload(&self) -> &[u8] {
        let (start, end) = self.payload_bounds();
        &self.inner().handle.as_ref()[start..end]
    }

    pub fn packet_payload_mut(&mut self) -> &mut [u8] {
        let (start, end) = self.payload_bounds();
        &mut self.inner_mut().handle.as_mut()[start..end]
    }

    fn payload_bounds(&self) -> (usize, usize) {
        let start = self.ip_header_len();
        // parse() verified total_len <= buffer len
        let end = self.pkt_total_len().max(start);
        (start, end)
    }

    /// The `skb_make_writable` analog: checks that at least `len` bytes of
    /// packet data are present and exclusively owned. Any transport view
    /// derived before this call must be re-derived afterwards.
    pub fn ensure_writable(&mut self, len: usize) -> bool {
        self.inner().handle.len() >= len
    }

    pub fn mark(&self) -> u32 {
        self.inner().mark
    }

    pub fn set_mark(&mut self, mark: u32) {
        self.inner_mut().mark = mark;
    }

    pub fn checksum_state(&self) -> ChecksumState {
        self.inner().checksum_state
    }

    pub fn set_checksum_verified(&mut self) {
        self.inner_mut().checksum_state = ChecksumState::Verified;
    }

    /// Verify the transport checksum against the pseudo-header. Returns false
    /// for malformed transport headers as well.
    pub fn verify_transport_checksum(&self) -> bool {
        let src = IpAddress::from(self.src_addr());
        let dst = IpAddress::from(self.dst_addr());
        match self.protocol() {
            IpProtocol::Udp => {
                let Ok(udp) = UdpPacket::new_checked(self.packet_payload()) else {
                    return false;
                };
                UdpRepr::parse(&udp, &src, &dst, &ChecksumCapabilities::default()).is_ok()
            }
            IpProtocol::Tcp => {
                let Ok(tcp) = TcpPacket::new_checked(self.packet_payload()) else {
                    return false;
                };
                tcp.verify_checksum(&src, &dst)
            }
            _ => false,
        }
    }

    /// Rewrite the destination address and port in place, refreshing transport
    /// and IP checksums. Returns false when the address family does not match
    /// the packet or the protocol carries no port.
    pub fn rewrite_dst(&mut self, dst_addr: SocketAddr) -> bool {
        match (&*self, dst_addr) {
            (IpPkt::V4(_), SocketAddr::V4(_)) | (IpPkt::V6(_), SocketAddr::V6(_)) => {}
            _ => return false,
        }
        let src = IpAddress::from(self.src_addr());
        let dst = IpAddress::from(dst_addr.ip());
        match self.protocol() {
            IpProtocol::Tcp => {
                let mut pkt = TcpPacket::new_unchecked(self.packet_payload_mut());
                pkt.set_dst_port(dst_addr.port());
                pkt.fill_checksum(&src, &dst);
            }
            IpProtocol::Udp => {
                let mut pkt = UdpPacket::new_unchecked(self.packet_payload_mut());
                pkt.set_dst_port(dst_addr.port());
                pkt.fill_checksum(&src, &dst);
            }
            _ => return false,
        }
        match dst_addr.ip() {
            IpAddr::V4(ip) => {
                let mut pkt = Ipv4Packet::new_unchecked(self.packet_data_mut());
                pkt.set_dst_addr(Ipv4Address::from(ip));
                pkt.fill_checksum();
            }
            IpAddr::V6(ip) => {
                let mut pkt = Ipv6Packet::new_unchecked(self.packet_data_mut());
                pkt.set_dst_addr(Ipv6Address::from(ip));
                // ipv6 does not contain checksum
            }
        }
        true
    }

    pub fn into_bytes_mut(self) -> BytesMut {
        match self {
            IpPkt::V4(inner) => inner.handle,
            IpPkt::V6(inner) => inner.handle,
        }
    }
}
