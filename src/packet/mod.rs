pub mod ip;
pub mod transport;

pub use ip::{ChecksumState, IpPkt};
pub use transport::{TcpView, UdpView, TCP_MIN_HEADER_LEN, UDP_HEADER_LEN};

/// Packet builders shared by the unit tests of several modules.
#[cfg(test)]
pub(crate) mod testutil {
    use super::IpPkt;
    use bytes::BytesMut;
    use smoltcp::wire::{
        IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, TcpPacket, TcpSeqNumber, UdpPacket,
    };
    use std::net::SocketAddrV4;

    const IP_HEADER_LEN: usize = 20;

    fn finish_ipv4(
        mut buf: Vec<u8>,
        src: SocketAddrV4,
        dst: SocketAddrV4,
        proto: IpProtocol,
    ) -> Vec<u8> {
        let total = buf.len();
        let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
        ip.set_version(4);
        ip.set_header_len(IP_HEADER_LEN as u8);
        ip.set_total_len(total as u16);
        ip.set_hop_limit(64);
        ip.set_next_header(proto);
        ip.set_src_addr(Ipv4Address::from(*src.ip()));
        ip.set_dst_addr(Ipv4Address::from(*dst.ip()));
        ip.fill_checksum();
        buf
    }

    /// IPv4 TCP segment with the given flags and options (padded by caller).
    pub fn build_tcp4(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        syn: bool,
        ack: bool,
        options: &[u8],
    ) -> IpPkt {
        assert_eq!(options.len() % 4, 0, "options must be 32-bit aligned");
        let tcp_len = 20 + options.len();
        let mut buf = vec![0u8; IP_HEADER_LEN + tcp_len];
        {
            let tcp_buf = &mut buf[IP_HEADER_LEN..];
            let mut tcp = TcpPacket::new_unchecked(&mut tcp_buf[..]);
            tcp.set_src_port(src.port());
            tcp.set_dst_port(dst.port());
            tcp.set_seq_number(TcpSeqNumber(1));
            tcp.set_ack_number(TcpSeqNumber(0));
            tcp.set_header_len(tcp_len as u8);
            tcp.set_syn(syn);
            tcp.set_ack(ack);
            tcp.set_window_len(65535);
            tcp_buf[20..].copy_from_slice(options);
            let mut tcp = TcpPacket::new_unchecked(&mut tcp_buf[..]);
            tcp.fill_checksum(
                &IpAddress::Ipv4(Ipv4Address::from(*src.ip())),
                &IpAddress::Ipv4(Ipv4Address::from(*dst.ip())),
            );
        }
        let buf = finish_ipv4(buf, src, dst, IpProtocol::Tcp);
        IpPkt::parse(BytesMut::from(&buf[..])).expect("valid test packet")
    }

    /// IPv4 UDP datagram with the given payload and a correct checksum.
    pub fn build_udp4(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> IpPkt {
        build_udp4_ext(src, dst, payload, false)
    }

    /// As `build_udp4`; `corrupt_checksum` flips the checksum after filling it.
    pub fn build_udp4_ext(
        src: SocketAddrV4,
        dst: SocketAddrV4,
        payload: &[u8],
        corrupt_checksum: bool,
    ) -> IpPkt {
        let udp_len = 8 + payload.len();
        let mut buf = vec![0u8; IP_HEADER_LEN + udp_len];
        {
            let udp_buf = &mut buf[IP_HEADER_LEN..];
            let mut udp = UdpPacket::new_unchecked(&mut udp_buf[..]);
            udp.set_src_port(src.port());
            udp.set_dst_port(dst.port());
            udp.set_len(udp_len as u16);
            udp_buf[8..].copy_from_slice(payload);
            let mut udp = UdpPacket::new_unchecked(&mut udp_buf[..]);
            udp.fill_checksum(
                &IpAddress::Ipv4(Ipv4Address::from(*src.ip())),
                &IpAddress::Ipv4(Ipv4Address::from(*dst.ip())),
            );
            if corrupt_checksum {
                // zero would mean "checksum absent", keep it nonzero
                let bad = match udp.checksum() ^ 0x5555 {
                    0 => 0xaaaa,
                    c => c,
                };
                udp.set_checksum(bad);
            }
        }
        let buf = finish_ipv4(buf, src, dst, IpProtocol::Udp);
        IpPkt::parse(BytesMut::from(&buf[..])).expect("valid test packet")
    }
}
