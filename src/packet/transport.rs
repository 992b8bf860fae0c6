use smoltcp::wire::{TcpPacket, UdpPacket};

pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

/// Checked view over a TCP-style header. Views are cheap and rebuilt per use;
/// after any buffer mutation callers derive a fresh view instead of reusing a
/// stale slice.
///
/// The slice does not have to come from a real TCP segment: the UDP-encoded
/// sub-protocol embeds a TCP-shaped header inside a datagram payload and this
/// view is used for its SYN/ACK bits and length field there as well.
#[derive(Clone, Copy)]
pub struct TcpView<'a> {
    data: &'a [u8],
}

impl<'a> TcpView<'a> {
    /// Validates the fixed 20-byte header and the declared data offset, but
    /// tolerates a truncated options area. Used to learn the declared header
    /// length before the caller has checked the full length is present.
    pub fn minimal(data: &'a [u8]) -> Option<Self> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return None;
        }
        let view = Self { data };
        if view.header_len() < TCP_MIN_HEADER_LEN {
            return None;
        }
        Some(view)
    }

    /// Full validation: the whole declared header must be present.
    pub fn new(data: &'a [u8]) -> Option<Self> {
        let view = Self::minimal(data)?;
        if data.len() < view.header_len() {
            return None;
        }
        Some(view)
    }

    fn pkt(&self) -> TcpPacket<&'a [u8]> {
        TcpPacket::new_unchecked(self.data)
    }

    pub fn src_port(&self) -> u16 {
        self.pkt().src_port()
    }

    pub fn dst_port(&self) -> u16 {
        self.pkt().dst_port()
    }

    pub fn syn(&self) -> bool {
        self.pkt().syn()
    }

    pub fn ack(&self) -> bool {
        self.pkt().ack()
    }

    pub fn header_len(&self) -> usize {
        self.pkt().header_len() as usize
    }

    /// Options area between the fixed header and the declared data offset.
    /// Empty when the view was built with `minimal` over a truncated slice.
    pub fn options(&self) -> &'a [u8] {
        self.data
            .get(TCP_MIN_HEADER_LEN..self.header_len())
            .unwrap_or(&[])
    }
}

/// Checked view over a UDP header plus payload. The declared length field is
/// validated against the slice: a datagram shorter than its own length field
/// is treated as truncated and yields no view.
#[derive(Clone, Copy)]
pub struct UdpView<'a> {
    data: &'a [u8],
}

impl<'a> UdpView<'a> {
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }
        let view = Self { data };
        let declared = view.declared_len();
        if declared < UDP_HEADER_LEN || declared > data.len() {
            return None;
        }
        Some(view)
    }

    fn pkt(&self) -> UdpPacket<&'a [u8]> {
        UdpPacket::new_unchecked(self.data)
    }

    pub fn src_port(&self) -> u16 {
        self.pkt().src_port()
    }

    pub fn dst_port(&self) -> u16 {
        self.pkt().dst_port()
    }

    pub fn declared_len(&self) -> usize {
        self.pkt().len() as usize
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.data[UDP_HEADER_LEN..self.declared_len()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_header(header_len: u8, syn: bool, ack: bool) -> Vec<u8> {
        let mut buf = vec![0u8; header_len as usize];
        let mut pkt = TcpPacket::new_unchecked(&mut buf[..]);
        pkt.set_src_port(1234);
        pkt.set_dst_port(443);
        pkt.set_header_len(header_len);
        pkt.set_syn(syn);
        pkt.set_ack(ack);
        buf
    }

    #[test]
    fn test_tcp_view_validation() {
        let buf = tcp_header(24, true, false);
        let view = TcpView::new(&buf).unwrap();
        assert!(view.syn());
        assert!(!view.ack());
        assert_eq!(view.header_len(), 24);
        assert_eq!(view.options().len(), 4);

        // truncated fixed header
        assert!(TcpView::new(&buf[..16]).is_none());
        assert!(TcpView::minimal(&buf[..16]).is_none());
        // options truncated: minimal tolerates, full does not
        assert!(TcpView::new(&buf[..20]).is_none());
        let min = TcpView::minimal(&buf[..20]).unwrap();
        assert_eq!(min.header_len(), 24);
        assert!(min.options().is_empty());
    }

    #[test]
    fn test_tcp_view_rejects_bad_data_offset() {
        let mut buf = tcp_header(20, true, false);
        // declared data offset of 3 words is below the fixed header size
        buf[12] = 3 << 4;
        assert!(TcpView::minimal(&buf).is_none());
    }

    #[test]
    fn test_udp_view_length_field() {
        let mut buf = vec![0u8; 20];
        let mut pkt = UdpPacket::new_unchecked(&mut buf[..]);
        pkt.set_src_port(1000);
        pkt.set_dst_port(2000);
        pkt.set_len(20);
        let view = UdpView::new(&buf).unwrap();
        assert_eq!(view.payload().len(), 12);
        assert_eq!(view.dst_port(), 2000);

        // declared length exceeding the slice is a truncated datagram
        let mut pkt = UdpPacket::new_unchecked(&mut buf[..]);
        pkt.set_len(24);
        assert!(UdpView::new(&buf).is_none());
        // shorter than the header itself
        let mut pkt = UdpPacket::new_unchecked(&mut buf[..]);
        pkt.set_len(4);
        assert!(UdpView::new(&buf).is_none());
    }
}
