use crate::checksum;
use crate::error::{Result, TunnelError};
use std::net::Ipv4Addr;

/// 不含选项的 IPv4 首部长度
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// 构造首部时使用的 TTL
pub const DEFAULT_TTL: u8 = 64;

const FLAG_DONT_FRAGMENT: u16 = 0x4000;

/// IPv4 报文只读视图
///
/// 构造时校验版本、首部长度与总长度，之后的字段读取不会越界
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    buf: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4Packet<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let first = *buf.first().ok_or_else(|| TunnelError::truncated(1, 0))?;
        match first >> 4 {
            4 => {}
            6 => return Err(TunnelError::unsupported("IPv6 packet")),
            v => return Err(TunnelError::unsupported(format!("IP version {}", v))),
        }
        if buf.len() < IPV4_MIN_HEADER_LEN {
            return Err(TunnelError::truncated(IPV4_MIN_HEADER_LEN, buf.len()));
        }

        let header_len = usize::from(first & 0x0f) * 4;
        if header_len < IPV4_MIN_HEADER_LEN {
            return Err(TunnelError::temporary(format!(
                "invalid IPv4 header length {}",
                header_len
            )));
        }
        if buf.len() < header_len {
            return Err(TunnelError::truncated(header_len, buf.len()));
        }

        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_len < header_len {
            return Err(TunnelError::temporary(format!(
                "IPv4 total length {} shorter than header {}",
                total_len, header_len
            )));
        }
        if buf.len() < total_len {
            return Err(TunnelError::truncated(total_len, buf.len()));
        }

        Ok(Self {
            buf,
            header_len,
            total_len,
        })
    }

    pub fn header_len(&self) -> usize {
        self.header_len
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn identification(&self) -> u16 {
        u16::from_be_bytes([self.buf[4], self.buf[5]])
    }

    pub fn ttl(&self) -> u8 {
        self.buf[8]
    }

    /// 协议号
    pub fn protocol(&self) -> u8 {
        self.buf[9]
    }

    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    /// 是否为分片（MF 置位或片偏移非零）
    pub fn is_fragment(&self) -> bool {
        let frag = u16::from_be_bytes([self.buf[6], self.buf[7]]);
        frag & 0x2000 != 0 || frag & 0x1fff != 0
    }

    pub fn header(&self) -> &'a [u8] {
        &self.buf[..self.header_len]
    }

    /// 传输层段（按总长度截断，忽略链路层填充）
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.header_len..self.total_len]
    }
}

/// 构造一个 IPv4 报文（无选项，DF 置位，首部校验和已计算）
pub fn build_ipv4(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    identification: u16,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let total_len = IPV4_MIN_HEADER_LEN + payload.len();
    let total_len = u16::try_from(total_len).map_err(|_| {
        TunnelError::unsupported(format!("IPv4 packet of {} bytes", total_len))
    })?;

    let mut packet = Vec::with_capacity(usize::from(total_len));
    packet.push(0x45);
    packet.push(0);
    packet.extend_from_slice(&total_len.to_be_bytes());
    packet.extend_from_slice(&identification.to_be_bytes());
    packet.extend_from_slice(&FLAG_DONT_FRAGMENT.to_be_bytes());
    packet.push(DEFAULT_TTL);
    packet.push(protocol);
    packet.extend_from_slice(&[0, 0]);
    packet.extend_from_slice(&src.octets());
    packet.extend_from_slice(&dst.octets());

    let header_checksum = checksum::checksum(&packet[..IPV4_MIN_HEADER_LEN]);
    packet[10..12].copy_from_slice(&header_checksum.to_be_bytes());

    packet.extend_from_slice(payload);
    Ok(packet)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_and_parse() {
        let src = Ipv4Addr::new(10, 0, 0, 5);
        let dst = Ipv4Addr::new(93, 184, 216, 34);
        let packet = build_ipv4(src, dst, 17, 7, b"payload").unwrap();

        let view = Ipv4Packet::parse(&packet).unwrap();
        assert_eq!(view.header_len(), 20);
        assert_eq!(view.total_len(), 27);
        assert_eq!(view.source(), src);
        assert_eq!(view.destination(), dst);
        assert_eq!(view.protocol(), 17);
        assert_eq!(view.identification(), 7);
        assert_eq!(view.ttl(), DEFAULT_TTL);
        assert!(!view.is_fragment());
        assert_eq!(view.payload(), b"payload");
        // 首部校验和正确时重新求和结果为 0
        assert_eq!(checksum::checksum(view.header()), 0);
    }

    #[test]
    fn test_parse_rejects_ipv6() {
        let mut packet = vec![0u8; 40];
        packet[0] = 0x60;
        let err = Ipv4Packet::parse(&packet).unwrap_err();
        assert!(matches!(err, TunnelError::Unsupported(_)));
    }

    #[test]
    fn test_parse_truncated() {
        assert!(matches!(
            Ipv4Packet::parse(&[]),
            Err(TunnelError::Truncated { .. })
        ));
        assert!(matches!(
            Ipv4Packet::parse(&[0x45, 0, 0]),
            Err(TunnelError::Truncated { .. })
        ));

        let mut packet = build_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 6, 0, &[0; 20]).unwrap();
        packet.truncate(30);
        assert!(matches!(
            Ipv4Packet::parse(&packet),
            Err(TunnelError::Truncated { .. })
        ));
    }

    #[test]
    fn test_payload_ignores_trailing_padding() {
        let mut packet = build_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 17, 0, b"abc").unwrap();
        packet.extend_from_slice(&[0xee; 6]);
        let view = Ipv4Packet::parse(&packet).unwrap();
        assert_eq!(view.payload(), b"abc");
    }
}
