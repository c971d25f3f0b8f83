use crate::error::{Result, TunnelError};
use crate::packet::{transport_ports, Ipv4Packet, Protocol};
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// 会话句柄：会话在隧道线上的 16 位标识
pub type SessionHandle = u16;

/// 控制通道保留句柄，不会分配给数据会话
pub const CONTROL_HANDLE: SessionHandle = u16::MAX;

/// 空句柄，注册失败时响应中携带该值
pub const NULL_HANDLE: SessionHandle = 0;

/// 线上编码长度：协议 1 + 源地址 4 + 源端口 2 + 目的地址 4 + 目的端口 2
pub const IDENTITY_WIRE_LEN: usize = 13;

/// 被代理流的标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionIdentity {
    pub source: SocketAddrV4,
    pub protocol: Protocol,
    pub destination: SocketAddrV4,
}

impl SessionIdentity {
    pub fn new(source: SocketAddrV4, protocol: Protocol, destination: SocketAddrV4) -> Self {
        Self {
            source,
            protocol,
            destination,
        }
    }

    /// 控制通道使用的保留标识
    pub fn control() -> Self {
        let zero = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
        Self::new(zero, Protocol::Tcp, zero)
    }

    pub fn is_control(&self) -> bool {
        *self == Self::control()
    }

    /// 从出站 IPv4 报文中提取
    pub fn from_packet(packet: &[u8]) -> Result<Self> {
        let ip = Ipv4Packet::parse(packet)?;
        let protocol = Protocol::from_number(ip.protocol())?;
        let (src_port, dst_port) = transport_ports(protocol, ip.payload())?;
        Ok(Self::new(
            SocketAddrV4::new(ip.source(), src_port),
            protocol,
            SocketAddrV4::new(ip.destination(), dst_port),
        ))
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(IDENTITY_WIRE_LEN);
        buf.put_u8(self.protocol.number());
        buf.put_slice(&self.source.ip().octets());
        buf.put_u16(self.source.port());
        buf.put_slice(&self.destination.ip().octets());
        buf.put_u16(self.destination.port());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != IDENTITY_WIRE_LEN {
            return Err(TunnelError::violation(format!(
                "session identity must be {} bytes, got {}",
                IDENTITY_WIRE_LEN,
                buf.len()
            )));
        }
        let protocol = Protocol::from_number(buf[0])
            .map_err(|e| TunnelError::violation(e.to_string()))?;
        let source = SocketAddrV4::new(
            Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]),
            u16::from_be_bytes([buf[5], buf[6]]),
        );
        let destination = SocketAddrV4::new(
            Ipv4Addr::new(buf[7], buf[8], buf[9], buf[10]),
            u16::from_be_bytes([buf[11], buf[12]]),
        );
        Ok(Self::new(source, protocol, destination))
    }
}

impl fmt::Display for SessionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.protocol, self.source, self.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_ipv4;

    #[test]
    fn test_identity_wire_format() {
        let id = SessionIdentity::new(
            "10.0.0.5:51000".parse().unwrap(),
            Protocol::Tcp,
            "93.184.216.34:80".parse().unwrap(),
        );
        let mut buf = BytesMut::new();
        id.encode(&mut buf);
        assert_eq!(buf.len(), IDENTITY_WIRE_LEN);
        assert_eq!(buf[0], 6);
        assert_eq!(&buf[1..5], &[10, 0, 0, 5]);
        assert_eq!(SessionIdentity::decode(&buf).unwrap(), id);
    }

    #[test]
    fn test_identity_decode_wrong_size() {
        let err = SessionIdentity::decode(&[6; 12]).unwrap_err();
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_identity_from_packet() {
        let mut udp = vec![0u8; 8];
        udp[0..2].copy_from_slice(&5000u16.to_be_bytes());
        udp[2..4].copy_from_slice(&53u16.to_be_bytes());
        let packet = build_ipv4(
            Ipv4Addr::new(10, 0, 0, 5),
            Ipv4Addr::new(8, 8, 8, 8),
            17,
            0,
            &udp,
        )
        .unwrap();

        let id = SessionIdentity::from_packet(&packet).unwrap();
        assert_eq!(id.protocol, Protocol::Udp);
        assert_eq!(id.source, "10.0.0.5:5000".parse().unwrap());
        assert_eq!(id.destination, "8.8.8.8:53".parse().unwrap());
        assert!(!id.is_control());
        assert!(SessionIdentity::control().is_control());
    }
}
