// 报文视图模块 - 对字节切片做带边界检查的首部解析

mod ipv4;
mod tcp;
mod udp;

pub use ipv4::{build_ipv4, Ipv4Packet, DEFAULT_TTL, IPV4_MIN_HEADER_LEN};
pub use tcp::{
    TcpHeader, TCP_CHECKSUM_OFFSET, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_PSH, TCP_FLAG_RST,
    TCP_FLAG_SYN, TCP_MIN_HEADER_LEN,
};
pub use udp::{UdpHeader, UDP_CHECKSUM_OFFSET, UDP_HEADER_LEN};

use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 传输层协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    /// IP 首部中的协议号
    pub fn number(self) -> u8 {
        match self {
            Protocol::Tcp => 6,
            Protocol::Udp => 17,
        }
    }

    /// 从协议号解析
    pub fn from_number(number: u8) -> Result<Self> {
        match number {
            6 => Ok(Protocol::Tcp),
            17 => Ok(Protocol::Udp),
            other => Err(TunnelError::unsupported(format!(
                "transport protocol {}",
                other
            ))),
        }
    }

    /// 传输层首部中校验和字段的偏移
    pub fn checksum_offset(self) -> usize {
        match self {
            Protocol::Tcp => TCP_CHECKSUM_OFFSET,
            Protocol::Udp => UDP_CHECKSUM_OFFSET,
        }
    }

    /// 传输层首部的最小长度
    pub fn min_header_len(self) -> usize {
        match self {
            Protocol::Tcp => TCP_MIN_HEADER_LEN,
            Protocol::Udp => UDP_HEADER_LEN,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// 读取传输层段的 (源端口, 目的端口)
pub fn transport_ports(protocol: Protocol, segment: &[u8]) -> Result<(u16, u16)> {
    match protocol {
        Protocol::Tcp => {
            let tcp = TcpHeader::new_fixed(segment)?;
            Ok((tcp.src_port(), tcp.dst_port()))
        }
        Protocol::Udp => {
            let udp = UdpHeader::new_checked(segment)?;
            Ok((udp.src_port(), udp.dst_port()))
        }
    }
}

/// 改写传输层段的源端口
pub fn set_transport_src_port(protocol: Protocol, segment: &mut [u8], port: u16) -> Result<()> {
    match protocol {
        Protocol::Tcp => TcpHeader::new_fixed(segment)?.set_src_port(port),
        Protocol::Udp => UdpHeader::new_checked(segment)?.set_src_port(port),
    }
    Ok(())
}

/// 改写传输层段的目的端口
pub fn set_transport_dst_port(protocol: Protocol, segment: &mut [u8], port: u16) -> Result<()> {
    match protocol {
        Protocol::Tcp => TcpHeader::new_fixed(segment)?.set_dst_port(port),
        Protocol::Udp => UdpHeader::new_checked(segment)?.set_dst_port(port),
    }
    Ok(())
}
