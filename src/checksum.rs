/// 校验和编解码模块
///
/// 客户端在"源地址 0.0.0.0、源端口 0"的占位下计算传输层校验和，
/// 服务端只需把真实的本地地址和端口按反码加法补进去，而不必重新扫描整个报文。
/// 反码和满足结合律，所以先去掉再加回同宽字段等价于直接替换。
use crate::error::{Result, TunnelError};
use crate::packet::{build_ipv4, set_transport_src_port, transport_ports, Ipv4Packet, Protocol};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// 把 64 位累加值折叠成 16 位反码和（不取反）
pub fn fold(mut sum: u64) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// 按 16 位大端字累加，奇数尾字节补零
pub fn sum(data: &[u8]) -> u16 {
    let mut acc = 0u64;
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        acc += u64::from(u16::from_be_bytes([word[0], word[1]]));
    }
    if let [last] = chunks.remainder() {
        acc += u64::from(*last) << 8;
    }
    fold(acc)
}

/// 反码加法
pub fn combine(a: u16, b: u16) -> u16 {
    fold(u64::from(a) + u64::from(b))
}

/// 互联网校验和
pub fn checksum(data: &[u8]) -> u16 {
    !sum(data)
}

/// 增量更新校验和：报文反码和增加了 `added`
///
/// 要表示减少 `x`，传入 `!x`
pub fn adjust(checksum: u16, added: u16) -> u16 {
    !combine(!checksum, added)
}

/// 伪首部的反码和
pub fn pseudo_header_sum(src: Ipv4Addr, dst: Ipv4Addr, protocol: Protocol, length: u16) -> u16 {
    let s = src.octets();
    let d = dst.octets();
    let mut acc = 0u64;
    acc += u64::from(u16::from_be_bytes([s[0], s[1]]));
    acc += u64::from(u16::from_be_bytes([s[2], s[3]]));
    acc += u64::from(u16::from_be_bytes([d[0], d[1]]));
    acc += u64::from(u16::from_be_bytes([d[2], d[3]]));
    acc += u64::from(protocol.number());
    acc += u64::from(length);
    fold(acc)
}

fn segment_len(segment: &[u8]) -> Result<u16> {
    u16::try_from(segment.len()).map_err(|_| {
        TunnelError::unsupported(format!("transport segment of {} bytes", segment.len()))
    })
}

/// 计算传输层校验和，校验和字段本身按 0 处理
pub fn transport_checksum(
    protocol: Protocol,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    segment: &[u8],
) -> Result<u16> {
    if segment.len() < protocol.min_header_len() {
        return Err(TunnelError::truncated(protocol.min_header_len(), segment.len()));
    }
    let offset = protocol.checksum_offset();
    let body = combine(sum(&segment[..offset]), sum(&segment[offset + 2..]));
    let total = combine(
        pseudo_header_sum(src, dst, protocol, segment_len(segment)?),
        body,
    );

    let value = !total;
    // UDP 用 0 表示未计算校验和
    if protocol == Protocol::Udp && value == 0 {
        return Ok(0xffff);
    }
    Ok(value)
}

/// 校验传输层段是否正确
pub fn verify_transport(protocol: Protocol, src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> bool {
    if segment.len() < protocol.min_header_len() {
        return false;
    }
    let Ok(len) = segment_len(segment) else {
        return false;
    };
    let offset = protocol.checksum_offset();
    if protocol == Protocol::Udp && segment[offset] == 0 && segment[offset + 1] == 0 {
        return true;
    }
    combine(pseudo_header_sum(src, dst, protocol, len), sum(segment)) == 0xffff
}

/// 写入校验和字段
pub fn write_transport_checksum(protocol: Protocol, segment: &mut [u8], value: u16) -> Result<()> {
    let offset = protocol.checksum_offset();
    if segment.len() < offset + 2 {
        return Err(TunnelError::truncated(offset + 2, segment.len()));
    }
    segment[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

fn read_transport_checksum(protocol: Protocol, segment: &[u8]) -> Result<u16> {
    let offset = protocol.checksum_offset();
    if segment.len() < offset + 2 {
        return Err(TunnelError::truncated(offset + 2, segment.len()));
    }
    Ok(u16::from_be_bytes([segment[offset], segment[offset + 1]]))
}

/// 客户端预处理：剥掉 IP 首部，源端口清零，并以 0.0.0.0 为伪首部源地址计算校验和
///
/// 返回待封装进隧道的传输层段
pub fn client_prepare(packet: &[u8]) -> Result<Vec<u8>> {
    let ip = Ipv4Packet::parse(packet)?;
    if ip.is_fragment() {
        return Err(TunnelError::unsupported("fragmented IPv4 packet"));
    }
    let protocol = Protocol::from_number(ip.protocol())?;

    let mut segment = ip.payload().to_vec();
    set_transport_src_port(protocol, &mut segment, 0)?;
    let value = transport_checksum(protocol, Ipv4Addr::UNSPECIFIED, ip.destination(), &segment)?;
    write_transport_checksum(protocol, &mut segment, value)?;
    Ok(segment)
}

/// 服务端修正：把真实本地地址/端口的贡献增量加进校验和，写回源端口，
/// 再包上新的 IPv4 首部
pub fn server_fixup(
    protocol: Protocol,
    segment: &[u8],
    local: SocketAddr,
    remote: IpAddr,
    identification: u16,
) -> Result<Vec<u8>> {
    let (local_ip, remote_ip) = match (local.ip(), remote) {
        (IpAddr::V4(l), IpAddr::V4(r)) => (l, r),
        (l, r) => {
            return Err(TunnelError::unsupported(format!(
                "address family of {} -> {}",
                l, r
            )))
        }
    };

    let mut segment = segment.to_vec();
    debug_assert_eq!(
        transport_ports(protocol, &segment).map(|(src, _)| src).ok(),
        Some(0),
        "segment was not client-prepared"
    );

    let old = read_transport_checksum(protocol, &segment)?;
    let o = local_ip.octets();
    let delta = combine(
        combine(
            u16::from_be_bytes([o[0], o[1]]),
            u16::from_be_bytes([o[2], o[3]]),
        ),
        local.port(),
    );

    let new = match protocol {
        Protocol::Udp if old == 0 => 0,
        Protocol::Udp => match adjust(old, delta) {
            0 => 0xffff,
            v => v,
        },
        Protocol::Tcp => adjust(old, delta),
    };

    set_transport_src_port(protocol, &mut segment, local.port())?;
    write_transport_checksum(protocol, &mut segment, new)?;
    debug_assert!(verify_transport(protocol, local_ip, remote_ip, &segment));

    build_ipv4(local_ip, remote_ip, protocol.number(), identification, &segment)
}
