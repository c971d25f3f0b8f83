//! 抓包/注入协作方的抽象
//!
//! 核心只把它当作收发原始 IP 报文的双工通道。实现方必须原样投递与注入字节，
//! 不得自行重算或卸载传输层校验和，否则分段校验和方案会失效。

use crate::disguise::teardown;
use crate::error::{Result, TunnelError};
use crate::packet::{Protocol, IPV4_MIN_HEADER_LEN};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use tokio::sync::{mpsc, Mutex};
use tracing::trace;

/// 内存通道的默认容量
pub const DEFAULT_CAPTURE_CAPACITY: usize = 1024;

/// 原始 IP 报文的收发接口
#[async_trait]
pub trait Capture: Send + Sync {
    /// 读取一个报文
    async fn recv(&self) -> Result<Bytes>;

    /// 注入一个报文
    async fn send(&self, packet: &[u8]) -> Result<()>;

    /// 注入一个由多个不连续缓冲区组成的报文
    ///
    /// 缓冲区以可变借用传入，装饰器可以原地改写首部
    async fn send_vectored(&self, parts: &mut [&mut [u8]]) -> Result<()> {
        let packet: Vec<u8> = parts.iter().flat_map(|p| p.iter().copied()).collect();
        self.send(&packet).await
    }
}

fn closed() -> TunnelError {
    TunnelError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        "capture channel closed",
    ))
}

/// 进程内的双工抓包通道，用于测试和嵌入
#[derive(Debug)]
pub struct MemoryCapture {
    tx: mpsc::Sender<Bytes>,
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl MemoryCapture {
    /// 创建一对相连的端点：一端注入的报文由另一端读出
    pub fn pair() -> (Self, Self) {
        Self::pair_with_capacity(DEFAULT_CAPTURE_CAPACITY)
    }

    pub fn pair_with_capacity(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl Capture for MemoryCapture {
    async fn recv(&self) -> Result<Bytes> {
        self.rx.lock().await.recv().await.ok_or_else(closed)
    }

    async fn send(&self, packet: &[u8]) -> Result<()> {
        self.tx
            .send(Bytes::copy_from_slice(packet))
            .await
            .map_err(|_| closed())
    }
}

/// 读取 IPv4/TCP 报文的传输层首部偏移，其他报文返回 None
fn tcp_offset(header: &[u8]) -> Option<usize> {
    if header.len() < IPV4_MIN_HEADER_LEN || header[0] >> 4 != 4 {
        return None;
    }
    if header[9] != Protocol::Tcp.number() {
        return None;
    }
    let ihl = ((header[0] & 0x0f) as usize) * 4;
    (ihl >= IPV4_MIN_HEADER_LEN).then_some(ihl)
}

/// 链路层垫片：收包时还原隐藏的 FIN，发包时把 FIN 藏进私有标记
///
/// 用户态 TCP/IP 栈从这里接入伪装层
#[derive(Debug)]
pub struct StealthCapture<C> {
    inner: C,
}

impl<C: Capture> StealthCapture<C> {
    pub fn new(inner: C) -> Self {
        Self { inner }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

#[async_trait]
impl<C: Capture> Capture for StealthCapture<C> {
    async fn recv(&self) -> Result<Bytes> {
        let packet = self.inner.recv().await?;
        let Some(offset) = tcp_offset(&packet) else {
            return Ok(packet);
        };
        if packet.len() < offset {
            return Ok(packet);
        }
        let mut packet = packet.to_vec();
        match teardown::decode(&mut packet[offset..]) {
            Ok(true) => trace!("Restored hidden FIN on inbound packet"),
            Ok(false) => {}
            // 截断的报文原样交给协议栈，由它丢弃
            Err(e) => trace!("Passing through inbound packet untouched: {}", e),
        }
        Ok(Bytes::from(packet))
    }

    async fn send(&self, packet: &[u8]) -> Result<()> {
        match tcp_offset(packet) {
            Some(offset) if packet.len() > offset => {
                let mut packet = packet.to_vec();
                if teardown::encode(&mut packet[offset..])? {
                    trace!("Hid FIN on outbound packet");
                }
                self.inner.send(&packet).await
            }
            _ => self.inner.send(packet).await,
        }
    }

    async fn send_vectored(&self, parts: &mut [&mut [u8]]) -> Result<()> {
        let mut header = [0u8; IPV4_MIN_HEADER_LEN];
        let copied = teardown::gather(parts, 0, &mut header);
        if let Some(offset) = tcp_offset(&header[..copied]) {
            if teardown::encode_segments(parts, offset)? {
                trace!("Hid FIN on outbound vectored packet");
            }
        }
        self.inner.send_vectored(parts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{transport_checksum, verify_transport, write_transport_checksum};
    use crate::packet::{build_ipv4, Ipv4Packet, TcpHeader, TCP_FLAG_ACK, TCP_FLAG_FIN};
    use crate::disguise::STEALTH_FIN_MARKER;
    use std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn fin_packet() -> Vec<u8> {
        let mut seg = vec![0u8; 24];
        {
            let mut tcp = TcpHeader::new_fixed(&mut seg[..]).unwrap();
            tcp.set_src_port(51000);
            tcp.set_dst_port(80);
            tcp.set_seq(42);
            tcp.set_header_len(20);
            tcp.set_flags(TCP_FLAG_FIN | TCP_FLAG_ACK);
            tcp.set_window(1024);
        }
        seg[20..].copy_from_slice(b"bye!");
        let cs = transport_checksum(Protocol::Tcp, SRC, DST, &seg).unwrap();
        write_transport_checksum(Protocol::Tcp, &mut seg, cs).unwrap();
        build_ipv4(SRC, DST, Protocol::Tcp.number(), 1, &seg).unwrap()
    }

    fn assert_hidden(packet: &[u8]) {
        let ip = Ipv4Packet::parse(packet).unwrap();
        let tcp = TcpHeader::new_fixed(ip.payload()).unwrap();
        assert!(!tcp.has_flag(TCP_FLAG_FIN));
        assert!(tcp.has_reserved(STEALTH_FIN_MARKER));
        assert!(verify_transport(Protocol::Tcp, SRC, DST, ip.payload()));
    }

    #[tokio::test]
    async fn test_memory_pair() {
        let (a, b) = MemoryCapture::pair();
        a.send(b"one").await.unwrap();
        b.send(b"two").await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..], b"one");
        assert_eq!(&a.recv().await.unwrap()[..], b"two");
    }

    #[tokio::test]
    async fn test_memory_closed() {
        let (a, b) = MemoryCapture::pair();
        drop(b);
        assert!(a.send(b"x").await.is_err());
        assert!(a.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_default_send_vectored_gathers() {
        let (a, b) = MemoryCapture::pair();
        let mut x = *b"ab";
        let mut y = *b"cd";
        a.send_vectored(&mut [&mut x[..], &mut y[..]]).await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..], b"abcd");
    }

    #[tokio::test]
    async fn test_stealth_round_trip() {
        let (a, b) = MemoryCapture::pair();
        let sender = StealthCapture::new(a);
        let receiver = StealthCapture::new(b);
        let original = fin_packet();

        sender.send(&original).await.unwrap();
        let on_wire = receiver.inner().recv().await.unwrap();
        assert_hidden(&on_wire);

        sender.inner().send(&on_wire).await.unwrap();
        let restored = receiver.recv().await.unwrap();
        assert_eq!(&restored[..], &original[..]);
    }

    #[tokio::test]
    async fn test_stealth_vectored_split_header() {
        let (a, b) = MemoryCapture::pair();
        let sender = StealthCapture::new(a);
        let mut packet = fin_packet();
        // IP 首部在第 6 字节处切开，TCP 首部在第 30 字节处切开
        let (x, rest) = packet.split_at_mut(6);
        let (y, z) = rest.split_at_mut(24);
        sender
            .send_vectored(&mut [x, y, z])
            .await
            .unwrap();
        assert_hidden(&b.recv().await.unwrap());
    }

    #[tokio::test]
    async fn test_stealth_truncated_tcp() {
        let (a, b) = MemoryCapture::pair();
        let receiver = StealthCapture::new(b);
        let truncated = fin_packet()[..IPV4_MIN_HEADER_LEN + 10].to_vec();

        // 收包方向原样放行，发包方向报错
        a.send(&truncated).await.unwrap();
        assert_eq!(&receiver.recv().await.unwrap()[..], &truncated[..]);
        assert!(receiver.send(&truncated).await.is_err());
    }

    #[tokio::test]
    async fn test_stealth_passes_non_tcp() {
        let (a, b) = MemoryCapture::pair();
        let sender = StealthCapture::new(a);
        let udp = build_ipv4(SRC, DST, Protocol::Udp.number(), 1, &[0u8; 8]).unwrap();
        sender.send(&udp).await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..], &udp[..]);
        sender.send(b"junk").await.unwrap();
        assert_eq!(&b.recv().await.unwrap()[..], b"junk");
    }
}
