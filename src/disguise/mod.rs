//! 伪装层：把隧道段包进外观正常的 TCP 报文
//!
//! 序列号与确认号不是真实的 TCP 状态，只用来让外层首部看起来合理且校验和正确。
//! 发送路径独占 `seq`，接收路径独占 `ack`，两者都是原子量，热路径上不加锁。

mod cipher;
pub mod teardown;

pub use cipher::{AesGcmCipher, Cipher, KEY_LEN};
pub use teardown::STEALTH_FIN_MARKER;

use crate::checksum::{transport_checksum, verify_transport, write_transport_checksum};
use crate::error::{Result, TunnelError};
use crate::packet::{
    build_ipv4, Ipv4Packet, Protocol, TcpHeader, TCP_FLAG_ACK, TCP_FLAG_PSH, TCP_MIN_HEADER_LEN,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::trace;

/// 伪装标记：外层 TCP 首部偏移 12 字节中的保留位
pub const DISGUISE_MARKER: u8 = 0x08;

/// 伪装报文通告的窗口
pub const FAKE_WINDOW: u16 = 64240;

/// 外层 AAD 覆盖的首部长度（端口、序列号、确认号）
const AAD_LEN: usize = 12;

/// 判断一个 IPv4 报文是否为带伪装标记的隧道帧
pub fn is_disguised(packet: &[u8]) -> bool {
    let Ok(ip) = Ipv4Packet::parse(packet) else {
        return false;
    };
    if ip.protocol() != Protocol::Tcp.number() {
        return false;
    }
    TcpHeader::new_fixed(ip.payload())
        .map(|tcp| tcp.has_reserved(DISGUISE_MARKER))
        .unwrap_or(false)
}

/// 读取隧道帧的外层 (源, 目的) 端点，用于多路分发
pub fn frame_endpoints(packet: &[u8]) -> Result<(SocketAddrV4, SocketAddrV4)> {
    let ip = Ipv4Packet::parse(packet)?;
    let tcp = TcpHeader::new_fixed(ip.payload())?;
    Ok((
        SocketAddrV4::new(ip.source(), tcp.src_port()),
        SocketAddrV4::new(ip.destination(), tcp.dst_port()),
    ))
}

/// 序列号意义下 `a` 是否在 `b` 之后
fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// 一条外层伪装连接的上下文
#[derive(Debug)]
pub struct FakeTcp {
    local: SocketAddrV4,
    remote: SocketAddrV4,
    seq: AtomicU32,
    ack: AtomicU32,
    ack_valid: AtomicBool,
    ip_id: AtomicU16,
    cipher: RwLock<Option<Arc<dyn Cipher>>>,
}

impl FakeTcp {
    pub fn new(local: SocketAddrV4, remote: SocketAddrV4, initial_seq: u32) -> Self {
        Self {
            local,
            remote,
            seq: AtomicU32::new(initial_seq),
            ack: AtomicU32::new(0),
            ack_valid: AtomicBool::new(false),
            ip_id: AtomicU16::new(initial_seq as u16),
            cipher: RwLock::new(None),
        }
    }

    /// 使用随机初始序列号
    pub fn with_random_seq(local: SocketAddrV4, remote: SocketAddrV4) -> Result<Self> {
        let mut isn = [0u8; 4];
        openssl::rand::rand_bytes(&mut isn).map_err(|e| TunnelError::tls(e.to_string()))?;
        Ok(Self::new(local, remote, u32::from_be_bytes(isn)))
    }

    pub fn local(&self) -> SocketAddrV4 {
        self.local
    }

    pub fn remote(&self) -> SocketAddrV4 {
        self.remote
    }

    pub fn sequence(&self) -> u32 {
        self.seq.load(Ordering::Acquire)
    }

    pub fn acknowledgement(&self) -> u32 {
        self.ack.load(Ordering::Acquire)
    }

    /// 安装加密，此后两个方向的帧都经过 AEAD
    pub fn set_cipher(&self, cipher: Arc<dyn Cipher>) {
        *self.cipher.write() = Some(cipher);
    }

    pub fn has_cipher(&self) -> bool {
        self.cipher.read().is_some()
    }

    /// 为负载加上伪装 TCP 首部与 IPv4 首部
    pub fn attach_send(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.read().clone();
        let body_len = payload.len() + cipher.as_ref().map_or(0, |c| c.overhead());
        let seq = self.seq.fetch_add(body_len as u32, Ordering::AcqRel);
        let ack = self.ack.load(Ordering::Acquire);

        let mut segment = vec![0u8; TCP_MIN_HEADER_LEN];
        {
            let mut tcp = TcpHeader::new_fixed(&mut segment[..])?;
            tcp.set_src_port(self.local.port());
            tcp.set_dst_port(self.remote.port());
            tcp.set_seq(seq);
            tcp.set_ack(ack);
            tcp.set_header_len(TCP_MIN_HEADER_LEN);
            tcp.set_reserved(DISGUISE_MARKER, true);
            tcp.set_flags(TCP_FLAG_PSH | TCP_FLAG_ACK);
            tcp.set_window(FAKE_WINDOW);
        }

        match cipher {
            Some(cipher) => {
                let sealed = cipher.seal(&segment[..AAD_LEN], payload)?;
                segment.extend_from_slice(&sealed);
            }
            None => segment.extend_from_slice(payload),
        }

        // 加密时同样写入正确的校验和，外层报文在线上始终是合法的 TCP
        let value = transport_checksum(Protocol::Tcp, *self.local.ip(), *self.remote.ip(), &segment)?;
        write_transport_checksum(Protocol::Tcp, &mut segment, value)?;

        trace!(
            "Fake TCP send {} -> {} seq={} ack={} len={}",
            self.local,
            self.remote,
            seq,
            ack,
            body_len
        );

        build_ipv4(
            *self.local.ip(),
            *self.remote.ip(),
            Protocol::Tcp.number(),
            self.ip_id.fetch_add(1, Ordering::Relaxed),
            &segment,
        )
    }

    /// 校验/解密外层帧并剥去首部
    ///
    /// 校验失败属于临时错误，调用方丢弃该帧继续运行
    pub fn detach_recv(&self, packet: &[u8]) -> Result<Bytes> {
        let ip = Ipv4Packet::parse(packet)?;
        if ip.protocol() != Protocol::Tcp.number() {
            return Err(TunnelError::temporary("frame is not TCP"));
        }
        let segment = ip.payload();
        let tcp = TcpHeader::new_checked(segment)?;
        if !tcp.has_reserved(DISGUISE_MARKER) {
            return Err(TunnelError::temporary("frame carries no disguise marker"));
        }
        if ip.source() != *self.remote.ip()
            || tcp.src_port() != self.remote.port()
            || tcp.dst_port() != self.local.port()
        {
            return Err(TunnelError::temporary(format!(
                "frame {}:{} -> {} does not belong to {} -> {}",
                ip.source(),
                tcp.src_port(),
                tcp.dst_port(),
                self.remote,
                self.local
            )));
        }

        let body = tcp.payload();
        let cipher = self.cipher.read().clone();
        let payload = match cipher {
            Some(cipher) => Bytes::from(cipher.open(&segment[..AAD_LEN], body)?),
            None => {
                if !verify_transport(Protocol::Tcp, ip.source(), ip.destination(), segment) {
                    return Err(TunnelError::temporary("fake TCP checksum mismatch"));
                }
                Bytes::copy_from_slice(body)
            }
        };

        self.advance_ack(tcp.seq().wrapping_add(body.len() as u32));
        Ok(payload)
    }

    /// 确认号取观察到的最高 seq+len，乱序或重复帧不会使其回退
    fn advance_ack(&self, end: u32) {
        if !self.ack_valid.load(Ordering::Acquire) {
            self.ack.store(end, Ordering::Release);
            self.ack_valid.store(true, Ordering::Release);
            return;
        }
        let _ = self
            .ack
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                seq_after(end, current).then_some(end)
            });
    }
}
