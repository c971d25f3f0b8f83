/// 隧道段编解码
///
/// 线上格式：`[Handle:u16 BE][Payload]`，没有长度前缀，
/// 段边界由外层伪装 TCP 报文的边界决定
use crate::error::{Result, TunnelError};
use crate::session::{SessionHandle, CONTROL_HANDLE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// 句柄字段长度
pub const SEGMENT_HEADER_LEN: usize = 2;

/// 一个隧道段：会话句柄加上该会话的原始传输层报文（或控制消息）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub handle: SessionHandle,
    pub payload: Bytes,
}

impl Segment {
    pub fn new(handle: SessionHandle, payload: impl Into<Bytes>) -> Self {
        Self {
            handle,
            payload: payload.into(),
        }
    }

    pub fn is_control(&self) -> bool {
        self.handle == CONTROL_HANDLE
    }

    pub fn encode(&self) -> Bytes {
        encode(self.handle, &self.payload)
    }
}

/// 编码一个段
pub fn encode(handle: SessionHandle, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(SEGMENT_HEADER_LEN + payload.len());
    buf.put_u16(handle);
    buf.put_slice(payload);
    buf.freeze()
}

/// 解码一个段，负载与输入共享底层存储
pub fn decode(mut bytes: Bytes) -> Result<Segment> {
    if bytes.len() < SEGMENT_HEADER_LEN {
        return Err(TunnelError::truncated(SEGMENT_HEADER_LEN, bytes.len()));
    }
    let handle = bytes.get_u16();
    Ok(Segment {
        handle,
        payload: bytes,
    })
}
