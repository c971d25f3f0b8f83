use crate::error::{Result, TunnelError};

/// 不含选项的 TCP 首部长度
pub const TCP_MIN_HEADER_LEN: usize = 20;
/// 校验和字段偏移
pub const TCP_CHECKSUM_OFFSET: usize = 16;

pub const TCP_FLAG_FIN: u8 = 0x01;
pub const TCP_FLAG_SYN: u8 = 0x02;
pub const TCP_FLAG_RST: u8 = 0x04;
pub const TCP_FLAG_PSH: u8 = 0x08;
pub const TCP_FLAG_ACK: u8 = 0x10;

/// 数据偏移字节（第 12 字节）中低 4 位的保留位掩码，最低位是 NS/AE
const RESERVED_MASK: u8 = 0x0e;

/// TCP 首部视图
///
/// `new_fixed` 只保证固定 20 字节可读；`new_checked` 还要求缓冲区覆盖
/// 数据偏移声明的完整首部
#[derive(Debug)]
pub struct TcpHeader<T> {
    buf: T,
}

impl<T: AsRef<[u8]>> TcpHeader<T> {
    /// 仅校验固定首部
    pub fn new_fixed(buf: T) -> Result<Self> {
        let len = buf.as_ref().len();
        if len < TCP_MIN_HEADER_LEN {
            return Err(TunnelError::truncated(TCP_MIN_HEADER_LEN, len));
        }
        Ok(Self { buf })
    }

    /// 校验固定首部与数据偏移
    pub fn new_checked(buf: T) -> Result<Self> {
        let header = Self::new_fixed(buf)?;
        let header_len = header.header_len();
        let len = header.buf.as_ref().len();
        if header_len < TCP_MIN_HEADER_LEN {
            return Err(TunnelError::temporary(format!(
                "invalid TCP data offset {}",
                header_len
            )));
        }
        if len < header_len {
            return Err(TunnelError::truncated(header_len, len));
        }
        Ok(header)
    }

    fn bytes(&self) -> &[u8] {
        self.buf.as_ref()
    }

    fn read_u16(&self, offset: usize) -> u16 {
        let b = self.bytes();
        u16::from_be_bytes([b[offset], b[offset + 1]])
    }

    fn read_u32(&self, offset: usize) -> u32 {
        let b = self.bytes();
        u32::from_be_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
    }

    pub fn src_port(&self) -> u16 {
        self.read_u16(0)
    }

    pub fn dst_port(&self) -> u16 {
        self.read_u16(2)
    }

    pub fn seq(&self) -> u32 {
        self.read_u32(4)
    }

    pub fn ack(&self) -> u32 {
        self.read_u32(8)
    }

    /// 数据偏移换算成字节数
    pub fn header_len(&self) -> usize {
        usize::from(self.bytes()[12] >> 4) * 4
    }

    pub fn flags(&self) -> u8 {
        self.bytes()[13]
    }

    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags() & flag != 0
    }

    /// 保留位中是否置了 `bit`
    pub fn has_reserved(&self, bit: u8) -> bool {
        self.bytes()[12] & RESERVED_MASK & bit != 0
    }

    pub fn window(&self) -> u16 {
        self.read_u16(14)
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(TCP_CHECKSUM_OFFSET)
    }

    /// 首部之后的数据，仅对 `new_checked` 构造的视图有意义
    pub fn payload(&self) -> &[u8] {
        let b = self.bytes();
        &b[self.header_len().min(b.len())..]
    }

    pub fn into_inner(self) -> T {
        self.buf
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> TcpHeader<T> {
    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf.as_mut()[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.buf.as_mut()[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.write_u16(0, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.write_u16(2, port);
    }

    pub fn set_seq(&mut self, seq: u32) {
        self.write_u32(4, seq);
    }

    pub fn set_ack(&mut self, ack: u32) {
        self.write_u32(8, ack);
    }

    /// 设置首部长度（字节，必须是 4 的倍数）
    pub fn set_header_len(&mut self, len: usize) {
        let b = self.buf.as_mut();
        b[12] = (b[12] & 0x0f) | (((len / 4) as u8) << 4);
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.buf.as_mut()[13] = flags;
    }

    pub fn set_flag(&mut self, flag: u8, on: bool) {
        let b = self.buf.as_mut();
        if on {
            b[13] |= flag;
        } else {
            b[13] &= !flag;
        }
    }

    pub fn set_reserved(&mut self, bit: u8, on: bool) {
        let bit = bit & RESERVED_MASK;
        let b = self.buf.as_mut();
        if on {
            b[12] |= bit;
        } else {
            b[12] &= !bit;
        }
    }

    pub fn set_window(&mut self, window: u16) {
        self.write_u16(14, window);
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.write_u16(TCP_CHECKSUM_OFFSET, checksum);
    }

    pub fn set_urgent(&mut self, urgent: u16) {
        self.write_u16(18, urgent);
    }
}
