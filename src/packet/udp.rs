use crate::error::{Result, TunnelError};

pub const UDP_HEADER_LEN: usize = 8;
pub const UDP_CHECKSUM_OFFSET: usize = 6;

/// UDP 首部视图
#[derive(Debug)]
pub struct UdpHeader<T> {
    buf: T,
}

impl<T: AsRef<[u8]>> UdpHeader<T> {
    pub fn new_checked(buf: T) -> Result<Self> {
        let len = buf.as_ref().len();
        if len < UDP_HEADER_LEN {
            return Err(TunnelError::truncated(UDP_HEADER_LEN, len));
        }
        Ok(Self { buf })
    }

    fn read_u16(&self, offset: usize) -> u16 {
        let b = self.buf.as_ref();
        u16::from_be_bytes([b[offset], b[offset + 1]])
    }

    pub fn src_port(&self) -> u16 {
        self.read_u16(0)
    }

    pub fn dst_port(&self) -> u16 {
        self.read_u16(2)
    }

    pub fn length(&self) -> u16 {
        self.read_u16(4)
    }

    pub fn checksum(&self) -> u16 {
        self.read_u16(UDP_CHECKSUM_OFFSET)
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf.as_ref()[UDP_HEADER_LEN..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> UdpHeader<T> {
    fn write_u16(&mut self, offset: usize, value: u16) {
        self.buf.as_mut()[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_src_port(&mut self, port: u16) {
        self.write_u16(0, port);
    }

    pub fn set_dst_port(&mut self, port: u16) {
        self.write_u16(2, port);
    }

    pub fn set_length(&mut self, length: u16) {
        self.write_u16(4, length);
    }

    pub fn set_checksum(&mut self, checksum: u16) {
        self.write_u16(UDP_CHECKSUM_OFFSET, checksum);
    }
}
