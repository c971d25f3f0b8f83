//! 隐蔽拆链编码
//!
//! 把内层 TCP 首部的 FIN 换成一个私有保留位。两处改动都落在首部偏移 12
//! 的同一个 16 位字上（保留位 +0x0400，FIN -0x0001），所以校验和只需
//! 加减一个常量增量，与报文内容无关。

use crate::checksum::adjust;
use crate::error::{Result, TunnelError};
use crate::packet::{TcpHeader, TCP_FLAG_FIN, TCP_MIN_HEADER_LEN};

/// 偏移 12 字节中的私有标记位
pub const STEALTH_FIN_MARKER: u8 = 0x04;

/// 编码使偏移 12 处的 16 位字增加的量
const ENCODE_DELTA: u16 = ((STEALTH_FIN_MARKER as u16) << 8) - TCP_FLAG_FIN as u16;
/// 解码时的反向增量（反码意义下的 -ENCODE_DELTA）
const DECODE_DELTA: u16 = !ENCODE_DELTA;

/// FIN -> 私有标记，返回是否改动
pub fn encode(header: &mut [u8]) -> Result<bool> {
    let mut tcp = TcpHeader::new_fixed(header)?;
    if !tcp.has_flag(TCP_FLAG_FIN) || tcp.has_reserved(STEALTH_FIN_MARKER) {
        return Ok(false);
    }
    tcp.set_flag(TCP_FLAG_FIN, false);
    tcp.set_reserved(STEALTH_FIN_MARKER, true);
    let checksum = adjust(tcp.checksum(), ENCODE_DELTA);
    tcp.set_checksum(checksum);
    Ok(true)
}

/// 私有标记 -> FIN，返回是否改动
pub fn decode(header: &mut [u8]) -> Result<bool> {
    let mut tcp = TcpHeader::new_fixed(header)?;
    if !tcp.has_reserved(STEALTH_FIN_MARKER) || tcp.has_flag(TCP_FLAG_FIN) {
        return Ok(false);
    }
    tcp.set_reserved(STEALTH_FIN_MARKER, false);
    tcp.set_flag(TCP_FLAG_FIN, true);
    let checksum = adjust(tcp.checksum(), DECODE_DELTA);
    tcp.set_checksum(checksum);
    Ok(true)
}

/// 首部可能跨多个不连续缓冲区时的编码，`offset` 是 TCP 首部在拼接后数据中的起点
pub fn encode_segments(segments: &mut [&mut [u8]], offset: usize) -> Result<bool> {
    transform_segments(segments, offset, encode)
}

/// 首部可能跨多个不连续缓冲区时的解码
pub fn decode_segments(segments: &mut [&mut [u8]], offset: usize) -> Result<bool> {
    transform_segments(segments, offset, decode)
}

fn transform_segments(
    segments: &mut [&mut [u8]],
    offset: usize,
    transform: fn(&mut [u8]) -> Result<bool>,
) -> Result<bool> {
    let mut header = [0u8; TCP_MIN_HEADER_LEN];
    let copied = copy_range(segments, offset, &mut header, Direction::Gather);
    if copied < TCP_MIN_HEADER_LEN {
        return Err(TunnelError::truncated(TCP_MIN_HEADER_LEN, copied));
    }

    let changed = transform(&mut header)?;
    if changed {
        copy_range(segments, offset, &mut header, Direction::Scatter);
    }
    Ok(changed)
}

/// 从不连续缓冲区的逻辑偏移处读出数据，返回读出的字节数
pub(crate) fn gather(segments: &mut [&mut [u8]], offset: usize, buf: &mut [u8]) -> usize {
    copy_range(segments, offset, buf, Direction::Gather)
}

#[derive(Clone, Copy)]
enum Direction {
    Gather,
    Scatter,
}

/// 在逻辑偏移 `offset` 处与 `buf` 之间拷贝，返回拷贝的字节数
fn copy_range(
    segments: &mut [&mut [u8]],
    offset: usize,
    buf: &mut [u8],
    direction: Direction,
) -> usize {
    let mut skip = offset;
    let mut done = 0;
    for seg in segments.iter_mut() {
        if done == buf.len() {
            break;
        }
        if skip >= seg.len() {
            skip -= seg.len();
            continue;
        }
        let n = (seg.len() - skip).min(buf.len() - done);
        match direction {
            Direction::Gather => buf[done..done + n].copy_from_slice(&seg[skip..skip + n]),
            Direction::Scatter => seg[skip..skip + n].copy_from_slice(&buf[done..done + n]),
        }
        done += n;
        skip = 0;
    }
    done
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::{transport_checksum, verify_transport, write_transport_checksum};
    use crate::packet::Protocol;
    use rand::Rng;
    use std::net::Ipv4Addr;

    const SRC: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const DST: Ipv4Addr = Ipv4Addr::new(93, 184, 216, 34);

    fn random_segment(rng: &mut impl Rng, fin: bool) -> Vec<u8> {
        let payload_len = rng.random_range(0..64);
        let mut seg: Vec<u8> = (0..TCP_MIN_HEADER_LEN + payload_len).map(|_| rng.random()).collect();
        seg[12] = 5 << 4;
        seg[13] = (seg[13] & !(TCP_FLAG_FIN)) | if fin { TCP_FLAG_FIN } else { 0 };
        let cs = transport_checksum(Protocol::Tcp, SRC, DST, &seg).unwrap();
        write_transport_checksum(Protocol::Tcp, &mut seg, cs).unwrap();
        seg
    }

    #[test]
    fn test_delta_constants() {
        assert_eq!(ENCODE_DELTA, 0x03ff);
        assert_eq!(DECODE_DELTA, 0xfc00);
    }

    #[test]
    fn test_encode_hides_fin() {
        let mut rng = rand::rng();
        let mut seg = random_segment(&mut rng, true);
        assert!(encode(&mut seg).unwrap());

        let tcp = TcpHeader::new_fixed(&seg[..]).unwrap();
        assert!(!tcp.has_flag(TCP_FLAG_FIN));
        assert!(tcp.has_reserved(STEALTH_FIN_MARKER));
        assert!(verify_transport(Protocol::Tcp, SRC, DST, &seg));
    }

    #[test]
    fn test_noop_without_trigger() {
        let mut rng = rand::rng();
        let mut seg = random_segment(&mut rng, false);
        let original = seg.clone();
        assert!(!encode(&mut seg).unwrap());
        assert!(!decode(&mut seg).unwrap());
        assert_eq!(seg, original);
    }

    #[test]
    fn test_round_trip_random() {
        let mut rng = rand::rng();
        for i in 0..1000 {
            let original = random_segment(&mut rng, i % 2 == 0);
            let mut seg = original.clone();
            let encoded = encode(&mut seg).unwrap();
            assert_eq!(encoded, i % 2 == 0);
            assert!(verify_transport(Protocol::Tcp, SRC, DST, &seg));
            let decoded = decode(&mut seg).unwrap();
            assert_eq!(decoded, encoded);
            assert_eq!(seg, original);
        }
    }

    #[test]
    fn test_segments_split_inside_header() {
        let mut rng = rand::rng();
        let original = random_segment(&mut rng, true);
        // 前面放一个 20 字节的 IP 首部，TCP 首部在第 13 字节处被切开
        let mut packet = vec![0x45u8; 20];
        packet.extend_from_slice(&original);
        let (a, rest) = packet.split_at_mut(20 + 13);
        let (b, c) = rest.split_at_mut(4);

        {
            let mut segments: Vec<&mut [u8]> = vec![a, b, c];
            assert!(encode_segments(&mut segments, 20).unwrap());
        }
        let tcp = TcpHeader::new_fixed(&packet[20..]).unwrap();
        assert!(tcp.has_reserved(STEALTH_FIN_MARKER));
        assert!(!tcp.has_flag(TCP_FLAG_FIN));

        let (a, rest) = packet.split_at_mut(7);
        let mut segments: Vec<&mut [u8]> = vec![a, rest];
        assert!(decode_segments(&mut segments, 20).unwrap());
        assert_eq!(&packet[20..], &original[..]);
    }

    #[test]
    fn test_segments_too_short() {
        let mut a = [0u8; 10];
        let mut b = [0u8; 5];
        let mut segments: Vec<&mut [u8]> = vec![&mut a, &mut b];
        assert!(matches!(
            encode_segments(&mut segments, 0),
            Err(TunnelError::Truncated { .. })
        ));
    }
}
