//! Common utilities for integration tests
#![allow(dead_code)]

use fake_tcp_tunnel::capture::{Capture, MemoryCapture};
use fake_tcp_tunnel::checksum::{transport_checksum, write_transport_checksum};
use fake_tcp_tunnel::packet::{build_ipv4, Protocol, TcpHeader};
use fake_tcp_tunnel::port::PortReserver;
use std::io;
use std::net::SocketAddrV4;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Install a tracing subscriber once, honouring RUST_LOG
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Generate temporary certificate files for testing
pub fn generate_test_certs() -> (PathBuf, PathBuf) {
    use fake_tcp_tunnel::tls;
    use std::sync::atomic::AtomicU64;

    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let temp_dir = std::env::temp_dir();
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = COUNTER.fetch_add(1, Ordering::SeqCst);
    let unique_id = format!("{}-{}-{}", timestamp, counter, std::process::id());

    let cert_path = temp_dir.join(format!("test-cert-{}.pem", unique_id));
    let key_path = temp_dir.join(format!("test-key-{}.pem", unique_id));

    tls::generate_self_signed_cert("localhost", &["localhost".to_string()], &cert_path, &key_path)
        .expect("Failed to generate test certificates");

    (cert_path, key_path)
}

/// Hands out local ports in order, never releasing them to the OS
#[derive(Debug, Clone)]
pub struct SequentialReserver {
    next: Arc<AtomicU16>,
}

impl SequentialReserver {
    pub fn starting_at(port: u16) -> Self {
        Self {
            next: Arc::new(AtomicU16::new(port)),
        }
    }
}

impl PortReserver for SequentialReserver {
    type Guard = ();

    fn reserve(&self, _protocol: Protocol) -> io::Result<(u16, ())> {
        Ok((self.next.fetch_add(1, Ordering::SeqCst), ()))
    }
}

/// Forward every packet injected on `from` to `to`, like a network path between two hosts
pub fn bridge(from: Arc<MemoryCapture>, to: Arc<MemoryCapture>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(packet) = from.recv().await {
            if to.send(&packet).await.is_err() {
                break;
            }
        }
    })
}

/// Receive one packet or fail the test after `secs`
pub async fn recv_within(capture: &MemoryCapture, secs: u64) -> bytes::Bytes {
    timeout(Duration::from_secs(secs), capture.recv())
        .await
        .expect("Timed out waiting for packet")
        .expect("Capture closed")
}

/// Build an IPv4/TCP packet with a valid checksum
pub fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, payload: &[u8]) -> Vec<u8> {
    let mut seg = vec![0u8; 20];
    {
        let mut tcp = TcpHeader::new_fixed(&mut seg[..]).unwrap();
        tcp.set_src_port(src.port());
        tcp.set_dst_port(dst.port());
        tcp.set_seq(1000);
        tcp.set_header_len(20);
        tcp.set_flags(flags);
        tcp.set_window(65535);
    }
    seg.extend_from_slice(payload);
    let cs = transport_checksum(Protocol::Tcp, *src.ip(), *dst.ip(), &seg).unwrap();
    write_transport_checksum(Protocol::Tcp, &mut seg, cs).unwrap();
    build_ipv4(*src.ip(), *dst.ip(), Protocol::Tcp.number(), 1, &seg).unwrap()
}

/// Build an IPv4/UDP packet with a valid checksum
pub fn udp_packet(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Vec<u8> {
    let len = (8 + payload.len()) as u16;
    let mut seg = Vec::with_capacity(len as usize);
    seg.extend_from_slice(&src.port().to_be_bytes());
    seg.extend_from_slice(&dst.port().to_be_bytes());
    seg.extend_from_slice(&len.to_be_bytes());
    seg.extend_from_slice(&[0, 0]);
    seg.extend_from_slice(payload);
    let cs = transport_checksum(Protocol::Udp, *src.ip(), *dst.ip(), &seg).unwrap();
    write_transport_checksum(Protocol::Udp, &mut seg, cs).unwrap();
    build_ipv4(*src.ip(), *dst.ip(), Protocol::Udp.number(), 1, &seg).unwrap()
}
