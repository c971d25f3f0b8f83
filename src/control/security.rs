//! 隧道内 TLS 密钥交换
//!
//! 客户端生成 32 字节对称密钥，经由 TLS 发给服务端，服务端回复 1 字节确认。
//! 双方随后在伪装层上安装 AES-GCM。TLS 结束时不会关闭隧道本身。
//! 客户端在返回前等待服务端的 close_notify，切换信号因而总是排在全部 TLS 记录之后。

use super::stream::{ControlStream, NoCloseStream};
use crate::disguise::{AesGcmCipher, KEY_LEN};
use crate::error::{Result, TunnelError};
use rustls::pki_types::ServerName;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

/// 服务端确认收到密钥
pub const KEY_ACK: u8 = 0x01;

/// 整个交换的默认超时
pub const DEFAULT_SECURITY_TIMEOUT: Duration = Duration::from_secs(10);

fn tls_error(context: &str, err: impl std::fmt::Display) -> TunnelError {
    TunnelError::tls(format!("{}: {}", context, err))
}

/// 客户端：握手、发送新密钥并等待确认，返回已发送的密钥
pub async fn client_exchange(
    stream: ControlStream,
    connector: TlsConnector,
    server_name: ServerName<'static>,
) -> Result<[u8; KEY_LEN]> {
    let mut tls = connector
        .connect(server_name, NoCloseStream::new(stream))
        .await
        .map_err(|e| tls_error("TLS handshake failed", e))?;
    debug!("In-tunnel TLS handshake completed");

    let key = AesGcmCipher::generate_key()?;
    tls.write_all(&key)
        .await
        .map_err(|e| tls_error("Failed to send key", e))?;
    tls.flush().await?;

    let mut ack = [0u8; 1];
    tls.read_exact(&mut ack)
        .await
        .map_err(|e| tls_error("Failed to read key acknowledgement", e))?;
    if ack[0] != KEY_ACK {
        return Err(TunnelError::violation(format!(
            "unexpected key acknowledgement {:#04x}",
            ack[0]
        )));
    }

    // 只发送 close_notify，NoCloseStream 让控制通道保持打开
    tls.shutdown().await?;

    // 读到对端的 close_notify 为止，此后不会再有明文 TLS 记录到达
    let mut trailing = Vec::new();
    tls.read_to_end(&mut trailing)
        .await
        .map_err(|e| tls_error("Failed to finish TLS session", e))?;
    if !trailing.is_empty() {
        return Err(TunnelError::violation(format!(
            "{} unexpected bytes after key acknowledgement",
            trailing.len()
        )));
    }
    info!("Tunnel key exchanged");
    Ok(key)
}

/// 服务端：接受握手、读取密钥并确认
pub async fn server_exchange(stream: ControlStream, acceptor: TlsAcceptor) -> Result<[u8; KEY_LEN]> {
    let mut tls = acceptor
        .accept(NoCloseStream::new(stream))
        .await
        .map_err(|e| tls_error("TLS handshake failed", e))?;
    debug!("In-tunnel TLS handshake accepted");

    let mut key = [0u8; KEY_LEN];
    tls.read_exact(&mut key)
        .await
        .map_err(|e| tls_error("Failed to read key", e))?;
    tls.write_all(&[KEY_ACK]).await?;
    tls.shutdown().await?;
    info!("Tunnel key received");
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::ControlStreamHandle;
    use crate::tls;
    use bytes::Bytes;

    /// 在两个端点之间转发数据块，模拟经由隧道的 Security 消息
    async fn pump(mut from: ControlStreamHandle, to: tokio::sync::mpsc::UnboundedSender<Bytes>) {
        while let Some(chunk) = from.outbound.recv().await {
            assert!(chunk.len() <= crate::control::MAX_SECURITY_CHUNK);
            if to.send(chunk).is_err() {
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_key_exchange_over_control_stream() {
        let dir = std::env::temp_dir().join(format!("fake-tcp-tunnel-sec-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert = dir.join("cert.pem");
        let key = dir.join("key.pem");
        tls::generate_self_signed_cert("localhost", &[], &cert, &key).unwrap();

        let acceptor = tls::acceptor(tls::load_server_config(&cert, &key).unwrap());
        let connector = tls::connector(tls::load_client_config(Some(&cert), false).unwrap());

        let (client_stream, client_handle) = ControlStream::pair();
        let (server_stream, server_handle) = ControlStream::pair();
        let client_inbound = client_handle.inbound.clone();
        let server_inbound = server_handle.inbound.clone();
        tokio::spawn(pump(client_handle, server_inbound));
        tokio::spawn(pump(server_handle, client_inbound));

        let server = tokio::spawn(server_exchange(server_stream, acceptor));
        let client_key = tokio::time::timeout(
            DEFAULT_SECURITY_TIMEOUT,
            client_exchange(client_stream, connector, tls::server_name("localhost").unwrap()),
        )
        .await
        .unwrap()
        .unwrap();
        let server_key = server.await.unwrap().unwrap();

        assert_eq!(client_key, server_key);
        std::fs::remove_dir_all(dir).ok();
    }
}
