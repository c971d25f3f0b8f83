use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

/// 单个 Security 消息携带的最大 TLS 字节数，保证外层帧不超过常见 MTU
pub const MAX_SECURITY_CHUNK: usize = 1200;

/// 基于 Security 控制消息的字节流，供隧道内 TLS 使用
///
/// 写入的数据被切成块交给引擎发出，引擎收到的 Security 负载从这里读出
#[derive(Debug)]
pub struct ControlStream {
    incoming: mpsc::UnboundedReceiver<Bytes>,
    outgoing: Option<mpsc::UnboundedSender<Bytes>>,
    pending: Bytes,
}

/// 引擎一侧的端点
#[derive(Debug)]
pub struct ControlStreamHandle {
    /// 把收到的 Security 负载喂给 TLS
    pub inbound: mpsc::UnboundedSender<Bytes>,
    /// TLS 要发送的数据块
    pub outbound: mpsc::UnboundedReceiver<Bytes>,
}

impl ControlStream {
    pub fn pair() -> (ControlStream, ControlStreamHandle) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        (
            ControlStream {
                incoming: in_rx,
                outgoing: Some(out_tx),
                pending: Bytes::new(),
            },
            ControlStreamHandle {
                inbound: in_tx,
                outbound: out_rx,
            },
        )
    }
}

impl AsyncRead for ControlStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        while self.pending.is_empty() {
            match self.incoming.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.pending = chunk,
                // 对端不再投递：EOF
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = self.pending.len().min(buf.remaining());
        let chunk = self.pending.split_to(n);
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for ControlStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let Some(outgoing) = self.outgoing.as_ref() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control stream shut down",
            )));
        };
        let n = buf.len().min(MAX_SECURITY_CHUNK);
        if outgoing.send(Bytes::copy_from_slice(&buf[..n])).is_err() {
            self.outgoing = None;
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "control channel closed",
            )));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outgoing = None;
        Poll::Ready(Ok(()))
    }
}

/// 关闭时只刷新、不关闭底层流的包装
///
/// TLS 会话结束时会关闭其传输，这里的传输是隧道控制通道本身，必须保持打开
#[derive(Debug)]
pub struct NoCloseStream<S> {
    inner: S,
}

impl<S> NoCloseStream<S> {
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for NoCloseStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for NoCloseStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_writes_are_chunked() {
        let (mut stream, mut handle) = ControlStream::pair();
        stream.write_all(&[7u8; 3000]).await.unwrap();

        let mut sizes = Vec::new();
        while let Ok(chunk) = handle.outbound.try_recv() {
            sizes.push(chunk.len());
        }
        assert_eq!(sizes, vec![1200, 1200, 600]);
    }

    #[tokio::test]
    async fn test_reads_span_chunks() {
        let (mut stream, handle) = ControlStream::pair();
        handle.inbound.send(Bytes::from_static(b"hel")).unwrap();
        handle.inbound.send(Bytes::from_static(b"lo")).unwrap();
        drop(handle);

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }

    #[tokio::test]
    async fn test_no_close_keeps_writing() {
        let (stream, mut handle) = ControlStream::pair();
        let mut wrapped = NoCloseStream::new(stream);
        wrapped.shutdown().await.unwrap();
        wrapped.write_all(b"still open").await.unwrap();
        assert_eq!(&handle.outbound.recv().await.unwrap()[..], b"still open");

        let mut stream = wrapped.into_inner();
        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"closed").await.is_err());
    }
}
