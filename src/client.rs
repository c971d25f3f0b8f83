//! 客户端引擎
//!
//! 从应用侧抓包读取出站 IPv4 报文，为新的流登记会话句柄，做分段校验和预处理、
//! 隐藏内层 FIN 后封进伪装 TCP 发往服务端；服务端送回的段按句柄还原成
//! 应用可以接受的报文，重新注入应用侧。

use crate::capture::Capture;
use crate::checksum::{client_prepare, transport_checksum, write_transport_checksum};
use crate::config::ClientConfig;
use crate::control::security::{client_exchange, DEFAULT_SECURITY_TIMEOUT};
use crate::control::{
    ControlCodec, ControlMachine, ControlMessage, ControlState, ControlStream, ControlStreamHandle,
    Role,
};
use crate::disguise::{is_disguised, teardown, AesGcmCipher, FakeTcp, KEY_LEN};
use crate::error::{Result, TunnelError};
use crate::packet::{build_ipv4, set_transport_dst_port, Protocol, TcpHeader, TCP_FLAG_RST};
use crate::segment::{self, Segment};
use crate::session::{
    HandleAllocator, SessionHandle, SessionIdentity, SessionTable, CONTROL_HANDLE, NULL_HANDLE,
};
use crate::stats::TunnelStats;
use crate::task::AbortOnDrop;
use crate::tls;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, trace, warn};

/// 等待登记答复期间每个流最多缓存的报文数
pub const MAX_QUEUED_PACKETS: usize = 64;

/// 服务端对一次登记的答复：成功，或拒绝原因
type RegisterOutcome = std::result::Result<(), String>;

struct PendingRegistration {
    handle: SessionHandle,
    reply: oneshot::Sender<RegisterOutcome>,
}

/// 状态机与未决登记队列在同一把锁下修改，二者的计数始终一致
struct ControlChannel {
    machine: ControlMachine,
    pending: VecDeque<PendingRegistration>,
}

/// 读取方通知握手流程
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandshakeEvent {
    SecurityAccepted,
    Started,
}

/// 正在登记的流
struct Registering {
    handle: SessionHandle,
    queued: Vec<Bytes>,
}

type RegistrationDone = (SessionIdentity, Result<()>);

/// 隧道客户端
pub struct Client {
    config: ClientConfig,
    /// 应用侧：拦截到的出站报文，以及注入回包
    app: Arc<dyn Capture>,
    /// 线路侧：伪装帧的收发
    wire: Arc<dyn Capture>,
    fake: FakeTcp,
    sessions: SessionTable,
    allocator: HandleAllocator,
    control: Mutex<ControlChannel>,
    /// 安全交换期间把收到的 TLS 记录交给 ControlStream
    security_inbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    connector: Option<TlsConnector>,
    stats: TunnelStats,
    ip_id: AtomicU16,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        app: Arc<dyn Capture>,
        wire: Arc<dyn Capture>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let connector = if config.security {
            let tls_config =
                tls::load_client_config(config.ca_cert_path.as_deref(), config.skip_verify)?;
            Some(tls::connector(tls_config))
        } else {
            None
        };
        let fake = FakeTcp::with_random_seq(config.local_addr, config.server_addr)?;

        Ok(Arc::new(Self {
            control: Mutex::new(ControlChannel {
                machine: ControlMachine::new(Role::Client, config.security),
                pending: VecDeque::new(),
            }),
            config,
            app,
            wire,
            fake,
            sessions: SessionTable::new(),
            allocator: HandleAllocator::new(),
            security_inbound: Mutex::new(None),
            connector,
            stats: TunnelStats::new(),
            ip_id: AtomicU16::new(0),
        }))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    pub fn state(&self) -> ControlState {
        self.control.lock().machine.state()
    }

    pub fn fake_tcp(&self) -> &FakeTcp {
        &self.fake
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// 已登记流的句柄
    pub fn handle_of(&self, identity: &SessionIdentity) -> Option<SessionHandle> {
        self.sessions.handle_of(identity)
    }

    /// 运行客户端，直到隧道出现致命错误或抓包通道关闭
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "Starting tunnel client {} -> {}",
            self.config.local_addr, self.config.server_addr
        );

        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut reader = tokio::spawn(self.clone().wire_loop(event_tx));

        let result = tokio::select! {
            result = self.clone().proxy(&mut event_rx) => result,
            joined = &mut reader => match joined {
                Ok(result) => result,
                Err(e) => Err(TunnelError::Other(anyhow::anyhow!("wire reader failed: {}", e))),
            },
        };
        reader.abort();

        if let Err(ref e) = result {
            error!("Tunnel client stopped: {}", e);
        }
        result
    }

    async fn proxy(
        self: Arc<Self>,
        events: &mut mpsc::UnboundedReceiver<HandshakeEvent>,
    ) -> Result<()> {
        self.handshake(events).await?;
        info!("Tunnel established, proxying");

        let _sweeper = AbortOnDrop::new(tokio::spawn(self.clone().sweep_loop()));
        self.app_loop().await
    }

    /// `Idle -> (Securing -> Secured)? -> StartSent -> Proxying`
    async fn handshake(
        self: &Arc<Self>,
        events: &mut mpsc::UnboundedReceiver<HandshakeEvent>,
    ) -> Result<()> {
        if let Some(connector) = self.connector.clone() {
            self.send_control(ControlMessage::security_signal()).await?;
            wait_for(events, HandshakeEvent::SecurityAccepted, DEFAULT_SECURITY_TIMEOUT).await?;

            let key = self.exchange_key(connector).await?;

            // 切换信号本身仍是明文，之后的帧全部加密
            self.send_control(ControlMessage::security_signal()).await?;
            self.fake.set_cipher(Arc::new(AesGcmCipher::new(&key)?));
            info!("Tunnel encryption enabled");
        }

        self.send_control(ControlMessage::Start).await?;
        wait_for(events, HandshakeEvent::Started, self.config.register_timeout()).await
    }

    async fn exchange_key(self: &Arc<Self>, connector: TlsConnector) -> Result<[u8; KEY_LEN]> {
        let (stream, handle) = ControlStream::pair();
        let ControlStreamHandle {
            inbound,
            mut outbound,
        } = handle;
        *self.security_inbound.lock() = Some(inbound);

        let this = self.clone();
        let pump = tokio::spawn(async move {
            while let Some(chunk) = outbound.recv().await {
                this.send_control(ControlMessage::Security(chunk)).await?;
            }
            Ok::<(), TunnelError>(())
        });

        let server_name = tls::server_name(&self.config.tls_server_name())?;
        let exchanged = tokio::time::timeout(
            DEFAULT_SECURITY_TIMEOUT,
            client_exchange(stream, connector, server_name),
        )
        .await
        .unwrap_or(Err(TunnelError::timeout(DEFAULT_SECURITY_TIMEOUT)));
        self.security_inbound.lock().take();

        let key = match exchanged {
            Ok(key) => key,
            Err(e) => {
                pump.abort();
                return Err(e);
            }
        };

        // ControlStream 已随交换结束而关闭，等待剩余的 TLS 记录发完
        pump.await
            .map_err(|e| TunnelError::Other(anyhow::anyhow!("security pump failed: {}", e)))??;
        Ok(key)
    }

    async fn send_control(&self, message: ControlMessage) -> Result<()> {
        self.control.lock().machine.on_send(&message)?;
        trace!("Control -> {}", message);
        let payload = ControlCodec::new(Role::Client).encode_message(message)?;
        self.send_segment(CONTROL_HANDLE, &payload).await
    }

    async fn send_segment(&self, handle: SessionHandle, payload: &[u8]) -> Result<()> {
        let frame = self.fake.attach_send(&segment::encode(handle, payload))?;
        self.wire.send(&frame).await?;
        self.stats.frame_sent(frame.len());
        Ok(())
    }

    fn drop_or_fail(&self, err: TunnelError, what: &str) -> Result<()> {
        if err.is_fatal() {
            return Err(err);
        }
        self.stats.frame_dropped();
        debug!("Dropped {}: {}", what, err);
        Ok(())
    }

    async fn app_loop(self: Arc<Self>) -> Result<()> {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<RegistrationDone>();
        let mut registering: HashMap<SessionIdentity, Registering> = HashMap::new();

        loop {
            tokio::select! {
                packet = self.app.recv() => {
                    let packet = packet?;
                    if let Err(e) = self.on_app_packet(packet, &mut registering, &done_tx).await {
                        self.drop_or_fail(e, "outbound packet")?;
                    }
                }
                Some((identity, result)) = done_rx.recv() => {
                    self.on_registered(identity, result, &mut registering).await?;
                }
            }
        }
    }

    /// 已登记的流直接转发；新流分配句柄后在后台登记，期间的报文先缓存
    async fn on_app_packet(
        self: &Arc<Self>,
        packet: Bytes,
        registering: &mut HashMap<SessionIdentity, Registering>,
        done: &mpsc::UnboundedSender<RegistrationDone>,
    ) -> Result<()> {
        let identity = SessionIdentity::from_packet(&packet)?;

        if let Some(handle) = self.sessions.handle_of(&identity) {
            self.sessions.touch(handle);
            return self.forward(handle, identity.protocol, &packet).await;
        }

        if let Some(pending) = registering.get_mut(&identity) {
            if pending.queued.len() >= MAX_QUEUED_PACKETS {
                return Err(TunnelError::temporary(format!(
                    "registration of {} still pending",
                    identity
                )));
            }
            pending.queued.push(packet);
            return Ok(());
        }

        let handle = self.allocator.get()?;
        registering.insert(
            identity,
            Registering {
                handle,
                queued: vec![packet],
            },
        );

        let this = self.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let result = this.register(handle, identity).await;
            let _ = done.send((identity, result));
        });
        Ok(())
    }

    async fn on_registered(
        &self,
        identity: SessionIdentity,
        result: Result<()>,
        registering: &mut HashMap<SessionIdentity, Registering>,
    ) -> Result<()> {
        let Some(Registering { handle, queued }) = registering.remove(&identity) else {
            return Ok(());
        };

        match result {
            Ok(()) => {
                self.sessions.insert(handle, identity)?;
                self.stats.session_registered();
                debug!("Session {} registered as handle {}", identity, handle);
                for packet in queued {
                    if let Err(e) = self.forward(handle, identity.protocol, &packet).await {
                        self.drop_or_fail(e, "queued packet")?;
                    }
                }
                Ok(())
            }
            Err(e) => {
                warn!("Failed to register {}: {}", identity, e);
                for _ in &queued {
                    self.stats.frame_dropped();
                }
                self.allocator.put(handle);
                if e.is_fatal() {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn begin_registration(
        &self,
        handle: SessionHandle,
        identity: SessionIdentity,
    ) -> Result<(Bytes, oneshot::Receiver<RegisterOutcome>)> {
        let message = ControlMessage::RegisterSession { handle, identity };
        let (tx, rx) = oneshot::channel();
        {
            let mut control = self.control.lock();
            control.machine.on_send(&message)?;
            control
                .pending
                .push_back(PendingRegistration { handle, reply: tx });
        }
        let payload = ControlCodec::new(Role::Client).encode_message(message)?;
        Ok((payload, rx))
    }

    /// 发送登记请求并等待答复
    ///
    /// 结果未知（超时或答复丢失）时撤销未决记录，并通知服务端移除该句柄
    async fn register(&self, handle: SessionHandle, identity: SessionIdentity) -> Result<()> {
        let (payload, reply) = self.begin_registration(handle, identity)?;
        debug!("Registering {} as handle {}", identity, handle);
        if let Err(e) = self.send_segment(CONTROL_HANDLE, &payload).await {
            self.abandon(handle);
            return Err(e);
        }

        let limit = self.config.register_timeout();
        match tokio::time::timeout(limit, reply).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(reason))) => Err(TunnelError::temporary(format!(
                "registration of {} rejected: {}",
                identity, reason
            ))),
            Ok(Err(_)) => {
                // 服务端可能已经绑定了这个句柄，归还前先让它撤销
                self.notify_removed(handle).await;
                Err(TunnelError::temporary(format!(
                    "reply to registration of handle {} was lost",
                    handle
                )))
            }
            Err(_) => {
                self.abandon(handle);
                self.notify_removed(handle).await;
                Err(TunnelError::timeout(limit))
            }
        }
    }

    fn abandon(&self, handle: SessionHandle) {
        let mut control = self.control.lock();
        if let Some(pos) = control.pending.iter().position(|p| p.handle == handle) {
            control.pending.remove(pos);
            control.machine.abandon_registration();
        }
    }

    /// 把答复交给对应的未决登记
    ///
    /// 成功答复按句柄匹配，排在它前面的请求视为答复已丢失；错误答复句柄为 0，
    /// 只能按顺序交给最早的请求。找不到对象的答复是超时后迟到的，直接忽略
    fn complete_registration(&self, handle: SessionHandle, error: Option<String>) -> Result<()> {
        let mut control = self.control.lock();
        let position = if handle == NULL_HANDLE {
            (!control.pending.is_empty()).then_some(0)
        } else {
            control.pending.iter().position(|p| p.handle == handle)
        };
        let Some(position) = position else {
            debug!("Ignoring stale registration reply for handle {}", handle);
            return Ok(());
        };

        let lost = control.pending.drain(..position).count();
        for _ in 0..lost {
            control.machine.abandon_registration();
        }
        let reply = ControlMessage::RegisterReply {
            handle,
            error: error.clone(),
        };
        control.machine.on_recv(&reply)?;
        if let Some(pending) = control.pending.pop_front() {
            let _ = pending.reply.send(error.map_or(Ok(()), Err));
        }
        Ok(())
    }

    async fn forward(&self, handle: SessionHandle, protocol: Protocol, packet: &[u8]) -> Result<()> {
        let mut segment = client_prepare(packet)?;
        let mut reset = false;
        if protocol == Protocol::Tcp {
            teardown::encode(&mut segment)?;
            reset = TcpHeader::new_fixed(&segment[..])?.has_flag(TCP_FLAG_RST);
        }
        self.send_segment(handle, &segment).await?;

        if reset {
            self.release(handle, true).await;
        }
        Ok(())
    }

    /// 释放会话；`notify` 为真时先通知服务端，再归还句柄，避免句柄在通知前被复用
    async fn release(&self, handle: SessionHandle, notify: bool) {
        let Some(identity) = self.sessions.remove(handle) else {
            return;
        };
        if notify {
            self.notify_removed(handle).await;
        }
        self.allocator.put(handle);
        self.stats.session_removed();
        debug!("Released session {} ({})", handle, identity);
    }

    async fn notify_removed(&self, handle: SessionHandle) {
        if let Err(e) = self
            .send_control(ControlMessage::RemoveSession { handle })
            .await
        {
            debug!("Failed to send RemoveSession({}): {}", handle, e);
        }
    }

    /// 定期释放空闲会话，并上报丢帧数
    ///
    /// 丢帧报告同时让服务端知道这个对端仍然在线
    async fn sweep_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval());
        let mut reported = 0u64;
        loop {
            interval.tick().await;
            let dropped = self.stats.snapshot().frames_dropped;
            let count = u32::try_from(dropped.saturating_sub(reported)).unwrap_or(u32::MAX);
            reported = dropped;
            if let Err(e) = self.send_control(ControlMessage::PackLoss { count }).await {
                debug!("Failed to report dropped frames: {}", e);
            }

            let idle = self
                .sessions
                .idle_handles(Instant::now(), self.config.session_idle_timeout());
            if idle.is_empty() {
                continue;
            }
            debug!("Releasing {} idle sessions", idle.len());
            for handle in idle {
                self.release(handle, true).await;
            }
        }
    }

    async fn wire_loop(self: Arc<Self>, events: mpsc::UnboundedSender<HandshakeEvent>) -> Result<()> {
        let mut codec = ControlCodec::new(Role::Client);
        loop {
            let packet = self.wire.recv().await?;
            if !is_disguised(&packet) {
                trace!("Ignoring {} byte packet without disguise marker", packet.len());
                continue;
            }

            let payload = match self.fake.detach_recv(&packet) {
                Ok(payload) => payload,
                Err(e) => {
                    self.drop_or_fail(e, "tunnel frame")?;
                    continue;
                }
            };
            self.stats.frame_received(packet.len());

            let segment = match segment::decode(payload) {
                Ok(segment) => segment,
                Err(e) => {
                    self.drop_or_fail(e, "tunnel segment")?;
                    continue;
                }
            };

            if segment.is_control() {
                for message in codec.decode_segment(&segment.payload)? {
                    self.on_control(message, &events)?;
                }
            } else if let Err(e) = self.deliver(segment).await {
                self.drop_or_fail(e, "reply segment")?;
            }
        }
    }

    fn on_control(
        self: &Arc<Self>,
        message: ControlMessage,
        events: &mpsc::UnboundedSender<HandshakeEvent>,
    ) -> Result<()> {
        trace!("Control <- {}", message);
        if let ControlMessage::RegisterReply { handle, error } = message {
            return self.complete_registration(handle, error);
        }

        self.control.lock().machine.on_recv(&message)?;
        match message {
            ControlMessage::Security(payload) if payload.is_empty() => {
                let _ = events.send(HandshakeEvent::SecurityAccepted);
            }
            ControlMessage::Security(payload) => {
                if let Some(inbound) = self.security_inbound.lock().as_ref() {
                    let _ = inbound.send(payload);
                }
            }
            ControlMessage::Start => {
                let _ = events.send(HandshakeEvent::Started);
            }
            ControlMessage::RemoveSession { handle } => {
                if let Some(identity) = self.sessions.remove(handle) {
                    self.allocator.put(handle);
                    self.stats.session_removed();
                    debug!("Server removed session {} ({})", handle, identity);
                }
            }
            ControlMessage::RequireReg { handle } => self.reregister(handle),
            ControlMessage::PackLoss { count } => {
                debug!("Server reports {} dropped frames", count);
            }
            // 客户端一侧状态机不接受登记请求，答复已在上面处理
            ControlMessage::RegisterSession { .. } | ControlMessage::RegisterReply { .. } => {}
        }
        Ok(())
    }

    /// 服务端丢失了会话绑定（例如链路过期后又收到数据），重新登记同一句柄
    fn reregister(self: &Arc<Self>, handle: SessionHandle) {
        let Some(identity) = self.sessions.identity_of(handle) else {
            debug!("RequireReg for unknown handle {}", handle);
            return;
        };
        if self.control.lock().pending.iter().any(|p| p.handle == handle) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Err(e) = this.register(handle, identity).await {
                warn!("Re-registration of {} failed: {}", identity, e);
                this.release(handle, false).await;
            }
        });
    }

    /// 把服务端送回的段还原成发给应用源端点的报文
    async fn deliver(&self, segment: Segment) -> Result<()> {
        let handle = segment.handle;
        let identity = self
            .sessions
            .identity_of(handle)
            .ok_or_else(|| TunnelError::not_found(format!("session handle {}", handle)))?;
        self.sessions.touch(handle);

        let protocol = identity.protocol;
        let mut payload = segment.payload.to_vec();
        let mut reset = false;
        if protocol == Protocol::Tcp {
            teardown::decode(&mut payload)?;
            reset = TcpHeader::new_fixed(&payload[..])?.has_flag(TCP_FLAG_RST);
        }

        let (src, dst) = (*identity.destination.ip(), *identity.source.ip());
        set_transport_dst_port(protocol, &mut payload, identity.source.port())?;
        let value = transport_checksum(protocol, src, dst, &payload)?;
        write_transport_checksum(protocol, &mut payload, value)?;
        let packet = build_ipv4(
            src,
            dst,
            protocol.number(),
            self.ip_id.fetch_add(1, Ordering::Relaxed),
            &payload,
        )?;
        self.app.send(&packet).await?;

        if reset {
            self.release(handle, true).await;
        }
        Ok(())
    }
}

async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<HandshakeEvent>,
    expected: HandshakeEvent,
    limit: Duration,
) -> Result<()> {
    let received = tokio::time::timeout(limit, events.recv())
        .await
        .map_err(|_| TunnelError::timeout(limit))?;
    match received {
        Some(event) if event == expected => Ok(()),
        Some(event) => Err(TunnelError::violation(format!(
            "expected {:?}, got {:?}",
            expected, event
        ))),
        None => Err(TunnelError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "tunnel reader stopped",
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::MemoryCapture;
    use crate::checksum::verify_transport;
    use crate::packet::{Ipv4Packet, TCP_FLAG_ACK, TCP_FLAG_FIN, TCP_FLAG_SYN};
    use std::net::{Ipv4Addr, SocketAddrV4};

    const APP: &str = "10.0.0.5:51000";
    const TARGET: &str = "93.184.216.34:80";

    struct Harness {
        client: Arc<Client>,
        /// 对端：扮演被拦截的应用
        app: MemoryCapture,
        /// 对端：扮演服务端所在的线路
        wire: MemoryCapture,
        /// 服务端一侧的伪装上下文
        server: FakeTcp,
    }

    fn harness() -> Harness {
        let config = ClientConfig::builder()
            .local_addr("10.0.0.5:40000".parse().unwrap())
            .server_addr("203.0.113.10:443".parse().unwrap())
            .register_timeout_secs(1)
            .build()
            .unwrap();
        let (app, app_peer) = MemoryCapture::pair();
        let (wire, wire_peer) = MemoryCapture::pair();
        let server = FakeTcp::new(config.server_addr, config.local_addr, 7);
        let client = Client::new(config, Arc::new(app), Arc::new(wire)).unwrap();
        Harness {
            client,
            app: app_peer,
            wire: wire_peer,
            server,
        }
    }

    fn tcp_packet(src: SocketAddrV4, dst: SocketAddrV4, flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut seg = vec![0u8; 20];
        {
            let mut tcp = TcpHeader::new_fixed(&mut seg[..]).unwrap();
            tcp.set_src_port(src.port());
            tcp.set_dst_port(dst.port());
            tcp.set_seq(1000);
            tcp.set_header_len(20);
            tcp.set_flags(flags);
            tcp.set_window(8192);
        }
        seg.extend_from_slice(payload);
        let cs = transport_checksum(Protocol::Tcp, *src.ip(), *dst.ip(), &seg).unwrap();
        write_transport_checksum(Protocol::Tcp, &mut seg, cs).unwrap();
        build_ipv4(*src.ip(), *dst.ip(), Protocol::Tcp.number(), 1, &seg).unwrap()
    }

    fn identity() -> SessionIdentity {
        SessionIdentity::new(APP.parse().unwrap(), Protocol::Tcp, TARGET.parse().unwrap())
    }

    #[tokio::test]
    async fn test_forward_prepares_segment() {
        let h = harness();
        let packet = tcp_packet(
            APP.parse().unwrap(),
            TARGET.parse().unwrap(),
            TCP_FLAG_FIN | TCP_FLAG_ACK,
            b"bye",
        );
        h.client.forward(1, Protocol::Tcp, &packet).await.unwrap();

        let frame = h.wire.recv().await.unwrap();
        let segment = segment::decode(h.server.detach_recv(&frame).unwrap()).unwrap();
        assert_eq!(segment.handle, 1);

        let tcp = TcpHeader::new_fixed(&segment.payload[..]).unwrap();
        assert_eq!(tcp.src_port(), 0);
        assert_eq!(tcp.dst_port(), 80);
        assert!(!tcp.has_flag(TCP_FLAG_FIN));
        assert!(tcp.has_reserved(teardown::STEALTH_FIN_MARKER));
        assert_eq!(h.client.stats().snapshot().frames_sent, 1);
    }

    #[tokio::test]
    async fn test_deliver_restores_app_endpoint() {
        let h = harness();
        h.client.sessions.insert(3, identity()).unwrap();

        // 服务端去掉了 IP 首部，目的端口是它预留的本地端口
        let reply = tcp_packet(
            TARGET.parse().unwrap(),
            "198.51.100.1:40001".parse().unwrap(),
            TCP_FLAG_SYN | TCP_FLAG_ACK,
            b"",
        );
        let inner = Ipv4Packet::parse(&reply).unwrap().payload().to_vec();
        h.client
            .deliver(Segment::new(3, Bytes::from(inner)))
            .await
            .unwrap();

        let injected = h.app.recv().await.unwrap();
        let ip = Ipv4Packet::parse(&injected).unwrap();
        assert_eq!(ip.source(), Ipv4Addr::new(93, 184, 216, 34));
        assert_eq!(ip.destination(), Ipv4Addr::new(10, 0, 0, 5));
        let tcp = TcpHeader::new_fixed(ip.payload()).unwrap();
        assert_eq!(tcp.src_port(), 80);
        assert_eq!(tcp.dst_port(), 51000);
        assert!(verify_transport(
            Protocol::Tcp,
            ip.source(),
            ip.destination(),
            ip.payload()
        ));
    }

    #[tokio::test]
    async fn test_deliver_unknown_handle_is_not_found() {
        let h = harness();
        let err = h
            .client
            .deliver(Segment::new(9, Bytes::from_static(&[0u8; 20])))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_reply_matching() {
        let h = harness();
        let (_, first) = h.client.begin_registration(1, identity()).unwrap();
        let (_, mut second) = h.client.begin_registration(2, identity()).unwrap();
        let (_, mut third) = h.client.begin_registration(3, identity()).unwrap();

        // 对 2 的成功答复意味着对 1 的答复已丢失
        h.client.complete_registration(2, None).unwrap();
        assert!(first.blocking_recv().is_err());
        assert_eq!(second.try_recv().unwrap(), Ok(()));
        assert_eq!(h.client.control.lock().machine.pending_registrations(), 1);

        h.client
            .complete_registration(NULL_HANDLE, Some("rate limit exceeded".into()))
            .unwrap();
        assert_eq!(
            third.try_recv().unwrap(),
            Err("rate limit exceeded".to_string())
        );

        // 迟到的答复被忽略
        h.client.complete_registration(5, None).unwrap();
        assert_eq!(h.client.control.lock().machine.pending_registrations(), 0);
    }

    #[tokio::test]
    async fn test_register_timeout_abandons() {
        let h = harness();
        let err = h.client.register(1, identity()).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(h.client.control.lock().pending.is_empty());

        // 登记请求确实发出了
        let frame = h.wire.recv().await.unwrap();
        let segment = segment::decode(h.server.detach_recv(&frame).unwrap()).unwrap();
        assert!(segment.is_control());
        let messages = ControlCodec::new(Role::Server)
            .decode_segment(&segment.payload)
            .unwrap();
        assert_eq!(
            messages,
            vec![ControlMessage::RegisterSession {
                handle: 1,
                identity: identity()
            }]
        );
    }

    fn control_messages(h: &Harness, frame: &[u8]) -> Vec<ControlMessage> {
        let segment = segment::decode(h.server.detach_recv(frame).unwrap()).unwrap();
        assert!(segment.is_control());
        ControlCodec::new(Role::Server)
            .decode_segment(&segment.payload)
            .unwrap()
    }

    #[tokio::test]
    async fn test_lost_reply_notifies_server() {
        let h = harness();
        let other = SessionIdentity::new(
            APP.parse().unwrap(),
            Protocol::Udp,
            "8.8.8.8:53".parse().unwrap(),
        );
        let first = h.client.allocator.get().unwrap();
        let second = h.client.allocator.get().unwrap();

        let client = h.client.clone();
        let lost = tokio::spawn(async move { client.register(first, identity()).await });
        h.wire.recv().await.unwrap();
        let client = h.client.clone();
        let answered = tokio::spawn(async move { client.register(second, other).await });
        h.wire.recv().await.unwrap();

        // 只有第二个请求得到答复
        h.client.complete_registration(second, None).unwrap();
        assert!(answered.await.unwrap().is_ok());
        let err = lost.await.unwrap().unwrap_err();
        assert!(err.is_temporary());

        let frame = h.wire.recv().await.unwrap();
        assert_eq!(
            control_messages(&h, &frame),
            vec![ControlMessage::RemoveSession { handle: first }]
        );
    }

    #[tokio::test]
    async fn test_register_timeout_notifies_server() {
        let h = harness();
        assert!(h.client.register(1, identity()).await.unwrap_err().is_timeout());

        let request = h.wire.recv().await.unwrap();
        assert!(matches!(
            &control_messages(&h, &request)[..],
            [ControlMessage::RegisterSession { handle: 1, .. }]
        ));
        let frame = h.wire.recv().await.unwrap();
        assert_eq!(
            control_messages(&h, &frame),
            vec![ControlMessage::RemoveSession { handle: 1 }]
        );
    }

    #[tokio::test]
    async fn test_release_notifies_before_reusing_handle() {
        let h = harness();
        let handle = h.client.allocator.get().unwrap();
        h.client.sessions.insert(handle, identity()).unwrap();

        h.client.release(handle, true).await;
        h.client.release(handle, true).await;
        assert!(!h.client.allocator.contains(handle));
        assert_eq!(h.client.session_count(), 0);

        let frame = h.wire.recv().await.unwrap();
        let segment = segment::decode(h.server.detach_recv(&frame).unwrap()).unwrap();
        let messages = ControlCodec::new(Role::Server)
            .decode_segment(&segment.payload)
            .unwrap();
        assert_eq!(messages, vec![ControlMessage::RemoveSession { handle }]);
        assert_eq!(h.client.stats().snapshot().frames_sent, 1);
    }
}
