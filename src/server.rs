//! 服务端引擎
//!
//! 从线路侧读取伪装帧，按外层源端点分发给各个隧道对端。上行段经链路表取得
//! 本地端口后补全校验和，以出口地址重新注入；目标服务器的回包按链路表找回
//! 隧道会话，封进伪装 TCP 送回客户端。

use crate::capture::Capture;
use crate::checksum::server_fixup;
use crate::config::ServerConfig;
use crate::control::security::{server_exchange, DEFAULT_SECURITY_TIMEOUT};
use crate::control::{
    ControlCodec, ControlMachine, ControlMessage, ControlState, ControlStream, ControlStreamHandle,
    Role,
};
use crate::disguise::{frame_endpoints, is_disguised, teardown, AesGcmCipher, FakeTcp, KEY_LEN};
use crate::error::{Result, TunnelError};
use crate::link::{Connection, Downlink, LinkTable, Uplink};
use crate::packet::{transport_ports, Ipv4Packet, Protocol};
use crate::port::{OsPortReserver, PortAdapter, PortReserver};
use crate::rate_limiter::RateLimiter;
use crate::segment::{self, Segment};
use crate::session::{SessionHandle, SessionIdentity, SessionTable, CONTROL_HANDLE};
use crate::stats::TunnelStats;
use crate::task::AbortOnDrop;
use crate::tls;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, trace, warn};

/// 正在进行的隧道内密钥交换
struct SecurityExchange {
    inbound: mpsc::UnboundedSender<Bytes>,
    key: oneshot::Receiver<Result<[u8; KEY_LEN]>>,
}

/// 一个隧道对端（客户端的外层端点）
struct Peer {
    addr: SocketAddrV4,
    fake: FakeTcp,
    sessions: SessionTable,
    machine: Mutex<ControlMachine>,
    security: Mutex<Option<SecurityExchange>>,
    /// 最近一次收到可校验帧的时间
    last_seen: Mutex<Instant>,
}

impl Peer {
    fn new(addr: SocketAddrV4, local: SocketAddrV4, require_security: bool) -> Result<Self> {
        Ok(Self {
            addr,
            fake: FakeTcp::with_random_seq(local, addr)?,
            sessions: SessionTable::new(),
            machine: Mutex::new(ControlMachine::new(Role::Server, require_security)),
            security: Mutex::new(None),
            last_seen: Mutex::new(Instant::now()),
        })
    }

    fn uplink(&self, identity: &SessionIdentity) -> Uplink {
        Uplink {
            peer: self.addr,
            source: identity.source,
            protocol: identity.protocol,
            target: identity.destination,
        }
    }
}

/// 隧道服务端
pub struct Server<R: PortReserver = OsPortReserver> {
    config: ServerConfig,
    /// 线路侧：伪装帧的收发
    wire: Arc<dyn Capture>,
    /// 出口侧：重新注入的报文，以及目标服务器的回包
    egress: Arc<dyn Capture>,
    links: LinkTable<R>,
    peers: RwLock<HashMap<SocketAddrV4, Arc<Peer>>>,
    acceptor: Option<TlsAcceptor>,
    rate_limiter: Option<RateLimiter>,
    stats: TunnelStats,
    ip_id: AtomicU16,
}

impl Server<OsPortReserver> {
    /// 使用操作系统端口预留创建服务端
    pub fn with_os_ports(
        config: ServerConfig,
        wire: Arc<dyn Capture>,
        egress: Arc<dyn Capture>,
    ) -> Result<Arc<Self>> {
        let reserver = OsPortReserver::new(config.reserve_addr());
        Self::new(config, wire, egress, reserver)
    }
}

impl<R: PortReserver + 'static> Server<R> {
    pub fn new(
        config: ServerConfig,
        wire: Arc<dyn Capture>,
        egress: Arc<dyn Capture>,
        reserver: R,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let acceptor = match (&config.cert_path, &config.key_path) {
            (Some(cert), Some(key)) => Some(tls::acceptor(tls::load_server_config(cert, key)?)),
            _ => None,
        };
        let rate_limiter = config.rate_limit.clone().map(RateLimiter::new).transpose()?;
        let links = LinkTable::new(Arc::new(PortAdapter::new(reserver)), config.link_ttl());

        Ok(Arc::new(Self {
            config,
            wire,
            egress,
            links,
            peers: RwLock::new(HashMap::new()),
            acceptor,
            rate_limiter,
            stats: TunnelStats::new(),
            ip_id: AtomicU16::new(0),
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn stats(&self) -> &TunnelStats {
        &self.stats
    }

    pub fn links(&self) -> &LinkTable<R> {
        &self.links
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    /// 对端控制通道的当前状态
    pub fn peer_state(&self, peer: SocketAddrV4) -> Option<ControlState> {
        self.find_peer(peer).map(|p| p.machine.lock().state())
    }

    /// 对端已登记的会话数
    pub fn session_count(&self, peer: SocketAddrV4) -> usize {
        self.find_peer(peer).map_or(0, |p| p.sessions.len())
    }

    fn find_peer(&self, addr: SocketAddrV4) -> Option<Arc<Peer>> {
        self.peers.read().get(&addr).cloned()
    }

    /// 运行服务端，直到某一侧抓包通道出错
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            "Tunnel server listening on {} (egress {})",
            self.config.listen_addr, self.config.egress_addr
        );

        let _cleanup = AbortOnDrop::new(tokio::spawn(self.clone().cleanup_loop()));
        let result = tokio::select! {
            result = self.clone().wire_loop() => result,
            result = self.clone().egress_loop() => result,
        };

        if let Err(ref e) = result {
            error!("Tunnel server stopped: {}", e);
        }
        result
    }

    fn accepts(&self, local: SocketAddrV4) -> bool {
        let listen = self.config.listen_addr;
        local.port() == listen.port() && (listen.ip().is_unspecified() || local.ip() == listen.ip())
    }

    async fn wire_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let packet = self.wire.recv().await?;
            if let Err(e) = self.on_frame(&packet).await {
                // 只有注入失败会中止服务端，其余错误都限于单个帧或单个对端
                if matches!(e, TunnelError::Io(_)) {
                    return Err(e);
                }
                self.stats.frame_dropped();
                debug!("Dropped tunnel frame: {}", e);
            }
        }
    }

    async fn on_frame(self: &Arc<Self>, packet: &[u8]) -> Result<()> {
        if !is_disguised(packet) {
            trace!("Ignoring {} byte packet without disguise marker", packet.len());
            return Ok(());
        }
        let (remote, local) = frame_endpoints(packet)?;
        if !self.accepts(local) {
            trace!("Ignoring tunnel frame addressed to {}", local);
            return Ok(());
        }

        let (peer, created) = self.peer_for(remote, local)?;
        let payload = match peer.fake.detach_recv(packet) {
            Ok(payload) => payload,
            Err(e) => {
                // 首帧就无法校验的对端不保留
                if created {
                    self.peers.write().remove(&remote);
                }
                return Err(e);
            }
        };
        self.stats.frame_received(packet.len());
        *peer.last_seen.lock() = Instant::now();
        let segment = segment::decode(payload)?;

        if segment.is_control() {
            if let Err(e) = self.on_control(&peer, &segment.payload).await {
                if e.is_fatal() && !matches!(e, TunnelError::Io(_)) {
                    warn!("Dropping tunnel peer {}: {}", peer.addr, e);
                    self.drop_peer(peer.addr);
                }
                return Err(e);
            }
            Ok(())
        } else {
            self.uplink(&peer, segment).await
        }
    }

    /// 取得或创建对端，同时返回是否为新建
    fn peer_for(&self, remote: SocketAddrV4, local: SocketAddrV4) -> Result<(Arc<Peer>, bool)> {
        if let Some(peer) = self.find_peer(remote) {
            return Ok((peer, false));
        }
        let mut peers = self.peers.write();
        if let Some(peer) = peers.get(&remote) {
            return Ok((peer.clone(), false));
        }
        let peer = Arc::new(Peer::new(remote, local, self.config.require_security)?);
        peers.insert(remote, peer.clone());
        info!("New tunnel peer {} (total: {})", remote, peers.len());
        Ok((peer, true))
    }

    /// 断开对端：丢弃其全部会话并释放链路
    fn drop_peer(&self, addr: SocketAddrV4) {
        let Some(peer) = self.peers.write().remove(&addr) else {
            return;
        };
        for handle in peer.sessions.handles() {
            if peer.sessions.remove(handle).is_some() {
                self.stats.session_removed();
            }
        }
        let links = self.links.remove_peer(addr);
        debug!("Peer {} dropped with {} links", addr, links.len());
    }

    async fn send_control(&self, peer: &Peer, message: ControlMessage) -> Result<()> {
        peer.machine.lock().on_send(&message)?;
        trace!("Control -> {} to {}", message, peer.addr);
        let payload = ControlCodec::new(Role::Server).encode_message(message)?;
        self.send_segment(peer, CONTROL_HANDLE, &payload).await
    }

    async fn send_segment(&self, peer: &Peer, handle: SessionHandle, payload: &[u8]) -> Result<()> {
        let frame = peer.fake.attach_send(&segment::encode(handle, payload))?;
        self.wire.send(&frame).await?;
        self.stats.frame_sent(frame.len());
        Ok(())
    }

    async fn on_control(self: &Arc<Self>, peer: &Arc<Peer>, payload: &[u8]) -> Result<()> {
        let messages = ControlCodec::new(Role::Server).decode_segment(payload)?;
        for message in messages {
            trace!("Control <- {} from {}", message, peer.addr);
            let state = {
                let mut machine = peer.machine.lock();
                machine.on_recv(&message)?;
                machine.state()
            };

            match message {
                ControlMessage::Security(payload) if payload.is_empty() => {
                    if state == ControlState::Securing {
                        self.start_exchange(peer).await?;
                    } else {
                        self.finish_exchange(peer).await?;
                    }
                }
                ControlMessage::Security(payload) => {
                    if let Some(exchange) = peer.security.lock().as_ref() {
                        let _ = exchange.inbound.send(payload);
                    }
                }
                ControlMessage::Start => {
                    self.send_control(peer, ControlMessage::Start).await?;
                    info!("Tunnel peer {} is proxying", peer.addr);
                }
                ControlMessage::RegisterSession { handle, identity } => {
                    self.on_register(peer, handle, identity).await?;
                }
                ControlMessage::RemoveSession { handle } => self.remove_session(peer, handle),
                ControlMessage::PackLoss { count } => {
                    debug!("Peer {} reports {} dropped frames", peer.addr, count);
                }
                // 服务端状态机不接受这两种消息
                ControlMessage::RegisterReply { .. } | ControlMessage::RequireReg { .. } => {}
            }
        }
        Ok(())
    }

    /// 答复安全信号并在后台运行 TLS 交换，密钥经 oneshot 交给切换信号的处理
    async fn start_exchange(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<()> {
        let acceptor = self
            .acceptor
            .clone()
            .ok_or_else(|| TunnelError::violation("in-tunnel security is not configured"))?;

        let (stream, handle) = ControlStream::pair();
        let ControlStreamHandle {
            inbound,
            mut outbound,
        } = handle;
        let (key_tx, key_rx) = oneshot::channel();
        *peer.security.lock() = Some(SecurityExchange {
            inbound,
            key: key_rx,
        });

        self.send_control(peer, ControlMessage::security_signal()).await?;

        let (this, pump_peer) = (self.clone(), peer.clone());
        tokio::spawn(async move {
            while let Some(chunk) = outbound.recv().await {
                if let Err(e) = this
                    .send_control(&pump_peer, ControlMessage::Security(chunk))
                    .await
                {
                    debug!("Security pump for {} stopped: {}", pump_peer.addr, e);
                    break;
                }
            }
        });

        let addr = peer.addr;
        tokio::spawn(async move {
            let result = tokio::time::timeout(DEFAULT_SECURITY_TIMEOUT, server_exchange(stream, acceptor))
                .await
                .unwrap_or(Err(TunnelError::timeout(DEFAULT_SECURITY_TIMEOUT)));
            if let Err(ref e) = result {
                warn!("Key exchange with {} failed: {}", addr, e);
            }
            let _ = key_tx.send(result);
        });
        Ok(())
    }

    /// 收到切换信号：取得交换出的密钥并安装，此后的帧全部加密
    async fn finish_exchange(&self, peer: &Peer) -> Result<()> {
        let exchange = peer
            .security
            .lock()
            .take()
            .ok_or_else(|| TunnelError::violation("security switch without key exchange"))?;
        drop(exchange.inbound);

        // 失败一律按 TLS 错误处理，对端随之断开
        let key = tokio::time::timeout(DEFAULT_SECURITY_TIMEOUT, exchange.key)
            .await
            .map_err(|_| TunnelError::tls("key exchange did not finish in time"))?
            .map_err(|_| TunnelError::tls("key exchange task ended without a result"))?
            .map_err(|e| TunnelError::tls(e.to_string()))?;

        peer.fake.set_cipher(Arc::new(AesGcmCipher::new(&key)?));
        info!("Tunnel with {} is now encrypted", peer.addr);
        Ok(())
    }

    async fn on_register(
        &self,
        peer: &Peer,
        handle: SessionHandle,
        identity: SessionIdentity,
    ) -> Result<()> {
        let reply = match self.admit(peer, handle, identity) {
            Ok(true) => {
                self.stats.session_registered();
                debug!("Peer {} registered {} as handle {}", peer.addr, identity, handle);
                ControlMessage::register_ok(handle)
            }
            Ok(false) => ControlMessage::register_ok(handle),
            Err(reason) => {
                debug!("Peer {} registration of {} rejected: {}", peer.addr, identity, reason);
                ControlMessage::register_failed(reason)
            }
        };
        self.send_control(peer, reply).await
    }

    /// 接受登记，返回是否为新绑定；拒绝时给出原因
    ///
    /// 句柄空间归客户端所有：句柄或流已有别的绑定时，旧绑定是客户端已经放弃的，
    /// 连同链路一起移除
    fn admit(
        &self,
        peer: &Peer,
        handle: SessionHandle,
        identity: SessionIdentity,
    ) -> std::result::Result<bool, String> {
        if peer.sessions.identity_of(handle) == Some(identity) {
            peer.sessions.touch(handle);
            return Ok(false);
        }
        let destination = identity.destination;
        if destination.port() == 0
            || destination.ip().is_unspecified()
            || destination.ip().is_broadcast()
        {
            return Err(format!("invalid destination {}", destination));
        }
        if let Some(limiter) = &self.rate_limiter {
            limiter
                .check(peer.addr)
                .map_err(|wait| format!("rate limit exceeded, retry after {:?}", wait))?;
        }
        if peer.sessions.identity_of(handle).is_some() {
            debug!("Peer {} rebinds handle {}", peer.addr, handle);
            self.remove_session(peer, handle);
        }
        if let Some(stale) = peer.sessions.handle_of(&identity) {
            debug!("Peer {} moves {} from handle {}", peer.addr, identity, stale);
            self.remove_session(peer, stale);
        }
        peer.sessions
            .insert(handle, identity)
            .map_err(|e| e.to_string())?;
        Ok(true)
    }

    fn remove_session(&self, peer: &Peer, handle: SessionHandle) {
        let Some(identity) = peer.sessions.remove(handle) else {
            return;
        };
        self.links.remove(&peer.uplink(&identity));
        self.stats.session_removed();
        debug!("Peer {} removed session {} ({})", peer.addr, handle, identity);
    }

    /// 上行：取得本地端口，补全校验和后从出口注入
    async fn uplink(&self, peer: &Peer, segment: Segment) -> Result<()> {
        let handle = segment.handle;
        let Some(identity) = peer.sessions.identity_of(handle) else {
            self.send_control(peer, ControlMessage::RequireReg { handle })
                .await?;
            return Err(TunnelError::temporary(format!(
                "peer {} sent data for unregistered handle {}",
                peer.addr, handle
            )));
        };
        if !peer.machine.lock().is_proxying() {
            return Err(TunnelError::temporary(format!(
                "peer {} sent data before Start",
                peer.addr
            )));
        }
        peer.sessions.touch(handle);

        let protocol = identity.protocol;
        let mut payload = segment.payload.to_vec();
        if protocol == Protocol::Tcp {
            teardown::decode(&mut payload)?;
        }

        let local_port = self
            .links
            .add(
                peer.uplink(&identity),
                Connection {
                    peer: peer.addr,
                    handle,
                },
            )
            .map_err(|e| {
                TunnelError::temporary(format!("no local port for {}: {}", identity, e))
            })?;

        let packet = server_fixup(
            protocol,
            &payload,
            SocketAddr::V4(SocketAddrV4::new(self.config.egress_addr, local_port)),
            IpAddr::V4(*identity.destination.ip()),
            self.ip_id.fetch_add(1, Ordering::Relaxed),
        )?;
        self.egress.send(&packet).await?;
        trace!("Uplink {} via local port {}", identity, local_port);
        Ok(())
    }

    async fn egress_loop(self: Arc<Self>) -> Result<()> {
        loop {
            let packet = self.egress.recv().await?;
            if let Err(e) = self.downlink(&packet).await {
                if matches!(e, TunnelError::Io(_)) {
                    return Err(e);
                }
                trace!("Ignoring egress packet: {}", e);
            }
        }
    }

    /// 下行：按 (协议, 本地端口, 目标) 找回会话，剥去 IP 首部送回客户端
    async fn downlink(&self, packet: &[u8]) -> Result<()> {
        let ip = Ipv4Packet::parse(packet)?;
        if ip.destination() != self.config.egress_addr {
            return Err(TunnelError::not_found(format!(
                "packet for {} is not egress traffic",
                ip.destination()
            )));
        }
        let protocol = Protocol::from_number(ip.protocol())?;
        let (src_port, dst_port) = transport_ports(protocol, ip.payload())?;
        let downlink = Downlink {
            protocol,
            local_port: dst_port,
            target: SocketAddrV4::new(ip.source(), src_port),
        };

        let link = self.links.lookup_downlink(&downlink).ok_or_else(|| {
            TunnelError::not_found(format!(
                "link for {} {} -> port {}",
                protocol, downlink.target, dst_port
            ))
        })?;
        let Connection { peer, handle } = link.connection;
        let peer = self
            .find_peer(peer)
            .ok_or_else(|| TunnelError::not_found(format!("tunnel peer {}", peer)))?;
        peer.sessions.touch(handle);

        let mut payload = ip.payload().to_vec();
        if protocol == Protocol::Tcp {
            teardown::encode(&mut payload)?;
        }
        self.send_segment(&peer, handle, &payload).await
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval());
        loop {
            interval.tick().await;
            self.cleanup_at(Instant::now()).await;
        }
    }

    /// 清理截至 `now` 空闲超时的链路，通知对应客户端移除会话
    ///
    /// 返回清理的链路数
    pub async fn cleanup_at(&self, now: Instant) -> usize {
        if let Some(limiter) = &self.rate_limiter {
            limiter.shrink();
        }
        let expired = self.links.cleanup_at(now);
        if !expired.is_empty() {
            self.stats.links_expired(expired.len());
            for link in &expired {
                let Connection { peer, handle } = link.connection;
                let Some(peer) = self.find_peer(peer) else {
                    continue;
                };
                if peer.sessions.remove(handle).is_some() {
                    self.stats.session_removed();
                }
                self.notify_removed(&peer, handle).await;
            }
            info!("Expired {} idle links", expired.len());
        }

        self.sweep_peers(now).await;
        expired.len()
    }

    /// 移除从未带过数据或早已沉寂的会话，再断开既无会话又无流量的对端
    async fn sweep_peers(&self, now: Instant) {
        let ttl = self.links.ttl();
        let peers: Vec<Arc<Peer>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            for handle in peer.sessions.idle_handles(now, ttl) {
                self.remove_session(&peer, handle);
                self.notify_removed(&peer, handle).await;
            }

            let quiet = now.saturating_duration_since(*peer.last_seen.lock()) > ttl;
            if quiet && peer.sessions.is_empty() {
                info!("Evicting idle tunnel peer {}", peer.addr);
                self.drop_peer(peer.addr);
            }
        }
    }

    async fn notify_removed(&self, peer: &Peer, handle: SessionHandle) {
        if let Err(e) = self
            .send_control(peer, ControlMessage::RemoveSession { handle })
            .await
        {
            debug!("Failed to send RemoveSession({}) to {}: {}", handle, peer.addr, e);
        }
    }
}
