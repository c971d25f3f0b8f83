//! 服务端链路表
//!
//! 把客户端会话 (隧道对端, 源端点, 协议, 目标) 映射到服务端预留的本地端口，
//! 并按 (协议, 本地端口, 目标) 把回包映射回隧道会话

use crate::error::Result;
use crate::packet::Protocol;
use crate::port::{PortAdapter, PortReserver};
use crate::session::SessionHandle;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// 默认链路空闲超时
pub const DEFAULT_LINK_TTL: Duration = Duration::from_secs(120);

/// 上行方向的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uplink {
    /// 隧道外层对端
    pub peer: SocketAddrV4,
    /// 客户端进程的源端点
    pub source: SocketAddrV4,
    pub protocol: Protocol,
    pub target: SocketAddrV4,
}

/// 下行方向（目标服务器回包）的键
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Downlink {
    pub protocol: Protocol,
    pub local_port: u16,
    pub target: SocketAddrV4,
}

/// 回包要送达的隧道会话
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub peer: SocketAddrV4,
    pub handle: SessionHandle,
}

#[derive(Debug)]
pub struct Link {
    pub uplink: Uplink,
    pub connection: Connection,
    pub local_port: u16,
    /// 相对于表创建时刻的毫秒数
    last_activity: AtomicU64,
}

impl Link {
    pub fn downlink(&self) -> Downlink {
        Downlink {
            protocol: self.uplink.protocol,
            local_port: self.local_port,
            target: self.uplink.target,
        }
    }
}

/// 链路表
///
/// 上行与下行两张表各自一把锁，清理时逐条加写锁，不会长时间阻塞新链路注册
pub struct LinkTable<R: PortReserver> {
    ports: Arc<PortAdapter<R>>,
    uplinks: RwLock<HashMap<Uplink, Arc<Link>>>,
    downlinks: RwLock<HashMap<Downlink, Arc<Link>>>,
    ttl: Duration,
    epoch: Instant,
}

impl<R: PortReserver> std::fmt::Debug for LinkTable<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkTable")
            .field("links", &self.uplinks.read().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<R: PortReserver> LinkTable<R> {
    pub fn new(ports: Arc<PortAdapter<R>>, ttl: Duration) -> Self {
        Self {
            ports,
            uplinks: RwLock::new(HashMap::new()),
            downlinks: RwLock::new(HashMap::new()),
            ttl,
            epoch: Instant::now(),
        }
    }

    pub fn ports(&self) -> &Arc<PortAdapter<R>> {
        &self.ports
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn millis(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// 注册链路并返回本地端口；链路已存在时刷新活跃时间并返回原端口
    pub fn add(&self, uplink: Uplink, connection: Connection) -> Result<u16> {
        if let Some(port) = self.lookup_uplink(&uplink) {
            return Ok(port);
        }

        let local_port = self.ports.get_port(uplink.protocol, uplink.target)?;
        let link = Arc::new(Link {
            uplink,
            connection,
            local_port,
            last_activity: AtomicU64::new(self.millis(Instant::now())),
        });

        {
            let mut uplinks = self.uplinks.write();
            if let Some(existing) = uplinks.get(&uplink) {
                // 并发注册了同一条链路
                let port = existing.local_port;
                drop(uplinks);
                self.ports
                    .del_port(uplink.protocol, local_port, uplink.target);
                return Ok(port);
            }
            uplinks.insert(uplink, link.clone());
        }
        self.downlinks.write().insert(link.downlink(), link);

        debug!(
            "New link {} {} -> {} via local port {} (handle {} of {})",
            uplink.protocol, uplink.source, uplink.target, local_port, connection.handle, connection.peer
        );
        Ok(local_port)
    }

    /// 上行查找，命中时刷新活跃时间
    pub fn lookup_uplink(&self, uplink: &Uplink) -> Option<u16> {
        let link = self.uplinks.read().get(uplink).cloned()?;
        self.touch(&link);
        Some(link.local_port)
    }

    /// 下行查找，命中时刷新活跃时间
    pub fn lookup_downlink(&self, downlink: &Downlink) -> Option<Arc<Link>> {
        let link = self.downlinks.read().get(downlink).cloned()?;
        self.touch(&link);
        Some(link)
    }

    fn touch(&self, link: &Link) {
        link.last_activity
            .store(self.millis(Instant::now()), Ordering::Relaxed);
    }

    /// 移除链路并释放端口，重复移除是空操作
    pub fn remove(&self, uplink: &Uplink) -> Option<Arc<Link>> {
        let link = self.uplinks.write().remove(uplink)?;
        self.detach(&link);
        Some(link)
    }

    /// 移除某个隧道对端的全部链路
    pub fn remove_peer(&self, peer: SocketAddrV4) -> Vec<Arc<Link>> {
        let uplinks: Vec<Uplink> = self
            .uplinks
            .read()
            .keys()
            .filter(|u| u.peer == peer)
            .copied()
            .collect();
        uplinks.iter().filter_map(|u| self.remove(u)).collect()
    }

    fn detach(&self, link: &Arc<Link>) {
        {
            let mut downlinks = self.downlinks.write();
            let downlink = link.downlink();
            if downlinks
                .get(&downlink)
                .is_some_and(|current| Arc::ptr_eq(current, link))
            {
                downlinks.remove(&downlink);
            }
        }
        self.ports
            .del_port(link.uplink.protocol, link.local_port, link.uplink.target);
    }

    /// 以 `now` 为当前时刻清理过期链路，返回被清理的链路
    pub fn cleanup_at(&self, now: Instant) -> Vec<Arc<Link>> {
        let now = self.millis(now);
        let ttl = self.ttl.as_millis() as u64;
        let is_expired =
            |link: &Link| now.saturating_sub(link.last_activity.load(Ordering::Relaxed)) > ttl;

        let candidates: Vec<Arc<Link>> = self
            .uplinks
            .read()
            .values()
            .filter(|link| is_expired(link))
            .cloned()
            .collect();

        let mut expired = Vec::with_capacity(candidates.len());
        for link in candidates {
            let removed = {
                let mut uplinks = self.uplinks.write();
                // 收集之后可能被刷新或替换
                let still_expired = uplinks
                    .get(&link.uplink)
                    .is_some_and(|current| Arc::ptr_eq(current, &link) && is_expired(current));
                still_expired && uplinks.remove(&link.uplink).is_some()
            };
            if removed {
                self.detach(&link);
                trace!("Link {} -> {} expired", link.uplink.source, link.uplink.target);
                expired.push(link);
            }
        }
        expired
    }

    pub fn cleanup(&self) -> Vec<Arc<Link>> {
        self.cleanup_at(Instant::now())
    }

    pub fn len(&self) -> usize {
        self.uplinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::tests::FakeReserver;

    fn uplink(source_port: u16) -> Uplink {
        Uplink {
            peer: "203.0.113.7:40000".parse().unwrap(),
            source: SocketAddrV4::new("10.0.0.5".parse().unwrap(), source_port),
            protocol: Protocol::Tcp,
            target: "93.184.216.34:80".parse().unwrap(),
        }
    }

    fn connection(handle: SessionHandle) -> Connection {
        Connection {
            peer: "203.0.113.7:40000".parse().unwrap(),
            handle,
        }
    }

    fn table(ttl: Duration) -> (LinkTable<FakeReserver>, FakeReserver) {
        let reserver = FakeReserver::starting_at(40001);
        let ports = Arc::new(PortAdapter::new(reserver.clone()));
        (LinkTable::new(ports, ttl), reserver)
    }

    #[test]
    fn test_add_and_lookup() {
        let (links, _) = table(DEFAULT_LINK_TTL);
        let port = links.add(uplink(51000), connection(1)).unwrap();
        assert_eq!(port, 40001);
        assert_eq!(links.add(uplink(51000), connection(1)).unwrap(), 40001);
        assert_eq!(links.lookup_uplink(&uplink(51000)), Some(40001));

        let link = links
            .lookup_downlink(&Downlink {
                protocol: Protocol::Tcp,
                local_port: 40001,
                target: "93.184.216.34:80".parse().unwrap(),
            })
            .unwrap();
        assert_eq!(link.connection, connection(1));
        assert_eq!(link.uplink.source.port(), 51000);
    }

    #[test]
    fn test_same_target_needs_distinct_ports() {
        let (links, _) = table(DEFAULT_LINK_TTL);
        let a = links.add(uplink(51000), connection(1)).unwrap();
        let b = links.add(uplink(51001), connection(2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(links.len(), 2);
    }

    #[test]
    fn test_cleanup_releases_expired_link() {
        let (links, reserver) = table(Duration::from_secs(30));
        links.add(uplink(51000), connection(1)).unwrap();

        assert!(links.cleanup_at(Instant::now()).is_empty());

        let expired = links.cleanup_at(Instant::now() + Duration::from_secs(31));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].uplink, uplink(51000));
        assert_eq!(expired[0].local_port, 40001);
        assert!(links.is_empty());
        assert!(links.ports().peers(Protocol::Tcp, 40001).is_none());
        assert_eq!(
            reserver.released.load(std::sync::atomic::Ordering::SeqCst),
            1
        );

        // 过期后再清理不会重复释放
        assert!(links
            .cleanup_at(Instant::now() + Duration::from_secs(62))
            .is_empty());
    }

    #[test]
    fn test_remove_idempotent() {
        let (links, reserver) = table(DEFAULT_LINK_TTL);
        links.add(uplink(51000), connection(1)).unwrap();
        assert!(links.remove(&uplink(51000)).is_some());
        assert!(links.remove(&uplink(51000)).is_none());
        assert_eq!(
            reserver.released.load(std::sync::atomic::Ordering::SeqCst),
            1
        );
    }

    #[test]
    fn test_remove_peer() {
        let (links, _) = table(DEFAULT_LINK_TTL);
        links.add(uplink(51000), connection(1)).unwrap();
        links.add(uplink(51001), connection(2)).unwrap();
        assert_eq!(links.remove_peer("203.0.113.7:40000".parse().unwrap()).len(), 2);
        assert!(links.is_empty());
        assert!(links.ports().is_empty());
    }
}
