// 端口适配模块 - 服务端本地端口的预留与按对端复用

mod os;

pub use os::{OsPortReserver, PortReservation};

use crate::error::{Result, TunnelError};
use crate::packet::Protocol;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::net::SocketAddrV4;
use tracing::{debug, trace};

/// 向操作系统预留本地端口
///
/// 返回的守卫存活期间端口保持占用，丢弃守卫即释放
pub trait PortReserver: Send + Sync {
    type Guard: Send + Sync + 'static;

    fn reserve(&self, protocol: Protocol) -> io::Result<(u16, Self::Guard)>;
}

/// 一个本地端口的预留记录
#[derive(Debug)]
struct Reservation<G> {
    peers: BTreeSet<SocketAddrV4>,
    _guard: G,
}

/// 端口适配器
///
/// 同一本地端口可以服务多个不同的远端，只要同一远端不出现两次；
/// 端口消耗因此受限于每个端口上并发的不同远端数，而不是流的数量
pub struct PortAdapter<R: PortReserver> {
    reserver: R,
    entries: RwLock<BTreeMap<(Protocol, u16), Reservation<R::Guard>>>,
}

impl<R: PortReserver> std::fmt::Debug for PortAdapter<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAdapter")
            .field("reserved", &self.entries.read().len())
            .finish()
    }
}

fn find_reusable<G>(
    entries: &mut BTreeMap<(Protocol, u16), Reservation<G>>,
    protocol: Protocol,
    remote: SocketAddrV4,
) -> Option<u16> {
    entries
        .range_mut((protocol, 0)..=(protocol, u16::MAX))
        .find(|(_, entry)| !entry.peers.contains(&remote))
        .map(|(&(_, port), entry)| {
            entry.peers.insert(remote);
            port
        })
}

impl<R: PortReserver> PortAdapter<R> {
    pub fn new(reserver: R) -> Self {
        Self {
            reserver,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    /// 为发往 `remote` 的流取得一个本地端口
    pub fn get_port(&self, protocol: Protocol, remote: SocketAddrV4) -> Result<u16> {
        if let Some(port) = find_reusable(&mut self.entries.write(), protocol, remote) {
            trace!("Reusing {} port {} for {}", protocol, port, remote);
            return Ok(port);
        }

        // 系统调用不在锁内进行
        let (port, guard) = self.reserver.reserve(protocol)?;

        let mut entries = self.entries.write();
        if let Some(reused) = find_reusable(&mut entries, protocol, remote) {
            // 期间别的任务已经建好了可复用的端口，新预留随守卫一起释放
            trace!("Reusing {} port {} for {}", protocol, reused, remote);
            drop(entries);
            drop(guard);
            return Ok(reused);
        }
        if entries.contains_key(&(protocol, port)) {
            return Err(TunnelError::Other(anyhow::anyhow!(
                "reserver returned {} port {} which is already held",
                protocol,
                port
            )));
        }
        entries.insert(
            (protocol, port),
            Reservation {
                peers: BTreeSet::from([remote]),
                _guard: guard,
            },
        );
        debug!("Reserved {} port {} for {}", protocol, port, remote);
        Ok(port)
    }

    /// 把 `remote` 从端口的对端集合中移除，集合为空时释放端口
    ///
    /// 重复释放是空操作，返回端口是否因此被释放
    pub fn del_port(&self, protocol: Protocol, port: u16, remote: SocketAddrV4) -> bool {
        let released = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(&(protocol, port)) else {
                return false;
            };
            entry.peers.remove(&remote);
            if entry.peers.is_empty() {
                entries.remove(&(protocol, port))
            } else {
                None
            }
        };

        match released {
            Some(reservation) => {
                drop(reservation);
                debug!("Released {} port {}", protocol, port);
                true
            }
            None => false,
        }
    }

    /// 端口当前服务的远端
    pub fn peers(&self, protocol: Protocol, port: u16) -> Option<Vec<SocketAddrV4>> {
        self.entries
            .read()
            .get(&(protocol, port))
            .map(|entry| entry.peers.iter().copied().collect())
    }

    pub fn is_reserved(&self, protocol: Protocol, port: u16) -> bool {
        self.entries.read().contains_key(&(protocol, port))
    }

    /// 当前预留的端口数
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
