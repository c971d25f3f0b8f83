// 会话模块 - 会话标识、句柄分配与双向映射表

mod allocator;
mod identity;

pub use allocator::{HandleAllocator, MAX_SESSIONS};
pub use identity::{
    SessionHandle, SessionIdentity, CONTROL_HANDLE, IDENTITY_WIRE_LEN, NULL_HANDLE,
};

use crate::error::{Result, TunnelError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 会话表项
#[derive(Debug)]
struct SessionEntry {
    identity: SessionIdentity,
    /// 相对于表创建时刻的毫秒数
    last_activity: AtomicU64,
}

#[derive(Debug, Default)]
struct SessionMaps {
    by_identity: HashMap<SessionIdentity, SessionHandle>,
    by_handle: HashMap<SessionHandle, SessionEntry>,
}

/// 会话标识与句柄的双向映射
///
/// 两个方向的映射在同一把锁下修改，保证二者始终一致；
/// 刷新活跃时间只需读锁
#[derive(Debug)]
pub struct SessionTable {
    maps: RwLock<SessionMaps>,
    epoch: Instant,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(SessionMaps::default()),
            epoch: Instant::now(),
        }
    }

    fn millis_since_epoch(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// 绑定句柄与会话标识
    ///
    /// 完全相同的绑定重复插入是空操作；句柄或标识已绑定到别处时返回协议违规
    pub fn insert(&self, handle: SessionHandle, identity: SessionIdentity) -> Result<()> {
        if handle == CONTROL_HANDLE || handle == NULL_HANDLE {
            return Err(TunnelError::violation(format!(
                "handle {} is reserved",
                handle
            )));
        }
        if identity.is_control() {
            return Err(TunnelError::violation("control identity cannot be registered"));
        }

        let now = self.millis_since_epoch(Instant::now());
        let mut maps = self.maps.write();
        match (maps.by_handle.get(&handle), maps.by_identity.get(&identity)) {
            (Some(entry), Some(&h)) if entry.identity == identity && h == handle => {
                entry.last_activity.store(now, Ordering::Relaxed);
                return Ok(());
            }
            (Some(entry), _) => {
                return Err(TunnelError::violation(format!(
                    "handle {} already bound to {}",
                    handle, entry.identity
                )))
            }
            (None, Some(h)) => {
                return Err(TunnelError::violation(format!(
                    "{} already bound to handle {}",
                    identity, h
                )))
            }
            (None, None) => {}
        }

        maps.by_identity.insert(identity, handle);
        maps.by_handle.insert(
            handle,
            SessionEntry {
                identity,
                last_activity: AtomicU64::new(now),
            },
        );
        Ok(())
    }

    pub fn handle_of(&self, identity: &SessionIdentity) -> Option<SessionHandle> {
        self.maps.read().by_identity.get(identity).copied()
    }

    pub fn identity_of(&self, handle: SessionHandle) -> Option<SessionIdentity> {
        self.maps.read().by_handle.get(&handle).map(|e| e.identity)
    }

    /// 刷新活跃时间，返回句柄是否存在
    pub fn touch(&self, handle: SessionHandle) -> bool {
        let now = self.millis_since_epoch(Instant::now());
        match self.maps.read().by_handle.get(&handle) {
            Some(entry) => {
                entry.last_activity.store(now, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// 移除会话，不存在时返回 None
    pub fn remove(&self, handle: SessionHandle) -> Option<SessionIdentity> {
        let mut maps = self.maps.write();
        let entry = maps.by_handle.remove(&handle)?;
        maps.by_identity.remove(&entry.identity);
        Some(entry.identity)
    }

    /// 截至 `now` 空闲超过 `timeout` 的句柄
    pub fn idle_handles(&self, now: Instant, timeout: Duration) -> Vec<SessionHandle> {
        let now = self.millis_since_epoch(now);
        let timeout = timeout.as_millis() as u64;
        self.maps
            .read()
            .by_handle
            .iter()
            .filter(|(_, e)| now.saturating_sub(e.last_activity.load(Ordering::Relaxed)) > timeout)
            .map(|(&h, _)| h)
            .collect()
    }

    pub fn handles(&self) -> Vec<SessionHandle> {
        self.maps.read().by_handle.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Protocol;

    fn identity(port: u16) -> SessionIdentity {
        SessionIdentity::new(
            format!("10.0.0.5:{}", port).parse().unwrap(),
            Protocol::Tcp,
            "93.184.216.34:80".parse().unwrap(),
        )
    }

    #[test]
    fn test_bijection() {
        let table = SessionTable::new();
        table.insert(1, identity(51000)).unwrap();
        table.insert(2, identity(51001)).unwrap();

        assert_eq!(table.handle_of(&identity(51000)), Some(1));
        assert_eq!(table.identity_of(2), Some(identity(51001)));
        assert_eq!(table.len(), 2);

        // 重复插入相同绑定
        table.insert(1, identity(51000)).unwrap();
        // 冲突绑定
        assert!(table.insert(1, identity(51002)).is_err());
        assert!(table.insert(3, identity(51000)).is_err());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_reserved_handles_rejected() {
        let table = SessionTable::new();
        assert!(table.insert(CONTROL_HANDLE, identity(1)).is_err());
        assert!(table.insert(NULL_HANDLE, identity(1)).is_err());
        assert!(table.insert(5, SessionIdentity::control()).is_err());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = SessionTable::new();
        table.insert(7, identity(1)).unwrap();
        assert_eq!(table.remove(7), Some(identity(1)));
        assert_eq!(table.remove(7), None);
        assert!(table.handle_of(&identity(1)).is_none());
        assert!(!table.touch(7));
    }

    #[test]
    fn test_idle_handles() {
        let table = SessionTable::new();
        table.insert(1, identity(1)).unwrap();
        table.insert(2, identity(2)).unwrap();

        let now = Instant::now();
        assert!(table.idle_handles(now, Duration::from_secs(30)).is_empty());

        let later = now + Duration::from_secs(31);
        let mut idle = table.idle_handles(later, Duration::from_secs(30));
        idle.sort();
        assert_eq!(idle, vec![1, 2]);
    }
}
