use super::identity::{SessionHandle, CONTROL_HANDLE};
use crate::error::{Result, TunnelError};
use parking_lot::RwLock;
use tracing::trace;

/// 可分配给数据会话的句柄数：1..=65534
pub const MAX_SESSIONS: usize = CONTROL_HANDLE as usize - 1;

/// 会话句柄分配器
///
/// 已分配句柄按升序保存，总是返回最小的空闲正值，让线上句柄保持紧凑
#[derive(Debug, Default)]
pub struct HandleAllocator {
    allocated: RwLock<Vec<SessionHandle>>,
}

/// 在升序、无重复、从 1 开始的序列里找第一个缺口
///
/// 前缀 `sorted[..i]` 恰好是 `1..=i` 当且仅当 `sorted[i-1] == i`，
/// 该性质单调，可以二分
fn first_free(sorted: &[SessionHandle]) -> Option<SessionHandle> {
    let (mut lo, mut hi) = (0usize, sorted.len());
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if usize::from(sorted[mid]) == mid + 1 {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    let candidate = lo + 1;
    if candidate > MAX_SESSIONS {
        None
    } else {
        Some(candidate as SessionHandle)
    }
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分配一个句柄
    ///
    /// 先在读锁下查找候选值，再在写锁下确认并插入；
    /// 候选值在两次加锁之间被占用时，在写锁下重新查找
    pub fn get(&self) -> Result<SessionHandle> {
        let candidate = first_free(&self.allocated.read());

        let mut allocated = self.allocated.write();
        if let Some(handle) = candidate {
            if let Err(pos) = allocated.binary_search(&handle) {
                allocated.insert(pos, handle);
                trace!("Allocated session handle {}", handle);
                return Ok(handle);
            }
        }

        let handle = first_free(&allocated).ok_or(TunnelError::CapacityExceeded)?;
        match allocated.binary_search(&handle) {
            Ok(_) => Err(TunnelError::CapacityExceeded),
            Err(pos) => {
                allocated.insert(pos, handle);
                trace!("Allocated session handle {} (slow path)", handle);
                Ok(handle)
            }
        }
    }

    /// 释放句柄，重复释放或释放未分配的句柄是空操作
    pub fn put(&self, handle: SessionHandle) {
        let mut allocated = self.allocated.write();
        if let Ok(pos) = allocated.binary_search(&handle) {
            allocated.remove(pos);
            trace!("Released session handle {}", handle);
        }
    }

    pub fn contains(&self, handle: SessionHandle) -> bool {
        self.allocated.read().binary_search(&handle).is_ok()
    }

    pub fn len(&self) -> usize {
        self.allocated.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocated.read().is_empty()
    }
}
