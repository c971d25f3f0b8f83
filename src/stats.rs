use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

/// Point-in-time copy of the tunnel counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelStatsSnapshot {
    /// Disguised frames written to the wire
    pub frames_sent: u64,
    /// Disguised frames accepted from the wire
    pub frames_received: u64,
    /// Frames discarded (bad checksum, failed authentication, unknown handle)
    pub frames_dropped: u64,
    /// Payload bytes sent inside frames
    pub bytes_sent: u64,
    /// Payload bytes received inside frames
    pub bytes_received: u64,
    /// Sessions registered since start
    pub sessions_registered: u64,
    /// Sessions removed (idle sweep, RST, or peer request)
    pub sessions_removed: u64,
    /// Currently live sessions
    pub active_sessions: u64,
    /// Server links expired by the cleanup sweep
    pub links_expired: u64,
    /// Timestamp when the tracker was created (Unix timestamp)
    pub start_time: u64,
}

/// Shared counters for one tunnel endpoint
#[derive(Debug, Clone)]
pub struct TunnelStats {
    frames_sent: Arc<AtomicU64>,
    frames_received: Arc<AtomicU64>,
    frames_dropped: Arc<AtomicU64>,
    bytes_sent: Arc<AtomicU64>,
    bytes_received: Arc<AtomicU64>,
    sessions_registered: Arc<AtomicU64>,
    sessions_removed: Arc<AtomicU64>,
    active_sessions: Arc<AtomicU64>,
    links_expired: Arc<AtomicU64>,
    start_time: u64,
}

impl TunnelStats {
    pub fn new() -> Self {
        Self {
            frames_sent: Arc::new(AtomicU64::new(0)),
            frames_received: Arc::new(AtomicU64::new(0)),
            frames_dropped: Arc::new(AtomicU64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            sessions_registered: Arc::new(AtomicU64::new(0)),
            sessions_removed: Arc::new(AtomicU64::new(0)),
            active_sessions: Arc::new(AtomicU64::new(0)),
            links_expired: Arc::new(AtomicU64::new(0)),
            start_time: SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }

    /// Record one frame written to the wire
    pub fn frame_sent(&self, bytes: usize) {
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Record one frame accepted from the wire
    pub fn frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment active sessions (called when a session is registered)
    pub fn session_registered(&self) {
        self.sessions_registered.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active sessions (called when a session is removed)
    pub fn session_removed(&self) {
        self.sessions_removed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn links_expired(&self, count: usize) {
        self.links_expired.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get current snapshot of stats
    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            sessions_registered: self.sessions_registered.load(Ordering::Relaxed),
            sessions_removed: self.sessions_removed.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
            links_expired: self.links_expired.load(Ordering::Relaxed),
            start_time: self.start_time,
        }
    }
}

impl Default for TunnelStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_shared_between_clones() {
        let stats = TunnelStats::new();
        let other = stats.clone();

        stats.frame_sent(100);
        other.frame_received(40);
        other.frame_dropped();
        stats.session_registered();
        stats.session_registered();
        other.session_removed();
        other.links_expired(3);

        let snap = stats.snapshot();
        assert_eq!(snap.frames_sent, 1);
        assert_eq!(snap.bytes_sent, 100);
        assert_eq!(snap.bytes_received, 40);
        assert_eq!(snap.frames_dropped, 1);
        assert_eq!(snap.sessions_registered, 2);
        assert_eq!(snap.active_sessions, 1);
        assert_eq!(snap.links_expired, 3);
        assert!(snap.start_time > 0);
    }

    #[test]
    fn test_active_sessions_never_underflow() {
        let stats = TunnelStats::new();
        stats.session_removed();
        assert_eq!(stats.snapshot().active_sessions, 0);
        assert_eq!(stats.snapshot().sessions_removed, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = TunnelStats::new();
        stats.frame_sent(7);
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        let back: TunnelStatsSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, stats.snapshot());
    }
}
