//! Invocation memory admission control
//!
//! Before an invoke is enqueued, the monitor checks whether the estimated
//! in-flight payload footprint would push the process past its configured
//! thresholds. Small messages always pass; large ones are tracked in an
//! estimate counter and a per-instance counter so a single hot instance
//! cannot starve the rest once the low watermark is crossed.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::domain_types::{InstanceId, RequestId};

/// Supplies the process's current RSS and memory limit.
pub trait MemoryProbe: Send + Sync {
    fn current(&self) -> u64;
    fn limit(&self) -> u64;
}

/// Probe refreshed periodically from `/proc/self/status`.
pub struct ProcStatusProbe {
    current: AtomicU64,
    limit: u64,
}

impl ProcStatusProbe {
    /// Creates the probe with a fixed limit and spawns the refresh task.
    pub fn start(limit: u64, refresh_interval: Duration) -> Arc<Self> {
        let probe = Arc::new(Self {
            current: AtomicU64::new(0),
            limit,
        });
        let refreshing = Arc::clone(&probe);
        tokio::spawn(async move {
            loop {
                refreshing.refresh();
                tokio::time::sleep(refresh_interval).await;
            }
        });
        probe
    }

    fn refresh(&self) {
        if let Some(rss) = read_rss_bytes() {
            self.current.store(rss, Ordering::Relaxed);
        }
    }
}

fn read_rss_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

impl MemoryProbe for ProcStatusProbe {
    fn current(&self) -> u64 {
        self.current.load(Ordering::Relaxed)
    }

    fn limit(&self) -> u64 {
        self.limit
    }
}

/// Thresholds steering the admission ladder.
#[derive(Debug, Clone)]
pub struct MemoryControlConfig {
    /// Fraction of the limit above which every request is rejected.
    pub high_memory_threshold: f64,
    /// Fraction of the limit below which large requests pass unexamined.
    pub low_memory_threshold: f64,
    /// Messages at or below this size are always admitted.
    pub msg_size_threshold: u64,
    pub enabled: bool,
}

impl Default for MemoryControlConfig {
    fn default() -> Self {
        Self {
            high_memory_threshold: 0.8,
            low_memory_threshold: 0.6,
            msg_size_threshold: 20_000,
            enabled: true,
        }
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    estimate: u64,
    instance_usage: HashMap<InstanceId, u64>,
    request_size: HashMap<RequestId, u64>,
}

/// Admission gate consulted for every incoming invoke.
pub struct MemoryMonitor {
    config: MemoryControlConfig,
    probe: Arc<dyn MemoryProbe>,
    state: Mutex<MonitorState>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryControlConfig, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            config,
            probe,
            state: Mutex::new(MonitorState::default()),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Decides whether a request of `msg_size` bytes may be admitted; on
    /// admission of a large message, the size is charged to the estimate
    /// and per-instance counters until [`Self::release`].
    pub fn allow(&self, instance_id: &InstanceId, request_id: &RequestId, msg_size: u64) -> bool {
        let limit = self.probe.limit();
        let current = self.probe.current();
        let high = (limit as f64 * self.config.high_memory_threshold) as u64;
        let low = (limit as f64 * self.config.low_memory_threshold) as u64;

        let mut state = self.state.lock().expect("memory monitor lock");
        let estimate = state.estimate;
        debug!(
            request = %request_id,
            instance = %instance_id,
            current,
            estimate,
            limit,
            msg_size,
            "memory admission check"
        );

        if current.checked_add(msg_size).is_none() {
            warn!(request = %request_id, instance = %instance_id, "memory usage overflow, reject request");
            return false;
        }
        if current + msg_size > high {
            warn!(
                request = %request_id,
                instance = %instance_id,
                current,
                estimate,
                limit,
                threshold = self.config.high_memory_threshold,
                "memory usage reaches high threshold, reject request"
            );
            return false;
        }
        if msg_size <= self.config.msg_size_threshold {
            return true;
        }
        // Above the size threshold the estimate counters apply.
        if current <= low && estimate <= low {
            Self::charge(&mut state, instance_id, request_id, msg_size);
            return true;
        }
        let instance_usage = state
            .instance_usage
            .get(instance_id)
            .copied()
            .unwrap_or(0);
        let average = estimate / (state.instance_usage.len() as u64 + 1);
        if instance_usage == 0 || instance_usage <= average {
            Self::charge(&mut state, instance_id, request_id, msg_size);
            return true;
        }
        warn!(
            request = %request_id,
            instance = %instance_id,
            current,
            estimate,
            limit,
            threshold = self.config.low_memory_threshold,
            instance_usage,
            average,
            "estimated usage exceeds per-instance average, reject request"
        );
        false
    }

    fn charge(
        state: &mut MonitorState,
        instance_id: &InstanceId,
        request_id: &RequestId,
        msg_size: u64,
    ) {
        state.estimate = state.estimate.saturating_add(msg_size);
        let usage = state.instance_usage.entry(instance_id.clone()).or_insert(0);
        *usage = usage.saturating_add(msg_size);
        state.request_size.insert(request_id.clone(), msg_size);
    }

    /// Returns a request's charge on terminal acknowledgement. Unknown
    /// request ids (small messages, rejected requests) are a no-op.
    pub fn release(&self, instance_id: &InstanceId, request_id: &RequestId) {
        let mut state = self.state.lock().expect("memory monitor lock");
        let Some(msg_size) = state.request_size.remove(request_id) else {
            return;
        };
        state.estimate = state.estimate.saturating_sub(msg_size);
        match state.instance_usage.get_mut(instance_id) {
            Some(usage) if *usage > msg_size => *usage -= msg_size,
            Some(_) => {
                state.instance_usage.remove(instance_id);
            }
            None => {}
        }
    }

    /// Current total estimated in-flight bytes.
    #[must_use]
    pub fn estimate(&self) -> u64 {
        self.state.lock().expect("memory monitor lock").estimate
    }

    #[cfg(test)]
    fn prime_estimate(&self, bytes: u64) {
        self.state.lock().expect("memory monitor lock").estimate = bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    struct FixedProbe {
        current: u64,
        limit: u64,
    }

    impl MemoryProbe for FixedProbe {
        fn current(&self) -> u64 {
            self.current
        }
        fn limit(&self) -> u64 {
            self.limit
        }
    }

    fn monitor(current: u64, limit: u64) -> MemoryMonitor {
        MemoryMonitor::new(
            MemoryControlConfig::default(),
            Arc::new(FixedProbe { current, limit }),
        )
    }

    fn ids(instance: &str, request: &str) -> (InstanceId, RequestId) {
        (
            InstanceId::new(instance.to_string()),
            RequestId::new(request.to_string()),
        )
    }

    #[test]
    fn test_high_threshold_rejects_immediately() {
        let monitor = monitor(9_000_000_000, 10_000_000_000);
        let (instance, request) = ids("instA", "req-1");
        // current + size > 0.8 * limit
        assert!(!monitor.allow(&instance, &request, 1));
        assert_eq!(monitor.estimate(), 0, "rejected request leaves estimate unchanged");
    }

    #[test]
    fn test_small_messages_always_pass_untracked() {
        let monitor = monitor(1_000_000, 10_000_000_000);
        let (instance, request) = ids("instA", "req-1");
        assert!(monitor.allow(&instance, &request, 20_000));
        assert_eq!(monitor.estimate(), 0);
        // Releasing an untracked request is a no-op.
        monitor.release(&instance, &request);
        assert_eq!(monitor.estimate(), 0);
    }

    #[test]
    fn test_large_message_below_low_watermark_is_charged() {
        let monitor = monitor(1_000_000, 10_000_000_000);
        let (instance, request) = ids("instA", "req-1");
        assert!(monitor.allow(&instance, &request, 80_000));
        assert_eq!(monitor.estimate(), 80_000);
        monitor.release(&instance, &request);
        assert_eq!(monitor.estimate(), 0);
    }

    #[test]
    fn test_fair_share_between_low_and_high_watermark() {
        // RSS sits between the watermarks: low = 30.72e9, high = 40.96e9.
        let monitor = monitor(33_280_000_000, 51_200_000_000);

        // Small requests still pass.
        let (inst1, req1) = ids("instance_1", "request_1");
        assert!(monitor.allow(&inst1, &req1, 10_000));

        // Instances with no recorded usage are admitted and charged.
        let (inst2, req2) = ids("instance_2", "request_2");
        let (inst3, req3) = ids("instance_3", "request_3");
        assert!(monitor.allow(&inst2, &req2, 80_000));
        assert!(monitor.allow(&inst3, &req3, 25_000));
        assert_eq!(monitor.estimate(), 105_000);

        // instance_2's share (80000) exceeds the average (105000 / 3).
        let (_, req4) = ids("instance_2", "request_4");
        assert!(!monitor.allow(&inst2, &req4, 25_000));
        assert_eq!(monitor.estimate(), 105_000);

        // instance_3's share (25000) stays at or below the average.
        let (_, req5) = ids("instance_3", "request_5");
        assert!(monitor.allow(&inst3, &req5, 25_000));
    }

    #[test]
    fn test_instance_with_no_usage_is_admitted_above_low_watermark() {
        let monitor = monitor(1_000_000, 10_000_000_000);
        monitor.prime_estimate(6_500_000_000);
        let (fresh, request) = ids("instFresh", "req-9");
        assert!(monitor.allow(&fresh, &request, 80_000));
    }

    #[test]
    fn test_overflow_guard_rejects() {
        let monitor = monitor(u64::MAX - 10, u64::MAX);
        let (instance, request) = ids("instA", "req-1");
        assert!(!monitor.allow(&instance, &request, 100));
    }

    proptest! {
        /// Every admitted large request adds exactly its size to the
        /// estimate and every release subtracts it; rejected requests leave
        /// the counter untouched.
        #[test]
        fn prop_estimate_balances(sizes in prop::collection::vec(20_001u64..200_000, 1..20)) {
            let monitor = monitor(0, 10_000_000_000);
            let mut admitted = Vec::new();
            for (index, size) in sizes.iter().enumerate() {
                let (instance, request) = ids(
                    &format!("inst{}", index % 3),
                    &format!("req-{index}"),
                );
                let before = monitor.estimate();
                if monitor.allow(&instance, &request, *size) {
                    prop_assert_eq!(monitor.estimate(), before + size);
                    admitted.push((instance, request, *size));
                } else {
                    prop_assert_eq!(monitor.estimate(), before);
                }
            }
            for (instance, request, size) in admitted {
                let before = monitor.estimate();
                monitor.release(&instance, &request);
                prop_assert_eq!(monitor.estimate(), before - size);
            }
            prop_assert_eq!(monitor.estimate(), 0);
        }
    }
}
