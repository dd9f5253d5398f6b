use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Reads the peak resident set size of a live process in KB.
///
/// Returns `None` once the process is gone (or on platforms without procfs).
pub fn read_peak_rss_kb(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    parse_status_field(&status, "VmHWM:").or_else(|| parse_status_field(&status, "VmRSS:"))
}

fn parse_status_field(status: &str, key: &str) -> Option<u64> {
    status
        .lines()
        .find_map(|line| line.strip_prefix(key))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
}

/// Polls a child's peak memory until it exits.
///
/// A missing sample is not an error: a process that finishes before the first
/// poll simply reports zero.
pub struct MemoryWatch {
    peak: watch::Receiver<u64>,
    task: Option<JoinHandle<()>>,
}

impl MemoryWatch {
    pub fn spawn(pid: Option<u32>, interval: Duration) -> Self {
        let (tx, peak) = watch::channel(0u64);
        let task = pid.map(|pid| {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(kb) = read_peak_rss_kb(pid) else {
                        break;
                    };
                    tx.send_if_modified(|peak| {
                        if kb > *peak {
                            *peak = kb;
                            true
                        } else {
                            false
                        }
                    });
                }
            })
        });
        Self { peak, task }
    }

    pub fn peak_kb(&self) -> u64 {
        *self.peak.borrow()
    }

    /// Resolves once the sampled peak goes above `limit_kb`. Never resolves if
    /// sampling stops first.
    pub async fn exceeded(&self, limit_kb: u64) {
        let mut rx = self.peak.clone();
        if rx.wait_for(|kb| *kb > limit_kb).await.is_ok() {
            return;
        }
        std::future::pending::<()>().await
    }

    /// Stops sampling and returns the peak seen so far.
    pub fn finish(mut self) -> u64 {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.peak_kb()
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
