//! Per-IP sliding-window counter of failed connection attempts.

use crate::config::AutoBanConfig;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

pub struct AutoBan {
    config: AutoBanConfig,
    failures: HashMap<IpAddr, VecDeque<Instant>>,
}

impl AutoBan {
    pub fn new(config: AutoBanConfig) -> Self {
        Self {
            config,
            failures: HashMap::new(),
        }
    }

    fn prune(queue: &mut VecDeque<Instant>, window: Duration) {
        while let Some(oldest) = queue.front() {
            if oldest.elapsed() > window {
                queue.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records one failed attempt. Returns the ban duration when the window
    /// overflows; the caller creates the ban.
    pub fn record_failure(&mut self, ip: IpAddr) -> Option<u32> {
        if self.config.attempts == 0 {
            return None;
        }

        let window = Duration::from_secs(self.config.timeframe_secs);
        let queue = self.failures.entry(ip).or_default();

        Self::prune(queue, window);
        queue.push_back(Instant::now());

        if queue.len() as u32 > self.config.attempts {
            queue.clear();

            Some(self.config.duration_secs)
        } else {
            None
        }
    }

    pub fn record_success(&mut self, ip: IpAddr) {
        if self.config.reset_on_success {
            self.failures.remove(&ip);
        }
    }

    /// Drops empty windows so the table stays bounded by active offenders.
    pub fn sweep(&mut self) {
        let window = Duration::from_secs(self.config.timeframe_secs);

        self.failures.retain(|_, queue| {
            Self::prune(queue, window);
            !queue.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(attempts: u32) -> AutoBanConfig {
        AutoBanConfig {
            attempts,
            timeframe_secs: 60,
            duration_secs: 300,
            reset_on_success: true,
        }
    }

    #[test]
    fn triggers_after_threshold() {
        let mut autoban = AutoBan::new(config(3));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        assert_eq!(autoban.record_failure(ip), None);
        assert_eq!(autoban.record_failure(ip), None);
        assert_eq!(autoban.record_failure(ip), None);
        assert_eq!(autoban.record_failure(ip), Some(300));
    }

    #[test]
    fn success_resets_the_counter() {
        let mut autoban = AutoBan::new(config(2));
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        autoban.record_failure(ip);
        autoban.record_failure(ip);
        autoban.record_success(ip);

        assert_eq!(autoban.record_failure(ip), None);
    }

    #[test]
    fn counters_are_per_ip() {
        let mut autoban = AutoBan::new(config(1));
        let a: IpAddr = "10.0.0.3".parse().unwrap();
        let b: IpAddr = "10.0.0.4".parse().unwrap();

        autoban.record_failure(a);
        assert_eq!(autoban.record_failure(b), None);
    }

    #[test]
    fn disabled_when_attempts_is_zero() {
        let mut autoban = AutoBan::new(config(0));
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        for _ in 0..100 {
            assert_eq!(autoban.record_failure(ip), None);
        }
    }
}
