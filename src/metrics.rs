use serde::{Deserialize, Serialize};

/// Guardian session counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct GuardianStats {
    pub events_received: u64,
    pub events_dropped: u64,
    pub sessions_started: u64,
    pub sessions_completed: u64,
    pub sessions_failed: u64,
    pub sessions_rolled_back: u64,
    pub rebuilds: u64,
}

impl GuardianStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// An event reached admission
    pub fn record_event(&mut self, admitted: bool) {
        self.events_received += 1;
        if !admitted {
            self.events_dropped += 1;
        }
    }

    pub fn record_started(&mut self) {
        self.sessions_started += 1;
    }

    pub fn record_completed(&mut self) {
        self.sessions_completed += 1;
    }

    pub fn record_failed(&mut self) {
        self.sessions_failed += 1;
    }

    /// A rollback after the session had already failed or completed
    pub fn record_rolled_back(&mut self) {
        self.sessions_rolled_back += 1;
    }

    pub fn record_rebuild(&mut self) {
        self.rebuilds += 1;
    }

    /// Completed sessions as a percentage of finished ones
    pub fn success_rate(&self) -> f64 {
        let finished = self.sessions_completed + self.sessions_failed;
        if finished == 0 {
            return 100.0;
        }
        (self.sessions_completed as f64 / finished as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_new() {
        let stats = GuardianStats::new();
        assert_eq!(stats, GuardianStats::default());
        assert_eq!(stats.sessions_started, 0);
    }

    #[test]
    fn test_record_event() {
        let mut stats = GuardianStats::new();
        stats.record_event(true);
        stats.record_event(false);
        stats.record_event(false);
        assert_eq!(stats.events_received, 3);
        assert_eq!(stats.events_dropped, 2);
    }

    #[test]
    fn test_success_rate_empty() {
        assert_eq!(GuardianStats::new().success_rate(), 100.0);
    }

    #[test]
    fn test_success_rate_mixed() {
        let mut stats = GuardianStats::new();
        for _ in 0..3 {
            stats.record_started();
            stats.record_completed();
        }
        stats.record_started();
        stats.record_failed();
        assert!((stats.success_rate() - 75.0).abs() < 0.01);

        // in-flight sessions do not count against the rate
        stats.record_started();
        assert!((stats.success_rate() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_serialization() {
        let mut stats = GuardianStats::new();
        stats.record_rebuild();
        stats.record_rolled_back();
        let json = serde_json::to_string(&stats).unwrap();
        let back: GuardianStats = serde_json::from_str(&json).unwrap();
        assert_eq!(back.rebuilds, 1);
        assert_eq!(back.sessions_rolled_back, 1);
    }
}
