use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub sessions_started: u64,
    pub warm_reuses: u64,
    pub launch_fallbacks: u64,
    pub qr_requests: u64,
    pub qr_captures: u64,
    pub degraded_captures: u64,
    pub mode_switches: u64,
    pub logins_confirmed: u64,
    pub logins_expired: u64,
    pub publishes: u64,
    pub publish_failures: u64,
    pub pool_exhaustions: u64,
}

impl SessionMetrics {
    pub fn record_session_start(&mut self, warm: bool) {
        self.sessions_started = self.sessions_started.saturating_add(1);
        if warm {
            self.warm_reuses = self.warm_reuses.saturating_add(1);
        }
    }

    pub fn record_launch_fallback(&mut self) {
        self.launch_fallbacks = self.launch_fallbacks.saturating_add(1);
    }

    pub fn record_qr_request(&mut self) {
        self.qr_requests = self.qr_requests.saturating_add(1);
    }

    pub fn record_qr_capture(&mut self, degraded: bool) {
        self.qr_captures = self.qr_captures.saturating_add(1);
        if degraded {
            self.degraded_captures = self.degraded_captures.saturating_add(1);
        }
    }

    pub fn record_mode_switch(&mut self) {
        self.mode_switches = self.mode_switches.saturating_add(1);
    }

    pub fn record_login_confirmed(&mut self) {
        self.logins_confirmed = self.logins_confirmed.saturating_add(1);
    }

    pub fn record_login_expired(&mut self) {
        self.logins_expired = self.logins_expired.saturating_add(1);
    }

    pub fn record_publish(&mut self, success: bool) {
        self.publishes = self.publishes.saturating_add(1);
        if !success {
            self.publish_failures = self.publish_failures.saturating_add(1);
        }
    }

    pub fn record_pool_exhaustion(&mut self) {
        self.pool_exhaustions = self.pool_exhaustions.saturating_add(1);
    }

    pub fn qr_success_rate(&self) -> f64 {
        if self.qr_requests == 0 {
            0.0
        } else {
            (self.qr_captures as f64 / self.qr_requests as f64) * 100.0
        }
    }
}
