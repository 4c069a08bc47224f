// Coarse congestion classification. This does not attempt TCP-style fairness: it only makes
// resends and acks less aggressive, and sheds a fixed share of unreliable traffic, while the RTT
// stays above a threshold.

use crate::config::Config;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    None,
    Good,
    Bad,
}

#[derive(Clone, Debug)]
struct Params {
    smoothing_factor: f64,
    threshold_ms: u64,
    reward_interval_ms: u64,
    punish_timeout_ms: u64,
    required_time_min_ms: u64,
    required_time_default_ms: u64,
    required_time_max_ms: u64,
    packet_reduction: u32,
    bad_mode_multiplier: f64,
    resend_timeout_ms: u64,
    resends_max: u64,
    reack_timeout_ms: u64,
}

impl From<&Config> for Params {
    fn from(config: &Config) -> Self {
        Self {
            smoothing_factor: config.rtt_smoothing_factor,
            threshold_ms: config.congestion_threshold_ms,
            reward_interval_ms: config.good_rtt_reward_interval_ms,
            punish_timeout_ms: config.bad_rtt_punish_timeout_ms,
            required_time_min_ms: config.congestion_required_time_min_ms,
            required_time_default_ms: config.congestion_required_time_default_ms,
            required_time_max_ms: config.congestion_required_time_max_ms,
            packet_reduction: config.congestion_packet_reduction.into(),
            bad_mode_multiplier: config.bad_mode_multiplier,
            resend_timeout_ms: config.resend_timeout_ms,
            resends_max: config.packet_resends_max,
            reack_timeout_ms: config.reack_timeout_ms,
        }
    }
}

pub struct CongestionController {
    params: Params,
    mode: Mode,
    // Smoothed round trip time, unset until the first sample
    rtt_ms: Option<f64>,
    last_change_ms: u64,
    // Dwell time required before leaving bad mode
    required_time_ms: u64,
    unreliable_count: u32,
    // Knobs derived from the current mode
    resend_timeout_ms: u64,
    resends_max: u64,
    reack_timeout_ms: u64,
}

impl CongestionController {
    pub fn new(config: &Config, now_ms: u64) -> Self {
        let params = Params::from(config);
        let required_time_ms = params.required_time_default_ms;

        let mut cc = Self {
            params,
            mode: Mode::None,
            rtt_ms: None,
            last_change_ms: now_ms,
            required_time_ms,
            unreliable_count: 0,
            resend_timeout_ms: 0,
            resends_max: 0,
            reack_timeout_ms: 0,
        };

        cc.change_mode(Mode::None, now_ms);

        cc
    }

    pub fn reset(&mut self, now_ms: u64) {
        self.change_mode(Mode::None, now_ms);
        self.rtt_ms = None;
        self.required_time_ms = self.params.required_time_default_ms;
        self.unreliable_count = 0;
    }

    /// Feeds the round trip of a packet sent at `send_time_ms` and acknowledged at `now_ms`.
    pub fn check(&mut self, send_time_ms: u64, now_ms: u64) {
        let sample_ms = now_ms.saturating_sub(send_time_ms);
        let sample = sample_ms as f64;

        self.rtt_ms = Some(match self.rtt_ms {
            Some(rtt) => rtt + (sample - rtt) * self.params.smoothing_factor,
            None => sample,
        });

        let over_threshold = sample_ms > self.params.threshold_ms;
        let since_change_ms = now_ms.saturating_sub(self.last_change_ms);

        match self.mode {
            Mode::None => {
                self.change_mode(Mode::Good, now_ms);
            }
            Mode::Good => {
                if over_threshold {
                    if since_change_ms <= self.params.punish_timeout_ms {
                        self.required_time_ms =
                            (self.required_time_ms * 2).min(self.params.required_time_max_ms);
                    }

                    self.change_mode(Mode::Bad, now_ms);
                } else if since_change_ms >= self.params.reward_interval_ms {
                    self.required_time_ms =
                        (self.required_time_ms / 2).max(self.params.required_time_min_ms);
                    self.last_change_ms = now_ms;
                }
            }
            Mode::Bad => {
                if over_threshold {
                    self.last_change_ms = now_ms;
                }

                if now_ms.saturating_sub(self.last_change_ms) >= self.required_time_ms {
                    self.change_mode(Mode::Good, now_ms);
                }
            }
        }
    }

    fn change_mode(&mut self, mode: Mode, now_ms: u64) {
        let ref p = self.params;

        match mode {
            Mode::None | Mode::Good => {
                self.resend_timeout_ms = p.resend_timeout_ms;
                self.resends_max = p.resends_max;
                self.reack_timeout_ms = p.reack_timeout_ms;
            }
            Mode::Bad => {
                let m = p.bad_mode_multiplier;
                self.resend_timeout_ms = (p.resend_timeout_ms as f64 * m) as u64;
                self.resends_max = (p.resends_max as f64 * m) as u64;
                self.reack_timeout_ms = (p.reack_timeout_ms as f64 * m) as u64;
            }
        }

        self.mode = mode;
        self.last_change_ms = now_ms;
    }

    /// In bad mode, returns true for every Nth unreliable packet.
    pub fn should_drop_unreliable(&mut self) -> bool {
        match self.mode {
            Mode::Bad => {
                self.unreliable_count = self.unreliable_count.wrapping_add(1);
                self.unreliable_count % self.params.packet_reduction == 0
            }
            _ => false,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn rtt_ms(&self) -> u64 {
        self.rtt_ms.unwrap_or(0.0) as u64
    }

    pub fn ping_ms(&self) -> u64 {
        self.rtt_ms() / 2
    }

    #[cfg(test)]
    pub fn required_time_ms(&self) -> u64 {
        self.required_time_ms
    }

    pub fn resend_timeout_ms(&self) -> u64 {
        self.resend_timeout_ms
    }

    pub fn resends_max(&self) -> u64 {
        self.resends_max
    }

    pub fn reack_timeout_ms(&self) -> u64 {
        self.reack_timeout_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_cc() -> CongestionController {
        CongestionController::new(&Config::default(), 0)
    }

    #[test]
    fn first_sample() {
        let mut cc = new_cc();
        assert_eq!(cc.mode(), Mode::None);
        assert!(!cc.should_drop_unreliable());

        cc.check(1000, 1080);

        assert_eq!(cc.mode(), Mode::Good);
        assert_eq!(cc.rtt_ms(), 80);
        assert_eq!(cc.ping_ms(), 40);
    }

    #[test]
    fn smoothing() {
        let mut cc = new_cc();

        cc.check(0, 100);
        cc.check(100, 300);

        // 100 + (200 - 100) * 0.1
        assert_eq!(cc.rtt_ms(), 110);
    }

    #[test]
    fn stays_good() {
        let mut cc = new_cc();

        for i in 0..50 {
            let t = 1000 + i * 100;
            cc.check(t, t + 200);
            assert_eq!(cc.mode(), Mode::Good);
        }

        assert_eq!(cc.resend_timeout_ms(), 50);
        assert_eq!(cc.resends_max(), 15);
        assert_eq!(cc.reack_timeout_ms(), 50);
    }

    #[test]
    fn bad_mode_knobs() {
        let mut cc = new_cc();

        cc.check(1000, 1050);
        cc.check(1100, 1400);

        assert_eq!(cc.mode(), Mode::Bad);
        assert_eq!(cc.resend_timeout_ms(), 125);
        assert_eq!(cc.resends_max(), 37);
        assert_eq!(cc.reack_timeout_ms(), 125);
    }

    #[test]
    fn punish_within_window() {
        let mut cc = new_cc();

        // Good at t=1050
        cc.check(1000, 1050);
        // Bad shortly after
        cc.check(1100, 1400);

        assert_eq!(cc.mode(), Mode::Bad);
        assert_eq!(cc.required_time_ms(), 8000);
    }

    #[test]
    fn no_punish_outside_window() {
        let mut cc = new_cc();

        cc.check(1000, 1050);
        cc.check(20_000, 20_300);

        assert_eq!(cc.mode(), Mode::Bad);
        assert_eq!(cc.required_time_ms(), 4000);
    }

    #[test]
    fn punish_is_capped() {
        let mut cc = new_cc();

        let mut t = 0;
        for _ in 0..10 {
            // Enter good, then immediately bad
            cc.check(t, t + 10);
            t += 10;
            if cc.mode() == Mode::Bad {
                t += cc.required_time_ms();
                cc.check(t, t + 10);
                t += 10;
            }
            cc.check(t, t + 300);
            t += 300;
        }

        assert_eq!(cc.required_time_ms(), 60_000);
    }

    #[test]
    fn recover_after_dwell() {
        let mut cc = new_cc();

        cc.check(0, 50);
        cc.check(100, 400);
        assert_eq!(cc.mode(), Mode::Bad);
        assert_eq!(cc.required_time_ms(), 8000);

        // Fresh bad sample restarts the dwell
        cc.check(4000, 4300);
        cc.check(8400, 8410);
        assert_eq!(cc.mode(), Mode::Bad);

        cc.check(12_300, 12_310);
        assert_eq!(cc.mode(), Mode::Good);
        assert_eq!(cc.resend_timeout_ms(), 50);
    }

    #[test]
    fn reward_sustained_good() {
        let mut cc = new_cc();

        cc.check(0, 10);
        cc.check(5000, 5010);
        assert_eq!(cc.required_time_ms(), 4000);

        cc.check(10_000, 10_010);
        assert_eq!(cc.required_time_ms(), 2000);

        // Reward interval restarts
        cc.check(15_000, 15_010);
        assert_eq!(cc.required_time_ms(), 2000);
    }

    #[test]
    fn shed_every_nth() {
        let mut cc = new_cc();

        cc.check(0, 10);
        cc.check(100, 400);
        assert_eq!(cc.mode(), Mode::Bad);

        let drops = (0..40).filter(|_| cc.should_drop_unreliable()).count();
        assert_eq!(drops, 10);

        let pattern: Vec<bool> = (0..4).map(|_| cc.should_drop_unreliable()).collect();
        assert_eq!(pattern, vec![false, false, false, true]);
    }

    #[test]
    fn reset() {
        let mut cc = new_cc();

        cc.check(0, 10);
        cc.check(100, 400);
        cc.reset(500);

        assert_eq!(cc.mode(), Mode::None);
        assert_eq!(cc.rtt_ms(), 0);
        assert_eq!(cc.required_time_ms(), 4000);
        assert_eq!(cc.resend_timeout_ms(), 50);
    }
}
