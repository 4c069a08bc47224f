use crate::error::{Error, Result};
use crate::frame::serial::HEADER_SIZE_MAX;

const MTU_DEFAULT: usize = 1024;
const MTU_MAX: usize = 65507;

const PROTOCOL_ID_DEFAULT: u8 = 231;

const SEQUENCE_WINDOW_SIZE_DEFAULT: usize = 200;
const SKIPPED_PACKETS_MAX_MAX: u16 = 32;

/// Configuration shared by every connection of a [`Host`](crate::Host).
///
/// All durations are expressed in milliseconds.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum datagram size, header included. Also the size of pooled receive buffers.
    ///
    /// Minimum value: 15 \
    /// Maximum value: 65,507 \
    /// Default value: 1,024
    pub mtu: usize,

    /// First byte of every datagram. Datagrams carrying another id are ignored.
    ///
    /// Default value: 231
    pub protocol_id: u8,

    /// Number of listener threads reading from the shared socket.
    ///
    /// Minimum value: 1 \
    /// Default value: 1
    pub listener_count: usize,

    /// Bound of each connection's outbound queue. The oldest packet is dropped on overflow.
    ///
    /// Minimum value: 1 \
    /// Default value: 100
    pub send_queue_max: usize,

    /// Maximum number of reliable-ordered packets held for reordering.
    ///
    /// Minimum value: 1 \
    /// Default value: 255
    pub chain_length_max: usize,

    /// Number of slots in the duplicate-detection window. Must leave at least 33 slots of slack
    /// when 65,535 is divided by it, and must divide into 65,535 at least twice.
    ///
    /// Default value: 200
    pub sequence_window_size: usize,

    /// Largest forward jump of the remote sequence accepted from a single packet.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 32 \
    /// Default value: 25
    pub skipped_packets_max: u16,

    /// Idle sleep of the per-connection duty cycle when nothing is queued.
    ///
    /// Minimum value: 1 \
    /// Default value: 10
    pub update_loop_timeout_ms: u64,

    /// Age after which an unacknowledged reliable packet is given up.
    ///
    /// Default value: 1,600
    pub send_remove_timeout_ms: u64,

    /// Time without reorder progress after which a gap in the reliable-ordered stream is skipped.
    ///
    /// Default value: 3,000
    pub chain_skip_timeout_ms: u64,

    /// Every Nth ack interval additionally sends a reliable ping.
    ///
    /// Minimum value: 1 \
    /// Default value: 15
    pub auto_ping_interval: u8,

    /// Time without any received datagram after which a connection times out.
    ///
    /// Default value: 4,000
    pub timeout_threshold_ms: u64,

    /// Ping (half the smoothed RTT) above which a connection times out.
    ///
    /// Default value: 150
    pub ping_max_ms: u64,

    /// Weight of a new RTT sample in the moving average.
    ///
    /// Range: (0, 1] \
    /// Default value: 0.1
    pub rtt_smoothing_factor: f64,

    /// RTT sample above which the congestion mode turns bad.
    ///
    /// Default value: 250
    pub congestion_threshold_ms: u64,

    /// Sustained good-mode interval after which the required bad-mode dwell time is halved.
    ///
    /// Default value: 10,000
    pub good_rtt_reward_interval_ms: u64,

    /// Re-entering bad mode within this long after the last mode change doubles the required
    /// dwell time.
    ///
    /// Default value: 10,000
    pub bad_rtt_punish_timeout_ms: u64,

    /// Lower bound of the bad-mode dwell time.
    ///
    /// Minimum value: 1 \
    /// Default value: 1
    pub congestion_required_time_min_ms: u64,

    /// Initial bad-mode dwell time.
    ///
    /// Default value: 4,000
    pub congestion_required_time_default_ms: u64,

    /// Upper bound of the bad-mode dwell time.
    ///
    /// Default value: 60,000
    pub congestion_required_time_max_ms: u64,

    /// In bad mode, every Nth unreliable packet is shed.
    ///
    /// Minimum value: 2 \
    /// Default value: 4
    pub congestion_packet_reduction: u8,

    /// Factor applied to the resend, max-resend and ack knobs in bad mode.
    ///
    /// Minimum value: > 1 \
    /// Default value: 2.5
    pub bad_mode_multiplier: f64,

    /// Base interval between resend scans.
    ///
    /// Default value: 50
    pub resend_timeout_ms: u64,

    /// Base number of packets resent per scan.
    ///
    /// Default value: 15
    pub packet_resends_max: u64,

    /// Base interval between periodic acks.
    ///
    /// Default value: 50
    pub reack_timeout_ms: u64,

    /// Read timeout of each listener. Bounds how long shutdown waits on an idle socket.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub receive_timeout_ms: u64,

    /// Number of redundant DISCONNECT datagrams sent on teardown.
    ///
    /// Default value: 10
    pub disconnect_repeat: usize,

    /// Pause after the DISCONNECT datagrams are sent, before the duty cycle is stopped.
    ///
    /// Default value: 20
    pub disconnect_linger_ms: u64,

    /// Maximum number of idle objects retained by each pool.
    ///
    /// Default value: 64
    pub pool_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mtu: MTU_DEFAULT,
            protocol_id: PROTOCOL_ID_DEFAULT,
            listener_count: 1,
            send_queue_max: 100,
            chain_length_max: 255,
            sequence_window_size: SEQUENCE_WINDOW_SIZE_DEFAULT,
            skipped_packets_max: 25,
            update_loop_timeout_ms: 10,
            send_remove_timeout_ms: 1600,
            chain_skip_timeout_ms: 3000,
            auto_ping_interval: 15,
            timeout_threshold_ms: 4000,
            ping_max_ms: 150,
            rtt_smoothing_factor: 0.1,
            congestion_threshold_ms: 250,
            good_rtt_reward_interval_ms: 10_000,
            bad_rtt_punish_timeout_ms: 10_000,
            congestion_required_time_min_ms: 1,
            congestion_required_time_default_ms: 4000,
            congestion_required_time_max_ms: 60_000,
            congestion_packet_reduction: 4,
            bad_mode_multiplier: 2.5,
            resend_timeout_ms: 50,
            packet_resends_max: 15,
            reack_timeout_ms: 50,
            receive_timeout_ms: 1000,
            disconnect_repeat: 10,
            disconnect_linger_ms: 20,
            pool_capacity: 64,
        }
    }
}

fn sequence_window_size_valid(size: usize) -> bool {
    let max = u16::MAX as usize;
    size > 0 && max % size > 32 && max / size >= 2
}

impl Config {
    /// Returns an error naming the first option that is out of range.
    pub fn validate(&self) -> Result<()> {
        if self.mtu < HEADER_SIZE_MAX || self.mtu > MTU_MAX {
            return Err(Error::config(format!(
                "mtu must be within [{}, {}]",
                HEADER_SIZE_MAX, MTU_MAX
            )));
        }
        if self.listener_count == 0 {
            return Err(Error::config("listener_count == 0"));
        }
        if self.send_queue_max == 0 {
            return Err(Error::config("send_queue_max == 0"));
        }
        if self.chain_length_max == 0 {
            return Err(Error::config("chain_length_max == 0"));
        }
        if !sequence_window_size_valid(self.sequence_window_size) {
            return Err(Error::config(format!(
                "sequence_window_size {} does not wrap cleanly over the sequence space",
                self.sequence_window_size
            )));
        }
        if self.skipped_packets_max == 0 || self.skipped_packets_max > SKIPPED_PACKETS_MAX_MAX {
            return Err(Error::config(format!(
                "skipped_packets_max must be within [1, {}]",
                SKIPPED_PACKETS_MAX_MAX
            )));
        }
        if self.update_loop_timeout_ms == 0 {
            return Err(Error::config("update_loop_timeout_ms == 0"));
        }
        if self.auto_ping_interval == 0 {
            return Err(Error::config("auto_ping_interval == 0"));
        }
        if !(self.rtt_smoothing_factor > 0.0 && self.rtt_smoothing_factor <= 1.0) {
            return Err(Error::config("rtt_smoothing_factor must be within (0, 1]"));
        }
        if !(self.bad_mode_multiplier > 1.0) {
            return Err(Error::config("bad_mode_multiplier <= 1"));
        }
        if self.congestion_packet_reduction < 2 {
            return Err(Error::config("congestion_packet_reduction < 2"));
        }
        if self.congestion_required_time_min_ms == 0
            || self.congestion_required_time_min_ms > self.congestion_required_time_default_ms
            || self.congestion_required_time_default_ms > self.congestion_required_time_max_ms
        {
            return Err(Error::config(
                "congestion required times must satisfy 1 <= min <= default <= max",
            ));
        }
        if self.receive_timeout_ms == 0 {
            return Err(Error::config("receive_timeout_ms == 0"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn window_size_rule() {
        assert!(sequence_window_size_valid(200));
        // 65535 % 256 == 255, 65535 / 256 == 255
        assert!(sequence_window_size_valid(256));
        // 65535 % 255 == 0
        assert!(!sequence_window_size_valid(255));
        // Wraps fewer than twice
        assert!(!sequence_window_size_valid(40000));
        assert!(!sequence_window_size_valid(0));
    }

    #[test]
    fn rejects_out_of_range() {
        let cases: Vec<fn(&mut Config)> = vec![
            |c| c.mtu = 4,
            |c| c.mtu = 70_000,
            |c| c.listener_count = 0,
            |c| c.send_queue_max = 0,
            |c| c.chain_length_max = 0,
            |c| c.sequence_window_size = 255,
            |c| c.skipped_packets_max = 0,
            |c| c.skipped_packets_max = 33,
            |c| c.update_loop_timeout_ms = 0,
            |c| c.rtt_smoothing_factor = 0.0,
            |c| c.bad_mode_multiplier = 1.0,
            |c| c.congestion_packet_reduction = 1,
            |c| c.congestion_required_time_min_ms = 5000,
            |c| c.receive_timeout_ms = 0,
        ];

        for (i, case) in cases.into_iter().enumerate() {
            let mut config = Config::default();
            case(&mut config);
            match config.validate() {
                Err(Error::Config(_)) => (),
                other => panic!("case {} accepted: {:?}", i, other),
            }
        }
    }
}
