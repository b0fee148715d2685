// ABOUTME: ACKMSG/ACKRPY byte-window accounting — sender-side bytes-in-flight tracking and
// ABOUTME: receiver-side ack-cadence triggering

/// Default unacked-bytes window per message.
pub const DEFAULT_WINDOW_BYTES: u32 = 128 * 1024;
/// Default byte interval between ACKMSG/ACKRPY emissions.
pub const DEFAULT_ACK_INTERVAL_BYTES: u32 = 32 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct FlowControlConfig {
    pub window_bytes: u32,
    pub ack_interval_bytes: u32,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            window_bytes: DEFAULT_WINDOW_BYTES,
            ack_interval_bytes: DEFAULT_ACK_INTERVAL_BYTES,
        }
    }
}

/// Per-outgoing-message bytes-in-flight tracker. A sender that honors flow
/// control stops handing the message new frames once `available()` reaches
/// zero, until an ACK arrives.
#[derive(Debug)]
pub struct SendWindow {
    config: FlowControlConfig,
    sent: u64,
    acked: u64,
}

impl SendWindow {
    pub fn new(config: FlowControlConfig) -> Self {
        Self { config, sent: 0, acked: 0 }
    }

    pub fn available(&self) -> u32 {
        let in_flight = self.sent.saturating_sub(self.acked);
        (self.config.window_bytes as u64).saturating_sub(in_flight).min(u32::MAX as u64) as u32
    }

    pub fn on_sent(&mut self, n: u32) {
        self.sent += n as u64;
    }

    pub fn on_acked(&mut self, n: u32) {
        self.acked = (self.acked + n as u64).min(self.sent);
    }
}

/// Per-incoming-message byte accumulator triggering periodic ACKMSG/ACKRPY
/// emission.
#[derive(Debug, Default)]
pub struct ReceiveAccumulator {
    config: FlowControlConfig,
    since_last_ack: u32,
}

impl ReceiveAccumulator {
    pub fn new(config: FlowControlConfig) -> Self {
        Self { config, since_last_ack: 0 }
    }

    /// Record `n` newly received body bytes. Returns `Some(byte_count)` — the
    /// value to put in the ACK frame — once the ack-interval threshold is
    /// crossed, resetting the accumulator.
    pub fn on_received(&mut self, n: u32) -> Option<u32> {
        self.since_last_ack = self.since_last_ack.saturating_add(n);
        if self.since_last_ack >= self.config.ack_interval_bytes {
            let total = self.since_last_ack;
            self.since_last_ack = 0;
            Some(total)
        } else {
            None
        }
    }
}
