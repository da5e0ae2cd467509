//! Heartbeat monitor: periodic probes, missed-beat counting, one-shot death.
//!
//! Tick-driven: the host calls `on_tick` every interval with a millisecond
//! timestamp from its own clock and sends whatever probe the monitor asks for.

use std::collections::VecDeque;

/// Default missed-beat threshold when probing is enabled.
pub const DEFAULT_MAX_MISSED_BEATS: f64 = 3.0;

/// Per-direction heartbeat configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatConfig {
    /// Probe interval. `None` disables probing.
    pub interval_ms: Option<u64>,
    /// Unanswered probes tolerated; fractional values compare against the running count.
    pub max_missed_beats: f64,
    /// Answer the peer's probes.
    pub respond: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: None,
            max_missed_beats: DEFAULT_MAX_MISSED_BEATS,
            respond: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not started, or probing disabled.
    Idle,
    /// Probes outstanding, none answered since the last ack.
    Probing,
    /// Last probe round trip completed.
    Alive,
    /// Threshold exceeded. Terminal.
    Dead,
}

/// What the host must do after a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Nothing,
    SendProbe { sent_at_ms: u64 },
    /// Emitted exactly once, on the transition to `Dead`.
    Died,
}

/// A completed probe round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Beat {
    pub sent_at_ms: u64,
    pub received_at_ms: u64,
}

impl Beat {
    pub fn round_trip_ms(&self) -> u64 {
        self.received_at_ms.saturating_sub(self.sent_at_ms)
    }
}

pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    phase: Phase,
    /// Send timestamps of probes not yet acknowledged, oldest first.
    outstanding: VecDeque<u64>,
    last_sent_ms: Option<u64>,
    playing_dead: bool,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            outstanding: VecDeque::new(),
            last_sent_ms: None,
            playing_dead: false,
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_dead(&self) -> bool {
        self.phase == Phase::Dead
    }

    pub fn interval_ms(&self) -> Option<u64> {
        self.config.interval_ms
    }

    pub fn missed_beats(&self) -> usize {
        self.outstanding.len()
    }

    pub fn last_sent_ms(&self) -> Option<u64> {
        self.last_sent_ms
    }

    /// Idle -> Probing, if probing is configured.
    pub fn start(&mut self) {
        if self.phase == Phase::Idle && self.config.interval_ms.is_some() {
            self.phase = Phase::Probing;
        }
    }

    /// Check the threshold against probes left unanswered since the previous tick,
    /// then ask for the next probe.
    pub fn on_tick(&mut self, now_ms: u64) -> TickOutcome {
        match self.phase {
            Phase::Idle | Phase::Dead => return TickOutcome::Nothing,
            Phase::Probing | Phase::Alive => {}
        }
        if self.outstanding.len() as f64 > self.config.max_missed_beats {
            self.phase = Phase::Dead;
            self.outstanding.clear();
            return TickOutcome::Died;
        }
        // Timestamps must be distinct to match acks; a coarse host clock could repeat one.
        let sent_at_ms = match self.last_sent_ms {
            Some(last) if now_ms <= last => last + 1,
            _ => now_ms,
        };
        self.outstanding.push_back(sent_at_ms);
        self.last_sent_ms = Some(sent_at_ms);
        if self.phase == Phase::Alive {
            self.phase = Phase::Probing;
        }
        TickOutcome::SendProbe { sent_at_ms }
    }

    /// Peer probed us. Returns the timestamp to echo back, or `None` when not answering.
    pub fn on_probe(&self, sent_at_ms: u64) -> Option<u64> {
        if !self.config.respond || self.playing_dead {
            return None;
        }
        Some(sent_at_ms)
    }

    /// Peer answered one of our probes. Resets the missed count.
    pub fn on_ack(&mut self, sent_at_ms: u64, now_ms: u64) -> Option<Beat> {
        if self.phase == Phase::Dead || self.phase == Phase::Idle {
            return None;
        }
        if !self.outstanding.contains(&sent_at_ms) {
            return None;
        }
        // Any answer proves liveness; older and newer probes stop counting as missed.
        self.outstanding.clear();
        self.phase = Phase::Alive;
        Some(Beat {
            sent_at_ms,
            received_at_ms: now_ms,
        })
    }

    /// Toggle the non-responsive debug mode. Returns the new state.
    pub fn toggle_play_dead(&mut self) -> bool {
        self.playing_dead = !self.playing_dead;
        self.playing_dead
    }

    pub fn is_playing_dead(&self) -> bool {
        self.playing_dead
    }
}
