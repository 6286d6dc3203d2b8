//! Liveness probing, inactivity/timeout classification, and the
//! failure-decision consensus protocol that lets a fleet survive individual
//! compute-node failures.
//!
//! Runs identically in `InputBuilder` and `ComputeBuilder`: both own a
//! `HeartbeatLayer` with one [`HeartbeatChannel`] per peer tracking a
//! sent-message log, an unacked set, and pending messages, as a handle the
//! builder owns and drives itself rather than a singleton manager.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use tsb_timing::Nanos;

use crate::wire::{HeartbeatFailureInfo, HeartbeatMessage};

/// Tunables exposed as CLI flags
/// (`--heartbeat-history`, `--heartbeat-inactive-factor`,
/// `--heartbeat-timeout-factor`, `--heartbeat-inactive-retry`).
#[derive(Clone, Copy, Debug, serde::Serialize, serde::Deserialize)]
pub struct HeartbeatConfig {
    /// `H`: number of recent inter-heartbeat gaps averaged for `avg_latency`.
    pub history: usize,
    pub inactive_factor: u64,
    pub timeout_factor: u64,
    /// Number of unacked heartbeats required before a stale channel can be
    /// declared timed out rather than merely inactive.
    pub inactive_retry: usize,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { history: 8, inactive_factor: 4, timeout_factor: 10, inactive_retry: 3 }
    }
}

/// Per-peer liveness bookkeeping.
#[derive(Debug)]
pub struct HeartbeatChannel {
    last_recv_time: Nanos,
    latency_history: VecDeque<u64>,
    sum_latency: u64,
    next_message_id: u64,
    unacked_ids: BTreeSet<u64>,
    pub inactive: bool,
    pub timed_out: bool,
    pub failed: bool,
}

impl HeartbeatChannel {
    fn new(now: Nanos) -> Self {
        Self {
            last_recv_time: now,
            latency_history: VecDeque::new(),
            sum_latency: 0,
            next_message_id: 0,
            unacked_ids: BTreeSet::new(),
            inactive: false,
            timed_out: false,
            failed: false,
        }
    }

    fn avg_latency(&self, config: &HeartbeatConfig) -> u64 {
        if self.latency_history.is_empty() {
            // No data yet: assume a generous default so classification never
            // fires spuriously before the first round-trip completes.
            return u64::from(config.timeout_factor) * Nanos::from_secs(1).0;
        }
        self.sum_latency / self.latency_history.len() as u64
    }

    /// Records a newly sent heartbeat's id as outstanding.
    fn record_sent(&mut self, id: u64) {
        self.unacked_ids.insert(id);
    }

    /// Absorbs an ack for `id`: prunes it and every older pending id (an ack
    /// for a higher id implies all lower ones were also delivered), folds the
    /// observed gap into the latency history.
    fn record_ack(&mut self, id: u64, config: &HeartbeatConfig, now: Nanos) {
        self.unacked_ids.retain(|&pending| pending > id);

        let gap = now.0.saturating_sub(self.last_recv_time.0);
        self.last_recv_time = now;
        self.latency_history.push_back(gap);
        self.sum_latency += gap;
        while self.latency_history.len() > config.history {
            // SAFETY: just checked non-empty via the loop condition.
            self.sum_latency -= self.latency_history.pop_front().unwrap();
        }

        self.inactive = false;
        self.timed_out = false;
    }

    /// Recomputes `inactive`/`timed_out` against the current time. Called
    /// once per scheduler tick.
    fn classify(&mut self, config: &HeartbeatConfig, now: Nanos) {
        let avg = self.avg_latency(config);
        let idle = now.0.saturating_sub(self.last_recv_time.0);
        let unacked = self.unacked_ids.len();

        self.timed_out =
            idle >= avg.saturating_mul(config.timeout_factor) && unacked >= config.inactive_retry;
        self.inactive = !self.timed_out
            && idle >= avg.saturating_mul(config.inactive_factor)
            && unacked < config.inactive_retry;
    }
}

/// Owns one [`HeartbeatChannel`] per peer and the outgoing message-id
/// sequence. `sender_index` is this node's own index, carried on every
/// outgoing [`HeartbeatMessage`].
pub struct HeartbeatLayer {
    config: HeartbeatConfig,
    sender_index: u32,
    channels: Vec<HeartbeatChannel>,
}

impl HeartbeatLayer {
    #[must_use]
    pub fn new(sender_index: u32, num_peers: usize, config: HeartbeatConfig, now: Nanos) -> Self {
        Self {
            config,
            sender_index,
            channels: (0..num_peers).map(|_| HeartbeatChannel::new(now)).collect(),
        }
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> &HeartbeatChannel {
        &self.channels[index]
    }

    /// Builds the next outgoing probe for `channel`, recording it as
    /// outstanding.
    pub fn send_probe(&mut self, channel: usize) -> HeartbeatMessage {
        self.send_probe_with_failure(channel, None)
    }

    /// Builds the next outgoing probe for `channel`, piggybacking
    /// `failure_info` (a report this node wants every peer on the channel to
    /// learn about, or the consensus decision being delivered back) on the
    /// same message rather than opening a separate wire path for it.
    pub fn send_probe_with_failure(
        &mut self,
        channel: usize,
        failure_info: Option<HeartbeatFailureInfo>,
    ) -> HeartbeatMessage {
        let ch = &mut self.channels[channel];
        let id = ch.next_message_id;
        ch.next_message_id += 1;
        ch.record_sent(id);
        HeartbeatMessage { sender_index: self.sender_index, message_id: id, ack: false, failure_info }
    }

    /// Absorbs an incoming message from `channel`. Returns `Some(reply)` if
    /// this was a probe that needs an ack sent back (i.e. `msg.ack == false`);
    /// an ack message itself updates liveness and returns `None`.
    pub fn on_recv(
        &mut self,
        channel: usize,
        msg: &HeartbeatMessage,
        now: Nanos,
    ) -> Option<HeartbeatMessage> {
        if msg.ack {
            self.channels[channel].record_ack(msg.message_id, &self.config, now);
            None
        } else {
            // Answering a probe is itself proof of life from our side; the
            // peer's ack handler folds the round trip into its own average.
            Some(HeartbeatMessage {
                sender_index: self.sender_index,
                message_id: msg.message_id,
                ack: true,
                failure_info: None,
            })
        }
    }

    /// Recomputes classification for every channel against `now`.
    pub fn classify_all(&mut self, now: Nanos) {
        for ch in &mut self.channels {
            ch.classify(&self.config, now);
        }
    }

    #[must_use]
    pub fn is_timed_out(&self, channel: usize) -> bool {
        self.channels[channel].timed_out
    }

    #[must_use]
    pub fn is_inactive(&self, channel: usize) -> bool {
        self.channels[channel].inactive
    }

    pub fn mark_failed(&mut self, channel: usize) {
        tracing::warn!(channel, "peer declared failed");
        self.channels[channel].failed = true;
    }

    #[must_use]
    pub fn is_failed(&self, channel: usize) -> bool {
        self.channels[channel].failed
    }
}

/// Aggregates failure reports about one failed channel index from every
/// surviving peer into the consensus decision: `max` over
/// `last_completed_desc` (so no input node has to roll back sent data), `min`
/// over `timeslice_trigger` (so every input node can safely stop before it).
#[derive(Debug, Default)]
pub struct FailureConsensus {
    reports: BTreeMap<u32, Vec<HeartbeatFailureInfo>>,
}

impl FailureConsensus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records one report. Once `expected_reports` reports have been
    /// collected for `info.index`, returns the consensus decision and clears
    /// that index's bucket.
    pub fn record_report(
        &mut self,
        info: HeartbeatFailureInfo,
        expected_reports: usize,
    ) -> Option<HeartbeatFailureInfo> {
        let bucket = self.reports.entry(info.index).or_default();
        bucket.push(info);
        if bucket.len() < expected_reports {
            return None;
        }
        let last_completed_desc = bucket.iter().map(|r| r.last_completed_desc).max()?;
        let timeslice_trigger = bucket.iter().map(|r| r.timeslice_trigger).min()?;
        self.reports.remove(&info.index);
        tracing::info!(
            failed_index = info.index,
            last_completed_desc,
            timeslice_trigger,
            "failure consensus reached"
        );
        Some(HeartbeatFailureInfo { index: info.index, last_completed_desc, timeslice_trigger })
    }
}

/// Reassigns a timeslice originally destined for `failed` to a surviving
/// compute node, round-robin over `surviving` (indices other than `failed`),
/// keyed by `ts` so reassignment is deterministic and stateless.
#[must_use]
pub fn redistribute_round_robin(ts: u64, surviving: &[usize]) -> Option<usize> {
    if surviving.is_empty() {
        return None;
    }
    Some(surviving[(ts as usize) % surviving.len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_inactive_then_timed_out_as_idle_time_grows() {
        let mut ch = HeartbeatChannel::new(Nanos(0));
        let config = HeartbeatConfig { history: 4, inactive_factor: 4, timeout_factor: 10, inactive_retry: 3 };
        // seed a steady 1ms average latency
        for i in 0..4 {
            ch.record_ack(i, &config, Nanos((i + 1) * 1_000_000));
        }
        assert_eq!(ch.avg_latency(&config), 1_000_000);

        // idle for 5ms with only 2 unacked probes outstanding: inactive, not timed out
        ch.record_sent(10);
        ch.record_sent(11);
        ch.classify(&config, Nanos(4_000_000 + 5_000_000));
        assert!(ch.inactive);
        assert!(!ch.timed_out);

        // a third unacked probe plus enough idle time crosses the timeout threshold
        ch.record_sent(12);
        ch.classify(&config, Nanos(4_000_000 + 11_000_000));
        assert!(ch.timed_out);
    }

    #[test]
    fn ack_prunes_all_older_pending_ids() {
        let config = HeartbeatConfig::default();
        let mut ch = HeartbeatChannel::new(Nanos(0));
        ch.record_sent(1);
        ch.record_sent(2);
        ch.record_sent(3);
        ch.record_ack(2, &config, Nanos(100));
        assert_eq!(ch.unacked_ids.len(), 1);
        assert!(ch.unacked_ids.contains(&3));
    }

    #[test]
    fn failure_consensus_matches_spec_scenario_5() {
        let mut consensus = FailureConsensus::new();
        let first =
            consensus.record_report(HeartbeatFailureInfo { index: 2, last_completed_desc: 17, timeslice_trigger: 20 }, 2);
        assert!(first.is_none());
        let decision =
            consensus.record_report(HeartbeatFailureInfo { index: 2, last_completed_desc: 15, timeslice_trigger: 22 }, 2);
        assert_eq!(
            decision,
            Some(HeartbeatFailureInfo { index: 2, last_completed_desc: 17, timeslice_trigger: 20 })
        );
    }

    #[test]
    fn redistribute_skips_failed_node_round_robin() {
        let surviving = [0, 1, 3];
        assert_eq!(redistribute_round_robin(20, &surviving), Some(surviving[20 % 3]));
        assert_eq!(redistribute_round_robin(21, &surviving), Some(surviving[21 % 3]));
    }
}
