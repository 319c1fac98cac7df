//! Body-worn unit → receiver link.
//!
//! One JSON `LinkMessage` per datagram, tagged with a sequence number and the
//! sender's clock. The receiver side drops duplicates and out-of-order
//! messages and tracks how long ago the link last delivered anything.

use serde::{Deserialize, Serialize};

use crate::error::{FallwatchError, Result};
use crate::types::{ImuTelemetry, MotionEvent};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum LinkPayload {
    Event(MotionEvent),
    Telemetry(ImuTelemetry),
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkMessage {
    pub seq: u32,
    /// Sender clock when the message was produced.
    pub origin_ms: u64,
    pub payload: LinkPayload,
}

impl LinkMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| FallwatchError::LinkEncode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<LinkMessage> {
        serde_json::from_slice(bytes).map_err(|e| FallwatchError::LinkDecode(e.to_string()))
    }
}

/// An accepted message, stamped with the receiver's clock.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LinkDelivery {
    pub message: LinkMessage,
    pub received_ms: u64,
    /// First message after a sender reboot; its clock restarted from zero.
    pub restarted: bool,
}

/// Stamps outgoing messages on the sender.
#[derive(Debug, Default)]
pub struct LinkSender {
    next_seq: u32,
}

impl LinkSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wrap(&mut self, payload: LinkPayload, origin_ms: u64) -> LinkMessage {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        LinkMessage { seq, origin_ms, payload }
    }
}

/// How far the sender clock may run backwards before a sequence regression
/// is read as a reboot rather than a late datagram.
pub const DEFAULT_RESTART_GAP_MS: u64 = 2000;

#[derive(Debug)]
pub struct LinkReceiver {
    restart_gap_ms: u64,
    last_seq: Option<u32>,
    last_origin_ms: Option<u64>,
    last_received_ms: Option<u64>,
    accepted: u64,
    dropped: u64,
}

impl Default for LinkReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkReceiver {
    pub fn new() -> Self {
        Self::with_restart_gap(DEFAULT_RESTART_GAP_MS)
    }

    pub fn with_restart_gap(restart_gap_ms: u64) -> Self {
        Self {
            restart_gap_ms,
            last_seq: None,
            last_origin_ms: None,
            last_received_ms: None,
            accepted: 0,
            dropped: 0,
        }
    }

    /// Accept `msg` if it is newer than everything accepted so far.
    ///
    /// A message counts as newer when its origin timestamp advanced, or when
    /// the origin timestamp is unchanged and the sequence number advanced.
    /// A sender reboot resets both: sequence 0 with an older clock, or any
    /// sequence regression whose clock fell back by more than the restart gap
    /// (the first datagrams after the reboot may be lost).
    pub fn accept(&mut self, msg: LinkMessage, received_ms: u64) -> Option<LinkDelivery> {
        let mut restarted = false;
        let newer = match (self.last_origin_ms, self.last_seq) {
            (Some(origin), Some(seq)) => {
                let seq_reset = msg.seq == 0 && seq != 0 && msg.origin_ms < origin;
                let clock_reset =
                    msg.seq < seq && msg.origin_ms.saturating_add(self.restart_gap_ms) < origin;
                if seq_reset || clock_reset {
                    log::info!("link sender restarted (clock {} -> {} ms)", origin, msg.origin_ms);
                    restarted = true;
                    true
                } else {
                    msg.origin_ms > origin || (msg.origin_ms == origin && msg.seq > seq)
                }
            }
            _ => true,
        };
        if !newer {
            self.dropped += 1;
            log::debug!(
                "link message seq {} from {} ms dropped (out of order or duplicate)",
                msg.seq,
                msg.origin_ms
            );
            return None;
        }

        self.last_seq = Some(msg.seq);
        self.last_origin_ms = Some(msg.origin_ms);
        self.last_received_ms = Some(self.last_received_ms.map_or(received_ms, |r| r.max(received_ms)));
        self.accepted += 1;
        Some(LinkDelivery { message: msg, received_ms, restarted })
    }

    /// No message within `fresh_ms`, or nothing received yet.
    pub fn is_stale(&self, now_ms: u64, fresh_ms: u64) -> bool {
        match self.last_received_ms {
            Some(last) => now_ms.saturating_sub(last) > fresh_ms,
            None => true,
        }
    }

    pub fn last_received_ms(&self) -> Option<u64> {
        self.last_received_ms
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MotionEventKind;

    fn event_msg(seq: u32, origin_ms: u64) -> LinkMessage {
        LinkMessage {
            seq,
            origin_ms,
            payload: LinkPayload::Event(MotionEvent::new(origin_ms, MotionEventKind::Step)),
        }
    }

    #[test]
    fn test_wire_shape() {
        let msg = LinkMessage {
            seq: 3,
            origin_ms: 1500,
            payload: LinkPayload::Telemetry(ImuTelemetry { steps: 12, ..ImuTelemetry::default() }),
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["payload"]["kind"], "telemetry");
        assert_eq!(json["payload"]["body"]["steps"], 12);

        let event = event_msg(4, 1600);
        assert_eq!(LinkMessage::decode(&event.encode().unwrap()).unwrap(), event);
    }

    #[test]
    fn test_decode_garbage() {
        let err = LinkMessage::decode(b"{not json").unwrap_err();
        assert!(matches!(err, FallwatchError::LinkDecode(_)));
    }

    #[test]
    fn test_drops_duplicates_and_reordering() {
        let mut rx = LinkReceiver::new();
        assert!(rx.accept(event_msg(1, 100), 105).is_some());
        assert!(rx.accept(event_msg(1, 100), 110).is_none());
        assert!(rx.accept(event_msg(3, 200), 210).is_some());
        assert!(rx.accept(event_msg(2, 150), 215).is_none());
        assert_eq!(rx.accepted(), 2);
        assert_eq!(rx.dropped(), 2);
    }

    #[test]
    fn test_same_origin_ordered_by_seq() {
        let mut rx = LinkReceiver::new();
        assert!(rx.accept(event_msg(5, 100), 100).is_some());
        assert!(rx.accept(event_msg(6, 100), 101).is_some());
        assert!(rx.accept(event_msg(5, 100), 102).is_none());
    }

    #[test]
    fn test_sender_reboot_accepted() {
        let mut rx = LinkReceiver::new();
        assert!(!rx.accept(event_msg(900, 10_000), 10_000).unwrap().restarted);
        assert!(rx.accept(event_msg(0, 40), 10_060).unwrap().restarted);
        assert!(rx.accept(event_msg(0, 40), 10_070).is_none());
        assert!(rx.accept(event_msg(1, 90), 10_110).is_some());
    }

    #[test]
    fn test_reboot_detected_when_first_datagram_lost() {
        let mut rx = LinkReceiver::new();
        for seq in 0..100u32 {
            rx.accept(event_msg(seq, 600_000 + u64::from(seq) * 50), 1000 + u64::from(seq));
        }
        let delivery = rx.accept(event_msg(1, 60), 2000).unwrap();
        assert!(delivery.restarted);
        assert!(rx.accept(event_msg(2, 110), 2050).is_some());
        assert_eq!(rx.dropped(), 0);
    }

    #[test]
    fn test_late_datagram_within_gap_is_not_a_reboot() {
        let mut rx = LinkReceiver::new();
        assert!(rx.accept(event_msg(10, 5000), 5000).is_some());
        assert!(rx.accept(event_msg(7, 3500), 5010).is_none());
        assert_eq!(rx.dropped(), 1);
    }

    #[test]
    fn test_staleness() {
        let mut rx = LinkReceiver::new();
        assert!(rx.is_stale(0, 2000));
        let delivery = rx.accept(event_msg(0, 50), 1000).unwrap();
        assert_eq!(delivery.received_ms, 1000);
        assert!(!rx.is_stale(3000, 2000));
        assert!(rx.is_stale(3001, 2000));
    }

    #[test]
    fn test_sender_sequence() {
        let mut tx = LinkSender::new();
        let a = tx.wrap(LinkPayload::Telemetry(ImuTelemetry::default()), 0);
        let b = tx.wrap(LinkPayload::Telemetry(ImuTelemetry::default()), 50);
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
    }
}
