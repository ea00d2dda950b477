//! Per-browser relay session state.
//!
//! Owns the ratchet for one connected browser plus the ordered-delivery
//! machinery: the monotonic outbound sequence, the bounded replay buffer
//! for reconnects, and the per-(agent, view) screen-hash suppression map.

use std::collections::{HashMap, VecDeque};

use crate::constants::REPLAY_BUFFER_BYTES;
use crate::relay::frames::View;
use crate::relay::ratchet::RatchetSession;
use crate::server::SessionKey;

/// What a resuming browser should receive.
#[derive(Debug, PartialEq, Eq)]
pub enum ResumePlan {
    /// Replay these buffered frames, in order.
    Replay(Vec<Vec<u8>>),
    /// The gap is older than the buffer: full resync required.
    ResyncFull,
}

/// State for one connected browser.
///
/// Owned by the relay; lifetime is the browser connection. Never shared
/// across browsers.
pub struct BrowserSession {
    /// Opaque browser identity (its identity key fingerprint).
    pub browser_id: String,
    /// Double Ratchet state for this browser.
    pub ratchet: RatchetSession,
    /// Last sequence number handed out; strictly monotonic from 1.
    last_sent_seq: u64,
    /// Highest seq the browser has acked.
    last_ack_seq_from_peer: u64,
    /// Agent this browser is watching.
    pub subscribed_agent: Option<SessionKey>,
    /// Which PTY of that agent.
    pub subscribed_view: View,
    /// Raw-byte fidelity mode disables screen-hash suppression.
    pub raw_mode: bool,
    /// Buffered plaintext terminal frames for replay: (seq, serialized).
    replay: VecDeque<(u64, Vec<u8>)>,
    /// Total bytes currently buffered.
    replay_bytes: usize,
    /// Last screen hash sent per (agent, view), for change suppression.
    sent_hashes: HashMap<(SessionKey, View), u64>,
    /// Consecutive decrypt failures; the relay rekeys past a threshold.
    pub decrypt_failures: u32,
}

impl std::fmt::Debug for BrowserSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrowserSession")
            .field("browser_id", &self.browser_id)
            .field("last_sent_seq", &self.last_sent_seq)
            .field("subscribed_agent", &self.subscribed_agent)
            .field("replay_frames", &self.replay.len())
            .finish_non_exhaustive()
    }
}

impl BrowserSession {
    /// New session around an established ratchet.
    #[must_use]
    pub fn new(browser_id: String, ratchet: RatchetSession) -> Self {
        Self {
            browser_id,
            ratchet,
            last_sent_seq: 0,
            last_ack_seq_from_peer: 0,
            subscribed_agent: None,
            subscribed_view: View::Main,
            raw_mode: false,
            replay: VecDeque::new(),
            replay_bytes: 0,
            sent_hashes: HashMap::new(),
            decrypt_failures: 0,
        }
    }

    /// Allocate the next outbound sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.last_sent_seq += 1;
        self.last_sent_seq
    }

    /// Last allocated sequence number.
    #[must_use]
    pub fn last_sent_seq(&self) -> u64 {
        self.last_sent_seq
    }

    /// Highest seq the browser has acknowledged.
    #[must_use]
    pub fn last_ack_seq(&self) -> u64 {
        self.last_ack_seq_from_peer
    }

    /// Record an outbound terminal frame for potential replay.
    ///
    /// Evicts oldest frames beyond the 4 MiB cap; a browser whose gap
    /// reaches past the eviction point gets a full resync instead.
    pub fn record_outbound(&mut self, seq: u64, serialized: Vec<u8>) {
        self.replay_bytes += serialized.len();
        self.replay.push_back((seq, serialized));
        while self.replay_bytes > REPLAY_BUFFER_BYTES {
            if let Some((_, old)) = self.replay.pop_front() {
                self.replay_bytes -= old.len();
            } else {
                break;
            }
        }
    }

    /// Apply a browser ack: frames ≤ `seq` are never replayed again.
    pub fn apply_ack(&mut self, seq: u64) {
        if seq > self.last_ack_seq_from_peer {
            self.last_ack_seq_from_peer = seq;
        }
        while let Some((front_seq, _)) = self.replay.front() {
            if *front_seq <= seq {
                let (_, bytes) = self.replay.pop_front().expect("front checked");
                self.replay_bytes -= bytes.len();
            } else {
                break;
            }
        }
    }

    /// Plan a resume for a browser advertising `last_ack_seq`.
    ///
    /// Everything newer must still be buffered, else the browser gets a
    /// full snapshot rather than a gap.
    #[must_use]
    pub fn plan_resume(&self, last_ack_seq: u64) -> ResumePlan {
        if last_ack_seq >= self.last_sent_seq {
            return ResumePlan::Replay(Vec::new());
        }

        // The oldest frame the browser is missing is last_ack_seq + 1.
        let oldest_buffered = self.replay.front().map(|(seq, _)| *seq);
        match oldest_buffered {
            Some(oldest) if oldest <= last_ack_seq + 1 => ResumePlan::Replay(
                self.replay
                    .iter()
                    .filter(|(seq, _)| *seq > last_ack_seq)
                    .map(|(_, bytes)| bytes.clone())
                    .collect(),
            ),
            // Buffer empty but frames were sent, or oldest is past the gap.
            _ => ResumePlan::ResyncFull,
        }
    }

    /// Screen-hash suppression: returns true when a frame for this
    /// (agent, view) should be emitted, and records the hash.
    pub fn should_emit(&mut self, agent: &SessionKey, view: View, hash: u64) -> bool {
        if self.raw_mode {
            return true;
        }
        let key = (agent.clone(), view);
        match self.sent_hashes.get(&key) {
            Some(prev) if *prev == hash => false,
            _ => {
                self.sent_hashes.insert(key, hash);
                true
            }
        }
    }

    /// Forget the sent hash for a pair, forcing the next frame out (used
    /// after resync).
    pub fn invalidate_hash(&mut self, agent: &SessionKey, view: View) {
        self.sent_hashes.remove(&(agent.clone(), view));
    }

    /// Subscribe to an (agent, view) and reset per-subscription state.
    pub fn subscribe(&mut self, agent: SessionKey, view: View, raw_mode: bool) {
        self.invalidate_hash(&agent, view);
        self.subscribed_agent = Some(agent);
        self.subscribed_view = view;
        self.raw_mode = raw_mode;
    }

    /// Bytes currently held for replay (diagnostics).
    #[must_use]
    pub fn replay_bytes(&self) -> usize {
        self.replay_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::ratchet::RatchetSession;

    fn session() -> BrowserSession {
        let ratchet = RatchetSession::new(&[7u8; 32], false).unwrap();
        BrowserSession::new("browser-1".into(), ratchet)
    }

    #[test]
    fn test_seq_starts_at_one_and_is_consecutive() {
        let mut s = session();
        assert_eq!(s.next_seq(), 1);
        assert_eq!(s.next_seq(), 2);
        assert_eq!(s.next_seq(), 3);
        assert_eq!(s.last_sent_seq(), 3);
    }

    #[test]
    fn test_resume_replays_exact_gap() {
        let mut s = session();
        for i in 1..=60u64 {
            let seq = s.next_seq();
            assert_eq!(seq, i);
            s.record_outbound(seq, format!("frame-{seq}").into_bytes());
        }
        s.apply_ack(50);

        match s.plan_resume(50) {
            ResumePlan::Replay(frames) => {
                assert_eq!(frames.len(), 10);
                assert_eq!(frames[0], b"frame-51");
                assert_eq!(frames[9], b"frame-60");
            }
            ResumePlan::ResyncFull => panic!("expected replay"),
        }
    }

    #[test]
    fn test_resume_with_everything_acked_replays_nothing() {
        let mut s = session();
        let seq = s.next_seq();
        s.record_outbound(seq, b"x".to_vec());
        assert_eq!(s.plan_resume(1), ResumePlan::Replay(Vec::new()));
        // An ack ahead of what was sent is also fine.
        assert_eq!(s.plan_resume(99), ResumePlan::Replay(Vec::new()));
    }

    #[test]
    fn test_overflow_forces_resync() {
        let mut s = session();
        // Frames large enough that the 4 MiB cap evicts the early ones.
        let chunk = vec![b'x'; 64 * 1024];
        for _ in 0..200 {
            let seq = s.next_seq();
            s.record_outbound(seq, chunk.clone());
        }
        assert!(s.replay_bytes() <= REPLAY_BUFFER_BYTES);
        assert_eq!(s.plan_resume(0), ResumePlan::ResyncFull);
    }

    #[test]
    fn test_ack_prunes_replay_buffer() {
        let mut s = session();
        for _ in 0..10 {
            let seq = s.next_seq();
            s.record_outbound(seq, b"abcdef".to_vec());
        }
        let before = s.replay_bytes();
        s.apply_ack(7);
        assert!(s.replay_bytes() < before);
        assert_eq!(s.last_ack_seq(), 7);

        // Acks never regress.
        s.apply_ack(3);
        assert_eq!(s.last_ack_seq(), 7);
    }

    #[test]
    fn test_screen_hash_suppression() {
        let mut s = session();
        let agent = SessionKey::from_raw("acme-demo-42");

        assert!(s.should_emit(&agent, View::Main, 111));
        assert!(!s.should_emit(&agent, View::Main, 111));
        assert!(s.should_emit(&agent, View::Main, 222));
        // Different view tracks separately.
        assert!(s.should_emit(&agent, View::Server, 111));
    }

    #[test]
    fn test_raw_mode_disables_suppression() {
        let mut s = session();
        let agent = SessionKey::from_raw("acme-demo-42");
        s.subscribe(agent.clone(), View::Main, true);
        assert!(s.should_emit(&agent, View::Main, 5));
        assert!(s.should_emit(&agent, View::Main, 5));
    }

    #[test]
    fn test_subscribe_resets_hash() {
        let mut s = session();
        let agent = SessionKey::from_raw("acme-demo-42");
        assert!(s.should_emit(&agent, View::Main, 9));
        s.subscribe(agent.clone(), View::Main, false);
        // Same hash is emitted again after resubscribe.
        assert!(s.should_emit(&agent, View::Main, 9));
    }
}
