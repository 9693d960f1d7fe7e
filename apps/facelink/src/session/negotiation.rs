use std::collections::HashSet;

use crate::signaling::ConnectivityCandidate;
use crate::transport::webrtc::SignalingState;

/// How many distinct remote candidates one attempt remembers for de-duplication.
const CANDIDATE_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AnswerAction {
    Apply,
    IgnoreDuplicate,
    /// Not waiting for an answer in this signaling state.
    IgnoreUnexpected(SignalingState),
}

/// An answer is applied at most once, and only while our offer is outstanding.
pub(crate) fn answer_action(
    state: SignalingState,
    applied: Option<&str>,
    sdp: &str,
) -> AnswerAction {
    if applied == Some(sdp) {
        return AnswerAction::IgnoreDuplicate;
    }
    match state {
        SignalingState::HaveLocalOffer => AnswerAction::Apply,
        other => AnswerAction::IgnoreUnexpected(other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OfferAction {
    Accept,
    IgnoreDuplicate,
    /// A different offer after one was answered: the caller started over.
    Restart,
}

pub(crate) fn offer_action(answered: Option<&str>, sdp: &str) -> OfferAction {
    match answered {
        None => OfferAction::Accept,
        Some(previous) if previous == sdp => OfferAction::IgnoreDuplicate,
        Some(_) => OfferAction::Restart,
    }
}

/// Remote candidates of the current attempt in arrival order. Each distinct candidate is
/// handed out once; [`CandidateQueue::reset`] forgets them when the attempt ends.
#[derive(Debug, Default)]
pub(crate) struct CandidateQueue {
    received: Vec<ConnectivityCandidate>,
    seen: HashSet<ConnectivityCandidate>,
    applied: usize,
}

impl CandidateQueue {
    /// Returns false for a candidate already received.
    pub(crate) fn push(&mut self, candidate: ConnectivityCandidate) -> bool {
        if !self.seen.insert(candidate.clone()) {
            return false;
        }
        self.received.push(candidate);
        if self.received.len() > CANDIDATE_HISTORY {
            let excess = self.received.len() - CANDIDATE_HISTORY;
            for dropped in self.received.drain(..excess) {
                self.seen.remove(&dropped);
            }
            self.applied = self.applied.saturating_sub(excess);
        }
        true
    }

    pub(crate) fn take_pending(&mut self) -> Vec<ConnectivityCandidate> {
        let pending = self.received[self.applied..].to_vec();
        self.applied = self.received.len();
        pending
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.received.len() - self.applied
    }

    pub(crate) fn reset(&mut self) {
        self.received.clear();
        self.seen.clear();
        self.applied = 0;
    }
}
