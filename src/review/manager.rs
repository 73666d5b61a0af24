//! Peer-review manager: cross-checks entry logs and produces misbehavior
//! evidence.

use std::collections::BTreeMap;

use ark_ec::CurveGroup;
use serde::{Deserialize, Serialize};

use crate::keys::{PeerId, RoundId, BROADCAST_PEER};
use crate::review::{EntryLog, StateHash};

const LOG_TARGET: &str = "review::manager";

/// Evidence of misbehavior, produced only when verification fails.
/// Consumed by the blame phase and exportable for external audit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlameEvidence {
    /// Two peers' logs disagree about a message between them.
    LogDivergence {
        accuser: PeerId,
        accused: PeerId,
        /// Index into the matched send/receive pairing.
        pair_index: u64,
        expected: StateHash,
        observed: StateHash,
    },
    /// One side's log claims more matched traffic than the other's.
    LogTruncation {
        accuser: PeerId,
        accused: PeerId,
        claimed_entries: u64,
        matched_entries: u64,
    },
    /// A published proof failed verification; the transcript is retained so
    /// a third party can re-run the check.
    ProofFailure {
        accuser: PeerId,
        accused: PeerId,
        phase: String,
        transcript: Vec<u8>,
    },
    /// Contribution never arrived before the phase deadline.
    Silence { phase: String, missing: Vec<PeerId> },
    /// A bulk contribution did not match the pad the slot owner derived.
    /// Carries the revealed shared point and its equality proof, both in
    /// canonical encoding.
    PadMismatch {
        accused: PeerId,
        slot: u64,
        shared_point: Vec<u8>,
        proof: Vec<u8>,
    },
}

impl BlameEvidence {
    /// Peers this evidence incriminates.
    pub fn accused_peers(&self) -> Vec<PeerId> {
        match self {
            BlameEvidence::LogDivergence { accused, .. }
            | BlameEvidence::LogTruncation { accused, .. }
            | BlameEvidence::ProofFailure { accused, .. }
            | BlameEvidence::PadMismatch { accused, .. } => vec![*accused],
            BlameEvidence::Silence { missing, .. } => missing.clone(),
        }
    }
}

/// Holds per-(round, peer) entry logs and cross-checks them for divergence.
pub struct PeerReviewManager<C: CurveGroup> {
    logs: BTreeMap<(RoundId, PeerId), EntryLog<C>>,
}

impl<C: CurveGroup> Default for PeerReviewManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: CurveGroup> PeerReviewManager<C> {
    pub fn new() -> Self {
        Self {
            logs: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, log: EntryLog<C>) {
        let key = (log.descriptor().round_id, log.peer());
        self.logs.insert(key, log);
    }

    pub fn get(&self, round: RoundId, peer: PeerId) -> Option<&EntryLog<C>> {
        self.logs.get(&(round, peer))
    }

    /// Cross-check two peers' logs for one round.
    ///
    /// The i-th message `a` claims to have sent to `b` (directly or by
    /// broadcast) is matched against the i-th message `b` claims to have
    /// received from `a`; any payload-hash disagreement, and any count
    /// difference, is recorded as evidence against the sender-side claim.
    pub fn cross_check(&self, round: RoundId, a: PeerId, b: PeerId) -> Vec<BlameEvidence> {
        let (Some(log_a), Some(log_b)) = (self.get(round, a), self.get(round, b)) else {
            return Vec::new();
        };

        let mut evidence = Vec::new();
        evidence.extend(match_direction(log_a, log_b));
        evidence.extend(match_direction(log_b, log_a));

        if !evidence.is_empty() {
            tracing::warn!(
                target: LOG_TARGET,
                round,
                peer_a = a,
                peer_b = b,
                findings = evidence.len(),
                "log cross-check found divergence"
            );
        }
        evidence
    }

    pub fn evidence_for_silence(phase: impl Into<String>, missing: Vec<PeerId>) -> BlameEvidence {
        BlameEvidence::Silence {
            phase: phase.into(),
            missing,
        }
    }

    pub fn evidence_for_proof(
        accuser: PeerId,
        accused: PeerId,
        phase: impl Into<String>,
        transcript: Vec<u8>,
    ) -> BlameEvidence {
        BlameEvidence::ProofFailure {
            accuser,
            accused,
            phase: phase.into(),
            transcript,
        }
    }
}

/// Match `sender`'s outbound claims toward `receiver` against `receiver`'s
/// inbound claims from `sender`.
fn match_direction<C: CurveGroup>(
    sender: &EntryLog<C>,
    receiver: &EntryLog<C>,
) -> Vec<BlameEvidence> {
    let sent: Vec<&crate::review::LogEntry<C>> = sender
        .entries()
        .iter()
        .filter(|e| {
            e.outbound && (e.counterpart == receiver.peer() || e.counterpart == BROADCAST_PEER)
        })
        .collect();
    let received: Vec<&crate::review::LogEntry<C>> = receiver
        .entries()
        .iter()
        .filter(|e| !e.outbound && e.counterpart == sender.peer())
        .collect();

    let mut evidence = Vec::new();
    for (i, (s, r)) in sent.iter().zip(&received).enumerate() {
        // Receive-side entries hash with the receiver's direction and the
        // sender as counterpart, so compare the payloads' content hashes.
        let expected = crate::review::payload_content_hash(&s.payload);
        let observed = crate::review::payload_content_hash(&r.payload);
        if expected != observed {
            evidence.push(BlameEvidence::LogDivergence {
                accuser: receiver.peer(),
                accused: sender.peer(),
                pair_index: i as u64,
                expected,
                observed,
            });
        }
    }

    if sent.len() != received.len() {
        evidence.push(BlameEvidence::LogTruncation {
            accuser: receiver.peer(),
            accused: sender.peer(),
            claimed_entries: sent.len() as u64,
            matched_entries: sent.len().min(received.len()) as u64,
        });
    }

    evidence
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyPair, PeerIdentity, ProofSystem, Roster, RoundDescriptor};
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;
    use std::sync::Arc;

    fn setup() -> (
        Arc<RoundDescriptor<GrumpkinProjective>>,
        Vec<KeyPair<GrumpkinProjective>>,
    ) {
        let mut rng = test_rng();
        let signing: Vec<KeyPair<GrumpkinProjective>> =
            (0..2).map(|_| KeyPair::generate(&mut rng)).collect();
        let roster = Roster::new(
            signing
                .iter()
                .enumerate()
                .map(|(i, kp)| PeerIdentity {
                    id: i as PeerId,
                    signing_key: kp.public,
                    dh_key: KeyPair::<GrumpkinProjective>::generate(&mut rng).public,
                })
                .collect(),
        );
        let descriptor = Arc::new(RoundDescriptor {
            round_id: 7,
            nonce: [9u8; 32],
            roster,
            element_count: 2,
            proof_system: ProofSystem::default(),
        });
        (descriptor, signing)
    }

    #[test]
    fn agreeing_logs_produce_no_evidence() {
        let (descriptor, keys) = setup();
        let mut log_a = EntryLog::new(descriptor.clone(), 0);
        let mut log_b = EntryLog::new(descriptor.clone(), 1);

        log_a.append(true, 1, b"m1".to_vec(), &keys[0]);
        log_b.append(false, 0, b"m1".to_vec(), &keys[1]);

        let mut manager = PeerReviewManager::new();
        manager.insert(log_a);
        manager.insert(log_b);
        assert!(manager.cross_check(7, 0, 1).is_empty());
    }

    #[test]
    fn diverging_payloads_incriminate_the_sender_claim() {
        let (descriptor, keys) = setup();
        let mut log_a = EntryLog::new(descriptor.clone(), 0);
        let mut log_b = EntryLog::new(descriptor.clone(), 1);

        log_a.append(true, 1, b"sent this".to_vec(), &keys[0]);
        log_b.append(false, 0, b"got that".to_vec(), &keys[1]);

        let mut manager = PeerReviewManager::new();
        manager.insert(log_a);
        manager.insert(log_b);

        let evidence = manager.cross_check(7, 0, 1);
        assert_eq!(evidence.len(), 1);
        assert!(matches!(
            &evidence[0],
            BlameEvidence::LogDivergence { accused: 0, .. }
        ));
    }

    #[test]
    fn missing_receive_entry_is_flagged_as_truncation() {
        let (descriptor, keys) = setup();
        let mut log_a = EntryLog::new(descriptor.clone(), 0);
        let log_b = EntryLog::new(descriptor.clone(), 1);

        log_a.append(true, 1, b"m1".to_vec(), &keys[0]);

        let mut manager = PeerReviewManager::new();
        manager.insert(log_a);
        manager.insert(log_b);

        let evidence = manager.cross_check(7, 0, 1);
        assert_eq!(evidence.len(), 1);
        assert!(matches!(
            &evidence[0],
            BlameEvidence::LogTruncation {
                claimed_entries: 1,
                matched_entries: 0,
                ..
            }
        ));
    }

    #[test]
    fn evidence_serializes_for_audit_export() {
        let evidence = PeerReviewManager::<GrumpkinProjective>::evidence_for_silence(
            "submission",
            vec![3, 4],
        );
        let json = serde_json::to_string(&evidence).unwrap();
        let back: BlameEvidence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, evidence);
    }
}
