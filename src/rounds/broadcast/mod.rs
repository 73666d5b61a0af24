//! Key-encapsulated anonymous publish round.
//!
//! A shuffle-free alternative: each peer enrolls an ephemeral author key
//! into the round's public-key set, then publishes a payload together with
//! a one-of-many proof of knowing *some* enrolled private key, without
//! revealing which. Non-writers publish empty cover payloads with the same
//! proof shape, so submission counts are roster-uniform. Selected when a
//! deployment prioritizes many-writer, low-latency broadcast over the
//! stronger metadata hiding of shuffle plus bulk.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::error::RoundError;
use crate::keys::{KeyPair, PeerId, PublicKeySet, RosterChangePolicy, RoundDescriptor, RoundNonce};
use crate::proofs::RingKnowledgeProof;
use crate::review::{EntryLog, PeerReviewManager};
use crate::rounds::driver::{Dispatch, ExpectedSet, PhaseDriver, PhaseSpec, Progress};
use crate::rounds::{
    decode_body, encode_message, split_phase, Destination, Envelope, LocalPeer, Round, RoundCore,
    RoundFault, RoundState,
};
use crate::signing::{self, Signature};
use crate::transcript::TranscriptBuilder;

const LOG_TARGET: &str = "rounds::broadcast";

const PHASE_ENROLL: u8 = 0;
const PHASE_PUBLISH: u8 = 1;

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct EnrollBody<C: CurveGroup> {
    author_key: C,
    /// Possession proof: a signature under the enrolled key itself, so a
    /// peer cannot enroll a key it does not hold.
    possession: Signature<C>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct PublishBody<C: CurveGroup> {
    payload: Vec<u8>,
    proof: RingKnowledgeProof<C>,
}

enum Pending {
    EnterPhase,
    Replay(PeerId, u8, Vec<u8>),
    Finalize,
}

fn possession_bytes(nonce: &RoundNonce, peer: PeerId) -> Vec<u8> {
    let mut builder = TranscriptBuilder::new("broadcast/enroll/v1");
    builder.append_bytes(nonce);
    builder.append_u64(peer);
    builder.finish()
}

fn publish_binding(nonce: &RoundNonce, payload: &[u8]) -> Vec<u8> {
    let mut builder = TranscriptBuilder::new("broadcast/publish/v1");
    builder.append_bytes(nonce);
    builder.append_bytes(payload);
    builder.finish()
}

pub struct BroadcastRound<C: CurveGroup> {
    core: RoundCore<C>,
    driver: PhaseDriver,
    payload: Vec<u8>,
    /// Round-scoped author key; knowledge of any one enrolled key is what
    /// the publish proof attests.
    author: KeyPair<C>,
    enrolled: BTreeMap<PeerId, C>,
    key_set: Option<PublicKeySet<C>>,
    publications: BTreeMap<PeerId, Vec<u8>>,
    pending: VecDeque<Pending>,
}

impl<C: CurveGroup> BroadcastRound<C> {
    pub fn new(
        descriptor: Arc<RoundDescriptor<C>>,
        me: LocalPeer<C>,
        payload: Vec<u8>,
        phase_timeout: Duration,
    ) -> Self {
        let phases = vec![
            PhaseSpec {
                name: "enroll",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
            PhaseSpec {
                name: "publish",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
        ];
        let roster_ids: Vec<PeerId> = descriptor.roster.ids().collect();
        let author = KeyPair::generate(&mut rand::rngs::OsRng);
        Self {
            core: RoundCore::new(descriptor, me, RosterChangePolicy::Fault),
            driver: PhaseDriver::new(phases, roster_ids, 2),
            payload,
            author,
            enrolled: BTreeMap::new(),
            key_set: None,
            publications: BTreeMap::new(),
            pending: VecDeque::new(),
        }
    }

    fn dispatch(&mut self, sender: PeerId, phase: u8, body: &[u8]) -> Result<(), RoundError> {
        match self.driver.classify(phase, sender) {
            Dispatch::Stale | Dispatch::Duplicate => {
                tracing::debug!(target: LOG_TARGET, sender, phase, "dropping message");
                Ok(())
            }
            Dispatch::Buffered => {
                self.driver.buffer_message(sender, phase, body.to_vec());
                Ok(())
            }
            Dispatch::Unexpected => Err(RoundError::protocol(format!(
                "peer {sender} is not expected in phase {:?}",
                self.driver.name()
            ))),
            Dispatch::Handle => {
                let result = match phase {
                    PHASE_ENROLL => self.handle_enroll(sender, body),
                    PHASE_PUBLISH => self.handle_publish(sender, body),
                    _ => Err(RoundError::malformed(sender, "unknown phase tag")),
                };
                if let Err(e) = &result {
                    if matches!(e, RoundError::Malformed { .. }) {
                        self.core.flag(sender);
                    }
                }
                result
            }
        }
    }

    fn note_progress(&mut self, sender: PeerId) {
        match self.driver.note_handled(sender, Instant::now()) {
            Progress::InPhase => {}
            Progress::Advanced { replay } => {
                self.pending.push_back(Pending::EnterPhase);
                for (peer, phase, data) in replay {
                    self.pending.push_back(Pending::Replay(peer, phase, data));
                }
            }
            Progress::Complete => self.pending.push_back(Pending::Finalize),
        }
    }

    fn handle_enroll(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: EnrollBody<C> = decode_body(sender, body)?;
        let bytes = possession_bytes(&self.core.descriptor.nonce, sender);
        if !signing::verify(&body.author_key, &bytes, &body.possession) {
            let evidence = PeerReviewManager::<C>::evidence_for_proof(
                self.core.me.id,
                sender,
                "enroll",
                bytes,
            );
            self.core.fault_round(
                format!("peer {sender} enrolled a key it could not prove possession of"),
                vec![sender],
                vec![evidence],
            );
            return Err(RoundError::ProofVerification(format!(
                "enrollment possession proof from peer {sender}"
            )));
        }
        self.enrolled.insert(sender, body.author_key);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_publish(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: PublishBody<C> = decode_body(sender, body)?;
        let key_set = self.key_set.as_ref().expect("built at publish entry");
        let binding = publish_binding(&self.core.descriptor.nonce, &body.payload);
        if !body.proof.verify(key_set, &binding) {
            let evidence = PeerReviewManager::<C>::evidence_for_proof(
                self.core.me.id,
                sender,
                "publish",
                binding,
            );
            self.core.fault_round(
                format!("publication from peer {sender} carried an invalid knowledge proof"),
                vec![sender],
                vec![evidence],
            );
            return Err(RoundError::ProofVerification(format!(
                "publication proof from peer {sender}"
            )));
        }
        self.publications.insert(sender, body.payload);
        self.note_progress(sender);
        Ok(())
    }

    fn on_phase_enter(&mut self) {
        match self.driver.current() as u8 {
            PHASE_ENROLL => {
                let bytes = possession_bytes(&self.core.descriptor.nonce, self.core.me.id);
                let possession = signing::sign(&self.author.secret, &self.author.public, &bytes);
                let body = EnrollBody {
                    author_key: self.author.public,
                    possession,
                };
                self.core
                    .send(Destination::Broadcast, encode_message(PHASE_ENROLL, &body));
            }
            PHASE_PUBLISH => {
                // The enrolled set, in roster order, is the anonymity set.
                let keys: Vec<C> = self
                    .core
                    .descriptor
                    .roster
                    .ids()
                    .map(|id| self.enrolled[&id])
                    .collect();
                let my_index = self
                    .core
                    .descriptor
                    .roster
                    .index_of(self.core.me.id)
                    .expect("local peer is in the roster");
                let key_set = PublicKeySet::new(keys);

                let binding = publish_binding(&self.core.descriptor.nonce, &self.payload);
                let proof = RingKnowledgeProof::prove_knowledge(
                    &key_set,
                    &self.author.secret,
                    my_index,
                    &binding,
                    &mut rand::rngs::OsRng,
                );
                self.key_set = Some(key_set);

                let body = PublishBody {
                    payload: self.payload.clone(),
                    proof,
                };
                self.core
                    .send(Destination::Broadcast, encode_message(PHASE_PUBLISH, &body));
            }
            _ => {}
        }
    }

    fn finalize(&mut self) {
        if self.core.state != RoundState::Running {
            return;
        }
        // Lexicographic output order decouples the published list from
        // submission identities.
        let mut outputs: Vec<Vec<u8>> = self
            .publications
            .values()
            .filter(|p| !p.is_empty())
            .cloned()
            .collect();
        outputs.sort();
        self.core.succeed(outputs);
    }
}

impl<C: CurveGroup> Round<C> for BroadcastRound<C> {
    fn descriptor(&self) -> &Arc<RoundDescriptor<C>> {
        &self.core.descriptor
    }

    fn state(&self) -> RoundState {
        self.core.state
    }

    fn start(&mut self) -> Result<(), RoundError> {
        if self.core.state != RoundState::NotStarted {
            return Err(RoundError::protocol("round already started"));
        }
        self.core.state = RoundState::Running;
        self.driver.start(Instant::now());
        self.pending.push_back(Pending::EnterPhase);
        tracing::info!(
            target: LOG_TARGET,
            round = self.core.descriptor.round_id,
            peers = self.core.descriptor.roster.len(),
            "broadcast round started"
        );
        Ok(())
    }

    fn push_data(&mut self, sender: PeerId, data: &[u8]) -> Result<(), RoundError> {
        self.core.require_running()?;
        self.core.check_sender(sender)?;
        self.core.record_inbound(sender, data);

        let Some((phase, body)) = split_phase(data) else {
            self.core.flag(sender);
            return Err(RoundError::malformed(sender, "empty payload"));
        };
        let body = body.to_vec();
        self.dispatch(sender, phase, &body)
    }

    fn process_events(&mut self) -> Vec<Envelope> {
        while let Some(event) = self.pending.pop_front() {
            if self.core.state != RoundState::Running {
                break;
            }
            match event {
                Pending::EnterPhase => self.on_phase_enter(),
                Pending::Replay(sender, phase, data) => {
                    if let Err(e) = self.dispatch(sender, phase, &data) {
                        tracing::debug!(target: LOG_TARGET, sender, error = %e, "replay dropped");
                    }
                }
                Pending::Finalize => self.finalize(),
            }
        }
        self.core.drain_outbox()
    }

    fn handle_timeout(&mut self, now: Instant) {
        if self.core.state != RoundState::Running {
            return;
        }
        if let Some(missing) = self.driver.expire(now) {
            let evidence =
                PeerReviewManager::<C>::evidence_for_silence(self.driver.name(), missing.clone());
            self.core.fault_round(
                format!("phase {:?} timed out", self.driver.name()),
                missing,
                vec![evidence],
            );
        }
    }

    fn peer_joined(&mut self, peer: PeerId) {
        self.core.on_roster_change(peer);
    }

    fn peer_left(&mut self, peer: PeerId) {
        self.core.on_roster_change(peer);
    }

    fn close(&mut self) {
        self.core.close();
    }

    fn output(&self) -> Option<&[Vec<u8>]> {
        self.core.output.as_deref()
    }

    fn fault(&self) -> Option<&RoundFault> {
        self.core.fault.as_ref()
    }

    fn entry_log(&self) -> &EntryLog<C> {
        &self.core.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::ProofSystem;
    use crate::rounds::test_support::{make_peers, pump, pump_with};
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    fn make_rounds(
        payloads: &[&[u8]],
    ) -> (Vec<BroadcastRound<GrumpkinProjective>>, Vec<PeerId>) {
        let mut rng = test_rng();
        let (locals, roster) = make_peers::<GrumpkinProjective, _>(payloads.len(), &mut rng);
        let ids: Vec<PeerId> = roster.ids().collect();
        let descriptor = Arc::new(RoundDescriptor {
            round_id: 41,
            nonce: [6u8; 32],
            roster,
            element_count: payloads.len(),
            proof_system: ProofSystem::default(),
        });
        let rounds = locals
            .into_iter()
            .zip(payloads)
            .map(|(local, payload)| {
                BroadcastRound::new(
                    descriptor.clone(),
                    local,
                    payload.to_vec(),
                    Duration::from_secs(600),
                )
            })
            .collect();
        (rounds, ids)
    }

    #[test]
    fn writers_publish_and_covers_stay_silent() {
        let (mut rounds, ids) = make_rounds(&[b"first post", b"", b"second post", b""]);
        for round in rounds.iter_mut() {
            round.start().unwrap();
        }
        pump(&mut rounds, &ids);

        let mut expected: Vec<Vec<u8>> = vec![b"first post".to_vec(), b"second post".to_vec()];
        expected.sort();
        for (i, round) in rounds.iter().enumerate() {
            assert_eq!(round.state(), RoundState::Closed, "peer {i}");
            assert_eq!(round.output().unwrap(), expected.as_slice(), "peer {i}");
        }
    }

    #[test]
    fn forged_publication_faults_the_round_and_names_the_sender() {
        let (mut rounds, ids) = make_rounds(&[b"genuine", b"", b""]);
        for round in rounds.iter_mut() {
            round.start().unwrap();
        }

        let forger: PeerId = 0;
        pump_with(&mut rounds, &ids, |from, envelope| {
            let payload = &envelope.payload;
            if from == forger && payload.first() == Some(&PHASE_PUBLISH) {
                // Replace the plaintext after proving: the knowledge proof
                // no longer matches the published bytes.
                let mut body: PublishBody<GrumpkinProjective> =
                    PublishBody::deserialize_compressed(&mut &payload[1..]).unwrap();
                body.payload = b"forged".to_vec();
                return Some(encode_message(PHASE_PUBLISH, &body));
            }
            Some(payload.clone())
        });

        for (i, round) in rounds.iter().enumerate() {
            assert_eq!(round.state(), RoundState::Faulted, "peer {i}");
            assert_eq!(round.fault().unwrap().culprits, vec![forger], "peer {i}");
            assert!(round.output().is_none(), "peer {i} emits no partial output");
        }
    }

    #[test]
    fn stolen_enrollment_key_is_rejected() {
        let (mut rounds, ids) = make_rounds(&[b"a", b""]);
        for round in rounds.iter_mut() {
            round.start().unwrap();
        }

        let thief: PeerId = 1;
        let mut captured: Option<GrumpkinProjective> = None;
        pump_with(&mut rounds, &ids, |from, envelope| {
            let payload = &envelope.payload;
            if payload.first() == Some(&PHASE_ENROLL) {
                let mut body: EnrollBody<GrumpkinProjective> =
                    EnrollBody::deserialize_compressed(&mut &payload[1..]).unwrap();
                if from != thief && captured.is_none() {
                    captured = Some(body.author_key);
                } else if from == thief {
                    if let Some(stolen) = captured {
                        // Enroll someone else's key: the possession
                        // signature cannot be transplanted.
                        body.author_key = stolen;
                        return Some(encode_message(PHASE_ENROLL, &body));
                    }
                }
            }
            Some(payload.clone())
        });

        for round in &rounds {
            assert_eq!(round.state(), RoundState::Faulted);
            assert_eq!(round.fault().unwrap().culprits, vec![thief]);
        }
    }
}
