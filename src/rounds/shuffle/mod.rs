//! Verifiable shuffle round.
//!
//! Anonymizes a list of group elements: every peer contributes one element
//! encrypted to an aggregate ephemeral key, then each peer in roster order
//! re-randomizes and permutes the list, publishing a proof of correctness.
//! Threshold decryption of the final list yields the elements with their
//! submission order hidden from everyone, including the shufflers.
//!
//! A failing step proof transitions into the diagnostic blame phase; blame
//! always ends the round in failure.

pub mod blame;
pub mod proof;

pub use proof::{ShuffleStepProof, StepWitness};

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ark_ec::{CurveGroup, PrimeGroup};
use ark_ff::UniformRand;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use ark_std::Zero;

use crate::arith::FixedBase;
use crate::elgamal::ElGamalCiphertext;
use crate::error::RoundError;
use crate::keys::{KeyPair, PeerId, RosterChangePolicy, RoundDescriptor};
use crate::proofs::ChaumPedersenProof;
use crate::review::{BlameEvidence, EntryLog, PeerReviewManager};
use crate::rounds::driver::{Dispatch, ExpectedSet, PhaseDriver, PhaseSpec, Progress};
use crate::rounds::shuffle::blame::replay_steps;
use crate::rounds::{
    decode_body, encode_message, split_phase, Destination, Envelope, LocalPeer, Round, RoundCore,
    RoundFault, RoundState,
};

const LOG_TARGET: &str = "rounds::shuffle";

const PHASE_KEY_SHARE: u8 = 0;
const PHASE_SUBMISSION: u8 = 1;
const PHASE_SHUFFLING: u8 = 2;
const PHASE_DECRYPTION: u8 = 3;
const PHASE_BLAME: u8 = 4;

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct KeyShareBody<C: CurveGroup> {
    share: C,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct SubmissionBody<C: CurveGroup> {
    ciphertext: ElGamalCiphertext<C>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct StepBody<C: CurveGroup> {
    index: u32,
    output: Vec<ElGamalCiphertext<C>>,
    proof: ShuffleStepProof<C>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct SharesBody<C: CurveGroup> {
    shares: Vec<C>,
    proofs: Vec<ChaumPedersenProof<C>>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct BlameBody<C: CurveGroup> {
    step_index: u32,
    witness: StepWitness<C>,
}

enum Pending {
    EnterPhase,
    Replay(PeerId, u8, Vec<u8>),
    PerformStep,
    Finalize,
}

pub struct ShuffleRound<C: CurveGroup> {
    core: RoundCore<C>,
    driver: PhaseDriver,
    /// The element this peer contributes.
    input: C,
    /// Ephemeral shuffle key share; the aggregate of all shares encrypts
    /// the element list while it is in flight.
    eph: KeyPair<C>,
    generator_table: FixedBase<C>,
    key_shares: BTreeMap<PeerId, C>,
    shuffle_key: Option<C>,
    submissions: BTreeMap<PeerId, ElGamalCiphertext<C>>,
    /// `lists[0]` is the submitted list; one entry per applied step. On a
    /// failing step the rejected list is pushed too, for blame replay.
    lists: Vec<Vec<ElGamalCiphertext<C>>>,
    steps_applied: usize,
    /// In-phase step messages that arrived ahead of their turn.
    early_steps: BTreeMap<u32, (PeerId, Vec<u8>)>,
    my_witness: Option<StepWitness<C>>,
    decryption_shares: BTreeMap<PeerId, Vec<C>>,
    reveals: BTreeMap<u32, StepWitness<C>>,
    blame_active: bool,
    failed_step: Option<u32>,
    elements: Option<Vec<C>>,
    pending: VecDeque<Pending>,
}

impl<C: CurveGroup> ShuffleRound<C> {
    pub fn new(
        descriptor: Arc<RoundDescriptor<C>>,
        me: LocalPeer<C>,
        input: C,
        phase_timeout: Duration,
    ) -> Self {
        let phases = vec![
            PhaseSpec {
                name: "key-share",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
            PhaseSpec {
                name: "submission",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
            PhaseSpec {
                name: "shuffling",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
            PhaseSpec {
                name: "decryption",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
            PhaseSpec {
                name: "blame",
                expected: ExpectedSet::AllPeers,
                timeout: phase_timeout,
            },
        ];
        let roster_ids: Vec<PeerId> = descriptor.roster.ids().collect();
        let eph = KeyPair::generate(&mut rand::rngs::OsRng);
        Self {
            core: RoundCore::new(descriptor, me, RosterChangePolicy::Fault),
            driver: PhaseDriver::new(phases, roster_ids, 4),
            input,
            eph,
            generator_table: FixedBase::new(C::generator()),
            key_shares: BTreeMap::new(),
            shuffle_key: None,
            submissions: BTreeMap::new(),
            lists: Vec::new(),
            steps_applied: 0,
            early_steps: BTreeMap::new(),
            my_witness: None,
            decryption_shares: BTreeMap::new(),
            reveals: BTreeMap::new(),
            blame_active: false,
            failed_step: None,
            elements: None,
            pending: VecDeque::new(),
        }
    }

    /// The anonymized element list, available once the round has closed
    /// successfully.
    pub fn shuffled_elements(&self) -> Option<&[C]> {
        self.elements.as_deref()
    }

    fn my_index(&self) -> usize {
        self.core
            .descriptor
            .roster
            .index_of(self.core.me.id)
            .expect("local peer is in the roster")
    }

    fn repetitions(&self) -> u32 {
        self.core.descriptor.proof_system.repetitions()
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
                    PHASE_KEY_SHARE => self.handle_key_share(sender, body),
                    PHASE_SUBMISSION => self.handle_submission(sender, body),
                    PHASE_SHUFFLING => self.handle_step(sender, body),
                    PHASE_DECRYPTION => self.handle_shares(sender, body),
                    PHASE_BLAME => self.handle_reveal(sender, body),
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

    fn handle_key_share(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: KeyShareBody<C> = decode_body(sender, body)?;
        self.key_shares.insert(sender, body.share);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_submission(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: SubmissionBody<C> = decode_body(sender, body)?;
        self.submissions.insert(sender, body.ciphertext);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_step(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let step: StepBody<C> = decode_body(sender, body)?;
        let sender_index = self
            .core
            .descriptor
            .roster
            .index_of(sender)
            .expect("sender checked against roster") as u32;
        if step.index != sender_index {
            return Err(RoundError::protocol(format!(
                "peer {sender} attempted step {} out of order",
                step.index
            )));
        }
        if step.output.len() != self.core.descriptor.roster.len() {
            return Err(RoundError::malformed(sender, "step list length mismatch"));
        }

        if step.index as usize > self.steps_applied {
            // In-phase, but ahead of its turn; hold until the chain catches
            // up so steps apply strictly in roster order.
            self.early_steps.insert(step.index, (sender, body.to_vec()));
            return Ok(());
        }
        if (step.index as usize) < self.steps_applied {
            tracing::debug!(target: LOG_TARGET, sender, index = step.index, "stale step");
            return Ok(());
        }

        self.apply_step_message(sender, step);
        self.drain_ready_steps();
        Ok(())
    }

    fn apply_step_message(&mut self, sender: PeerId, step: StepBody<C>) {
        let shuffle_key = self.shuffle_key.expect("set at submission entry");
        let input = self.lists.last().expect("initialized at shuffling entry");

        let verified = step.proof.verify(
            &self.core.descriptor.nonce,
            step.index,
            shuffle_key,
            input,
            &step.output,
            self.repetitions(),
            &self.generator_table,
        );
        if !verified {
            tracing::warn!(
                target: LOG_TARGET,
                round = self.core.descriptor.round_id,
                sender,
                step = step.index,
                "shuffle step proof failed, entering blame"
            );
            self.enter_blame(step.index, step.output);
            return;
        }

        self.lists.push(step.output);
        self.steps_applied += 1;
        self.note_progress(sender);

        if !self.blame_active
            && self.driver.current() == PHASE_SHUFFLING as usize
            && self.steps_applied == self.my_index()
        {
            self.pending.push_back(Pending::PerformStep);
        }
    }

    fn drain_ready_steps(&mut self) {
        loop {
            if self.blame_active || self.core.state != RoundState::Running {
                break;
            }
            let next = self.steps_applied as u32;
            let Some((sender, data)) = self.early_steps.remove(&next) else {
                break;
            };
            match decode_body::<StepBody<C>>(sender, &data) {
                Ok(step) => self.apply_step_message(sender, step),
                Err(_) => self.core.flag(sender),
            }
        }
    }

    fn handle_shares(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: SharesBody<C> = decode_body(sender, body)?;
        let list = self.lists.last().expect("final list exists");
        let count = list.len();
        if body.shares.len() != count || body.proofs.len() != count {
            return Err(RoundError::malformed(sender, "share count mismatch"));
        }

        let sender_share = *self.key_shares.get(&sender).expect("key shares complete");
        let generator = C::generator();
        for (position, (share, dleq)) in body.shares.iter().zip(&body.proofs).enumerate() {
            if !dleq.verify(generator, list[position].c1, sender_share, *share) {
                let evidence = PeerReviewManager::<C>::evidence_for_proof(
                    self.core.me.id,
                    sender,
                    "decryption",
                    encode_message(PHASE_DECRYPTION, &body),
                );
                self.core.fault_round(
                    format!("decryption share proof from {sender} failed at position {position}"),
                    vec![sender],
                    vec![evidence],
                );
                return Err(RoundError::ProofVerification(format!(
                    "decryption share {position} from peer {sender}"
                )));
            }
        }

        self.decryption_shares.insert(sender, body.shares);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_reveal(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: BlameBody<C> = decode_body(sender, body)?;
        let sender_index = self
            .core
            .descriptor
            .roster
            .index_of(sender)
            .expect("sender checked against roster") as u32;
        if body.step_index != sender_index {
            return Err(RoundError::protocol(format!(
                "peer {sender} revealed a witness for step {}",
                body.step_index
            )));
        }
        self.reveals.insert(body.step_index, body.witness);
        self.note_progress(sender);
        Ok(())
    }

    fn enter_blame(&mut self, failed_step: u32, rejected: Vec<ElGamalCiphertext<C>>) {
        self.failed_step = Some(failed_step);
        self.lists.push(rejected);
        self.blame_active = true;
        self.early_steps.clear();
        self.pending.clear();

        let performers: BTreeSet<PeerId> = self
            .core
            .descriptor
            .roster
            .iter()
            .take(failed_step as usize + 1)
            .map(|p| p.id)
            .collect();
        self.driver
            .set_expected(PHASE_BLAME as usize, ExpectedSet::Peers(performers));
        self.driver.force_phase(PHASE_BLAME as usize, Instant::now());

        self.pending.push_back(Pending::EnterPhase);
        for (peer, phase, data) in self.driver.drain_current_buffer() {
            self.pending.push_back(Pending::Replay(peer, phase, data));
        }
    }

    fn on_phase_enter(&mut self) {
        match self.driver.current() as u8 {
            PHASE_KEY_SHARE => {
                let body = KeyShareBody {
                    share: self.eph.public,
                };
                self.core
                    .send(Destination::Broadcast, encode_message(PHASE_KEY_SHARE, &body));
            }
            PHASE_SUBMISSION => {
                // All shares are in; the aggregate is the shuffle key.
                let key = self
                    .core
                    .descriptor
                    .roster
                    .ids()
                    .fold(C::zero(), |acc, id| acc + self.key_shares[&id]);
                self.shuffle_key = Some(key);

                let mut rng = rand::rngs::OsRng;
                let randomness = C::ScalarField::rand(&mut rng);
                let body = SubmissionBody {
                    ciphertext: ElGamalCiphertext::encrypt(self.input, randomness, key),
                };
                self.core.send(
                    Destination::Broadcast,
                    encode_message(PHASE_SUBMISSION, &body),
                );
            }
            PHASE_SHUFFLING => {
                let initial: Vec<ElGamalCiphertext<C>> = self
                    .core
                    .descriptor
                    .roster
                    .ids()
                    .map(|id| self.submissions[&id])
                    .collect();
                self.lists.push(initial);
                if self.my_index() == 0 {
                    self.pending.push_back(Pending::PerformStep);
                }
            }
            PHASE_DECRYPTION => {
                let list = self.lists.last().expect("final list exists");
                let generator = C::generator();
                let (shares, proofs): (Vec<C>, Vec<ChaumPedersenProof<C>>) = list
                    .iter()
                    .map(|ciphertext| {
                        let share = ciphertext.decryption_share(&self.eph.secret);
                        let proof = ChaumPedersenProof::generate(
                            self.eph.secret,
                            generator,
                            ciphertext.c1,
                            self.eph.public,
                            share,
                        );
                        (share, proof)
                    })
                    .unzip();
                let body = SharesBody { shares, proofs };
                self.core.send(
                    Destination::Broadcast,
                    encode_message(PHASE_DECRYPTION, &body),
                );
            }
            PHASE_BLAME => {
                let failed = self.failed_step.expect("blame entered with a step") as usize;
                let my_index = self.my_index();
                if my_index <= failed {
                    if let Some(witness) = self.my_witness.clone() {
                        let body = BlameBody {
                            step_index: my_index as u32,
                            witness,
                        };
                        self.core
                            .send(Destination::Broadcast, encode_message(PHASE_BLAME, &body));
                    }
                }
            }
            _ => {}
        }
    }

    fn perform_step(&mut self) {
        if self.blame_active
            || self.core.state != RoundState::Running
            || self.driver.current() != PHASE_SHUFFLING as usize
            || self.my_witness.is_some()
        {
            return;
        }
        let shuffle_key = self.shuffle_key.expect("set at submission entry");
        let input = self.lists.last().expect("initialized at shuffling entry");

        let mut rng = rand::rngs::OsRng;
        let witness = StepWitness::random(input.len(), &mut rng);
        let output = proof::apply_step(input, &witness, shuffle_key, &self.generator_table);
        let step_proof = ShuffleStepProof::prove(
            &self.core.descriptor.nonce,
            self.my_index() as u32,
            shuffle_key,
            input,
            &output,
            &witness,
            self.repetitions(),
            &self.generator_table,
            &mut rng,
        );
        self.my_witness = Some(witness);

        let body = StepBody {
            index: self.my_index() as u32,
            output,
            proof: step_proof,
        };
        self.core
            .send(Destination::Broadcast, encode_message(PHASE_SHUFFLING, &body));
        tracing::debug!(
            target: LOG_TARGET,
            round = self.core.descriptor.round_id,
            step = self.my_index(),
            "performed shuffle step"
        );
    }

    fn finalize(&mut self) {
        if self.core.state != RoundState::Running {
            return;
        }
        if self.blame_active {
            self.finalize_blame();
            return;
        }

        let list = self.lists.last().expect("final list exists");
        let roster_ids: Vec<PeerId> = self.core.descriptor.roster.ids().collect();
        let elements: Vec<C> = list
            .iter()
            .enumerate()
            .map(|(position, ciphertext)| {
                let shares: Vec<C> = roster_ids
                    .iter()
                    .map(|id| self.decryption_shares[id][position])
                    .collect();
                ciphertext.combine_shares(&shares)
            })
            .collect();

        let output = elements
            .iter()
            .map(|element| {
                let mut bytes = Vec::new();
                element
                    .serialize_compressed(&mut bytes)
                    .expect("element serialization");
                bytes
            })
            .collect();
        self.elements = Some(elements);
        self.core.succeed(output);
    }

    fn finalize_blame(&mut self) {
        let shuffle_key = self.shuffle_key.expect("set before any step");
        let faulty_steps = replay_steps(
            &self.lists,
            &self.reveals,
            shuffle_key,
            &self.generator_table,
        );

        let culprits: Vec<PeerId> = if faulty_steps.is_empty() {
            // Every published list replays cleanly, so the failure was a
            // bad proof over a valid step; its performer is still at fault.
            vec![self.step_performer(self.failed_step.expect("blame entered"))]
        } else {
            faulty_steps
                .iter()
                .map(|&step| self.step_performer(step))
                .collect()
        };

        let mut rejected = Vec::new();
        self.lists
            .last()
            .expect("rejected list recorded at blame entry")
            .serialize_compressed(&mut rejected)
            .expect("list serialization");
        let evidence: Vec<BlameEvidence> = culprits
            .iter()
            .map(|&culprit| {
                PeerReviewManager::<C>::evidence_for_proof(
                    self.core.me.id,
                    culprit,
                    "shuffling",
                    rejected.clone(),
                )
            })
            .collect();
        self.core.fault_round(
            format!("shuffle blame resolved against {culprits:?}"),
            culprits,
            evidence,
        );
    }

    fn step_performer(&self, step: u32) -> PeerId {
        self.core
            .descriptor
            .roster
            .get(step as usize)
            .expect("step index within roster")
            .id
    }
}

impl<C: CurveGroup> Round<C> for ShuffleRound<C> {
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
            "shuffle round started"
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
                Pending::PerformStep => self.perform_step(),
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
