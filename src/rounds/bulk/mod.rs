//! Anonymous bulk transmission round.
//!
//! Consumes the slot-key list a shuffle round produced: each peer
//! anonymously owns the slot whose public key it submitted to the shuffle.
//! Per subphase every peer contributes one fixed-size cell per slot; XOR of
//! all contributions cancels the pads and leaves each slot owner's cell,
//! without revealing which roster position owns which slot.
//!
//! The client-server variant routes client contributions through designated
//! aggregators, trading decentralization for linear fan-in; the repeating
//! variant transmits several cells per slot over one shuffled key set.

pub mod pads;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ark_ec::{CurveGroup, PrimeGroup};
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::error::RoundError;
use crate::keys::{
    BulkPolicy, BulkTopology, PeerId, RosterChangePolicy, RoundDescriptor,
};
use crate::proofs::ChaumPedersenProof;
use crate::review::{BlameEvidence, EntryLog, PeerReviewManager};
use crate::rounds::driver::{Dispatch, ExpectedSet, PhaseDriver, PhaseSpec, Progress};
use crate::rounds::{
    decode_body, encode_message, split_phase, Destination, Envelope, LocalPeer, Round, RoundCore,
    RoundFault, RoundState,
};
use pads::{cell_capacity, decode_cell, derive_pad, encode_cell, xor_into};

const LOG_TARGET: &str = "rounds::bulk";

/// Keying material carried over from a completed shuffle round.
#[derive(Clone, Debug)]
pub struct BulkMaterial<C: CurveGroup> {
    /// Shuffled slot public keys, one per roster member, in slot order.
    pub slot_keys: Vec<C>,
    /// The secret behind this peer's slot key.
    pub slot_secret: C::ScalarField,
    /// One payload per subphase; missing entries transmit empty cells.
    pub messages: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct ContributionBody {
    subphase: u32,
    cells: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct AggregateBody {
    subphase: u32,
    cells: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct AccusationBody<C: CurveGroup> {
    subphase: u32,
    slot: u32,
    accused: PeerId,
    /// The Diffie-Hellman point between the accused peer's round key and
    /// the corrupted slot's key, revealed by the slot owner.
    shared: C,
    proof: ChaumPedersenProof<C>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PhaseKind {
    Contribution(u32),
    ClientSend(u32),
    ServerAggregate(u32),
    Blame,
}

enum Pending {
    EnterPhase,
    Replay(PeerId, u8, Vec<u8>),
    Combine(usize),
    Finalize,
}

pub struct BulkRound<C: CurveGroup> {
    core: RoundCore<C>,
    driver: PhaseDriver,
    policy: BulkPolicy,
    material: BulkMaterial<C>,
    my_slot: usize,
    /// Aggregator this peer reports to (client-server topology, clients
    /// only).
    my_server: Option<PeerId>,
    /// Clients this peer aggregates for (client-server topology, servers
    /// only).
    my_clients: Option<BTreeSet<PeerId>>,
    /// Broadcast contributions, keyed by subphase (decentralized).
    contributions: BTreeMap<u32, BTreeMap<PeerId, Vec<Vec<u8>>>>,
    /// Client contributions awaiting aggregation, keyed by subphase.
    client_contribs: BTreeMap<u32, BTreeMap<PeerId, Vec<Vec<u8>>>>,
    /// Server aggregates, keyed by subphase.
    server_aggs: BTreeMap<u32, BTreeMap<PeerId, Vec<Vec<u8>>>>,
    outputs: Vec<Vec<u8>>,
    corrupt_slots: Vec<u32>,
    corrupt_subphase: Option<u32>,
    /// Contribution snapshot kept for accusation verification.
    blame_contribs: BTreeMap<PeerId, Vec<Vec<u8>>>,
    blame_active: bool,
    pending: VecDeque<Pending>,
}

impl<C: CurveGroup> BulkRound<C> {
    pub fn new(
        descriptor: Arc<RoundDescriptor<C>>,
        me: LocalPeer<C>,
        material: BulkMaterial<C>,
        policy: BulkPolicy,
        phase_timeout: Duration,
    ) -> Result<Self, RoundError> {
        let roster_len = descriptor.roster.len();
        if material.slot_keys.len() != roster_len {
            return Err(RoundError::protocol("one slot per roster member required"));
        }
        let my_key = C::generator() * material.slot_secret;
        let my_slot = material
            .slot_keys
            .iter()
            .position(|k| *k == my_key)
            .ok_or_else(|| RoundError::protocol("slot secret does not match any slot key"))?;

        if policy.subphases == 0 || policy.cell_size <= pads::CELL_OVERHEAD {
            return Err(RoundError::protocol("degenerate bulk policy"));
        }
        if material.messages.len() > policy.subphases as usize {
            return Err(RoundError::protocol("more payloads than subphases"));
        }
        let capacity = cell_capacity(policy.cell_size);
        if material.messages.iter().any(|m| m.len() > capacity) {
            return Err(RoundError::protocol("payload exceeds cell capacity"));
        }

        let (phases, my_server, my_clients) =
            Self::build_phases(&descriptor, &me, &policy, phase_timeout)?;
        let normal_end = phases.len() - 1;
        let roster_ids: Vec<PeerId> = descriptor.roster.ids().collect();

        Ok(Self {
            core: RoundCore::new(descriptor, me, RosterChangePolicy::Fault),
            driver: PhaseDriver::new(phases, roster_ids, normal_end),
            policy,
            material,
            my_slot,
            my_server,
            my_clients,
            contributions: BTreeMap::new(),
            client_contribs: BTreeMap::new(),
            server_aggs: BTreeMap::new(),
            outputs: Vec::new(),
            corrupt_slots: Vec::new(),
            corrupt_subphase: None,
            blame_contribs: BTreeMap::new(),
            blame_active: false,
            pending: VecDeque::new(),
        })
    }

    #[allow(clippy::type_complexity)]
    fn build_phases(
        descriptor: &RoundDescriptor<C>,
        me: &LocalPeer<C>,
        policy: &BulkPolicy,
        timeout: Duration,
    ) -> Result<(Vec<PhaseSpec>, Option<PeerId>, Option<BTreeSet<PeerId>>), RoundError> {
        let mut phases = Vec::new();
        let mut my_server = None;
        let mut my_clients = None;

        match &policy.topology {
            BulkTopology::Decentralized => {
                for _ in 0..policy.subphases {
                    phases.push(PhaseSpec {
                        name: "contribution",
                        expected: ExpectedSet::AllPeers,
                        timeout,
                    });
                }
            }
            BulkTopology::ClientServer { servers } => {
                if servers.is_empty() {
                    return Err(RoundError::protocol("client-server topology needs servers"));
                }
                let server_set: BTreeSet<PeerId> = servers.iter().copied().collect();
                if server_set.len() != servers.len()
                    || servers.iter().any(|s| !descriptor.roster.contains(*s))
                {
                    return Err(RoundError::protocol("invalid aggregator set"));
                }

                let clients: Vec<PeerId> = descriptor
                    .roster
                    .ids()
                    .filter(|id| !server_set.contains(id))
                    .collect();
                let mut assigned: BTreeMap<PeerId, BTreeSet<PeerId>> = servers
                    .iter()
                    .map(|&s| (s, BTreeSet::new()))
                    .collect();
                for (i, client) in clients.iter().enumerate() {
                    let server = servers[i % servers.len()];
                    assigned.get_mut(&server).expect("server present").insert(*client);
                    if *client == me.id {
                        my_server = Some(server);
                    }
                }
                if server_set.contains(&me.id) {
                    my_clients = Some(assigned.remove(&me.id).expect("server present"));
                }

                let client_send_expected = my_clients.clone().unwrap_or_default();
                for _ in 0..policy.subphases {
                    phases.push(PhaseSpec {
                        name: "client-send",
                        expected: ExpectedSet::Peers(client_send_expected.clone()),
                        timeout,
                    });
                    phases.push(PhaseSpec {
                        name: "server-aggregate",
                        expected: ExpectedSet::Peers(server_set.clone()),
                        timeout,
                    });
                }
            }
        }

        if phases.len() >= u8::MAX as usize {
            return Err(RoundError::protocol("too many subphases"));
        }
        phases.push(PhaseSpec {
            name: "accusation",
            expected: ExpectedSet::AllPeers,
            timeout,
        });
        Ok((phases, my_server, my_clients))
    }

    fn phase_kind(&self, phase: usize) -> PhaseKind {
        let blame = self.blame_phase();
        if phase == blame {
            return PhaseKind::Blame;
        }
        match self.policy.topology {
            BulkTopology::Decentralized => PhaseKind::Contribution(phase as u32),
            BulkTopology::ClientServer { .. } => {
                let subphase = (phase / 2) as u32;
                if phase % 2 == 0 {
                    PhaseKind::ClientSend(subphase)
                } else {
                    PhaseKind::ServerAggregate(subphase)
                }
            }
        }
    }

    fn blame_phase(&self) -> usize {
        match self.policy.topology {
            BulkTopology::Decentralized => self.policy.subphases as usize,
            BulkTopology::ClientServer { .. } => 2 * self.policy.subphases as usize,
        }
    }

    fn slot_count(&self) -> usize {
        self.material.slot_keys.len()
    }

    /// This peer's full contribution vector for one subphase: a pad for
    /// every foreign slot, and the padded cell for its own.
    fn build_contribution(&self, subphase: u32) -> Vec<Vec<u8>> {
        let nonce = &self.core.descriptor.nonce;
        let cell_size = self.policy.cell_size;
        let reuse = self.policy.key_reuse;

        (0..self.slot_count())
            .map(|slot| {
                if slot == self.my_slot {
                    let payload = self
                        .material
                        .messages
                        .get(subphase as usize)
                        .cloned()
                        .unwrap_or_default();
                    let mut cell = encode_cell(&payload, cell_size, nonce, slot as u32, subphase)
                        .expect("payload validated at construction");
                    for identity in self.core.descriptor.roster.iter() {
                        if identity.id == self.core.me.id {
                            continue;
                        }
                        let shared = identity.dh_key * self.material.slot_secret;
                        let pad =
                            derive_pad(&shared, nonce, slot as u32, subphase, reuse, cell_size);
                        xor_into(&mut cell, &pad);
                    }
                    cell
                } else {
                    let shared = self.material.slot_keys[slot] * self.core.me.dh.secret;
                    derive_pad(&shared, nonce, slot as u32, subphase, reuse, cell_size)
                }
            })
            .collect()
    }

    fn check_cells(&self, sender: PeerId, cells: &[Vec<u8>]) -> Result<(), RoundError> {
        if cells.len() != self.slot_count()
            || cells.iter().any(|c| c.len() != self.policy.cell_size)
        {
            return Err(RoundError::malformed(sender, "bad contribution shape"));
        }
        Ok(())
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
                let result = match self.phase_kind(phase as usize) {
                    PhaseKind::Contribution(subphase) => {
                        self.handle_contribution(sender, subphase, body)
                    }
                    PhaseKind::ClientSend(subphase) => {
                        self.handle_client_send(sender, subphase, body)
                    }
                    PhaseKind::ServerAggregate(subphase) => {
                        self.handle_aggregate(sender, subphase, body)
                    }
                    PhaseKind::Blame => self.handle_accusation(sender, body),
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

    fn apply_progress(&mut self, completed_phase: usize, progress: Progress) {
        let combine = matches!(
            self.phase_kind(completed_phase),
            PhaseKind::Contribution(_) | PhaseKind::ServerAggregate(_)
        );
        match progress {
            Progress::InPhase => {}
            Progress::Advanced { replay } => {
                if combine {
                    self.pending.push_back(Pending::Combine(completed_phase));
                }
                self.pending.push_back(Pending::EnterPhase);
                for (peer, phase, data) in replay {
                    self.pending.push_back(Pending::Replay(peer, phase, data));
                }
            }
            Progress::Complete => {
                if combine {
                    self.pending.push_back(Pending::Combine(completed_phase));
                }
                self.pending.push_back(Pending::Finalize);
            }
        }
    }

    fn note_progress(&mut self, sender: PeerId) {
        let completed_phase = self.driver.current();
        let progress = self.driver.note_handled(sender, Instant::now());
        self.apply_progress(completed_phase, progress);
    }

    fn handle_contribution(
        &mut self,
        sender: PeerId,
        subphase: u32,
        body: &[u8],
    ) -> Result<(), RoundError> {
        let body: ContributionBody = decode_body(sender, body)?;
        if body.subphase != subphase {
            return Err(RoundError::malformed(sender, "subphase tag mismatch"));
        }
        self.check_cells(sender, &body.cells)?;
        self.contributions
            .entry(subphase)
            .or_default()
            .insert(sender, body.cells);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_client_send(
        &mut self,
        sender: PeerId,
        subphase: u32,
        body: &[u8],
    ) -> Result<(), RoundError> {
        let body: ContributionBody = decode_body(sender, body)?;
        if body.subphase != subphase {
            return Err(RoundError::malformed(sender, "subphase tag mismatch"));
        }
        self.check_cells(sender, &body.cells)?;
        self.client_contribs
            .entry(subphase)
            .or_default()
            .insert(sender, body.cells);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_aggregate(
        &mut self,
        sender: PeerId,
        subphase: u32,
        body: &[u8],
    ) -> Result<(), RoundError> {
        let body: AggregateBody = decode_body(sender, body)?;
        if body.subphase != subphase {
            return Err(RoundError::malformed(sender, "subphase tag mismatch"));
        }
        self.check_cells(sender, &body.cells)?;
        self.server_aggs
            .entry(subphase)
            .or_default()
            .insert(sender, body.cells);
        self.note_progress(sender);
        Ok(())
    }

    fn handle_accusation(&mut self, sender: PeerId, body: &[u8]) -> Result<(), RoundError> {
        let body: AccusationBody<C> = decode_body(sender, body)?;
        if !self.blame_active
            || Some(body.subphase) != self.corrupt_subphase
            || !self.corrupt_slots.contains(&body.slot)
        {
            return Err(RoundError::protocol("accusation without matching corruption"));
        }
        let Some(&accused_dh) = self.core.descriptor.roster.dh_key(body.accused) else {
            return Err(RoundError::malformed(sender, "unknown accused peer"));
        };
        let slot_key = self.material.slot_keys[body.slot as usize];

        // The accuser proves it owns the corrupted slot and that `shared`
        // is the pad key the accused must have used.
        if !body
            .proof
            .verify(C::generator(), accused_dh, slot_key, body.shared)
        {
            self.core.fault_round(
                format!("peer {sender} raised an unprovable accusation"),
                vec![sender],
                vec![PeerReviewManager::<C>::evidence_for_proof(
                    self.core.me.id,
                    sender,
                    "accusation",
                    body.to_bytes(),
                )],
            );
            return Err(RoundError::ProofVerification(format!(
                "accusation proof from peer {sender}"
            )));
        }

        let expected_pad = derive_pad(
            &body.shared,
            &self.core.descriptor.nonce,
            body.slot,
            body.subphase,
            self.policy.key_reuse,
            self.policy.cell_size,
        );
        let observed = self
            .blame_contribs
            .get(&body.accused)
            .map(|cells| cells[body.slot as usize].clone());

        match observed {
            Some(observed) if observed != expected_pad => {
                let evidence = BlameEvidence::PadMismatch {
                    accused: body.accused,
                    slot: body.slot as u64,
                    shared_point: crate::crypto_serde::canonical_serialize_hex(&body.shared)
                        .unwrap_or_default()
                        .into_bytes(),
                    proof: body.proof_bytes(),
                };
                self.core.fault_round(
                    format!(
                        "bulk contribution from peer {} did not match its pad",
                        body.accused
                    ),
                    vec![body.accused],
                    vec![evidence],
                );
            }
            _ => {
                // Accusation did not hold up; the accuser burned its slot's
                // anonymity for nothing.
                self.core.fault_round(
                    format!("peer {sender} accused {} without a mismatch", body.accused),
                    vec![sender],
                    Vec::new(),
                );
            }
        }
        Ok(())
    }

    fn combine(&mut self, completed_phase: usize) {
        if self.core.state != RoundState::Running || self.blame_active {
            return;
        }
        let (subphase, contribs) = match self.phase_kind(completed_phase) {
            PhaseKind::Contribution(s) => (s, self.contributions.remove(&s).unwrap_or_default()),
            PhaseKind::ServerAggregate(s) => (s, self.server_aggs.remove(&s).unwrap_or_default()),
            _ => return,
        };

        let nonce = self.core.descriptor.nonce;
        let cell_size = self.policy.cell_size;
        let mut corrupt = Vec::new();
        let mut decoded = Vec::new();

        for slot in 0..self.slot_count() {
            let mut acc = vec![0u8; cell_size];
            for cells in contribs.values() {
                xor_into(&mut acc, &cells[slot]);
            }
            match decode_cell(&acc, &nonce, slot as u32, subphase) {
                Some(payload) => decoded.push(payload),
                None => corrupt.push(slot as u32),
            }
        }

        if corrupt.is_empty() {
            self.outputs
                .extend(decoded.into_iter().filter(|p| !p.is_empty()));
            tracing::debug!(
                target: LOG_TARGET,
                round = self.core.descriptor.round_id,
                subphase,
                "subphase combined cleanly"
            );
            return;
        }

        tracing::warn!(
            target: LOG_TARGET,
            round = self.core.descriptor.round_id,
            subphase,
            slots = ?corrupt,
            "combined output flagged corrupted slots"
        );
        match self.policy.topology {
            BulkTopology::Decentralized => {
                self.enter_blame(subphase, corrupt, contribs);
            }
            BulkTopology::ClientServer { .. } => {
                // Client contributions were only seen by their aggregator,
                // so the mismatch cannot be attributed here.
                self.core.fault_round(
                    format!("bulk corruption in subphase {subphase} (slots {corrupt:?})"),
                    Vec::new(),
                    vec![PeerReviewManager::<C>::evidence_for_silence(
                        "server-aggregate",
                        Vec::new(),
                    )],
                );
            }
        }
    }

    fn enter_blame(
        &mut self,
        subphase: u32,
        corrupt: Vec<u32>,
        contribs: BTreeMap<PeerId, Vec<Vec<u8>>>,
    ) {
        self.blame_active = true;
        self.corrupt_subphase = Some(subphase);
        self.corrupt_slots = corrupt;
        self.blame_contribs = contribs;
        self.pending.clear();

        let blame = self.blame_phase();
        self.driver.force_phase(blame, Instant::now());
        self.pending.push_back(Pending::EnterPhase);
        for (peer, phase, data) in self.driver.drain_current_buffer() {
            self.pending.push_back(Pending::Replay(peer, phase, data));
        }
    }

    /// If this peer owns a corrupted slot, find the peer whose contribution
    /// diverged from its pad and broadcast the accusation.
    fn accuse(&mut self) {
        let Some(subphase) = self.corrupt_subphase else {
            return;
        };
        if !self.corrupt_slots.contains(&(self.my_slot as u32)) {
            return;
        }
        let nonce = self.core.descriptor.nonce;
        let slot = self.my_slot as u32;
        let slot_key = self.material.slot_keys[self.my_slot];

        let accusation = self
            .core
            .descriptor
            .roster
            .iter()
            .filter(|identity| identity.id != self.core.me.id)
            .find_map(|identity| {
                let shared = identity.dh_key * self.material.slot_secret;
                let expected = derive_pad(
                    &shared,
                    &nonce,
                    slot,
                    subphase,
                    self.policy.key_reuse,
                    self.policy.cell_size,
                );
                let observed = self.blame_contribs.get(&identity.id)?;
                if observed[self.my_slot] == expected {
                    return None;
                }
                let proof = ChaumPedersenProof::generate(
                    self.material.slot_secret,
                    C::generator(),
                    identity.dh_key,
                    slot_key,
                    shared,
                );
                Some(AccusationBody {
                    subphase,
                    slot,
                    accused: identity.id,
                    shared,
                    proof,
                })
            });

        if let Some(body) = accusation {
            tracing::warn!(
                target: LOG_TARGET,
                round = self.core.descriptor.round_id,
                accused = body.accused,
                "accusing peer of pad mismatch"
            );
            let phase = self.blame_phase() as u8;
            self.core
                .send(Destination::Broadcast, encode_message(phase, &body));
        }
    }

    fn on_phase_enter(&mut self) {
        let phase = self.driver.current();
        match self.phase_kind(phase) {
            PhaseKind::Blame => self.accuse(),
            PhaseKind::Contribution(subphase) => {
                let body = ContributionBody {
                    subphase,
                    cells: self.build_contribution(subphase),
                };
                self.core
                    .send(Destination::Broadcast, encode_message(phase as u8, &body));
            }
            PhaseKind::ClientSend(subphase) => {
                if let Some(server) = self.my_server {
                    let body = ContributionBody {
                        subphase,
                        cells: self.build_contribution(subphase),
                    };
                    self.core
                        .send(Destination::Peer(server), encode_message(phase as u8, &body));
                }
                if self.my_clients.is_some() {
                    // Aggregators fold their own contribution in directly.
                    let own = self.build_contribution(subphase);
                    self.client_contribs
                        .entry(subphase)
                        .or_default()
                        .insert(self.core.me.id, own);
                }
            }
            PhaseKind::ServerAggregate(subphase) => {
                if self.my_clients.is_some() {
                    let contribs = self.client_contribs.remove(&subphase).unwrap_or_default();
                    let mut cells = vec![vec![0u8; self.policy.cell_size]; self.slot_count()];
                    for contribution in contribs.values() {
                        for (slot, cell) in contribution.iter().enumerate() {
                            xor_into(&mut cells[slot], cell);
                        }
                    }
                    let body = AggregateBody { subphase, cells };
                    self.core
                        .send(Destination::Broadcast, encode_message(phase as u8, &body));
                }
            }
        }
    }

    fn finalize(&mut self) {
        if self.core.state != RoundState::Running || self.blame_active {
            return;
        }
        let outputs = std::mem::take(&mut self.outputs);
        self.core.succeed(outputs);
    }
}

impl<C: CurveGroup> AccusationBody<C> {
    fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.serialize_compressed(&mut bytes)
            .expect("accusation serialization");
        bytes
    }

    fn proof_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.proof
            .serialize_compressed(&mut bytes)
            .expect("proof serialization");
        bytes
    }
}

impl<C: CurveGroup> Round<C> for BulkRound<C> {
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
            slots = self.slot_count(),
            subphases = self.policy.subphases,
            "bulk round started"
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
                Pending::EnterPhase => {
                    let phase = self.driver.current();
                    self.on_phase_enter();
                    if let Some(progress) = self.driver.complete_if_empty(Instant::now()) {
                        self.apply_progress(phase, progress);
                    }
                }
                Pending::Replay(sender, phase, data) => {
                    if let Err(e) = self.dispatch(sender, phase, &data) {
                        tracing::debug!(target: LOG_TARGET, sender, error = %e, "replay dropped");
                    }
                }
                Pending::Combine(phase) => self.combine(phase),
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
            if self.blame_active {
                // No accusation arrived in time: the corruption stays
                // unattributed and the roster must be revised manually.
                self.core.fault_round(
                    "bulk corruption unattributed within the blame deadline",
                    Vec::new(),
                    Vec::new(),
                );
                return;
            }
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
    use crate::keys::{KeyPair, KeyReusePolicy, ProofSystem};
    use crate::rounds::test_support::{make_peers, pump, pump_with};
    use ark_grumpkin::Projective as GrumpkinProjective;
    use ark_std::test_rng;

    /// Build one bulk round per peer: peer `i` owns slot `i`.
    fn make_rounds(
        n: usize,
        policy: BulkPolicy,
        messages: impl Fn(usize) -> Vec<Vec<u8>>,
    ) -> (Vec<BulkRound<GrumpkinProjective>>, Vec<PeerId>) {
        let mut rng = test_rng();
        let (locals, roster) = make_peers::<GrumpkinProjective, _>(n, &mut rng);
        let ids: Vec<PeerId> = roster.ids().collect();
        let descriptor = Arc::new(RoundDescriptor {
            round_id: 31,
            nonce: [4u8; 32],
            roster,
            element_count: n,
            proof_system: ProofSystem::default(),
        });

        let slot_pairs: Vec<KeyPair<GrumpkinProjective>> =
            (0..n).map(|_| KeyPair::generate(&mut rng)).collect();
        let slot_keys: Vec<GrumpkinProjective> = slot_pairs.iter().map(|p| p.public).collect();

        let rounds = locals
            .into_iter()
            .enumerate()
            .map(|(i, local)| {
                let material = BulkMaterial {
                    slot_keys: slot_keys.clone(),
                    slot_secret: slot_pairs[i].secret,
                    messages: messages(i),
                };
                BulkRound::new(
                    descriptor.clone(),
                    local,
                    material,
                    policy.clone(),
                    Duration::from_secs(600),
                )
                .unwrap()
            })
            .collect();
        (rounds, ids)
    }

    fn run_and_collect(
        rounds: &mut Vec<BulkRound<GrumpkinProjective>>,
        ids: &[PeerId],
    ) -> Vec<Vec<u8>> {
        for round in rounds.iter_mut() {
            round.start().unwrap();
        }
        pump(rounds, ids);
        let reference = rounds[0].output().expect("round closed").to_vec();
        for (i, round) in rounds.iter().enumerate() {
            assert_eq!(round.state(), RoundState::Closed, "peer {i}");
            assert_eq!(round.output().unwrap(), reference.as_slice(), "peer {i}");
        }
        reference
    }

    fn payload_set(outputs: &[Vec<u8>]) -> Vec<Vec<u8>> {
        let mut sorted = outputs.to_vec();
        sorted.sort();
        sorted
    }

    #[test]
    fn decentralized_combination_recovers_every_payload() {
        let policy = BulkPolicy {
            cell_size: 64,
            ..BulkPolicy::default()
        };
        let (mut rounds, ids) =
            make_rounds(4, policy, |i| vec![format!("payload {i}").into_bytes()]);
        let outputs = run_and_collect(&mut rounds, &ids);
        assert_eq!(
            payload_set(&outputs),
            payload_set(
                &(0..4)
                    .map(|i| format!("payload {i}").into_bytes())
                    .collect::<Vec<_>>()
            )
        );
    }

    #[test]
    fn repeating_subphases_transmit_under_both_key_reuse_policies() {
        for key_reuse in [KeyReusePolicy::FreshPerSubphase, KeyReusePolicy::ReuseStream] {
            let policy = BulkPolicy {
                subphases: 3,
                cell_size: 48,
                key_reuse,
                ..BulkPolicy::default()
            };
            let (mut rounds, ids) = make_rounds(3, policy, |i| {
                (0..3)
                    .map(|s| format!("peer {i} slot message {s}").into_bytes())
                    .collect()
            });
            let outputs = run_and_collect(&mut rounds, &ids);
            assert_eq!(outputs.len(), 9, "{key_reuse:?}");
            let expected: Vec<Vec<u8>> = (0..3)
                .flat_map(|i| {
                    (0..3).map(move |s| format!("peer {i} slot message {s}").into_bytes())
                })
                .collect();
            assert_eq!(payload_set(&outputs), payload_set(&expected), "{key_reuse:?}");
        }
    }

    #[test]
    fn client_server_topology_recovers_every_payload() {
        let policy = BulkPolicy {
            topology: BulkTopology::ClientServer {
                servers: vec![0, 1],
            },
            cell_size: 64,
            ..BulkPolicy::default()
        };
        let (mut rounds, ids) =
            make_rounds(5, policy, |i| vec![format!("cs payload {i}").into_bytes()]);
        let outputs = run_and_collect(&mut rounds, &ids);
        assert_eq!(
            payload_set(&outputs),
            payload_set(
                &(0..5)
                    .map(|i| format!("cs payload {i}").into_bytes())
                    .collect::<Vec<_>>()
            )
        );
    }

    #[test]
    fn corrupted_contribution_is_flagged_and_the_owner_accusation_convicts() {
        let policy = BulkPolicy {
            cell_size: 64,
            ..BulkPolicy::default()
        };
        let (mut rounds, ids) =
            make_rounds(4, policy, |i| vec![format!("payload {i}").into_bytes()]);
        for round in rounds.iter_mut() {
            round.start().unwrap();
        }

        let cheater: PeerId = 1;
        pump_with(&mut rounds, &ids, |from, envelope| {
            let payload = &envelope.payload;
            if from == cheater && payload.first() == Some(&0u8) {
                // Corrupt the cheater's pad for slot 0 (owned by peer 0):
                // flip a byte inside the first cell of the contribution.
                let mut tampered = payload.clone();
                let first_cell_at = 1 + 4 + 8 + 8;
                tampered[first_cell_at + 3] ^= 0x55;
                return Some(tampered);
            }
            Some(payload.clone())
        });

        for (i, round) in rounds.iter().enumerate() {
            assert_eq!(round.state(), RoundState::Faulted, "peer {i}");
            let fault = round.fault().expect("fault recorded");
            assert_eq!(fault.culprits, vec![cheater], "peer {i}");
            assert!(
                fault
                    .evidence
                    .iter()
                    .any(|e| matches!(e, BlameEvidence::PadMismatch { accused, slot, .. }
                        if *accused == cheater && *slot == 0)),
                "peer {i} holds pad-mismatch evidence"
            );
            assert!(round.output().is_none(), "no partial output for peer {i}");
        }
    }

    #[test]
    fn mismatched_slot_material_is_rejected_at_construction() {
        let mut rng = test_rng();
        let (mut locals, roster) = make_peers::<GrumpkinProjective, _>(2, &mut rng);
        let descriptor = Arc::new(RoundDescriptor {
            round_id: 32,
            nonce: [4u8; 32],
            roster,
            element_count: 2,
            proof_system: ProofSystem::default(),
        });
        let material = BulkMaterial {
            slot_keys: vec![
                KeyPair::<GrumpkinProjective>::generate(&mut rng).public,
                KeyPair::<GrumpkinProjective>::generate(&mut rng).public,
            ],
            // Not the secret of any listed slot key.
            slot_secret: KeyPair::<GrumpkinProjective>::generate(&mut rng).secret,
            messages: vec![],
        };
        let result = BulkRound::new(
            descriptor,
            locals.pop().unwrap(),
            material,
            BulkPolicy::default(),
            Duration::from_secs(10),
        );
        assert!(result.is_err());
    }
}
