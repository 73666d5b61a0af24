//! Round lifecycle: the polymorphic base every anonymity protocol variant
//! shares, plus the tagged-variant dispatcher over the concrete rounds.

pub mod broadcast;
pub mod bulk;
pub mod driver;
pub mod null;
pub mod shuffle;

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};
use serde::{Deserialize, Serialize};

use crate::error::RoundError;
use crate::keys::{
    KeyPair, PeerId, RosterChangePolicy, RoundConfig, RoundDescriptor, RoundKind, BROADCAST_PEER,
};
use crate::review::{BlameEvidence, EntryLog};

pub use broadcast::BroadcastRound;
pub use bulk::{BulkMaterial, BulkRound};
pub use null::NullRound;
pub use shuffle::ShuffleRound;

const LOG_TARGET: &str = "rounds";

/// Lifecycle of one round: strictly forward-progressing, with `Faulted` as
/// the single absorbing failure state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundState {
    NotStarted,
    Running,
    Closed,
    Faulted,
}

/// Terminal failure report. Culprits are named when determinable from
/// blame evidence, otherwise empty for an undifferentiated fault.
#[derive(Clone, Debug)]
pub struct RoundFault {
    pub reason: String,
    pub culprits: Vec<PeerId>,
    pub evidence: Vec<BlameEvidence>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Destination {
    /// All roster members, the sender included.
    Broadcast,
    Peer(PeerId),
}

/// One outbound protocol message, handed to the external transport.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub destination: Destination,
    pub payload: Vec<u8>,
}

/// This participant's private round material.
#[derive(Clone, Debug)]
pub struct LocalPeer<C: CurveGroup> {
    pub id: PeerId,
    pub signing: KeyPair<C>,
    pub dh: KeyPair<C>,
}

/// Common lifecycle for one execution of the anonymity protocol over a
/// fixed roster.
pub trait Round<C: CurveGroup> {
    fn descriptor(&self) -> &Arc<RoundDescriptor<C>>;

    fn state(&self) -> RoundState;

    /// Enter `Running` and initialize per-phase state from the roster.
    fn start(&mut self) -> Result<(), RoundError>;

    /// Feed one inbound message. Fails with a protocol error when the
    /// round is not running or the sender is not in the roster; a
    /// malformed payload flags the sender and never advances the phase
    /// counter.
    fn push_data(&mut self, sender: PeerId, data: &[u8]) -> Result<(), RoundError>;

    /// Drain internally queued side effects (scheduled phase transitions,
    /// replays) and return the outbound messages produced.
    fn process_events(&mut self) -> Vec<Envelope>;

    /// Per-phase deadline check; a missed deadline faults the round and
    /// names the non-responding peers.
    fn handle_timeout(&mut self, now: Instant);

    fn peer_joined(&mut self, peer: PeerId);

    fn peer_left(&mut self, peer: PeerId);

    /// Terminal. Discards in-flight phase state; already-appended log
    /// entries are never rolled back.
    fn close(&mut self);

    /// Final anonymized output, available only after a fully successful
    /// run. Partial output is never emitted.
    fn output(&self) -> Option<&[Vec<u8>]>;

    fn fault(&self) -> Option<&RoundFault>;

    /// Accountability record of everything this peer sent and received.
    fn entry_log(&self) -> &EntryLog<C>;
}

/// State shared by every round implementation.
pub(crate) struct RoundCore<C: CurveGroup> {
    pub descriptor: Arc<RoundDescriptor<C>>,
    pub me: LocalPeer<C>,
    pub state: RoundState,
    pub outbox: VecDeque<Envelope>,
    pub log: EntryLog<C>,
    pub flagged: BTreeSet<PeerId>,
    pub fault: Option<RoundFault>,
    pub output: Option<Vec<Vec<u8>>>,
    pub roster_change: RosterChangePolicy,
}

impl<C: CurveGroup> RoundCore<C> {
    pub fn new(
        descriptor: Arc<RoundDescriptor<C>>,
        me: LocalPeer<C>,
        roster_change: RosterChangePolicy,
    ) -> Self {
        let log = EntryLog::new(descriptor.clone(), me.id);
        Self {
            descriptor,
            me,
            state: RoundState::NotStarted,
            outbox: VecDeque::new(),
            log,
            flagged: BTreeSet::new(),
            fault: None,
            output: None,
            roster_change,
        }
    }

    pub fn require_running(&self) -> Result<(), RoundError> {
        if self.state != RoundState::Running {
            return Err(RoundError::protocol(format!(
                "round {} is not running (state {:?})",
                self.descriptor.round_id, self.state
            )));
        }
        Ok(())
    }

    pub fn check_sender(&self, sender: PeerId) -> Result<(), RoundError> {
        if !self.descriptor.roster.contains(sender) {
            return Err(RoundError::protocol(format!(
                "sender {sender} is not in the roster"
            )));
        }
        Ok(())
    }

    /// Record one inbound message before it is acted upon.
    pub fn record_inbound(&mut self, sender: PeerId, payload: &[u8]) {
        self.log
            .append(false, sender, payload.to_vec(), &self.me.signing);
    }

    /// Record and queue one outbound message.
    pub fn send(&mut self, destination: Destination, payload: Vec<u8>) {
        let counterpart = match destination {
            Destination::Broadcast => BROADCAST_PEER,
            Destination::Peer(id) => id,
        };
        self.log
            .append(true, counterpart, payload.clone(), &self.me.signing);
        self.outbox.push_back(Envelope {
            destination,
            payload,
        });
    }

    pub fn drain_outbox(&mut self) -> Vec<Envelope> {
        self.outbox.drain(..).collect()
    }

    pub fn flag(&mut self, peer: PeerId) {
        if self.flagged.insert(peer) {
            tracing::warn!(
                target: LOG_TARGET,
                round = self.descriptor.round_id,
                peer,
                "flagged peer for malformed traffic"
            );
        }
    }

    pub fn fault_round(
        &mut self,
        reason: impl Into<String>,
        culprits: Vec<PeerId>,
        evidence: Vec<BlameEvidence>,
    ) {
        if matches!(self.state, RoundState::Closed | RoundState::Faulted) {
            return;
        }
        let reason = reason.into();
        tracing::warn!(
            target: LOG_TARGET,
            round = self.descriptor.round_id,
            %reason,
            ?culprits,
            "round faulted"
        );
        self.state = RoundState::Faulted;
        self.fault = Some(RoundFault {
            reason,
            culprits,
            evidence,
        });
        self.outbox.clear();
    }

    pub fn succeed(&mut self, output: Vec<Vec<u8>>) {
        tracing::info!(
            target: LOG_TARGET,
            round = self.descriptor.round_id,
            outputs = output.len(),
            "round completed"
        );
        self.state = RoundState::Closed;
        self.output = Some(output);
    }

    /// Manual close before completion: terminal, no output.
    pub fn close(&mut self) {
        if self.state == RoundState::Running || self.state == RoundState::NotStarted {
            tracing::info!(
                target: LOG_TARGET,
                round = self.descriptor.round_id,
                "round closed before completion"
            );
            self.state = RoundState::Closed;
            self.outbox.clear();
        }
    }

    /// Default roster-change reaction: the cryptographic parameters are
    /// roster-bound, so churn faults the round unless the policy opts out.
    pub fn on_roster_change(&mut self, peer: PeerId) {
        match self.roster_change {
            RosterChangePolicy::Ignore => {
                tracing::debug!(
                    target: LOG_TARGET,
                    round = self.descriptor.round_id,
                    peer,
                    "ignoring roster change"
                );
            }
            RosterChangePolicy::Fault => {
                if self.state == RoundState::Running {
                    self.fault_round(
                        RoundError::RosterChange(peer).to_string(),
                        Vec::new(),
                        Vec::new(),
                    );
                }
            }
        }
    }
}

/// Prefix a canonical message body with its phase tag.
pub(crate) fn encode_message<T: CanonicalSerialize>(phase: u8, body: &T) -> Vec<u8> {
    let mut bytes = vec![phase];
    body.serialize_compressed(&mut bytes)
        .expect("message serialization");
    bytes
}

pub(crate) fn split_phase(data: &[u8]) -> Option<(u8, &[u8])> {
    let (&phase, body) = data.split_first()?;
    Some((phase, body))
}

pub(crate) fn decode_body<T: CanonicalDeserialize>(
    sender: PeerId,
    body: &[u8],
) -> Result<T, RoundError> {
    T::deserialize_compressed(&mut &body[..])
        .map_err(|e| RoundError::malformed(sender, e.to_string()))
}

/// Input a round needs from its caller at construction.
pub enum RoundInput<C: CurveGroup> {
    /// Payload for null and broadcast rounds; empty for cover traffic.
    Message(Vec<u8>),
    /// Group element contributed to a shuffle.
    Element(C),
    /// Shuffle-derived keying material for a bulk round.
    Bulk(BulkMaterial<C>),
}

/// Tagged-variant dispatch over the concrete round implementations.
pub enum AnyRound<C: CurveGroup> {
    Null(NullRound<C>),
    Shuffle(ShuffleRound<C>),
    Bulk(BulkRound<C>),
    Broadcast(BroadcastRound<C>),
}

impl<C: CurveGroup> AnyRound<C> {
    pub fn from_config(
        config: &RoundConfig<C>,
        me: LocalPeer<C>,
        input: RoundInput<C>,
    ) -> Result<Self, RoundError> {
        let descriptor = Arc::new(config.descriptor());
        match (config.kind, input) {
            (RoundKind::Null, RoundInput::Message(payload)) => Ok(AnyRound::Null(NullRound::new(
                descriptor,
                me,
                payload,
                config.phase_timeout,
                config.roster_change,
            ))),
            (RoundKind::Shuffle, RoundInput::Element(element)) => Ok(AnyRound::Shuffle(
                ShuffleRound::new(descriptor, me, element, config.phase_timeout),
            )),
            (RoundKind::Bulk, RoundInput::Bulk(material)) => {
                let policy = config.bulk.clone().unwrap_or_default();
                BulkRound::new(descriptor, me, material, policy, config.phase_timeout)
                    .map(AnyRound::Bulk)
            }
            (RoundKind::Broadcast, RoundInput::Message(payload)) => Ok(AnyRound::Broadcast(
                BroadcastRound::new(descriptor, me, payload, config.phase_timeout),
            )),
            (kind, _) => Err(RoundError::protocol(format!(
                "round kind {kind:?} does not match the supplied input"
            ))),
        }
    }

    fn inner(&self) -> &dyn Round<C> {
        match self {
            AnyRound::Null(r) => r,
            AnyRound::Shuffle(r) => r,
            AnyRound::Bulk(r) => r,
            AnyRound::Broadcast(r) => r,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Round<C> {
        match self {
            AnyRound::Null(r) => r,
            AnyRound::Shuffle(r) => r,
            AnyRound::Bulk(r) => r,
            AnyRound::Broadcast(r) => r,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! In-memory network: delivers queued envelopes between rounds until
    //! traffic quiesces. Broadcast reaches every peer, the sender included.

    use super::*;
    use crate::keys::{PeerIdentity, Roster};
    use ark_std::rand::Rng;

    pub fn make_peers<C: CurveGroup, R: Rng>(
        count: usize,
        rng: &mut R,
    ) -> (Vec<LocalPeer<C>>, Roster<C>) {
        let locals: Vec<LocalPeer<C>> = (0..count as u64)
            .map(|id| LocalPeer {
                id,
                signing: KeyPair::generate(rng),
                dh: KeyPair::generate(rng),
            })
            .collect();
        let roster = Roster::new(
            locals
                .iter()
                .map(|local| PeerIdentity {
                    id: local.id,
                    signing_key: local.signing.public,
                    dh_key: local.dh.public,
                })
                .collect(),
        );
        (locals, roster)
    }

    /// Pump traffic until no round emits anything. `tamper` may rewrite or
    /// drop an envelope before delivery.
    pub fn pump_with<C, R, F>(rounds: &mut [R], ids: &[PeerId], mut tamper: F)
    where
        C: CurveGroup,
        R: Round<C>,
        F: FnMut(PeerId, &Envelope) -> Option<Vec<u8>>,
    {
        loop {
            let mut traffic = Vec::new();
            for (i, round) in rounds.iter_mut().enumerate() {
                for envelope in round.process_events() {
                    if let Some(payload) = tamper(ids[i], &envelope) {
                        traffic.push((ids[i], envelope.destination, payload));
                    }
                }
            }
            if traffic.is_empty() {
                return;
            }
            for (from, destination, payload) in traffic {
                match destination {
                    Destination::Broadcast => {
                        for round in rounds.iter_mut() {
                            let _ = round.push_data(from, &payload);
                        }
                    }
                    Destination::Peer(to) => {
                        if let Some(index) = ids.iter().position(|id| *id == to) {
                            let _ = rounds[index].push_data(from, &payload);
                        }
                    }
                }
            }
        }
    }

    pub fn pump<C: CurveGroup, R: Round<C>>(rounds: &mut [R], ids: &[PeerId]) {
        pump_with(rounds, ids, |_, envelope| Some(envelope.payload.clone()));
    }
}

impl<C: CurveGroup> Round<C> for AnyRound<C> {
    fn descriptor(&self) -> &Arc<RoundDescriptor<C>> {
        self.inner().descriptor()
    }

    fn state(&self) -> RoundState {
        self.inner().state()
    }

    fn start(&mut self) -> Result<(), RoundError> {
        self.inner_mut().start()
    }

    fn push_data(&mut self, sender: PeerId, data: &[u8]) -> Result<(), RoundError> {
        self.inner_mut().push_data(sender, data)
    }

    fn process_events(&mut self) -> Vec<Envelope> {
        self.inner_mut().process_events()
    }

    fn handle_timeout(&mut self, now: Instant) {
        self.inner_mut().handle_timeout(now)
    }

    fn peer_joined(&mut self, peer: PeerId) {
        self.inner_mut().peer_joined(peer)
    }

    fn peer_left(&mut self, peer: PeerId) {
        self.inner_mut().peer_left(peer)
    }

    fn close(&mut self) {
        self.inner_mut().close()
    }

    fn output(&self) -> Option<&[Vec<u8>]> {
        self.inner().output()
    }

    fn fault(&self) -> Option<&RoundFault> {
        self.inner().fault()
    }

    fn entry_log(&self) -> &EntryLog<C> {
        self.inner().entry_log()
    }
}
