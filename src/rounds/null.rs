//! Null round: a single exchange that broadcasts every peer's message to
//! everyone else, with no anonymity. Useful as a session warm-up and as the
//! smallest exercise of the round lifecycle.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ark_ec::CurveGroup;
use ark_serialize::{CanonicalDeserialize, CanonicalSerialize};

use crate::error::RoundError;
use crate::keys::{PeerId, RosterChangePolicy, RoundDescriptor};
use crate::review::{EntryLog, PeerReviewManager};
use crate::rounds::driver::{Dispatch, ExpectedSet, PhaseDriver, PhaseSpec, Progress};
use crate::rounds::{
    decode_body, encode_message, split_phase, Destination, Envelope, LocalPeer, Round, RoundCore,
    RoundFault, RoundState,
};

const LOG_TARGET: &str = "rounds::null";

const PHASE_EXCHANGE: u8 = 0;

#[derive(Clone, Debug, CanonicalSerialize, CanonicalDeserialize)]
struct ExchangeBody {
    payload: Vec<u8>,
}

enum Pending {
    EnterPhase,
    Replay(PeerId, u8, Vec<u8>),
    Finalize,
}

pub struct NullRound<C: CurveGroup> {
    core: RoundCore<C>,
    driver: PhaseDriver,
    payload: Vec<u8>,
    received: BTreeMap<PeerId, Vec<u8>>,
    pending: VecDeque<Pending>,
}

impl<C: CurveGroup> NullRound<C> {
    pub fn new(
        descriptor: Arc<RoundDescriptor<C>>,
        me: LocalPeer<C>,
        payload: Vec<u8>,
        phase_timeout: Duration,
        roster_change: RosterChangePolicy,
    ) -> Self {
        let phases = vec![PhaseSpec {
            name: "exchange",
            expected: ExpectedSet::AllPeers,
            timeout: phase_timeout,
        }];
        let roster_ids = descriptor.roster.ids().collect();
        Self {
            core: RoundCore::new(descriptor, me, roster_change),
            driver: PhaseDriver::new(phases, roster_ids, 1),
            payload,
            received: BTreeMap::new(),
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
                "unexpected exchange message from {sender}"
            ))),
            Dispatch::Handle => {
                let body: ExchangeBody = decode_body(sender, body).inspect_err(|_| {
                    self.core.flag(sender);
                })?;
                self.received.insert(sender, body.payload);
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
                Ok(())
            }
        }
    }

    fn finalize(&mut self) {
        let output: Vec<Vec<u8>> = self
            .core
            .descriptor
            .roster
            .ids()
            .filter_map(|id| self.received.get(&id).cloned())
            .collect();
        self.core.succeed(output);
    }
}

impl<C: CurveGroup> Round<C> for NullRound<C> {
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
        tracing::debug!(
            target: LOG_TARGET,
            round = self.core.descriptor.round_id,
            "null round started"
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
                    let body = ExchangeBody {
                        payload: self.payload.clone(),
                    };
                    self.core
                        .send(Destination::Broadcast, encode_message(PHASE_EXCHANGE, &body));
                }
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
