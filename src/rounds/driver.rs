//! Generic phase driver for round state machines.
//!
//! Tracks the declared phase sequence, the expected contributor set and
//! deadline of the current phase, buffers messages tagged for future phases,
//! and discards stale or duplicate ones. Messages are dispatched for the
//! current phase only, so a phase's full contribution set is causally prior
//! to any processing of the next phase.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use crate::keys::PeerId;

const LOG_TARGET: &str = "rounds::driver";

#[derive(Clone, Debug)]
pub enum ExpectedSet {
    /// One contribution from every roster member.
    AllPeers,
    /// One contribution from each listed peer (possibly empty).
    Peers(BTreeSet<PeerId>),
}

#[derive(Clone, Debug)]
pub struct PhaseSpec {
    pub name: &'static str,
    pub expected: ExpectedSet,
    pub timeout: Duration,
}

/// Classification of an inbound message against the current phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Tagged for the current phase; hand to the phase handler.
    Handle,
    /// Tagged for a future phase; buffer and replay on advance.
    Buffered,
    /// Tagged for a past phase (or the driver is finished); discard.
    Stale,
    /// Second contribution from the same peer this phase; discard.
    Duplicate,
    /// Sender is not in the current phase's expected set.
    Unexpected,
}

/// Result of recording a handled contribution.
#[derive(Debug)]
pub enum Progress {
    /// Phase still collecting.
    InPhase,
    /// Advanced to the next phase; replay the buffered messages, in
    /// arrival order, through normal dispatch.
    Advanced { replay: Vec<(PeerId, u8, Vec<u8>)> },
    /// The declared sequence is complete.
    Complete,
}

pub struct PhaseDriver {
    roster_ids: Vec<PeerId>,
    phases: Vec<PhaseSpec>,
    /// Index of the first out-of-band phase (blame); normal advancement
    /// finishes when it reaches this index, and out-of-band phases are
    /// reachable only through [`force_phase`].
    ///
    /// [`force_phase`]: Self::force_phase
    normal_end: usize,
    current: usize,
    received: BTreeSet<PeerId>,
    buffer: Vec<(PeerId, u8, Vec<u8>)>,
    deadline: Option<Instant>,
    finished: bool,
}

impl PhaseDriver {
    pub fn new(phases: Vec<PhaseSpec>, roster_ids: Vec<PeerId>, normal_end: usize) -> Self {
        debug_assert!(normal_end <= phases.len());
        debug_assert!(!phases.is_empty());
        Self {
            roster_ids,
            phases,
            normal_end,
            current: 0,
            received: BTreeSet::new(),
            buffer: Vec::new(),
            deadline: None,
            finished: false,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.phases[0].timeout);
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn name(&self) -> &'static str {
        self.phases[self.current].name
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn expected_ids(&self) -> BTreeSet<PeerId> {
        match &self.phases[self.current].expected {
            ExpectedSet::AllPeers => self.roster_ids.iter().copied().collect(),
            ExpectedSet::Peers(set) => set.clone(),
        }
    }

    /// Peers expected this phase that have not been heard from.
    pub fn missing(&self) -> Vec<PeerId> {
        self.expected_ids()
            .into_iter()
            .filter(|id| !self.received.contains(id))
            .collect()
    }

    pub fn classify(&self, phase: u8, sender: PeerId) -> Dispatch {
        if self.finished {
            return Dispatch::Stale;
        }
        let phase = phase as usize;
        if phase < self.current {
            return Dispatch::Stale;
        }
        if phase > self.current {
            // Out-of-band phases are never reached by buffered replay, but
            // early messages for them are kept in case blame begins.
            return if phase < self.phases.len() {
                Dispatch::Buffered
            } else {
                Dispatch::Stale
            };
        }
        if !self.expected_ids().contains(&sender) {
            return Dispatch::Unexpected;
        }
        if self.received.contains(&sender) {
            return Dispatch::Duplicate;
        }
        Dispatch::Handle
    }

    pub fn buffer_message(&mut self, sender: PeerId, phase: u8, data: Vec<u8>) {
        tracing::debug!(
            target: LOG_TARGET,
            sender,
            phase,
            current = self.current,
            "buffering early message"
        );
        self.buffer.push((sender, phase, data));
    }

    /// Record a handled contribution; advance when the expected set is
    /// complete.
    pub fn note_handled(&mut self, sender: PeerId, now: Instant) -> Progress {
        self.received.insert(sender);
        if !self.missing().is_empty() {
            return Progress::InPhase;
        }
        if self.current >= self.normal_end {
            // An out-of-band (blame) phase completed.
            self.finished = true;
            self.deadline = None;
            return Progress::Complete;
        }
        self.advance(now)
    }

    /// Complete the current phase immediately when nothing is expected of
    /// it (client roles in aggregator topologies).
    pub fn complete_if_empty(&mut self, now: Instant) -> Option<Progress> {
        if self.finished || !self.expected_ids().is_empty() {
            return None;
        }
        Some(self.advance(now))
    }

    fn advance(&mut self, now: Instant) -> Progress {
        self.current += 1;
        self.received.clear();
        if self.current >= self.normal_end {
            self.finished = true;
            self.deadline = None;
            return Progress::Complete;
        }
        self.deadline = Some(now + self.phases[self.current].timeout);

        let (replay, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffer)
            .into_iter()
            .partition(|(_, phase, _)| *phase as usize == self.current);
        self.buffer = keep;
        tracing::debug!(
            target: LOG_TARGET,
            phase = self.name(),
            replayed = replay.len(),
            "phase advanced"
        );
        Progress::Advanced { replay }
    }

    /// Jump into an out-of-band phase (blame). Buffered messages for
    /// earlier phases are dropped; the expected set may be narrowed first
    /// via [`set_expected`].
    ///
    /// [`set_expected`]: Self::set_expected
    pub fn force_phase(&mut self, phase: usize, now: Instant) {
        debug_assert!(phase >= self.normal_end && phase < self.phases.len());
        self.current = phase;
        self.received.clear();
        self.finished = false;
        self.buffer.retain(|(_, p, _)| *p as usize >= phase);
        self.deadline = Some(now + self.phases[phase].timeout);
    }

    /// Buffered messages tagged for the current phase, drained for replay.
    pub fn drain_current_buffer(&mut self) -> Vec<(PeerId, u8, Vec<u8>)> {
        let (replay, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut self.buffer)
            .into_iter()
            .partition(|(_, phase, _)| *phase as usize == self.current);
        self.buffer = keep;
        replay
    }

    pub fn set_expected(&mut self, phase: usize, expected: ExpectedSet) {
        self.phases[phase].expected = expected;
    }

    /// Deadline check: returns the missing contributors once the current
    /// phase has expired.
    pub fn expire(&mut self, now: Instant) -> Option<Vec<PeerId>> {
        if self.finished {
            return None;
        }
        let deadline = self.deadline?;
        if now < deadline {
            return None;
        }
        Some(self.missing())
    }
}
