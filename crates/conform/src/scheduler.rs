//! Idle-fill scheduling.
//!
//! Conforming runs only while the editor is idle. The scheduler is a small
//! state machine (`Idle → Scheduled → Running → Scheduled | Idle`) driven by
//! its owner's event loop. Every stop bumps a generation counter; a
//! scheduled continuation carries the generation it was issued under and
//! becomes a no-op if a stop happened in between.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use splice_common::ConformConfig;
use splice_timeline::SequenceId;

use crate::engine::{BatchOutcome, BatchStatus};

/// Playback and export flags shared between the host-facing handle and the
/// fill loop. Either one being set blocks idle fill.
#[derive(Debug, Clone, Default)]
pub struct ActivityFlags {
    playback: Arc<AtomicBool>,
    export: Arc<AtomicBool>,
}

impl ActivityFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_playback(&self, active: bool) {
        self.playback.store(active, Ordering::SeqCst);
    }

    pub fn set_export(&self, active: bool) {
        self.export.store(active, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.playback.load(Ordering::SeqCst)
    }

    pub fn is_exporting(&self) -> bool {
        self.export.load(Ordering::SeqCst)
    }

    /// Whether idle fill must not submit work.
    pub fn is_blocked(&self) -> bool {
        self.is_playing() || self.is_exporting()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    Idle,
    Scheduled,
    Running,
}

/// Permission to run one tick for one sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillTicket {
    pub sequence_id: SequenceId,
    pub generation: u64,
}

/// Idle-fill state machine.
#[derive(Debug)]
pub struct IdleFillScheduler {
    state: FillState,
    generation: u64,
    sequence: Option<SequenceId>,
    retry_delay: Duration,
    wraparound_delay: Duration,
}

impl IdleFillScheduler {
    pub fn new(config: &ConformConfig) -> Self {
        Self {
            state: FillState::Idle,
            generation: 0,
            sequence: None,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            wraparound_delay: Duration::from_millis(config.wraparound_delay_ms),
        }
    }

    pub fn state(&self) -> FillState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn sequence(&self) -> Option<&SequenceId> {
        self.sequence.as_ref()
    }

    /// Stop any running or scheduled fill. Pending tickets become stale.
    pub fn stop(&mut self) {
        self.generation += 1;
        self.state = FillState::Idle;
    }

    /// Stop, then schedule an immediate tick for `sequence_id`.
    pub fn restart(&mut self, sequence_id: SequenceId) -> FillTicket {
        self.stop();
        self.sequence = Some(sequence_id.clone());
        self.state = FillState::Scheduled;
        FillTicket {
            sequence_id,
            generation: self.generation,
        }
    }

    /// Claim a ticket. Returns false for stale tickets, which must be dropped.
    pub fn begin(&mut self, ticket: &FillTicket) -> bool {
        if ticket.generation != self.generation || self.state != FillState::Scheduled {
            return false;
        }
        self.state = FillState::Running;
        true
    }

    /// Decide what follows a tick. `None` leaves the scheduler idle.
    pub fn finish(
        &mut self,
        ticket: &FillTicket,
        outcome: &BatchOutcome,
    ) -> Option<(FillTicket, Duration)> {
        if ticket.generation != self.generation || self.state != FillState::Running {
            return None;
        }
        let delay = match outcome.status {
            BatchStatus::Submitted => Some(Duration::ZERO),
            BatchStatus::Starved if outcome.wrapped => Some(self.wraparound_delay),
            BatchStatus::Starved | BatchStatus::DecodeFailed => Some(self.retry_delay),
            BatchStatus::MemoryPressure => Some(self.wraparound_delay),
            BatchStatus::Complete | BatchStatus::Blocked => None,
        };
        match delay {
            Some(delay) => {
                self.state = FillState::Scheduled;
                Some((ticket.clone(), delay))
            }
            None => {
                self.state = FillState::Idle;
                None
            }
        }
    }

    /// Return to idle after a tick that failed outright.
    pub fn abort(&mut self, ticket: &FillTicket) {
        if ticket.generation == self.generation {
            self.state = FillState::Idle;
        }
    }
}
