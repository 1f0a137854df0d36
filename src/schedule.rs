//! Deciding when the converter runs.
//!
//! [`Scheduler`] is a per-session state machine. It owns no timers and spawns nothing: every
//! event handler takes the current time and answers with an [`Action`] that the session carries
//! out. This keeps the rules that matter in one place:
//!
//! - at most one invocation is outstanding at any time,
//! - at least the minimum interval passes between the end of one invocation and the start of the
//!   next (the first invocation of a session runs immediately),
//! - changes that arrive while waiting or invoking are coalesced into a single follow-up run.
//!
//! Invocations read the document when they start, not when the change that caused them arrived,
//! so a coalesced run always renders the latest text.

use std::time::{Duration, Instant};

use tracing::debug;

/// Where the scheduler is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing is running or waiting.
    Idle,
    /// An invocation is outstanding. `pending` is set when another change arrived meanwhile.
    Invoking {
        /// Whether a follow-up run is needed once this one completes.
        pending: bool,
    },
    /// Waiting for the minimum interval to pass before invoking.
    Deferred {
        /// When the wait is over.
        until: Instant,
    },
    /// Like [`State::Deferred`], with more changes having arrived during the wait.
    DeferredWithPending {
        /// When the wait is over.
        until: Instant,
    },
    /// The session is gone. Every event is ignored.
    Disposed,
}

/// What the caller must do in response to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing.
    None,
    /// Read the document and start an invocation now.
    Start,
    /// Arm a timer for the given deadline and call [`Scheduler::timer_fired`] when it expires.
    Defer(Instant),
}

/// Render scheduler for a single preview session.
#[derive(Debug)]
pub struct Scheduler {
    minimum_interval: Duration,
    last_completion: Option<Instant>,
    state: State,
}

impl Scheduler {
    /// Creates an idle scheduler that has never run an invocation.
    pub fn new(minimum_interval: Duration) -> Scheduler {
        Scheduler {
            minimum_interval,
            last_completion: None,
            state: State::Idle,
        }
    }

    /// Changes the minimum interval. Takes effect the next time a change is evaluated.
    pub fn set_minimum_interval(&mut self, minimum_interval: Duration) {
        self.minimum_interval = minimum_interval;
    }

    /// Returns the minimum interval.
    pub fn minimum_interval(&self) -> Duration {
        self.minimum_interval
    }

    /// Returns the current state.
    pub fn state(&self) -> State {
        self.state
    }

    /// When the most recent invocation completed, successfully or not.
    pub fn last_completion(&self) -> Option<Instant> {
        self.last_completion
    }

    /// Returns `true` while an invocation is outstanding.
    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, State::Invoking { .. })
    }

    /// Returns `true` once [`dispose`](Self::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.state == State::Disposed
    }

    /// The document changed.
    pub fn document_changed(&mut self, now: Instant) -> Action {
        match self.state {
            State::Idle => self.evaluate(now),
            State::Deferred { until } | State::DeferredWithPending { until } => {
                debug!("coalescing change into deferred render");
                self.state = State::DeferredWithPending { until };
                Action::None
            }
            State::Invoking { .. } => {
                debug!("render in flight, marking follow-up");
                self.state = State::Invoking { pending: true };
                Action::None
            }
            State::Disposed => Action::None,
        }
    }

    /// A timer armed through [`Action::Defer`] expired.
    ///
    /// Timers that fire early or after the state moved on are ignored.
    pub fn timer_fired(&mut self, now: Instant) -> Action {
        match self.state {
            State::Deferred { until } | State::DeferredWithPending { until } => {
                if now < until {
                    return Action::Defer(until);
                }

                self.state = State::Invoking { pending: false };
                Action::Start
            }
            _ => Action::None,
        }
    }

    /// The outstanding invocation completed, successfully or not.
    ///
    /// Returns `None` when the result must be discarded: the session was disposed, or no
    /// invocation was outstanding. Otherwise the result should be displayed and the returned
    /// action carried out.
    pub fn invocation_completed(&mut self, now: Instant) -> Option<Action> {
        let pending = match self.state {
            State::Invoking { pending } => pending,
            State::Disposed => return None,
            state => {
                debug!(?state, "ignoring completion with no invocation in flight");
                return None;
            }
        };

        self.last_completion = Some(now);
        self.state = State::Idle;

        if pending {
            Some(self.evaluate(now))
        } else {
            Some(Action::None)
        }
    }

    /// Stops scheduling. Any deferred run is abandoned and an in-flight result will be discarded.
    pub fn dispose(&mut self) {
        self.state = State::Disposed;
    }

    fn evaluate(&mut self, now: Instant) -> Action {
        let earliest = self
            .last_completion
            .map(|last_completion| last_completion + self.minimum_interval);

        match earliest {
            Some(until) if now < until => {
                debug!(
                    remaining_ms = (until - now).as_millis() as u64,
                    "deferring render until minimum interval passes"
                );
                self.state = State::Deferred { until };
                Action::Defer(until)
            }
            _ => {
                self.state = State::Invoking { pending: false };
                Action::Start
            }
        }
    }
}
