// SPDX-FileCopyrightText: 2026 Stan Grams <sjg@haxx.space>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Generic table-driven finite state machine.
//!
//! Transitions are plain data: (from-state, message) maps to an optional
//! action id, the next state, and an optional message to auto-send after
//! the transition. A (state, message) pair with no entry is rejected, never
//! silently ignored.
//!
//! Actions are identifiers rather than closures so a processor can run them
//! with full access to itself (including async work) and only commit the
//! transition once the action has succeeded. Auto messages are consumed by
//! an iterative loop in the processor, bounded by [`MAX_CASCADE`].

use std::fmt;

/// Upper bound on how many transitions one external message may cascade
/// through via auto messages.
pub const MAX_CASCADE: usize = 8;

/// A message that has no entry for the current state.
#[derive(Debug, Clone)]
pub struct FsmError {
    message: String,
}

impl FsmError {
    fn new(state: impl fmt::Debug, message: impl fmt::Debug) -> Self {
        Self {
            message: format!("message {message:?} is not valid in state {state:?}"),
        }
    }

    pub fn cascade_overflow() -> Self {
        Self {
            message: format!("transition cascade exceeded {MAX_CASCADE} steps"),
        }
    }
}

impl fmt::Display for FsmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FsmError {}

/// One row of the transition table.
#[derive(Debug, Clone)]
pub struct Transition<S, M, A> {
    pub from: S,
    pub on: M,
    pub action: Option<A>,
    pub next: S,
    pub auto: Option<M>,
}

impl<S, M, A> Transition<S, M, A> {
    pub fn new(from: S, on: M, next: S) -> Self {
        Self {
            from,
            on,
            action: None,
            next,
            auto: None,
        }
    }

    pub fn with_action(mut self, action: A) -> Self {
        self.action = Some(action);
        self
    }

    pub fn with_auto(mut self, message: M) -> Self {
        self.auto = Some(message);
        self
    }
}

/// What a lookup resolved to; owned copies so the caller can run the action
/// against itself before committing the state change.
#[derive(Debug, Clone, Copy)]
pub struct Step<S, M, A> {
    pub action: Option<A>,
    pub next: S,
    pub auto: Option<M>,
}

/// The state machine: a current state plus its transition table.
#[derive(Debug, Clone)]
pub struct StateMachine<S, M, A> {
    state: S,
    transitions: Vec<Transition<S, M, A>>,
}

impl<S, M, A> StateMachine<S, M, A>
where
    S: Copy + PartialEq + fmt::Debug,
    M: Copy + PartialEq + fmt::Debug,
    A: Copy,
{
    pub fn new(initial: S) -> Self {
        Self {
            state: initial,
            transitions: Vec::new(),
        }
    }

    pub fn add(mut self, transition: Transition<S, M, A>) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Whether `message` has an entry for the current state. Used to gate
    /// what gets offered to the operator without executing anything.
    pub fn can_send(&self, message: M) -> bool {
        self.find(message).is_some()
    }

    /// Resolve `message` against the current state. The state does not
    /// change until [`apply`](Self::apply) is called, so a failing action
    /// leaves the machine where it was.
    pub fn lookup(&self, message: M) -> Result<Step<S, M, A>, FsmError> {
        match self.find(message) {
            Some(t) => Ok(Step {
                action: t.action,
                next: t.next,
                auto: t.auto,
            }),
            None => Err(FsmError::new(self.state, message)),
        }
    }

    /// Commit a transition resolved by [`lookup`](Self::lookup).
    pub fn apply(&mut self, next: S) {
        self.state = next;
    }

    /// Force the state, bypassing the table. For initialization and tests.
    pub fn set_state(&mut self, state: S) {
        self.state = state;
    }

    fn find(&self, message: M) -> Option<&Transition<S, M, A>> {
        self.transitions
            .iter()
            .find(|t| t.from == self.state && t.on == message)
    }
}
