//! Table-driven finite state machines.
//!
//! A machine is described by a [`TransitionTable`] mapping `(state, event kind)` to an action and
//! a next state. Events are ordinary enums that may carry data; only their [`Event::kind`] takes
//! part in the lookup. The caller supplies a [`Hooks`] implementation that executes actions and
//! is told about events that have no matching row.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

/// An event fed to a [`StateMachine`].
pub trait Event {
    /// Payload-free discriminant used to look up transitions.
    type Kind: Copy + Eq + Hash + Debug;

    fn kind(&self) -> Self::Kind;
}

/// One row of a transition table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition<S, A> {
    pub action: A,
    pub next: S,
}

/// Immutable `(state, event kind) -> (action, next state)` mapping.
#[derive(Debug, Clone)]
pub struct TransitionTable<S, K, A> {
    rows: HashMap<(S, K), Transition<S, A>>,
}

impl<S, K, A> TransitionTable<S, K, A>
where
    S: Copy + Eq + Hash + Debug,
    K: Copy + Eq + Hash + Debug,
{
    pub fn new() -> Self {
        TransitionTable {
            rows: HashMap::new(),
        }
    }

    /// Adds the row `state --event/action--> next`.
    ///
    /// # Panics
    /// If a row for `(state, event)` already exists. Tables are built once at startup, so an
    /// ambiguous table is a programming error.
    pub fn on(mut self, state: S, event: K, action: A, next: S) -> Self {
        let previous = self
            .rows
            .insert((state, event), Transition { action, next });
        assert!(
            previous.is_none(),
            "duplicate transition for ({:?}, {:?})",
            state,
            event
        );
        self
    }

    pub fn lookup(&self, state: S, event: K) -> Option<&Transition<S, A>> {
        self.rows.get(&(state, event))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

impl<S, K, A> Default for TransitionTable<S, K, A>
where
    S: Copy + Eq + Hash + Debug,
    K: Copy + Eq + Hash + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Callbacks invoked by [`StateMachine::dispatch`].
pub trait Hooks<S, E, A> {
    /// Runs the action of a matched transition. The machine moves to `to` afterwards.
    fn execute(&mut self, action: &A, event: E, from: S, to: S);

    /// Called when no row matches `(state, event)`. The machine stays in `state`.
    fn no_transition(&mut self, state: S, event: E)
    where
        S: Debug,
        E: Event,
    {
        log::warn!("No transition from {:?} on {:?}", state, event.kind());
    }
}

/// A running machine: a shared table plus the current state.
#[derive(Debug, Clone)]
pub struct StateMachine<S, E: Event, A> {
    table: Arc<TransitionTable<S, E::Kind, A>>,
    state: S,
}

impl<S, E, A> StateMachine<S, E, A>
where
    S: Copy + Eq + Hash + Debug,
    E: Event,
{
    pub fn new(table: Arc<TransitionTable<S, E::Kind, A>>, initial: S) -> Self {
        StateMachine {
            table,
            state: initial,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Feeds `event` to the machine. Returns `true` if a transition fired.
    pub fn dispatch<H>(&mut self, event: E, hooks: &mut H) -> bool
    where
        H: Hooks<S, E, A>,
    {
        match self.table.lookup(self.state, event.kind()) {
            Some(transition) => {
                let from = self.state;
                hooks.execute(&transition.action, event, from, transition.next);
                self.state = transition.next;
                true
            }
            None => {
                hooks.no_transition(self.state, event);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Session {
        Idle,
        Active,
        Closed,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum SessionEventKind {
        Create,
        Update,
        Delete,
    }

    #[derive(Debug)]
    enum SessionEvent {
        Create { teid: u32 },
        Update { bytes: u64 },
        Delete,
    }

    impl Event for SessionEvent {
        type Kind = SessionEventKind;

        fn kind(&self) -> SessionEventKind {
            match self {
                SessionEvent::Create { .. } => SessionEventKind::Create,
                SessionEvent::Update { .. } => SessionEventKind::Update,
                SessionEvent::Delete => SessionEventKind::Delete,
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Open,
        Account,
        Close,
    }

    #[derive(Default)]
    struct Recorder {
        executed: Vec<(Action, Session, Session)>,
        teid: u32,
        bytes: u64,
        unmatched: Vec<(Session, SessionEventKind)>,
    }

    impl Hooks<Session, SessionEvent, Action> for Recorder {
        fn execute(&mut self, action: &Action, event: SessionEvent, from: Session, to: Session) {
            match event {
                SessionEvent::Create { teid } => self.teid = teid,
                SessionEvent::Update { bytes } => self.bytes += bytes,
                SessionEvent::Delete => (),
            }
            self.executed.push((*action, from, to));
        }

        fn no_transition(&mut self, state: Session, event: SessionEvent) {
            self.unmatched.push((state, event.kind()));
        }
    }

    fn session_table() -> Arc<TransitionTable<Session, SessionEventKind, Action>> {
        Arc::new(
            TransitionTable::new()
                .on(Session::Idle, SessionEventKind::Create, Action::Open, Session::Active)
                .on(Session::Active, SessionEventKind::Update, Action::Account, Session::Active)
                .on(Session::Active, SessionEventKind::Delete, Action::Close, Session::Closed),
        )
    }

    #[test]
    fn follows_table() {
        let mut fsm = StateMachine::new(session_table(), Session::Idle);
        let mut hooks = Recorder::default();

        assert!(fsm.dispatch(SessionEvent::Create { teid: 42 }, &mut hooks));
        assert!(fsm.dispatch(SessionEvent::Update { bytes: 100 }, &mut hooks));
        assert!(fsm.dispatch(SessionEvent::Update { bytes: 20 }, &mut hooks));
        assert!(fsm.dispatch(SessionEvent::Delete, &mut hooks));

        assert_eq!(fsm.state(), Session::Closed);
        assert_eq!(hooks.teid, 42);
        assert_eq!(hooks.bytes, 120);
        assert_eq!(
            hooks.executed,
            vec![
                (Action::Open, Session::Idle, Session::Active),
                (Action::Account, Session::Active, Session::Active),
                (Action::Account, Session::Active, Session::Active),
                (Action::Close, Session::Active, Session::Closed),
            ]
        );
        assert!(hooks.unmatched.is_empty());
    }

    #[test]
    fn unmatched_event_calls_no_transition() {
        let mut fsm = StateMachine::new(session_table(), Session::Idle);
        let mut hooks = Recorder::default();

        assert!(!fsm.dispatch(SessionEvent::Update { bytes: 1 }, &mut hooks));
        assert_eq!(fsm.state(), Session::Idle);
        assert_eq!(hooks.bytes, 0);
        assert_eq!(hooks.unmatched, vec![(Session::Idle, SessionEventKind::Update)]);
    }

    #[test]
    #[should_panic(expected = "duplicate transition")]
    fn duplicate_rows_are_rejected() {
        let _ = TransitionTable::new()
            .on(Session::Idle, SessionEventKind::Create, Action::Open, Session::Active)
            .on(Session::Idle, SessionEventKind::Create, Action::Close, Session::Closed);
    }
}
