use super::pool::{Stage, StageSnapshot};
use super::scheduler::{WorkError, Worker};
use super::stage_stats::StageStats;
use crate::fsm::{Event, Hooks, StateMachine, TransitionTable};

use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};

/// Lifecycle of a slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlaveState {
    /// Created by the scheduler, has not seen a started stage yet.
    Uninitialized,
    /// Copying the published snapshot and running `on_slave_init`.
    Initializing,
    Ready,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlaveEvent {
    /// First delivery after the master published its snapshot.
    Activate,
    InitDone,
    /// Pool teardown.
    Terminate,
}

impl Event for SlaveEvent {
    type Kind = SlaveEvent;

    fn kind(&self) -> SlaveEvent {
        *self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlaveAction {
    RunInitHook,
    MarkReady,
    RunTerminateHook,
    Abandon,
}

type LifecycleTable = TransitionTable<SlaveState, SlaveEvent, SlaveAction>;

fn lifecycle_table() -> Arc<LifecycleTable> {
    static TABLE: OnceLock<Arc<LifecycleTable>> = OnceLock::new();
    let table = TABLE.get_or_init(|| {
        use SlaveAction::*;
        use SlaveEvent::*;
        use SlaveState::*;
        Arc::new(
            TransitionTable::new()
                .on(Uninitialized, Activate, RunInitHook, Initializing)
                .on(Initializing, InitDone, MarkReady, Ready)
                .on(Ready, Terminate, RunTerminateHook, Terminated)
                .on(Uninitialized, Terminate, Abandon, Terminated),
        )
    });
    Arc::clone(table)
}

/// Executes lifecycle actions against the slave's stage instance.
struct LifecycleHooks<'a, S> {
    stage: &'a mut S,
    snapshot: Option<&'a StageSnapshot>,
    thread_key: usize,
}

impl<S: Stage> Hooks<SlaveState, SlaveEvent, SlaveAction> for LifecycleHooks<'_, S> {
    fn execute(&mut self, action: &SlaveAction, _event: SlaveEvent, from: SlaveState, to: SlaveState) {
        log::trace!("Slave {}: {:?} -> {:?}", self.thread_key, from, to);
        match action {
            SlaveAction::RunInitHook => {
                if let Some(snapshot) = self.snapshot {
                    self.stage.on_slave_init(snapshot);
                }
            }
            SlaveAction::RunTerminateHook => self.stage.on_slave_terminate(),
            SlaveAction::MarkReady | SlaveAction::Abandon => (),
        }
    }

    fn no_transition(&mut self, state: SlaveState, event: SlaveEvent) {
        log::warn!(
            "Slave {}: ignoring {:?} in state {:?}",
            self.thread_key,
            event,
            state
        );
    }
}

/// Per-worker-thread instance of a stage.
///
/// Built by the scheduler from a clone of the master's stage prototype. On the first delivery
/// after the master has published its [`StageSnapshot`], the slave copies the snapshot, runs
/// [`Stage::on_slave_init`] once and becomes `Ready`. Deliveries that arrive before publication
/// are dropped and the slave stays `Uninitialized`.
pub struct WorkerSlave<S: Stage> {
    stage: S,
    published: Arc<OnceLock<StageSnapshot>>,
    snapshot: Option<StageSnapshot>,
    lifecycle: StateMachine<SlaveState, SlaveEvent, SlaveAction>,
    stats: Arc<StageStats>,
    thread_key: usize,
    processed: u64,
}

impl<S: Stage> WorkerSlave<S> {
    pub fn new(
        stage: S,
        published: Arc<OnceLock<StageSnapshot>>,
        stats: Arc<StageStats>,
        thread_key: usize,
    ) -> Self {
        WorkerSlave {
            stage,
            published,
            snapshot: None,
            lifecycle: StateMachine::new(lifecycle_table(), SlaveState::Uninitialized),
            stats,
            thread_key,
            processed: 0,
        }
    }

    pub fn state(&self) -> SlaveState {
        self.lifecycle.state()
    }

    /// Number of items this slave processed successfully.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn thread_key(&self) -> usize {
        self.thread_key
    }

    /// The snapshot copied on initialization.
    pub fn snapshot(&self) -> Option<&StageSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    fn fire(&mut self, event: SlaveEvent) -> bool {
        let mut hooks = LifecycleHooks {
            stage: &mut self.stage,
            snapshot: self.snapshot.as_ref(),
            thread_key: self.thread_key,
        };
        self.lifecycle.dispatch(event, &mut hooks)
    }

    fn discard(&self, error: WorkError) -> Result<(), WorkError> {
        self.stats.discarded.fetch_add(1, Ordering::Relaxed);
        Err(error)
    }
}

impl<S: Stage> Worker<S::Item> for WorkerSlave<S> {
    fn do_work(&mut self, item: S::Item, thread_key: usize) -> Result<(), WorkError> {
        match self.lifecycle.state() {
            SlaveState::Uninitialized => {
                let Some(snapshot) = self.published.get() else {
                    return self.discard(WorkError::NotStarted);
                };
                self.snapshot = Some(snapshot.clone());
                self.fire(SlaveEvent::Activate);
                self.fire(SlaveEvent::InitDone);
            }
            SlaveState::Terminated => return self.discard(WorkError::Terminated),
            SlaveState::Initializing | SlaveState::Ready => (),
        }

        self.stats.actively_processing.fetch_add(1, Ordering::Relaxed);
        let result = self.stage.do_processing(item);
        self.stats.actively_processing.fetch_sub(1, Ordering::Relaxed);
        match result {
            Ok(()) => {
                self.processed += 1;
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                log::warn!("Slave {}: processing failed: {:#}", thread_key, e);
                Err(WorkError::Processing(e))
            }
        }
    }

    fn terminate(&mut self) {
        self.fire(SlaveEvent::Terminate);
    }
}
