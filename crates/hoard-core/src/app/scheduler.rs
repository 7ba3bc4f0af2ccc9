//! Scheduler - 協調的なタスクスケジューラ
//!
//! # フロー
//! 1. `submit()` でタスクを inbox に積む
//! 2. ループが `initialize` を呼び、Goto なら runnable キューへ、Idle なら suspend
//! 3. runnable キューから 1 件ずつ `multiplex` を呼ぶ（1 ステップは割り込まれない）
//! 4. `Resumer` からの wake-up で suspend 中のタスクを runnable に戻す
//! 5. Finish / Abort でスロットを片付け、`TaskHandle` に結果を返す
//!
//! # 設計原則
//! - ループは 1 本の tokio タスクで、全タスクの状態を単独で所有する（single writer）
//! - 外からの操作はすべて inbox（mpsc）経由
//! - タイムアウトは持たない。止めたいときは `cancel()`（abort 経路）を使う

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use super::erased::{Directive, DynMachine, Reply, TypedMachine};
use super::machine::{StateMachine, TaskContext};
use crate::domain::{TaskId, TaskPhase};
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Give the tokio runtime a turn after this many consecutive steps.
    pub yield_every: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { yield_every: 32 }
    }
}

/// Errors from talking to the scheduler itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("scheduler has stopped")]
    Stopped,
}

/// Why a task did not complete.
#[derive(Debug, Error)]
pub enum TaskError<E: std::error::Error + 'static> {
    #[error("task aborted: {0}")]
    Aborted(#[source] E),

    #[error("task cancelled")]
    Cancelled,

    /// The scheduler stopped before the task reached a terminal state.
    /// The abort hook has run.
    #[error("task dropped before completion")]
    Dropped,
}

impl<E: std::error::Error + 'static> TaskError<E> {
    pub fn aborted(&self) -> Option<&E> {
        match self {
            TaskError::Aborted(err) => Some(err),
            _ => None,
        }
    }
}

/// Task counts by phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerCounts {
    pub running: usize,
    pub suspended: usize,
    pub finished: usize,
    pub aborted: usize,
}

/// Wake-up delivered through a `Resumer`.
pub(crate) enum Wake {
    Continue,
    Resume(Box<dyn Any + Send>),
}

pub(crate) enum Command {
    Submit {
        task_id: TaskId,
        machine: Box<dyn DynMachine>,
    },
    Wake {
        task_id: TaskId,
        wake: Wake,
    },
    Cancel {
        task_id: TaskId,
    },
    Counts(oneshot::Sender<SchedulerCounts>),
}

/// Handle returned by [`Scheduler::submit`].
pub struct TaskHandle<O, E: std::error::Error + 'static> {
    task_id: TaskId,
    rx: oneshot::Receiver<Result<O, TaskError<E>>>,
}

impl<O, E: std::error::Error + 'static> TaskHandle<O, E> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Wait for the task to finish or abort.
    pub async fn join(self) -> Result<O, TaskError<E>> {
        match self.rx.await {
            Ok(reply) => reply,
            Err(_) => Err(TaskError::Dropped),
        }
    }
}

/// Scheduler handle.
/// - `shutdown_and_join()` でループを止めて終了を待つ
/// - Scheduler を drop してもループは止まる
pub struct Scheduler {
    inbox: mpsc::UnboundedSender<Command>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    ids: Arc<dyn IdGenerator>,
}

impl Scheduler {
    /// Spawn the scheduler loop on the current tokio runtime.
    pub fn start(config: SchedulerConfig) -> Self {
        Self::with_id_generator(config, Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(config: SchedulerConfig, ids: Arc<dyn IdGenerator>) -> Self {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let scheduler_loop = SchedulerLoop::new(config);
        let join = tokio::spawn(scheduler_loop.run(rx, shutdown_rx));
        Self {
            inbox,
            shutdown_tx,
            join,
            ids,
        }
    }

    /// Submit a machine; it is initialized on the scheduler loop.
    pub fn submit<M: StateMachine>(
        &self,
        machine: M,
    ) -> Result<TaskHandle<M::Output, M::Error>, SchedulerError> {
        let task_id = self.ids.generate_task_id();
        let (tx, rx) = oneshot::channel::<Reply<M>>();
        let ctx = TaskContext::new(task_id, self.inbox.clone());
        let machine = Box::new(TypedMachine::new(machine, ctx, tx));
        self.inbox
            .send(Command::Submit { task_id, machine })
            .map_err(|_| SchedulerError::Stopped)?;
        Ok(TaskHandle { task_id, rx })
    }

    /// Terminate a task through its abort path.
    ///
    /// Unknown or already finished tasks are ignored.
    pub fn cancel(&self, task_id: TaskId) -> Result<(), SchedulerError> {
        self.inbox
            .send(Command::Cancel { task_id })
            .map_err(|_| SchedulerError::Stopped)
    }

    pub async fn counts(&self) -> Result<SchedulerCounts, SchedulerError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Command::Counts(tx))
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)
    }

    /// Stop the loop. Tasks that have not terminated run their abort hook and
    /// report [`TaskError::Dropped`].
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        let _ = self.join.await;
    }
}

struct Slot {
    machine: Box<dyn DynMachine>,
    phase: TaskPhase,
}

struct SchedulerLoop {
    config: SchedulerConfig,
    slots: HashMap<TaskId, Slot>,
    runnable: VecDeque<TaskId>,
    finished: usize,
    aborted: usize,
}

impl SchedulerLoop {
    fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
            runnable: VecDeque::new(),
            finished: 0,
            aborted: 0,
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Command>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut steps_since_yield = 0usize;
        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            // 先に溜まっている wake-up を全部反映してから 1 ステップ進める
            while let Ok(command) = inbox.try_recv() {
                self.apply(command);
            }

            if let Some(task_id) = self.runnable.pop_front() {
                self.step(task_id);
                steps_since_yield += 1;
                if steps_since_yield >= self.config.yield_every.max(1) {
                    steps_since_yield = 0;
                    tokio::task::yield_now().await;
                }
                continue;
            }

            steps_since_yield = 0;
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        // Scheduler handle dropped
                        break;
                    }
                }
                command = inbox.recv() => match command {
                    Some(command) => self.apply(command),
                    None => break,
                },
            }
        }

        let pending = self.slots.len();
        // 終わっていないタスクも abort 経路で終わらせる（TaskHandle には Dropped）
        for (task_id, mut slot) in self.slots.drain() {
            debug!(%task_id, machine = slot.machine.name(), "task dropped by shutdown");
            slot.machine.abandon();
            self.aborted += 1;
        }
        self.runnable.clear();

        info!(
            pending,
            finished = self.finished,
            aborted = self.aborted,
            "scheduler stopped"
        );
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Submit { task_id, machine } => {
                debug!(%task_id, machine = machine.name(), "task submitted");
                self.slots.insert(
                    task_id,
                    Slot {
                        machine,
                        phase: TaskPhase::Created,
                    },
                );
                let directive = match self.slots.get_mut(&task_id) {
                    Some(slot) => slot.machine.initialize(),
                    None => return,
                };
                self.settle(task_id, directive);
            }
            Command::Wake { task_id, wake } => self.wake(task_id, wake),
            Command::Cancel { task_id } => {
                let Some(mut slot) = self.slots.remove(&task_id) else {
                    debug!(%task_id, "cancel for unknown or terminated task");
                    return;
                };
                info!(%task_id, machine = slot.machine.name(), "task cancelled");
                self.runnable.retain(|id| *id != task_id);
                slot.machine.cancel();
                self.aborted += 1;
            }
            Command::Counts(tx) => {
                let _ = tx.send(self.counts());
            }
        }
    }

    fn wake(&mut self, task_id: TaskId, wake: Wake) {
        let Some(slot) = self.slots.get_mut(&task_id) else {
            debug!(%task_id, "wake-up for unknown or terminated task");
            return;
        };
        if !slot.machine.resume(wake) {
            return;
        }
        trace!(%task_id, state = %slot.machine.state_label(), "task woken");
        // Running のタスクは既にキューにいるので、状態の差し替えだけで十分
        if slot.phase == TaskPhase::Suspended {
            slot.phase = TaskPhase::Running;
            self.runnable.push_back(task_id);
        }
    }

    fn step(&mut self, task_id: TaskId) {
        let directive = {
            let Some(slot) = self.slots.get_mut(&task_id) else {
                return;
            };
            if slot.phase != TaskPhase::Running {
                return;
            }
            trace!(
                %task_id,
                machine = slot.machine.name(),
                state = %slot.machine.state_label(),
                "multiplex"
            );
            slot.machine.step()
        };
        self.settle(task_id, directive);
    }

    fn settle(&mut self, task_id: TaskId, directive: Directive) {
        match directive {
            Directive::Run => {
                if let Some(slot) = self.slots.get_mut(&task_id) {
                    slot.phase = TaskPhase::Running;
                    self.runnable.push_back(task_id);
                }
            }
            Directive::Idle => {
                if let Some(slot) = self.slots.get_mut(&task_id) {
                    slot.phase = TaskPhase::Suspended;
                    debug!(%task_id, state = %slot.machine.state_label(), "task suspended");
                }
            }
            Directive::Done(phase) => {
                debug_assert!(phase.is_terminal());
                if let Some(slot) = self.slots.remove(&task_id) {
                    debug!(%task_id, machine = slot.machine.name(), ?phase, "task terminated");
                }
                match phase {
                    TaskPhase::Aborted => self.aborted += 1,
                    _ => self.finished += 1,
                }
            }
        }
    }

    fn counts(&self) -> SchedulerCounts {
        let mut counts = SchedulerCounts {
            finished: self.finished,
            aborted: self.aborted,
            ..SchedulerCounts::default()
        };
        for slot in self.slots.values() {
            match slot.phase {
                TaskPhase::Suspended => counts.suspended += 1,
                TaskPhase::Created | TaskPhase::Running => counts.running += 1,
                TaskPhase::Aborted | TaskPhase::Finished => {}
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::machine::Transition;
    use std::fmt;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Count {
        Tick(u32),
        Parked,
        Done,
    }

    impl fmt::Display for Count {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[derive(Debug, Error)]
    #[error("boom at {0}")]
    struct Boom(u32);

    /// Counts up to `limit`, optionally parking until resumed.
    struct Counter {
        limit: u32,
        park: bool,
        fail_at: Option<u32>,
        resumer: Arc<Mutex<Option<crate::app::Resumer<Count>>>>,
        aborted: Arc<Mutex<u32>>,
    }

    impl Counter {
        fn new(limit: u32) -> Self {
            Self {
                limit,
                park: false,
                fail_at: None,
                resumer: Arc::new(Mutex::new(None)),
                aborted: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl StateMachine for Counter {
        type State = Count;
        type Output = u32;
        type Error = Boom;
        const NAME: &'static str = "counter";

        fn initialize(&mut self, ctx: &TaskContext<Count>) -> Transition<Count, Boom> {
            if self.park {
                *self.resumer.lock().unwrap() = Some(ctx.resumer());
                return Transition::Idle(Count::Parked);
            }
            Transition::Goto(Count::Tick(0))
        }

        fn multiplex(
            &mut self,
            state: Count,
            _ctx: &TaskContext<Count>,
        ) -> Transition<Count, Boom> {
            match state {
                Count::Tick(n) if Some(n) == self.fail_at => Transition::Abort(Boom(n)),
                Count::Tick(n) if n >= self.limit => Transition::Goto(Count::Done),
                Count::Tick(n) => Transition::Goto(Count::Tick(n + 1)),
                Count::Parked => Transition::Idle(Count::Parked),
                Count::Done => Transition::Finish,
            }
        }

        fn on_abort(&mut self) {
            *self.aborted.lock().unwrap() += 1;
        }

        fn on_finish(&mut self) -> u32 {
            self.limit
        }
    }

    #[tokio::test]
    async fn runs_machine_to_finish() {
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let handle = scheduler.submit(Counter::new(5)).unwrap();
        assert!(handle.task_id().to_string().starts_with("task-"));

        assert_eq!(handle.join().await.unwrap(), 5);

        let counts = scheduler.counts().await.unwrap();
        assert_eq!(counts.finished, 1);
        assert_eq!(counts.running, 0);
        scheduler.shutdown_and_join().await;
    }

    #[tokio::test]
    async fn abort_runs_abort_hook_once() {
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let mut counter = Counter::new(10);
        counter.fail_at = Some(3);
        let aborted = Arc::clone(&counter.aborted);

        let err = scheduler.submit(counter).unwrap().join().await.unwrap_err();
        assert!(matches!(err, TaskError::Aborted(Boom(3))));
        assert_eq!(*aborted.lock().unwrap(), 1);
        assert_eq!(scheduler.counts().await.unwrap().aborted, 1);
    }

    #[tokio::test]
    async fn suspended_task_resumes_into_given_state() {
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let mut counter = Counter::new(2);
        counter.park = true;
        let resumer = Arc::clone(&counter.resumer);
        let handle = scheduler.submit(counter).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.counts().await.unwrap().suspended, 1);

        let resumer = resumer.lock().unwrap().clone().unwrap();
        // cont() は Parked のまま走らせるだけなので再び suspend する
        assert!(resumer.cont());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.counts().await.unwrap().suspended, 1);

        assert!(resumer.resume_to(Count::Tick(0)));
        assert_eq!(handle.join().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_reports_cancelled_and_ignores_late_wakes() {
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let mut counter = Counter::new(1);
        counter.park = true;
        let resumer = Arc::clone(&counter.resumer);
        let aborted = Arc::clone(&counter.aborted);
        let handle = scheduler.submit(counter).unwrap();
        let task_id = handle.task_id();

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.cancel(task_id).unwrap();
        assert!(matches!(handle.join().await, Err(TaskError::Cancelled)));
        assert_eq!(*aborted.lock().unwrap(), 1);

        let resumer = resumer.lock().unwrap().clone().unwrap();
        resumer.resume_to(Count::Done);
        let counts = scheduler.counts().await.unwrap();
        assert_eq!(counts.aborted, 1);
        assert_eq!(counts.finished, 0);
    }

    #[tokio::test]
    async fn shutdown_drops_pending_tasks() {
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let mut counter = Counter::new(1);
        counter.park = true;
        let aborted = Arc::clone(&counter.aborted);
        let handle = scheduler.submit(counter).unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        scheduler.shutdown_and_join().await;
        assert!(matches!(handle.join().await, Err(TaskError::Dropped)));
        assert_eq!(*aborted.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn shutdown_leaves_finished_tasks_alone() {
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let counter = Counter::new(3);
        let aborted = Arc::clone(&counter.aborted);

        assert_eq!(scheduler.submit(counter).unwrap().join().await.unwrap(), 3);
        scheduler.shutdown_and_join().await;
        assert_eq!(*aborted.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn many_tasks_interleave() {
        let scheduler = Scheduler::start(SchedulerConfig { yield_every: 1 });
        let handles: Vec<_> = (0..8)
            .map(|n| scheduler.submit(Counter::new(n * 10)).unwrap())
            .collect();
        for (n, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.join().await.unwrap(), n as u32 * 10);
        }
        assert_eq!(scheduler.counts().await.unwrap().finished, 8);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: SchedulerConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SchedulerConfig::default());
    }
}
