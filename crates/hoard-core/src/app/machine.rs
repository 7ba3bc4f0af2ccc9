//! StateMachine - スケジューラで動かすタスクの定義
//!
//! # 学習ポイント
//! - Associated types（State / Output / Error）でタスクごとの型を表現
//! - 状態遷移はフィールドの書き換えではなく `Transition` を返して表現する
//! - 外部コンテキスト（オブザーバー、readiness 待ち）からは `Resumer` 経由で
//!   スケジューラの inbox にメッセージを積むだけ（single writer を保つ）

use std::fmt;
use std::marker::PhantomData;

use tokio::sync::mpsc;
use tracing::debug;

use super::scheduler::{Command, Wake};
use crate::domain::TaskId;

/// What the scheduler should do with a task after a hook returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition<S, E> {
    /// Switch to `S` and run `multiplex` again on the next turn.
    Goto(S),
    /// Switch to `S` and suspend until a [`Resumer`] wakes the task.
    Idle(S),
    /// Terminate successfully.
    Finish,
    /// Terminate with an error.
    Abort(E),
}

/// StateMachine はスケジューラが駆動するタスク
///
/// # 使用例
/// ```ignore
/// impl StateMachine for MyTask {
///     type State = MyState;
///     type Output = ();
///     type Error = MyError;
///     const NAME: &'static str = "my_task";
///
///     fn initialize(&mut self, _ctx: &TaskContext<MyState>) -> Transition<MyState, MyError> {
///         Transition::Goto(MyState::Start)
///     }
///     // ...
/// }
/// ```
///
/// # 終了の約束
/// - `Finish` なら `on_finish`、`Abort`（またはキャンセル）なら `on_abort` が
///   ちょうど一度だけ呼ばれる
pub trait StateMachine: Send + 'static {
    type State: Copy + fmt::Debug + fmt::Display + Send + Sync + 'static;
    type Output: Send + 'static;
    type Error: std::error::Error + Send + 'static;

    /// Name used in logs.
    const NAME: &'static str;

    /// Set the starting state, optionally suspending right away.
    fn initialize(
        &mut self,
        ctx: &TaskContext<Self::State>,
    ) -> Transition<Self::State, Self::Error>;

    /// Run one step in `state`.
    fn multiplex(
        &mut self,
        state: Self::State,
        ctx: &TaskContext<Self::State>,
    ) -> Transition<Self::State, Self::Error>;

    fn on_abort(&mut self) {}

    /// Produce the task's result. Runs after the terminal state is reached.
    fn on_finish(&mut self) -> Self::Output;
}

/// TaskContext はフックに渡されるスケジューラへの窓口
pub struct TaskContext<S> {
    task_id: TaskId,
    inbox: mpsc::UnboundedSender<Command>,
    _marker: PhantomData<fn(S)>,
}

impl<S: Send + 'static> TaskContext<S> {
    pub(crate) fn new(task_id: TaskId, inbox: mpsc::UnboundedSender<Command>) -> Self {
        Self {
            task_id,
            inbox,
            _marker: PhantomData,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// A handle that can wake this task from any thread or call stack.
    pub fn resumer(&self) -> Resumer<S> {
        Resumer {
            task_id: self.task_id,
            inbox: self.inbox.clone(),
            _marker: PhantomData,
        }
    }
}

/// Resumer は suspend 中のタスクを起こすハンドル
///
/// 送るのはメッセージだけで、タスクの状態は scheduler ループの中でしか変わらない。
pub struct Resumer<S> {
    task_id: TaskId,
    inbox: mpsc::UnboundedSender<Command>,
    _marker: PhantomData<fn(S)>,
}

impl<S> Clone for Resumer<S> {
    fn clone(&self) -> Self {
        Self {
            task_id: self.task_id,
            inbox: self.inbox.clone(),
            _marker: PhantomData,
        }
    }
}

impl<S: Send + 'static> Resumer<S> {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Force the task into `state` and make it runnable.
    ///
    /// Returns `false` when the scheduler is gone.
    pub fn resume_to(&self, state: S) -> bool {
        self.send(Wake::Resume(Box::new(state)))
    }

    /// Make the task runnable again in its current state.
    pub fn cont(&self) -> bool {
        self.send(Wake::Continue)
    }

    fn send(&self, wake: Wake) -> bool {
        let sent = self
            .inbox
            .send(Command::Wake {
                task_id: self.task_id,
                wake,
            })
            .is_ok();
        if !sent {
            debug!(task_id = %self.task_id, "scheduler stopped; dropping wake-up");
        }
        sent
    }
}
