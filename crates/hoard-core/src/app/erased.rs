//! Type erasure for state machines.
//!
//! `StateMachine` has associated types, so the scheduler cannot keep
//! `Box<dyn StateMachine>` directly. `TypedMachine<M>` wraps a machine together
//! with its current state and reply channel and exposes the object-safe
//! `DynMachine` (same shape as a typed handler behind a dyn handler).

use std::any::Any;

use tokio::sync::oneshot;
use tracing::warn;

use super::machine::{StateMachine, TaskContext, Transition};
use super::scheduler::{TaskError, Wake};
use crate::domain::TaskPhase;

pub(crate) type Reply<M> =
    Result<<M as StateMachine>::Output, TaskError<<M as StateMachine>::Error>>;

/// What the scheduler loop does with a slot after a hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Directive {
    Run,
    Idle,
    /// Terminal; carries `Finished` or `Aborted`.
    Done(TaskPhase),
}

pub(crate) trait DynMachine: Send {
    fn name(&self) -> &'static str;

    fn state_label(&self) -> String;

    fn initialize(&mut self) -> Directive;

    fn step(&mut self) -> Directive;

    /// Apply a wake-up. Returns `false` if it carried a foreign state type.
    fn resume(&mut self, wake: Wake) -> bool;

    /// Scheduler-level termination through the abort path.
    fn cancel(&mut self);

    /// The scheduler is stopping with this task still pending.
    fn abandon(&mut self);
}

pub(crate) struct TypedMachine<M: StateMachine> {
    machine: M,
    state: Option<M::State>,
    ctx: TaskContext<M::State>,
    reply: Option<oneshot::Sender<Reply<M>>>,
}

impl<M: StateMachine> TypedMachine<M> {
    pub(crate) fn new(
        machine: M,
        ctx: TaskContext<M::State>,
        reply: oneshot::Sender<Reply<M>>,
    ) -> Self {
        Self {
            machine,
            state: None,
            ctx,
            reply: Some(reply),
        }
    }

    fn apply(&mut self, transition: Transition<M::State, M::Error>) -> Directive {
        match transition {
            Transition::Goto(state) => {
                self.state = Some(state);
                Directive::Run
            }
            Transition::Idle(state) => {
                self.state = Some(state);
                Directive::Idle
            }
            Transition::Finish => {
                let output = self.machine.on_finish();
                self.send(Ok(output));
                Directive::Done(TaskPhase::Finished)
            }
            Transition::Abort(err) => {
                self.machine.on_abort();
                self.send(Err(TaskError::Aborted(err)));
                Directive::Done(TaskPhase::Aborted)
            }
        }
    }

    fn send(&mut self, reply: Reply<M>) {
        // reply は一度しか取り出せないので finish/abort は高々一回
        if let Some(tx) = self.reply.take() {
            // 呼び出し側が TaskHandle を捨てていても問題ない
            let _ = tx.send(reply);
        }
    }
}

impl<M: StateMachine> DynMachine for TypedMachine<M> {
    fn name(&self) -> &'static str {
        M::NAME
    }

    fn state_label(&self) -> String {
        self.state
            .map(|state| state.to_string())
            .unwrap_or_else(|| "uninitialized".to_string())
    }

    fn initialize(&mut self) -> Directive {
        let transition = self.machine.initialize(&self.ctx);
        self.apply(transition)
    }

    fn step(&mut self) -> Directive {
        let Some(state) = self.state else {
            warn!(task_id = %self.ctx.task_id(), machine = M::NAME, "step without a state");
            return Directive::Idle;
        };
        let transition = self.machine.multiplex(state, &self.ctx);
        self.apply(transition)
    }

    fn resume(&mut self, wake: Wake) -> bool {
        match wake {
            Wake::Continue => true,
            Wake::Resume(state) => match state.downcast::<M::State>() {
                Ok(state) => {
                    self.state = Some(*state);
                    true
                }
                Err(other) => {
                    warn!(
                        task_id = %self.ctx.task_id(),
                        machine = M::NAME,
                        type_id = ?Any::type_id(&*other),
                        "ignoring resume with a foreign state type"
                    );
                    false
                }
            },
        }
    }

    fn cancel(&mut self) {
        self.machine.on_abort();
        self.send(Err(TaskError::Cancelled));
    }

    fn abandon(&mut self) {
        self.machine.on_abort();
        self.send(Err(TaskError::Dropped));
    }
}
