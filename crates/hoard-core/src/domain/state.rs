//! State - タスクの状態
//!
//! - `TaskPhase`: スケジューラが管理するメタ状態（どのタスクにも共通）
//! - `EnsureFolderState`: EnsureFolder タスク固有の状態
//!
//! 数値の state id を予約レンジで分け合う代わりに、タスクごとに enum を持たせる。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::FolderId;

/// TaskPhase はスケジューラから見たタスクのライフサイクル
///
/// # 状態遷移
/// - Created -> Running -> Finished
/// - Created -> Running -> Suspended -> Running -> ...
/// - Created/Running/Suspended -> Aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPhase {
    /// Submitted, `initialize` not yet called.
    Created,
    /// Runnable; `multiplex` will be called on the next turn.
    Running,
    /// Idle until a resumer wakes it.
    Suspended,
    Aborted,
    Finished,
}

impl TaskPhase {
    /// Is this a terminal phase (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskPhase::Aborted | TaskPhase::Finished)
    }
}

/// EnsureFolderState は EnsureFolder タスクの実行状態
///
/// AwaitChildren / Verify は対象フォルダの ID を持つので、
/// 「AwaitChildren に入った時点で対象が決まっている」ことを型で保証できる。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum EnsureFolderState {
    /// Entry state: resolve the folder by id or name, creating it if asked.
    ResolveOrCreate,
    /// Waiting for the children fetch bridge to fire.
    AwaitChildren { folder: FolderId },
    /// Re-validate the folder after the asynchronous fetch.
    Verify { folder: FolderId },
}

impl EnsureFolderState {
    pub fn as_str(self) -> &'static str {
        match self {
            EnsureFolderState::ResolveOrCreate => "resolve_or_create",
            EnsureFolderState::AwaitChildren { .. } => "await_children",
            EnsureFolderState::Verify { .. } => "verify",
        }
    }

    /// The folder this state is bound to, once resolution is done.
    pub fn folder(self) -> Option<FolderId> {
        match self {
            EnsureFolderState::ResolveOrCreate => None,
            EnsureFolderState::AwaitChildren { folder } | EnsureFolderState::Verify { folder } => {
                Some(folder)
            }
        }
    }
}

impl fmt::Display for EnsureFolderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case::created(TaskPhase::Created, false)]
    #[case::running(TaskPhase::Running, false)]
    #[case::suspended(TaskPhase::Suspended, false)]
    #[case::aborted(TaskPhase::Aborted, true)]
    #[case::finished(TaskPhase::Finished, true)]
    fn terminal_phases(#[case] phase: TaskPhase, #[case] terminal: bool) {
        assert_eq!(phase.is_terminal(), terminal);
    }

    #[test]
    fn state_labels_match_serde_tags() {
        let folder = FolderId::from_ulid(Ulid::new());
        for state in [
            EnsureFolderState::ResolveOrCreate,
            EnsureFolderState::AwaitChildren { folder },
            EnsureFolderState::Verify { folder },
        ] {
            let json = serde_json::to_value(state).unwrap();
            assert_eq!(json["state"], state.to_string());
        }
    }

    #[test]
    fn only_resolved_states_carry_a_folder() {
        let folder = FolderId::from_ulid(Ulid::new());
        assert_eq!(EnsureFolderState::ResolveOrCreate.folder(), None);
        assert_eq!(
            EnsureFolderState::AwaitChildren { folder }.folder(),
            Some(folder)
        );
        assert_eq!(EnsureFolderState::Verify { folder }.folder(), Some(folder));
    }
}
