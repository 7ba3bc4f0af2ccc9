//! App - アプリケーション層
//!
//! このモジュールは、ports を組み合わせてタスクを駆動します。
//!
//! # 主要コンポーネント
//! - **StateMachine**: スケジューラで動かすタスクの trait
//! - **Scheduler**: 協調的なタスクスケジューラ（single writer のループ）
//! - **ChildrenFetchBridge**: 子フォルダ取得の完了をタスクの再開に変換する
//! - **EnsureFolder**: フォルダの存在を保証するタスク

pub mod bridge;
pub mod ensure_folder;
mod erased;
pub mod machine;
pub mod scheduler;

// 主要な型を再エクスポート
pub use self::bridge::ChildrenFetchBridge;
pub use self::ensure_folder::{after_resolution, EnsureFolder, EnsureFolderReport};
pub use self::machine::{Resumer, StateMachine, TaskContext, Transition};
pub use self::scheduler::{
    Scheduler, SchedulerConfig, SchedulerCounts, SchedulerError, TaskError, TaskHandle,
};
