//! EnsureFolder - 名前付きフォルダの存在を保証するタスク
//!
//! # 状態遷移
//! - ResolveOrCreate: ID か名前でフォルダを特定する（必要なら作る）
//! - AwaitChildren: ChildrenFetchBridge に子フォルダ取得を任せて suspend
//! - Verify: 非同期待ちの間に消えていないかを確認する
//!
//! ```text
//! ResolveOrCreate --(fetch 不要)--> Finish
//!        |
//!        +--(fetch 必要)--> AwaitChildren --(bridge)--> Verify --> Finish / Abort(Vanished)
//! ```
//!
//! # 並行アクター
//! リポジトリは他の誰かにいつでも書き換えられる。suspend から戻るたびに存在を
//! 確認し直し、消えていたら Vanished で abort する（ロックはしない）。

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::bridge::ChildrenFetchBridge;
use super::machine::{StateMachine, TaskContext, Transition};
use crate::domain::{EnsureFolderError, EnsureFolderState, FolderId};
use crate::ports::FolderRepository;

type Step = Transition<EnsureFolderState, EnsureFolderError>;

/// Result of a finished [`EnsureFolder`] run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnsureFolderReport {
    /// The resolved folder; `None` when it did not exist and creation was off.
    pub folder: Option<FolderId>,
    pub resolved: bool,
    /// This run created the folder.
    pub created: bool,
    pub children_known: bool,
}

/// Ensures a folder exists, optionally with its children fetched.
///
/// # 使用例
/// ```ignore
/// let task = EnsureFolder::named(repo.clone(), "Textures")
///     .create_if_missing(true)
///     .fetch_children(true);
/// let report = scheduler.submit(task)?.join().await?;
/// ```
pub struct EnsureFolder {
    repo: Arc<dyn FolderRepository>,
    target: Option<FolderId>,
    parent: Option<FolderId>,
    name: String,
    create_if_missing: bool,
    fetch_children: bool,
    resolved: bool,
    created: bool,
    needs_notify: bool,
}

impl EnsureFolder {
    /// Look up (or create) `name` directly below the root folder.
    pub fn named(repo: Arc<dyn FolderRepository>, name: impl Into<String>) -> Self {
        Self {
            repo,
            target: None,
            parent: None,
            name: name.into(),
            create_if_missing: false,
            fetch_children: false,
            resolved: false,
            created: false,
            needs_notify: false,
        }
    }

    /// Start from a known id. Without a name, a missing id cannot be recovered.
    pub fn by_id(repo: Arc<dyn FolderRepository>, id: FolderId) -> Self {
        Self::named(repo, String::new()).with_target(id)
    }

    pub fn with_target(mut self, id: FolderId) -> Self {
        self.target = Some(id);
        self
    }

    pub fn under(mut self, parent: FolderId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn fetch_children(mut self, fetch: bool) -> Self {
        self.fetch_children = fetch;
        self
    }

    fn resolve_or_create(&mut self) -> Step {
        // readiness は一度 true になったら戻らない
        debug_assert!(self.repo.is_ready(), "resolving against an unusable repository");

        let root = self.repo.root_id();
        let parent = *self.parent.get_or_insert(root);

        let known = self.target.filter(|id| self.repo.contains(*id));
        let folder = match known {
            Some(id) => id,
            None => {
                // abort したときに古い ID を返さないよう先に消しておく
                let missing = self.target.take();
                if self.name.is_empty() {
                    warn!(target_id = ?missing, "unknown folder id and no name to resolve by");
                    return Transition::Abort(EnsureFolderError::MissingName { target: missing });
                }
                if parent != root && !self.repo.contains(parent) {
                    warn!(%parent, name = %self.name, "unknown parent folder id");
                    return Transition::Abort(EnsureFolderError::MissingParent {
                        parent,
                        name: self.name.clone(),
                    });
                }

                let found = self
                    .repo
                    .direct_children(parent)
                    .into_iter()
                    .find(|folder| folder.has_name(&self.name))
                    .map(|folder| folder.id);

                match found {
                    Some(id) => id,
                    None if !self.create_if_missing => {
                        debug!(%parent, name = %self.name, "folder does not exist");
                        return Transition::Finish;
                    }
                    None => match self.repo.create_folder(parent, &self.name) {
                        Some(id) => {
                            info!(folder = %id, %parent, name = %self.name, "created folder");
                            self.created = true;
                            self.needs_notify = true;
                            id
                        }
                        None => {
                            error!(
                                %parent,
                                name = %self.name,
                                "repository did not allocate a folder id"
                            );
                            return Transition::Abort(EnsureFolderError::IdAllocationFailed {
                                parent,
                                name: self.name.clone(),
                            });
                        }
                    },
                }
            }
        };

        self.target = Some(folder);
        self.resolved = true;
        after_resolution(folder, self.fetch_children, self.repo.is_everything_fetched())
    }

    fn verify(&mut self, folder: FolderId) -> Step {
        if !self.repo.contains(folder) {
            warn!(%folder, "folder vanished while fetching its children");
            return Transition::Abort(EnsureFolderError::Vanished { folder });
        }
        debug_assert!(
            self.repo.are_children_fully_known(folder),
            "bridge fired before children of {folder} were known"
        );
        Transition::Finish
    }
}

/// Decide what follows a successful resolution of `folder`.
pub fn after_resolution(folder: FolderId, fetch_children: bool, everything_fetched: bool) -> Step {
    if !fetch_children || everything_fetched {
        Transition::Finish
    } else {
        Transition::Goto(EnsureFolderState::AwaitChildren { folder })
    }
}

impl StateMachine for EnsureFolder {
    type State = EnsureFolderState;
    type Output = EnsureFolderReport;
    type Error = EnsureFolderError;
    const NAME: &'static str = "ensure_folder";

    fn initialize(&mut self, ctx: &TaskContext<EnsureFolderState>) -> Step {
        self.resolved = false;
        self.created = false;
        self.needs_notify = false;

        let signal = self.repo.ready_signal();
        if signal.is_ready() {
            return Transition::Goto(EnsureFolderState::ResolveOrCreate);
        }

        // ポーリングせず readiness の一回きりの通知を待つ
        debug!(task_id = %ctx.task_id(), "waiting for the repository to become ready");
        let resumer = ctx.resumer();
        tokio::spawn(async move {
            if signal.wait().await {
                resumer.cont();
            } else {
                warn!(task_id = %resumer.task_id(), "repository went away before becoming ready");
            }
        });
        Transition::Idle(EnsureFolderState::ResolveOrCreate)
    }

    fn multiplex(
        &mut self,
        state: EnsureFolderState,
        ctx: &TaskContext<EnsureFolderState>,
    ) -> Step {
        debug!(task_id = %ctx.task_id(), %state, folder = ?state.folder(), "ensure_folder step");
        match state {
            EnsureFolderState::ResolveOrCreate => self.resolve_or_create(),
            EnsureFolderState::AwaitChildren { folder } => {
                // 先に Idle を返すので、bridge が同期的に発火しても取りこぼさない
                ChildrenFetchBridge::spawn(
                    Arc::clone(&self.repo),
                    vec![folder],
                    ctx.resumer(),
                    EnsureFolderState::Verify { folder },
                );
                Transition::Idle(state)
            }
            EnsureFolderState::Verify { folder } => self.verify(folder),
        }
    }

    fn on_finish(&mut self) -> EnsureFolderReport {
        if self.needs_notify {
            self.repo.notify_observers();
        }
        let folder = self.target.filter(|_| self.resolved);
        EnsureFolderReport {
            folder,
            resolved: self.resolved,
            created: self.created,
            children_known: folder.is_some_and(|id| self.repo.are_children_fully_known(id)),
        }
    }
}
