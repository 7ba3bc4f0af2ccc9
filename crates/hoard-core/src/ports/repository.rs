//! FolderRepository port - 階層型フォルダリポジトリ
//!
//! リポジトリは非同期に中身が埋まっていく（子フォルダ一覧はあとから取得される）。
//! このクレートのタスクはリポジトリをこの port 越しにだけ触ります。
//!
//! # 設計原則
//! - クエリはすべて同期・infallible（存在しないものは `None` / `false`）
//! - 子フォルダ取得の完了は `RepositoryObserver::changed()` で通知される
//!   （`request_children_fetch` の呼び出し中に同期的に通知されることもある）
//! - readiness は一度だけ false -> true に遷移し、元に戻らない

use std::sync::Arc;

use tokio::sync::watch;

use crate::domain::{Folder, FolderId, ObserverId};

/// RepositoryObserver はリポジトリの変更通知を受け取る
///
/// `changed()` はリポジトリのロックを保持していない状態で呼ばれるので、
/// 中から `remove_observer` などを呼んでもよい。
pub trait RepositoryObserver: Send + Sync {
    fn changed(&self);
}

/// FolderRepository は階層型フォルダリポジトリへのインターフェース
pub trait FolderRepository: Send + Sync {
    /// Well-known id of the root folder.
    fn root_id(&self) -> FolderId;

    fn is_ready(&self) -> bool;

    /// One-shot readiness subscription.
    fn ready_signal(&self) -> ReadySignal;

    fn folder(&self, id: FolderId) -> Option<Folder>;

    fn contains(&self, id: FolderId) -> bool {
        self.folder(id).is_some()
    }

    /// Direct child folders of `parent`, in repository enumeration order.
    fn direct_children(&self, parent: FolderId) -> Vec<Folder>;

    /// Create a folder; a conforming repository always returns a fresh id.
    fn create_folder(&self, parent: FolderId, name: &str) -> Option<FolderId>;

    /// Ask the repository to fetch the children of `ids`.
    fn request_children_fetch(&self, ids: &[FolderId]);

    fn add_observer(&self, observer: Arc<dyn RepositoryObserver>) -> ObserverId;

    /// Returns `false` when the observer was not registered.
    fn remove_observer(&self, id: ObserverId) -> bool;

    fn are_children_fully_known(&self, id: FolderId) -> bool;

    /// Every folder in the repository has its children fetched.
    fn is_everything_fetched(&self) -> bool;

    /// Batched change notification (fire-and-forget).
    fn notify_observers(&self);
}

/// ReadyFlag は readiness の送信側
///
/// `watch` チャネルで一度きりの false -> true を配る。
#[derive(Debug)]
pub struct ReadyFlag {
    tx: watch::Sender<bool>,
}

impl ReadyFlag {
    pub fn new(ready: bool) -> Self {
        let (tx, _rx) = watch::channel(ready);
        Self { tx }
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Mark the repository usable. Irreversible; repeated calls are no-ops.
    pub fn mark_ready(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    pub fn signal(&self) -> ReadySignal {
        ReadySignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ReadyFlag {
    fn default() -> Self {
        Self::new(false)
    }
}

/// ReadySignal は readiness の受信側（登録ごとに一度だけ配送される）
#[derive(Debug)]
pub struct ReadySignal {
    rx: watch::Receiver<bool>,
}

impl ReadySignal {
    pub fn is_ready(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the repository is ready.
    ///
    /// Returns `false` if the repository went away without ever becoming ready.
    pub async fn wait(mut self) -> bool {
        self.rx.wait_for(|ready| *ready).await.is_ok()
    }
}
