//! ChildrenFetchBridge - 子フォルダ取得の完了をタスクの状態遷移に変換する
//!
//! # フロー
//! 1. リポジトリに子フォルダ取得を依頼する
//! 2. 自分をオブザーバーとして登録する
//! 3. すぐに完了チェックする（取得が依頼の中で同期的に終わっていることがある）
//! 4. 完了したら `Resumer::resume_to` でタスクを起こし、登録を外して消える
//!
//! ブリッジを所有しているのはリポジトリ側の登録だけ。登録を外した時点で drop される。
//! 呼び出し側はブリッジを作る前にタスクを suspend させること
//! （`Transition::Idle` を返す。起こすメッセージは inbox に積まれるので取りこぼさない）。

use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::debug;

use super::machine::Resumer;
use crate::domain::{FolderId, ObserverId};
use crate::ports::{FolderRepository, RepositoryObserver};

/// One-shot observer that resumes a task once the tracked folders are complete.
pub struct ChildrenFetchBridge<S> {
    repo: Arc<dyn FolderRepository>,
    folders: Vec<FolderId>,
    on_complete: S,
    /// Taken on fire; `None` afterwards.
    resumer: Mutex<Option<Resumer<S>>>,
    registration: OnceLock<ObserverId>,
}

impl<S> ChildrenFetchBridge<S>
where
    S: Copy + Send + Sync + 'static,
{
    /// Request the fetch for `folders` and resume the task into `on_complete`
    /// once every one of them is complete.
    pub fn spawn(
        repo: Arc<dyn FolderRepository>,
        folders: Vec<FolderId>,
        resumer: Resumer<S>,
        on_complete: S,
    ) {
        let task_id = resumer.task_id();
        let bridge = Arc::new(Self {
            repo: Arc::clone(&repo),
            folders,
            on_complete,
            resumer: Mutex::new(Some(resumer)),
            registration: OnceLock::new(),
        });

        repo.request_children_fetch(&bridge.folders);
        let observer_id = repo.add_observer(bridge.clone());
        let _ = bridge.registration.set(observer_id);
        debug!(%task_id, %observer_id, folders = bridge.folders.len(), "children fetch requested");

        // 依頼の中で取得が終わっていた場合は、ここで拾わないと誰も起こさない
        bridge.fire_if_complete();
        // changed() が登録 ID の設定より先に走った場合の後始末
        if bridge.has_fired() {
            repo.remove_observer(observer_id);
        }
    }

    /// A tracked folder counts as complete once its children are known or it no
    /// longer exists (a vanished folder has nothing left to fetch).
    fn is_complete(&self) -> bool {
        self.folders
            .iter()
            .all(|id| !self.repo.contains(*id) || self.repo.are_children_fully_known(*id))
    }

    fn has_fired(&self) -> bool {
        self.resumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn fire_if_complete(&self) {
        if !self.is_complete() {
            return;
        }
        let Some(resumer) = self
            .resumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        if let Some(observer_id) = self.registration.get() {
            self.repo.remove_observer(*observer_id);
        }
        debug!(task_id = %resumer.task_id(), "children fetch complete");
        resumer.resume_to(self.on_complete);
    }
}

impl<S> RepositoryObserver for ChildrenFetchBridge<S>
where
    S: Copy + Send + Sync + 'static,
{
    fn changed(&self) {
        self.fire_if_complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::machine::{StateMachine, TaskContext, Transition};
    use crate::app::scheduler::{Command, Scheduler, SchedulerConfig};
    use crate::domain::TaskId;
    use crate::impls::{FetchMode, InMemoryFolderRepository};
    use std::fmt;
    use std::time::Duration;
    use ulid::Ulid;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Phase {
        Fetch,
        Fetched,
    }

    impl fmt::Display for Phase {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{self:?}")
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("never")]
    struct Never;

    /// Fetches children of `folders` and counts how often it reached `Fetched`.
    struct FetchOnce {
        repo: Arc<InMemoryFolderRepository>,
        folders: Vec<FolderId>,
        fetched: u32,
    }

    impl StateMachine for FetchOnce {
        type State = Phase;
        type Output = u32;
        type Error = Never;
        const NAME: &'static str = "fetch_once";

        fn initialize(&mut self, _ctx: &TaskContext<Phase>) -> Transition<Phase, Never> {
            Transition::Goto(Phase::Fetch)
        }

        fn multiplex(
            &mut self,
            state: Phase,
            ctx: &TaskContext<Phase>,
        ) -> Transition<Phase, Never> {
            match state {
                Phase::Fetch => {
                    ChildrenFetchBridge::spawn(
                        self.repo.clone(),
                        self.folders.clone(),
                        ctx.resumer(),
                        Phase::Fetched,
                    );
                    Transition::Idle(Phase::Fetch)
                }
                Phase::Fetched => {
                    self.fetched += 1;
                    Transition::Finish
                }
            }
        }

        fn on_finish(&mut self) -> u32 {
            self.fetched
        }
    }

    #[tokio::test]
    async fn synchronous_completion_still_resumes() {
        let repo = Arc::new(InMemoryFolderRepository::new());
        let folder = repo.insert_path("A", false);
        let scheduler = Scheduler::start(SchedulerConfig::default());

        let handle = scheduler
            .submit(FetchOnce {
                repo: repo.clone(),
                folders: vec![folder],
                fetched: 0,
            })
            .unwrap();

        assert_eq!(handle.join().await.unwrap(), 1);
        assert_eq!(repo.observer_count(), 0);
        assert_eq!(repo.fetch_request_count(), 1);
    }

    #[tokio::test]
    async fn waits_for_every_tracked_folder() {
        let repo = Arc::new(InMemoryFolderRepository::new().with_fetch_mode(FetchMode::Manual));
        let a = repo.insert_path("A", false);
        let b = repo.insert_path("B", false);
        let scheduler = Scheduler::start(SchedulerConfig::default());

        let handle = scheduler
            .submit(FetchOnce {
                repo: repo.clone(),
                folders: vec![a, b],
                fetched: 0,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(repo.observer_count(), 1);
        assert_eq!(scheduler.counts().await.unwrap().suspended, 1);

        // 関係ない通知では起きない
        repo.notify_observers();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.counts().await.unwrap().suspended, 1);

        repo.complete_pending_fetches();
        assert_eq!(handle.join().await.unwrap(), 1);
        assert_eq!(repo.observer_count(), 0);
    }

    #[test]
    fn fires_at_most_once() {
        let repo = Arc::new(InMemoryFolderRepository::new().with_fetch_mode(FetchMode::Manual));
        let folder = repo.insert_path("A", false);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let ctx = TaskContext::<Phase>::new(TaskId::from_ulid(Ulid::new()), tx);

        ChildrenFetchBridge::spawn(repo.clone(), vec![folder], ctx.resumer(), Phase::Fetched);
        assert!(rx.try_recv().is_err());

        repo.complete_pending_fetches();
        repo.notify_observers();
        repo.notify_observers();

        let mut wakes = 0;
        while let Ok(command) = rx.try_recv() {
            assert!(matches!(command, Command::Wake { .. }));
            wakes += 1;
        }
        assert_eq!(wakes, 1);
        assert_eq!(repo.observer_count(), 0);
    }

    #[tokio::test]
    async fn vanished_folder_counts_as_complete() {
        let repo = Arc::new(InMemoryFolderRepository::new().with_fetch_mode(FetchMode::Manual));
        let folder = repo.insert_path("A", false);
        let scheduler = Scheduler::start(SchedulerConfig::default());
        let task = scheduler
            .submit(FetchOnce {
                repo: repo.clone(),
                folders: vec![folder],
                fetched: 0,
            })
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(repo.delete_folder(folder));
        assert_eq!(task.join().await.unwrap(), 1);
        assert_eq!(repo.observer_count(), 0);
    }
}
