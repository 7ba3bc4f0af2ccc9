//! InMemoryFolderRepository - 開発用・テスト用のフォルダリポジトリ
//!
//! # 学習ポイント
//! - `Arc<Mutex<State>>` で状態を共有し、ロックはメソッド内で完結させる
//! - オブザーバー呼び出しはロックの外で行う（コールバック中の再入で deadlock しない）
//! - 子フォルダ取得の完了タイミングを `FetchMode` で切り替えられる
//!
//! 並行アクター（フォルダを消す・作る別の誰か）は `delete_folder` / `insert_folder`
//! で再現します。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{Folder, FolderId, ObserverId};
use crate::ports::{
    FolderRepository, IdGenerator, ReadyFlag, ReadySignal, RepositoryObserver, SystemClock,
    UlidGenerator,
};

/// FetchMode は `request_children_fetch` がいつ完了するか
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchMode {
    /// Complete and notify observers before `request_children_fetch` returns.
    #[default]
    Immediate,
    /// Keep requests pending until `complete_pending_fetches` is called.
    Manual,
    /// Complete on a tokio task after the given delay.
    Delayed(Duration),
}

struct FolderRecord {
    folder: Folder,
    /// Direct children in insertion order (the enumeration order).
    children: Vec<FolderId>,
    children_known: bool,
}

struct RepositoryState {
    folders: HashMap<FolderId, FolderRecord>,
    observers: Vec<(ObserverId, Arc<dyn RepositoryObserver>)>,
    pending_fetches: Vec<FolderId>,
    fail_next_create: bool,
    notify_count: usize,
    fetch_requests: usize,
}

impl RepositoryState {
    fn insert(&mut self, folder: Folder, children_known: bool) {
        if let Some(parent) = folder.parent
            && let Some(record) = self.folders.get_mut(&parent)
        {
            record.children.push(folder.id);
        }
        self.folders.insert(
            folder.id,
            FolderRecord {
                folder,
                children: Vec::new(),
                children_known,
            },
        );
    }

    fn remove_tree(&mut self, id: FolderId) -> bool {
        let Some(record) = self.folders.remove(&id) else {
            return false;
        };
        if let Some(parent) = record.folder.parent
            && let Some(parent_record) = self.folders.get_mut(&parent)
        {
            parent_record.children.retain(|child| *child != id);
        }
        for child in record.children {
            self.remove_tree(child);
        }
        true
    }

    fn mark_fetched(&mut self, ids: &[FolderId]) {
        for id in ids {
            if let Some(record) = self.folders.get_mut(id) {
                record.children_known = true;
            }
        }
    }
}

/// In-memory implementation of [`FolderRepository`].
pub struct InMemoryFolderRepository {
    state: Arc<Mutex<RepositoryState>>,
    root: FolderId,
    ready: ReadyFlag,
    ids: Arc<dyn IdGenerator>,
    fetch_mode: FetchMode,
}

impl InMemoryFolderRepository {
    /// A ready repository holding only the root folder.
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        let root = ids.generate_folder_id();
        let mut state = RepositoryState {
            folders: HashMap::new(),
            observers: Vec::new(),
            pending_fetches: Vec::new(),
            fail_next_create: false,
            notify_count: 0,
            fetch_requests: 0,
        };
        state.insert(Folder::new(root, None, "My Inventory"), true);
        Self {
            state: Arc::new(Mutex::new(state)),
            root,
            ready: ReadyFlag::new(true),
            ids,
            fetch_mode: FetchMode::default(),
        }
    }

    pub fn with_fetch_mode(mut self, fetch_mode: FetchMode) -> Self {
        self.fetch_mode = fetch_mode;
        self
    }

    /// Start out unusable; call [`mark_ready`](Self::mark_ready) later.
    pub fn not_ready(mut self) -> Self {
        self.ready = ReadyFlag::new(false);
        self
    }

    pub fn mark_ready(&self) -> bool {
        let changed = self.ready.mark_ready();
        if changed {
            debug!("repository is ready");
        }
        changed
    }

    fn lock(&self) -> MutexGuard<'_, RepositoryState> {
        lock_state(&self.state)
    }

    /// Insert a folder as an outside actor would (no notification).
    ///
    /// Returns `None` if `parent` does not exist.
    pub fn insert_folder(
        &self,
        parent: FolderId,
        name: impl Into<String>,
        children_known: bool,
    ) -> Option<FolderId> {
        let mut state = self.lock();
        if !state.folders.contains_key(&parent) {
            return None;
        }
        let id = self.ids.generate_folder_id();
        state.insert(Folder::new(id, Some(parent), name), children_known);
        Some(id)
    }

    /// Insert every missing segment of a `/`-separated path below the root.
    ///
    /// Existing segments are reused (first match by name).
    pub fn insert_path(&self, path: &str, children_known: bool) -> FolderId {
        let mut current = self.root;
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            let existing = self
                .direct_children(current)
                .into_iter()
                .find(|folder| folder.has_name(segment))
                .map(|folder| folder.id);
            current = match existing {
                Some(id) => id,
                None => match self.insert_folder(current, segment, children_known) {
                    Some(id) => id,
                    None => break,
                },
            };
        }
        current
    }

    /// Delete a folder and everything below it, as a concurrent actor would.
    ///
    /// Observers are told about the change.
    pub fn delete_folder(&self, id: FolderId) -> bool {
        let removed = {
            let mut state = self.lock();
            let deletable = state
                .folders
                .get(&id)
                .is_some_and(|record| !record.folder.is_root());
            deletable && state.remove_tree(id)
        };
        if removed {
            notify_all(&self.state);
        }
        removed
    }

    /// Make the next `create_folder` call return `None`.
    pub fn fail_next_create(&self) {
        self.lock().fail_next_create = true;
    }

    /// Complete every pending fetch (`FetchMode::Manual`) and notify observers.
    pub fn complete_pending_fetches(&self) -> usize {
        let completed = {
            let mut state = self.lock();
            let pending = std::mem::take(&mut state.pending_fetches);
            state.mark_fetched(&pending);
            pending.len()
        };
        notify_all(&self.state);
        completed
    }

    pub fn pending_fetches(&self) -> Vec<FolderId> {
        self.lock().pending_fetches.clone()
    }

    /// How many times `notify_observers` has been called through the port.
    pub fn notify_count(&self) -> usize {
        self.lock().notify_count
    }

    pub fn fetch_request_count(&self) -> usize {
        self.lock().fetch_requests
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub fn folder_count(&self) -> usize {
        self.lock().folders.len()
    }
}

impl Default for InMemoryFolderRepository {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_state(state: &Mutex<RepositoryState>) -> MutexGuard<'_, RepositoryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call every observer outside the lock.
fn notify_all(state: &Mutex<RepositoryState>) {
    let observers: Vec<Arc<dyn RepositoryObserver>> = lock_state(state)
        .observers
        .iter()
        .map(|(_, observer)| Arc::clone(observer))
        .collect();
    for observer in observers {
        observer.changed();
    }
}

impl FolderRepository for InMemoryFolderRepository {
    fn root_id(&self) -> FolderId {
        self.root
    }

    fn is_ready(&self) -> bool {
        self.ready.is_ready()
    }

    fn ready_signal(&self) -> ReadySignal {
        self.ready.signal()
    }

    fn folder(&self, id: FolderId) -> Option<Folder> {
        self.lock()
            .folders
            .get(&id)
            .map(|record| record.folder.clone())
    }

    fn direct_children(&self, parent: FolderId) -> Vec<Folder> {
        let state = self.lock();
        let Some(record) = state.folders.get(&parent) else {
            return Vec::new();
        };
        record
            .children
            .iter()
            .filter_map(|child| state.folders.get(child))
            .map(|child| child.folder.clone())
            .collect()
    }

    fn create_folder(&self, parent: FolderId, name: &str) -> Option<FolderId> {
        let mut state = self.lock();
        if std::mem::take(&mut state.fail_next_create) {
            warn!(%parent, name, "refusing to allocate a folder id (injected failure)");
            return None;
        }
        if !state.folders.contains_key(&parent) {
            return None;
        }
        let id = self.ids.generate_folder_id();
        // 作ったばかりのフォルダは空なので子一覧は既知
        state.insert(Folder::new(id, Some(parent), name), true);
        Some(id)
    }

    fn request_children_fetch(&self, ids: &[FolderId]) {
        {
            let mut state = self.lock();
            state.fetch_requests += 1;
            if self.fetch_mode != FetchMode::Immediate {
                state.pending_fetches.extend_from_slice(ids);
            }
        }
        match self.fetch_mode {
            FetchMode::Immediate => {
                lock_state(&self.state).mark_fetched(ids);
                notify_all(&self.state);
            }
            FetchMode::Manual => {}
            FetchMode::Delayed(delay) => {
                let state = Arc::clone(&self.state);
                let ids = ids.to_vec();
                let complete = move || {
                    {
                        let mut state = lock_state(&state);
                        state.pending_fetches.retain(|id| !ids.contains(id));
                        state.mark_fetched(&ids);
                    }
                    notify_all(&state);
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(async move {
                            tokio::time::sleep(delay).await;
                            complete();
                        });
                    }
                    Err(_) => {
                        warn!("no tokio runtime for delayed fetch; completing immediately");
                        complete();
                    }
                }
            }
        }
    }

    fn add_observer(&self, observer: Arc<dyn RepositoryObserver>) -> ObserverId {
        let id = self.ids.generate_observer_id();
        self.lock().observers.push((id, observer));
        id
    }

    fn remove_observer(&self, id: ObserverId) -> bool {
        let mut state = self.lock();
        let before = state.observers.len();
        state.observers.retain(|(observer_id, _)| *observer_id != id);
        state.observers.len() != before
    }

    fn are_children_fully_known(&self, id: FolderId) -> bool {
        self.lock()
            .folders
            .get(&id)
            .is_some_and(|record| record.children_known)
    }

    fn is_everything_fetched(&self) -> bool {
        self.lock()
            .folders
            .values()
            .all(|record| record.children_known)
    }

    fn notify_observers(&self) {
        self.lock().notify_count += 1;
        notify_all(&self.state);
    }
}
