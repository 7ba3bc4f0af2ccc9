//! IdGenerator port - ID 生成の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（本番用）

use crate::domain::ids::{FolderId, Id, IdMarker, ObserverId, TaskId};
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は ID を生成
///
/// # Thread Safety
/// - `Send + Sync` を要求（スケジューラとリポジトリで共有する）
pub trait IdGenerator: Send + Sync {
    fn generate_folder_id(&self) -> FolderId;

    fn generate_task_id(&self) -> TaskId;

    fn generate_observer_id(&self) -> ObserverId;
}

/// UlidGenerator は ULID ベースの ID 生成器
///
/// Clock を使って現在時刻ベースの ULID を生成します。
/// テスト時に FixedClock を使うと timestamp 部分が決定的になります。
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    fn next<T: IdMarker>(&self) -> Id<T> {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        Id::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_folder_id(&self) -> FolderId {
        self.next()
    }

    fn generate_task_id(&self) -> TaskId {
        self.next()
    }

    fn generate_observer_id(&self) -> ObserverId {
        self.next()
    }
}
