//! Ports - 抽象化レイヤー
//!
//! このモジュールは Hexagonal Architecture の「ポート」を定義します。
//! タスクはリポジトリの実装を知らず、`FolderRepository` だけに依存します。

pub mod clock;
pub mod id_generator;
pub mod repository;

// 主要な trait を再エクスポート
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::repository::{FolderRepository, ReadyFlag, ReadySignal, RepositoryObserver};
