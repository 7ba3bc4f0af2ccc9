//! Impls - 実装（開発用・テスト用）
//!
//! このモジュールには ports の実装を含めます。
//!
//! # 含まれる実装
//! - **InMemoryFolderRepository**: 開発用・テスト用のフォルダリポジトリ

pub mod inmem_repository;

pub use self::inmem_repository::{FetchMode, InMemoryFolderRepository};
