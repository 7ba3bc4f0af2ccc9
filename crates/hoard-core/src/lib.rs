//! hoard-core
//!
//! Core building blocks for Hoard: a cooperative task scheduler and the
//! ensure-folder task that runs on it against an asynchronously populated
//! folder repository.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, folder, state, errors）
//! - **ports**: 抽象化レイヤー（FolderRepository, IdGenerator, Clock）
//! - **app**: アプリケーションロジック（StateMachine, Scheduler, ChildrenFetchBridge, EnsureFolder）
//! - **impls**: 実装（InMemoryFolderRepository など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;
