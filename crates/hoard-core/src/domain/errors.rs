//! Errors - EnsureFolder の abort 理由と分類
//!
//! # 分類
//! - Unresolvable: フォルダを特定・作成するための情報が足りない（名前なし、親なし）
//! - Vanished: 子フォルダ取得を待っている間にフォルダが消えた
//! - ContractViolation: リポジトリが作成時に ID を返さなかった（リポジトリ側のバグ）
//!
//! どの abort でも作成済みフォルダのロールバックはしない。

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::FolderId;

/// AbortKind は abort 理由の運用分類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortKind {
    Unresolvable,
    Vanished,
    ContractViolation,
}

/// Reasons an ensure-folder task aborts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnsureFolderError {
    /// The target id is unknown or missing and no name was given to search by.
    #[error("cannot resolve folder {target:?}: no name to search or create by")]
    MissingName { target: Option<FolderId> },

    /// The parent folder to search in does not exist.
    #[error("cannot resolve folder {name:?}: parent {parent} does not exist")]
    MissingParent { parent: FolderId, name: String },

    /// The folder was deleted while its children were being fetched.
    #[error("folder {folder} vanished while fetching its children")]
    Vanished { folder: FolderId },

    /// The repository did not hand out an id for a freshly created folder.
    #[error("repository returned no id creating {name:?} under {parent}")]
    IdAllocationFailed { parent: FolderId, name: String },
}

impl EnsureFolderError {
    pub fn kind(&self) -> AbortKind {
        match self {
            EnsureFolderError::MissingName { .. } | EnsureFolderError::MissingParent { .. } => {
                AbortKind::Unresolvable
            }
            EnsureFolderError::Vanished { .. } => AbortKind::Vanished,
            EnsureFolderError::IdAllocationFailed { .. } => AbortKind::ContractViolation,
        }
    }
}
