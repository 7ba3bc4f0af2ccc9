//! Domain model (IDs, folders, states, errors).

pub mod errors;
pub mod folder;
pub mod ids;
pub mod state;

pub use errors::{AbortKind, EnsureFolderError};
pub use folder::Folder;
pub use ids::{FolderId, ObserverId, TaskId};
pub use state::{EnsureFolderState, TaskPhase};
