//! Folder model: a named node in the hierarchical repository.

use serde::{Deserialize, Serialize};

use super::FolderId;

/// A folder as seen by the repository port.
///
/// `parent` is `None` only for the root folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Folder {
    pub id: FolderId,
    pub parent: Option<FolderId>,
    pub name: String,
}

impl Folder {
    pub fn new(id: FolderId, parent: Option<FolderId>, name: impl Into<String>) -> Self {
        Self {
            id,
            parent,
            name: name.into(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Exact, case-sensitive name comparison used for resolution.
    pub fn has_name(&self, name: &str) -> bool {
        self.name == name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn name_match_is_case_sensitive() {
        let folder = Folder::new(FolderId::from_ulid(Ulid::new()), None, "Textures");
        assert!(folder.has_name("Textures"));
        assert!(!folder.has_name("textures"));
        assert!(!folder.has_name("Textures "));
        assert!(folder.is_root());
    }
}
