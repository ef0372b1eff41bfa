use std::{fmt, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};

/// An image as supplied by the operator or a contact row.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageRef {
    Path(PathBuf),
    Blob(Arc<[u8]>),
}

impl ImageRef {
    pub fn path(p: impl Into<PathBuf>) -> Self {
        Self::Path(p.into())
    }

    pub fn blob(bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self::Blob(Arc::from(bytes))
    }

    /// A blob is always usable; a path only when it names an existing file.
    pub fn is_usable(&self) -> bool {
        match self {
            ImageRef::Path(p) => p.is_file(),
            ImageRef::Blob(b) => !b.is_empty(),
        }
    }
}

impl fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRef::Path(p) => f.debug_tuple("Path").field(p).finish(),
            ImageRef::Blob(b) => write!(f, "Blob({} bytes)", b.len()),
        }
    }
}

/// One deliverable contact. Immutable once produced by the contact source.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContactRecord {
    /// Digits only, never empty.
    pub phone: String,
    pub message: Option<String>,
    pub image: Option<ImageRef>,
}

/// Provider-side handle for an already uploaded file.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AssetHandle(pub String);

/// What actually gets attached to a send.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AssetRef {
    Local(ImageRef),
    Uploaded(AssetHandle),
}

/// Provider user resolved from a phone number.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUser {
    pub id: i64,
    #[serde(default)]
    pub access_hash: Option<i64>,
}

/// Result of a contact-import call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedContacts {
    #[serde(default)]
    pub users: Vec<PeerUser>,
}

/// An entry of the account's own address book.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteContact {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl RemoteContact {
    pub fn display_name(&self) -> String {
        let name = format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or(""),
            self.last_name.as_deref().unwrap_or("")
        );
        let name = name.trim();
        if name.is_empty() {
            "No name".to_string()
        } else {
            name.to_string()
        }
    }
}

/// Opaque resumable session string.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionToken(pub String);

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionToken({} chars)", self.0.len())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Success,
    Skipped,
    Error,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "SUCCESS",
            DeliveryStatus::Skipped => "SKIPPED",
            DeliveryStatus::Error => "ERROR",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub contact: ContactRecord,
    pub status: DeliveryStatus,
    pub detail: Option<String>,
}
