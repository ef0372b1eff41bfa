use async_trait::async_trait;

use crate::{
    domain::{
        AssetHandle, AssetRef, DeliveryOutcome, ImageRef, ImportedContacts, PeerUser,
        RemoteContact, SessionToken,
    },
    Result,
};

/// Hexagonal port for the chat-protocol client.
///
/// Implementations own their transport-level retries; errors that reach the core are
/// final for that call. Throttles must surface as `Error::RateLimited` or as a
/// `Error::Provider` carrying a `FLOOD_WAIT` marker.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn check_authorized(&self) -> Result<bool>;

    /// Run the interactive sign-in, pulling each credential from `prompts` when needed.
    async fn login(&self, prompts: &dyn LoginPrompts) -> Result<SessionToken>;

    /// Serialize the current authorized session.
    async fn export_session(&self) -> Result<SessionToken>;

    async fn import_contact(&self, phone: &str, correlation_id: i64) -> Result<ImportedContacts>;

    async fn send_message(&self, user: &PeerUser, text: &str) -> Result<()>;

    async fn send_file_with_caption(
        &self,
        user: &PeerUser,
        asset: &AssetRef,
        caption: &str,
    ) -> Result<()>;

    async fn upload_asset(&self, image: &ImageRef) -> Result<AssetHandle>;

    /// The account's own address book.
    async fn list_contacts(&self) -> Result<Vec<RemoteContact>>;
}

/// The three credential callbacks handed to `ProtocolClient::login`.
#[async_trait]
pub trait LoginPrompts: Send + Sync {
    async fn phone_number(&self) -> Result<String>;
    async fn phone_code(&self) -> Result<String>;
    async fn password(&self) -> Result<String>;

    /// Client-side challenge failure (bad code, bad password). The client may prompt again.
    fn on_error(&self, err: &crate::Error);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InputKind {
    Phone,
    Code,
    Password,
}

impl InputKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputKind::Phone => "phone",
            InputKind::Code => "code",
            InputKind::Password => "password",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "phone" => Some(InputKind::Phone),
            "code" => Some(InputKind::Code),
            "password" => Some(InputKind::Password),
            _ => None,
        }
    }
}

/// Where credential answers come from: a console prompt or an out-of-band submitter.
#[async_trait]
pub trait InputProvider: Send + Sync {
    async fn request(&self, kind: InputKind) -> Result<String>;
}

/// Per-contact outcome consumer (persistence, UI).
///
/// Awaited inside the dispatch loop before the next send, so a failing sink is visible
/// to the loop.
#[async_trait]
pub trait OutcomeSink: Send + Sync {
    async fn record(&self, outcome: &DeliveryOutcome) -> Result<()>;
}

/// Discards outcomes.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

#[async_trait]
impl OutcomeSink for NullSink {
    async fn record(&self, _outcome: &DeliveryOutcome) -> Result<()> {
        Ok(())
    }
}
