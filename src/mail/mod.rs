//! Mail capability seam — transport trait and wire types.
//!
//! The provider protocol client (auth, HTTP, paging) is an external
//! collaborator; the core talks to it through [`MailTransport`] and
//! layers rate limiting, idempotency, and delta-sync strategy on top
//! (see [`messages`] and [`fetcher`]).

pub mod fetcher;
pub mod folders;
pub mod messages;

pub use fetcher::{FetchResult, MailFetcher};
pub use folders::FolderCache;
pub use messages::{MessageOps, SentItemsCache};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MailApiError;

/// Fixed field projection requested for triage messages.
pub const MESSAGE_FIELDS: &str = "id,conversationId,conversationIndex,subject,from,\
     receivedDateTime,bodyPreview,parentFolderId,categories,webLink,flag,isRead,importance";

/// Sender address and display name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailAddress {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// A message as projected by the transport. The body is never fetched;
/// `body_preview` carries the collaborator-cleaned snippet.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub conversation_index: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub from: Option<EmailAddress>,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub body_preview: Option<String>,
    #[serde(default)]
    pub parent_folder_id: Option<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub web_link: Option<String>,
    #[serde(default)]
    pub flag_status: Option<String>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub importance: Option<String>,
    /// Entity tag for optimistic-concurrency writes, when the transport
    /// supplies one.
    #[serde(default)]
    pub etag: Option<String>,
}

/// Query options for a folder listing.
#[derive(Debug, Clone, Default)]
pub struct ListQuery {
    pub select: Option<String>,
    pub filter: Option<String>,
    pub order_by: Option<String>,
    /// Items per page (transport clamps to its own maximum).
    pub top: u32,
    /// Maximum total items; `None` fetches all pages.
    pub max_items: Option<u32>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self {
            top: 50,
            ..Self::default()
        }
    }
}

/// One delta response: changed messages plus the next cursor.
#[derive(Debug, Clone)]
pub struct DeltaPage {
    pub messages: Vec<RawMessage>,
    pub new_cursor: String,
}

/// Raw transport operations implemented by the host over the provider
/// protocol. Paging happens inside the transport; retries of transient
/// HTTP failures are the transport's responsibility.
#[async_trait]
pub trait MailTransport: Send + Sync {
    /// List messages from a folder, honoring the query's paging bounds.
    async fn list_messages(
        &self,
        folder: &str,
        query: &ListQuery,
    ) -> Result<Vec<RawMessage>, MailApiError>;

    /// Incremental sync for a folder. `cursor = None` performs an
    /// initial sync. Raises [`MailApiError::DeltaTokenExpired`] when
    /// the server rejects the cursor (HTTP 410).
    async fn get_delta_messages(
        &self,
        folder_id: &str,
        cursor: Option<&str>,
    ) -> Result<DeltaPage, MailApiError>;

    async fn get_message(
        &self,
        message_id: &str,
        select: Option<&str>,
    ) -> Result<RawMessage, MailApiError>;

    /// Unconditional move. Idempotency lives in the ops layer above.
    async fn move_message(
        &self,
        message_id: &str,
        destination_folder_id: &str,
    ) -> Result<RawMessage, MailApiError>;

    /// Replace or merge-write the category set. When `if_match` is
    /// given, the transport must fail with [`MailApiError::Conflict`]
    /// on a 412.
    async fn patch_categories(
        &self,
        message_id: &str,
        categories: &[String],
        if_match: Option<&str>,
    ) -> Result<RawMessage, MailApiError>;

    async fn get_thread_messages(
        &self,
        conversation_id: &str,
        max_messages: u32,
        select: Option<&str>,
    ) -> Result<Vec<RawMessage>, MailApiError>;

    /// Resolve a folder path to its id, if it exists.
    async fn get_folder_id(&self, path: &str) -> Result<Option<String>, MailApiError>;

    /// Create a folder (and any missing ancestors); returns its id.
    async fn create_folder(&self, path: &str) -> Result<String, MailApiError>;
}

impl RawMessage {
    pub fn sender_address(&self) -> Option<&str> {
        self.from.as_ref().map(|f| f.address.as_str())
    }

    pub fn sender_name(&self) -> Option<&str> {
        self.from.as_ref().and_then(|f| f.name.as_deref())
    }
}
