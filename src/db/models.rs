//! Domain entities. Field names follow the semantic attributes described
//! in the data model; row mapping lives alongside each repo module,
//! `db::repos::<area>::<entity>` / `row_to_X` convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Video,
    Podcast,
    Newsletter,
    WebFeed,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Video => "video",
            Provider::Podcast => "podcast",
            Provider::Newsletter => "newsletter",
            Provider::WebFeed => "web_feed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "video" => Some(Provider::Video),
            "podcast" => Some(Provider::Podcast),
            "newsletter" => Some(Provider::Newsletter),
            "web_feed" => Some(Provider::WebFeed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Active,
    Expired,
    Disconnected,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "ACTIVE",
            ConnectionStatus::Expired => "EXPIRED",
            ConnectionStatus::Disconnected => "DISCONNECTED",
        }
    }
    pub fn from_str(s: &str) -> Self {
        match s {
            "EXPIRED" => ConnectionStatus::Expired,
            "DISCONNECTED" => ConnectionStatus::Disconnected,
            _ => ConnectionStatus::Active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubscriptionStatus {
    Active,
    Disconnected,
    /// Web-feed-only: >=10 consecutive fetch errors. Not in the
    /// spec's base {ACTIVE, DISCONNECTED} pair; added so the web-feed
    /// adapter's documented "status = ERROR" transition has somewhere to
    /// land. Excluded from due-selection exactly like DISCONNECTED.
    Error,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::Disconnected => "DISCONNECTED",
            SubscriptionStatus::Error => "ERROR",
        }
    }
    pub fn from_str(s: &str) -> Self {
        match s {
            "DISCONNECTED" => SubscriptionStatus::Disconnected,
            "ERROR" => SubscriptionStatus::Error,
            _ => SubscriptionStatus::Active,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserItemState {
    Inbox,
    Archived,
}

impl UserItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserItemState::Inbox => "INBOX",
            UserItemState::Archived => "ARCHIVED",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderConnection {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub encrypted_access_token: String,
    pub access_token_nonce: String,
    pub encrypted_refresh_token: String,
    pub refresh_token_nonce: String,
    pub expires_at: DateTime<Utc>,
    pub status: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Subscription {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub provider_channel_id: String,
    pub display_name: String,
    pub poll_interval_seconds: i64,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub last_published_at: Option<DateTime<Utc>>,
    pub total_items: Option<i64>,
    pub status: String,
    pub error_count: i64,
    pub last_error: Option<String>,
    /// Web-feed conditional-GET cache; unused by other providers.
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Item {
    pub id: String,
    pub provider: String,
    pub provider_id: String,
    pub content_type: String,
    pub canonical_url: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub duration_seconds: Option<i64>,
    pub thumbnail_url: Option<String>,
    pub raw_metadata: Option<String>,
    pub creator_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserItem {
    pub id: String,
    pub user_id: String,
    pub item_id: String,
    pub state: String,
    pub ingested_at: DateTime<Utc>,
    pub progress_seconds: Option<i64>,
    /// Which subscription brought this item in. Nullable because the spec's
    /// canonical Item carries no subscription reference (it's deduplicated
    /// across users and channels); admin watermark repair needs a way
    /// back from "the items a subscription has produced" and this is it.
    pub subscription_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Creator {
    pub id: String,
    pub provider: String,
    pub provider_creator_id: String,
    pub display_name: String,
    pub normalized_name: String,
    pub handle: Option<String>,
    pub image_url: Option<String>,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NewsletterFeed {
    pub id: String,
    pub user_id: String,
    pub canonical_key: String,
    pub detection_score: f64,
    pub status: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mailbox {
    pub id: String,
    pub user_id: String,
    pub provider: String,
    pub history_cursor: Option<String>,
}

/// A raw item as produced by a provider's listing/detail fetch, carrying
/// everything `transform` needs plus identifiers the pipeline needs to key on.
#[derive(Debug, Clone)]
pub struct RawItem {
    pub provider_id: String,
    pub provider_creator_id: Option<String>,
    pub creator_display_name: Option<String>,
    pub canonical: CanonicalItem,
}

#[derive(Debug, Clone)]
pub struct CanonicalItem {
    pub content_type: String,
    pub canonical_url: String,
    pub title: String,
    pub summary: Option<String>,
    pub published_at: DateTime<Utc>,
    pub duration_seconds: Option<i64>,
    pub thumbnail_url: Option<String>,
    pub raw_metadata: Option<String>,
}
