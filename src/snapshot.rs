//! Normalized backup artifact shared by both pipelines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub job_id: Uuid,
    pub source: SnapshotSource,
    pub profile: Option<Profile>,
    #[serde(default)]
    pub posts: Vec<Post>,
    #[serde(default)]
    pub replies: Vec<Post>,
    #[serde(default)]
    pub followers: Vec<Follow>,
    #[serde(default)]
    pub following: Vec<Follow>,
    #[serde(default)]
    pub likes: Vec<Like>,
    #[serde(default)]
    pub direct_messages: Vec<DirectMessage>,
    #[serde(default)]
    pub stats: SnapshotStats,
    /// Media record of the original upload, set on finalize.
    pub archive_media_id: Option<Uuid>,
    /// Recomputed from the media records, never maintained incrementally.
    #[serde(default)]
    pub storage_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(owner_id: Uuid, job_id: Uuid, source: SnapshotSource) -> Self {
        Snapshot {
            id: Uuid::new_v4(),
            owner_id,
            job_id,
            source,
            profile: None,
            posts: vec![],
            replies: vec![],
            followers: vec![],
            following: vec![],
            likes: vec![],
            direct_messages: vec![],
            stats: SnapshotStats::default(),
            archive_media_id: None,
            storage_bytes: 0,
            created_at: Utc::now(),
        }
    }

    /// Recounts every collection into `stats`, keeping the media figures.
    pub fn refresh_counts(&mut self) {
        self.stats.posts = self.posts.len() as u64;
        self.stats.replies = self.replies.len() as u64;
        self.stats.followers = self.followers.len() as u64;
        self.stats.following = self.following.len() as u64;
        self.stats.likes = self.likes.len() as u64;
        self.stats.direct_messages = self.direct_messages.len() as u64;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotSource {
    Archive,
    Scrape,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotSource::Archive => "archive",
            SnapshotSource::Scrape => "scrape",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub account_id: Option<String>,
    pub username: String,
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub website: Option<String>,
    pub location: Option<String>,
    pub avatar_url: Option<String>,
    pub header_url: Option<String>,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub text: String,
    pub created_at: Option<String>,
    pub reply_to: Option<ReplyRef>,
    #[serde(default)]
    pub media: Vec<MediaRef>,
    #[serde(default)]
    pub like_count: u64,
    #[serde(default)]
    pub repost_count: u64,
    pub permalink: Option<String>,
}

impl Post {
    pub fn is_reply(&self) -> bool {
        self.reply_to.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplyRef {
    pub post_id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Follow {
    pub account_id: String,
    pub username: Option<String>,
    pub profile_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Like {
    pub post_id: String,
    pub text: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: Option<String>,
    pub recipient_id: Option<String>,
    pub text: String,
    pub created_at: Option<String>,
    #[serde(default)]
    pub media_urls: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub posts: u64,
    pub replies: u64,
    pub followers: u64,
    pub following: u64,
    pub likes: u64,
    pub direct_messages: u64,
    pub media_files: u64,
    pub media_bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCategory {
    Post,
    DirectMessage,
    Profile,
    /// The original uploaded export.
    Archive,
}

impl MediaCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaCategory::Post => "post",
            MediaCategory::DirectMessage => "direct_message",
            MediaCategory::Profile => "profile",
            MediaCategory::Archive => "archive",
        }
    }
}

impl fmt::Display for MediaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical link to a post when both parts are known.
pub fn permalink(username: Option<&str>, post_id: &str) -> Option<String> {
    let username = username.filter(|u| !u.is_empty())?;
    if post_id.is_empty() {
        return None;
    }
    Some(format!("https://x.com/{username}/status/{post_id}"))
}
