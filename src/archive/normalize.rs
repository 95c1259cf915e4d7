//! Raw export records to normalized artifact records.
//!
//! Each category gets its own raw shape; anything the artifact does not
//! keep is dropped here. Records without their mandatory id are dropped and
//! counted.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::categories::ExportCategory;
use crate::snapshot::{
    permalink, DirectMessage, Follow, Like, MediaRef, Post, Profile, ReplyRef,
};

/// One raw record, tagged by the category file it came from.
#[derive(Debug)]
pub enum RawRecord {
    Account(RawAccount),
    Profile(RawProfile),
    Post(RawPost),
    Follower(RawFollow),
    Following(RawFollow),
    Like(RawLike),
    Conversation(RawConversation),
}

impl RawRecord {
    /// Interprets one extracted JSON value, accepting both the wrapped
    /// (`{"tweet": {...}}`) and the bare form.
    pub fn parse(category: ExportCategory, value: Value) -> Option<RawRecord> {
        let (wrapper, build): (&str, fn(Value) -> Option<RawRecord>) = match category {
            ExportCategory::Account => ("account", |v| from_value(v).map(RawRecord::Account)),
            ExportCategory::Profile => ("profile", |v| from_value(v).map(RawRecord::Profile)),
            ExportCategory::Posts => ("tweet", |v| from_value(v).map(RawRecord::Post)),
            ExportCategory::Followers => ("follower", |v| from_value(v).map(RawRecord::Follower)),
            ExportCategory::Following => ("following", |v| from_value(v).map(RawRecord::Following)),
            ExportCategory::Likes => ("like", |v| from_value(v).map(RawRecord::Like)),
            ExportCategory::DirectMessages => {
                ("dmConversation", |v| from_value(v).map(RawRecord::Conversation))
            }
        };
        build(unwrap(value, wrapper))
    }
}

fn unwrap(value: Value, key: &str) -> Value {
    match value {
        Value::Object(mut map) if map.len() == 1 && map.contains_key(key) => {
            map.remove(key).unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn from_value<T: for<'de> Deserialize<'de>>(value: Value) -> Option<T> {
    serde_json::from_value(value).ok()
}

/// Ids and counters show up both as strings and as numbers.
fn text(value: &Option<Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn count(value: &Option<Value>) -> u64 {
    text(value).and_then(|s| s.parse().ok()).unwrap_or(0)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawAccount {
    account_id: Option<Value>,
    username: Option<String>,
    account_display_name: Option<String>,
    created_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawProfile {
    description: RawDescription,
    avatar_media_url: Option<String>,
    header_media_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDescription {
    bio: Option<String>,
    website: Option<String>,
    location: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RawPost {
    id_str: Option<Value>,
    id: Option<Value>,
    full_text: Option<String>,
    text: Option<String>,
    created_at: Option<String>,
    in_reply_to_status_id_str: Option<Value>,
    in_reply_to_status_id: Option<Value>,
    in_reply_to_user_id_str: Option<Value>,
    in_reply_to_screen_name: Option<String>,
    favorite_count: Option<Value>,
    retweet_count: Option<Value>,
    entities: RawEntities,
    extended_entities: RawEntities,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEntities {
    media: Vec<RawMedia>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMedia {
    media_url_https: Option<String>,
    media_url: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawFollow {
    account_id: Option<Value>,
    user_link: Option<String>,
    screen_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawLike {
    tweet_id: Option<Value>,
    full_text: Option<String>,
    expanded_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawConversation {
    conversation_id: Option<Value>,
    messages: Vec<RawMessageEvent>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMessageEvent {
    message_create: Option<RawMessage>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawMessage {
    id: Option<Value>,
    sender_id: Option<Value>,
    recipient_id: Option<Value>,
    text: Option<String>,
    created_at: Option<String>,
    media_urls: Vec<String>,
}

/// Everything normalized out of one export.
#[derive(Debug, Default)]
pub struct ParsedExport {
    pub profile: Option<Profile>,
    pub posts: Vec<Post>,
    pub replies: Vec<Post>,
    pub followers: Vec<Follow>,
    pub following: Vec<Follow>,
    pub likes: Vec<Like>,
    pub direct_messages: Vec<DirectMessage>,
    pub dropped: u64,
}

impl ParsedExport {
    pub fn counts(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("posts".to_string(), self.posts.len() as u64),
            ("replies".to_string(), self.replies.len() as u64),
            ("followers".to_string(), self.followers.len() as u64),
            ("following".to_string(), self.following.len() as u64),
            ("likes".to_string(), self.likes.len() as u64),
            ("direct_messages".to_string(), self.direct_messages.len() as u64),
            ("dropped".to_string(), self.dropped),
        ])
    }

    /// Maps direct-message ids to their conversation.
    pub fn conversation_of_message(&self) -> BTreeMap<&str, &str> {
        self.direct_messages
            .iter()
            .map(|m| (m.id.as_str(), m.conversation_id.as_str()))
            .collect()
    }
}

/// Normalizes the raw values of every category, account first.
pub fn normalize(raw: BTreeMap<ExportCategory, Vec<Value>>) -> ParsedExport {
    let mut parsed = ParsedExport::default();
    let mut records = Vec::new();
    for (category, values) in raw {
        for value in values {
            match RawRecord::parse(category, value) {
                Some(record) => records.push(record),
                None => parsed.dropped += 1,
            }
        }
    }

    // The username is needed for permalinks, so accounts go first.
    records.sort_by_key(|r| !matches!(r, RawRecord::Account(_)));
    for record in records {
        absorb(&mut parsed, record);
    }
    parsed
}

fn absorb(parsed: &mut ParsedExport, record: RawRecord) {
    match record {
        RawRecord::Account(account) => {
            let Some(username) = account.username.filter(|u| !u.is_empty()) else {
                parsed.dropped += 1;
                return;
            };
            let profile = parsed.profile.get_or_insert_with(Profile::default);
            profile.username = username;
            profile.account_id = text(&account.account_id);
            profile.display_name = account.account_display_name;
            profile.created_at = account.created_at;
        }
        RawRecord::Profile(raw) => {
            let profile = parsed.profile.get_or_insert_with(Profile::default);
            profile.bio = raw.description.bio.filter(|s| !s.is_empty());
            profile.website = raw.description.website.filter(|s| !s.is_empty());
            profile.location = raw.description.location.filter(|s| !s.is_empty());
            profile.avatar_url = raw.avatar_media_url;
            profile.header_url = raw.header_media_url;
        }
        RawRecord::Post(raw) => {
            let username = parsed.profile.as_ref().map(|p| p.username.as_str());
            match normalize_post(raw, username) {
                Some(post) if post.is_reply() => parsed.replies.push(post),
                Some(post) => parsed.posts.push(post),
                None => parsed.dropped += 1,
            }
        }
        RawRecord::Follower(raw) => match normalize_follow(raw) {
            Some(follow) => parsed.followers.push(follow),
            None => parsed.dropped += 1,
        },
        RawRecord::Following(raw) => match normalize_follow(raw) {
            Some(follow) => parsed.following.push(follow),
            None => parsed.dropped += 1,
        },
        RawRecord::Like(raw) => match text(&raw.tweet_id) {
            Some(post_id) => parsed.likes.push(Like {
                post_id,
                text: raw.full_text,
                url: raw.expanded_url,
            }),
            None => parsed.dropped += 1,
        },
        RawRecord::Conversation(raw) => {
            let Some(conversation_id) = text(&raw.conversation_id) else {
                parsed.dropped += 1;
                return;
            };
            for event in raw.messages {
                let Some(message) = event.message_create else {
                    continue;
                };
                let Some(id) = text(&message.id) else {
                    parsed.dropped += 1;
                    continue;
                };
                parsed.direct_messages.push(DirectMessage {
                    id,
                    conversation_id: conversation_id.clone(),
                    sender_id: text(&message.sender_id),
                    recipient_id: text(&message.recipient_id),
                    text: message.text.unwrap_or_default(),
                    created_at: message.created_at,
                    media_urls: message.media_urls,
                });
            }
        }
    }
}

fn normalize_post(raw: RawPost, username: Option<&str>) -> Option<Post> {
    let id = text(&raw.id_str).or_else(|| text(&raw.id))?;
    let reply_to = text(&raw.in_reply_to_status_id_str)
        .or_else(|| text(&raw.in_reply_to_status_id))
        .map(|post_id| ReplyRef {
            post_id,
            user_id: text(&raw.in_reply_to_user_id_str),
            username: raw.in_reply_to_screen_name.clone(),
        });
    let media_source = if raw.extended_entities.media.is_empty() {
        raw.entities.media
    } else {
        raw.extended_entities.media
    };
    let media = media_source
        .into_iter()
        .filter_map(|m| {
            m.media_url_https.or(m.media_url).map(|url| MediaRef { url, kind: m.kind })
        })
        .collect();
    Some(Post {
        permalink: permalink(username, &id),
        text: raw.full_text.or(raw.text).unwrap_or_default(),
        created_at: raw.created_at,
        reply_to,
        media,
        like_count: count(&raw.favorite_count),
        repost_count: count(&raw.retweet_count),
        id,
    })
}

fn normalize_follow(raw: RawFollow) -> Option<Follow> {
    let account_id = text(&raw.account_id)?;
    Some(Follow {
        account_id,
        username: raw.screen_name,
        profile_url: raw.user_link,
    })
}
