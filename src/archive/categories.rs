//! Which archive entries hold which export category.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use glob::Pattern;
use regex::Regex;

use super::reader::EntryInfo;

static PART_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"part(\d+)").expect("valid part regex"));

/// Ordered so that account data is always read before anything that links
/// back to the account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExportCategory {
    Account,
    Profile,
    Posts,
    Followers,
    Following,
    Likes,
    DirectMessages,
}

impl ExportCategory {
    pub const ALL: [ExportCategory; 7] = [
        ExportCategory::Account,
        ExportCategory::Profile,
        ExportCategory::Posts,
        ExportCategory::Followers,
        ExportCategory::Following,
        ExportCategory::Likes,
        ExportCategory::DirectMessages,
    ];

    fn file_patterns(&self) -> &'static [&'static str] {
        match self {
            ExportCategory::Account => &["account.js", "account-part*.js"],
            ExportCategory::Profile => &["profile.js", "profile-part*.js"],
            ExportCategory::Posts => &["tweets.js", "tweet.js", "tweets-part*.js", "tweet-part*.js"],
            ExportCategory::Followers => &["follower.js", "follower-part*.js"],
            ExportCategory::Following => &["following.js", "following-part*.js"],
            ExportCategory::Likes => &["like.js", "like-part*.js"],
            ExportCategory::DirectMessages => &[
                "direct-messages.js",
                "direct-message.js",
                "direct-messages-part*.js",
                "direct-message-part*.js",
                "direct-messages-group.js",
                "direct-message-group.js",
                "direct-messages-group-part*.js",
                "direct-message-group-part*.js",
            ],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportCategory::Account => "account",
            ExportCategory::Profile => "profile",
            ExportCategory::Posts => "posts",
            ExportCategory::Followers => "followers",
            ExportCategory::Following => "following",
            ExportCategory::Likes => "likes",
            ExportCategory::DirectMessages => "direct_messages",
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.file_patterns()
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|p| p.matches(file_name))
    }

    pub fn of(entry: &EntryInfo) -> Option<ExportCategory> {
        if entry.is_dir {
            return None;
        }
        let name = entry.file_name();
        ExportCategory::ALL.into_iter().find(|c| c.matches(name))
    }
}

impl fmt::Display for ExportCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn part_number(file_name: &str) -> u32 {
    PART_NUMBER
        .captures(file_name)
        .and_then(|c| c[1].parse().ok())
        .unwrap_or(0)
}

/// Groups metadata entries by category, each group sorted by part number
/// and then by name.
pub fn locate(entries: &[EntryInfo]) -> BTreeMap<ExportCategory, Vec<EntryInfo>> {
    let mut located: BTreeMap<ExportCategory, Vec<EntryInfo>> = BTreeMap::new();
    for entry in entries {
        if let Some(category) = ExportCategory::of(entry) {
            located.entry(category).or_default().push(entry.clone());
        }
    }
    for files in located.values_mut() {
        files.sort_by(|a, b| {
            part_number(a.file_name())
                .cmp(&part_number(b.file_name()))
                .then_with(|| a.name.cmp(&b.name))
        });
    }
    located
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, name: &str) -> EntryInfo {
        EntryInfo {
            index,
            name: name.into(),
            size: 1,
            is_dir: name.ends_with('/'),
        }
    }

    #[test]
    fn matches_known_file_names() {
        assert_eq!(ExportCategory::of(&entry(0, "data/tweets.js")), Some(ExportCategory::Posts));
        assert_eq!(ExportCategory::of(&entry(0, "data/tweet-part3.js")), Some(ExportCategory::Posts));
        assert_eq!(ExportCategory::of(&entry(0, "data/following.js")), Some(ExportCategory::Following));
        assert_eq!(ExportCategory::of(&entry(0, "data/follower.js")), Some(ExportCategory::Followers));
        assert_eq!(
            ExportCategory::of(&entry(0, "data/direct-messages-group.js")),
            Some(ExportCategory::DirectMessages)
        );
        assert_eq!(ExportCategory::of(&entry(0, "data/ad-impressions.js")), None);
        assert_eq!(ExportCategory::of(&entry(0, "data/tweets_media/1-a.jpg")), None);
    }

    #[test]
    fn parts_are_ordered_numerically_then_by_name() {
        let located = locate(&[
            entry(0, "data/tweets-part10.js"),
            entry(1, "data/tweets-part2.js"),
            entry(2, "data/tweets.js"),
            entry(3, "data/tweet.js"),
            entry(4, "data/account.js"),
        ]);

        let posts: Vec<&str> = located[&ExportCategory::Posts]
            .iter()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(
            posts,
            ["data/tweet.js", "data/tweets.js", "data/tweets-part2.js", "data/tweets-part10.js"]
        );
        assert_eq!(located.keys().next(), Some(&ExportCategory::Account));
    }
}
