use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlogCategory {
    Technology,
    Lifestyle,
    Romance,
    Travel,
    Food,
    Health,
    Business,
    Education,
    Entertainment,
    Sports,
    #[default]
    General,
}

impl BlogCategory {
    pub const ALL: [BlogCategory; 11] = [
        BlogCategory::Technology,
        BlogCategory::Lifestyle,
        BlogCategory::Romance,
        BlogCategory::Travel,
        BlogCategory::Food,
        BlogCategory::Health,
        BlogCategory::Business,
        BlogCategory::Education,
        BlogCategory::Entertainment,
        BlogCategory::Sports,
        BlogCategory::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BlogCategory::Technology => "TECHNOLOGY",
            BlogCategory::Lifestyle => "LIFESTYLE",
            BlogCategory::Romance => "ROMANCE",
            BlogCategory::Travel => "TRAVEL",
            BlogCategory::Food => "FOOD",
            BlogCategory::Health => "HEALTH",
            BlogCategory::Business => "BUSINESS",
            BlogCategory::Education => "EDUCATION",
            BlogCategory::Entertainment => "ENTERTAINMENT",
            BlogCategory::Sports => "SPORTS",
            BlogCategory::General => "GENERAL",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BlogCategory::Technology => "Technology",
            BlogCategory::Lifestyle => "Lifestyle",
            BlogCategory::Romance => "Romance",
            BlogCategory::Travel => "Travel",
            BlogCategory::Food => "Food",
            BlogCategory::Health => "Health",
            BlogCategory::Business => "Business",
            BlogCategory::Education => "Education",
            BlogCategory::Entertainment => "Entertainment",
            BlogCategory::Sports => "Sports",
            BlogCategory::General => "General",
        }
    }

    /// Unknown names fall back to `General`.
    pub fn from_name(value: &str) -> Self {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str() == value)
            .unwrap_or_default()
    }
}

impl fmt::Display for BlogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl<'de> Deserialize<'de> for BlogCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?;
        Ok(raw.map(|s| BlogCategory::from_name(&s)).unwrap_or_default())
    }
}

/// Profile document of a user. Also embedded, as a copy taken at write time,
/// in posts (`author`); later profile edits do not reach those copies.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub uid: String,
    pub name: String,
    pub email: String,
    pub bio: String,
    pub profile_image_url: String,
    pub social_links: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl UserProfile {
    /// Fresh profile with every optional field empty.
    pub fn new(uid: &str, name: &str, email: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            email: email.to_string(),
            created_at: Some(Utc::now()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub author: Option<UserProfile>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub liked_by: BTreeSet<String>,
    #[serde(default)]
    pub category: BlogCategory,
}

impl Post {
    pub fn new(
        title: &str,
        content: &str,
        category: BlogCategory,
        author: UserProfile,
        image_url: Option<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: String::new(),
            title: title.to_string(),
            content: content.to_string(),
            author: Some(author),
            created_at,
            image_url,
            liked_by: BTreeSet::new(),
            category,
        }
    }

    pub fn like_count(&self) -> usize {
        self.liked_by.len()
    }

    pub fn is_liked_by(&self, user_id: &str) -> bool {
        self.liked_by.contains(user_id)
    }

    pub fn author_id(&self) -> Option<&str> {
        self.author
            .as_ref()
            .map(|a| a.uid.as_str())
            .filter(|uid| !uid.is_empty())
    }

    /// Copy of this post with `user_id` added to or removed from the likers.
    pub fn with_like(&self, user_id: &str, liked: bool) -> Post {
        let mut next = self.clone();
        if liked {
            next.liked_by.insert(user_id.to_string());
        } else {
            next.liked_by.remove(user_id);
        }
        next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationType {
    #[default]
    Like,
    Comment,
    Follow,
    Mention,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Like => "like",
            NotificationType::Comment => "comment",
            NotificationType::Follow => "follow",
            NotificationType::Mention => "mention",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Notification {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub recipient_user_id: String,
    pub actor_user_id: String,
    pub actor_name: String,
    pub actor_profile_image: Option<String>,
    pub post_id: String,
    pub post_title: String,
    pub message: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Default for Notification {
    fn default() -> Self {
        Self {
            id: String::new(),
            kind: NotificationType::Like,
            recipient_user_id: String::new(),
            actor_user_id: String::new(),
            actor_name: String::new(),
            actor_profile_image: None,
            post_id: String::new(),
            post_title: String::new(),
            message: String::new(),
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

impl Notification {
    /// Like notification addressed to the post's author.
    pub fn like(
        recipient_user_id: &str,
        actor_user_id: &str,
        actor_name: &str,
        actor_profile_image: Option<String>,
        post_id: &str,
        post_title: &str,
    ) -> Self {
        Self {
            kind: NotificationType::Like,
            recipient_user_id: recipient_user_id.to_string(),
            actor_user_id: actor_user_id.to_string(),
            actor_name: actor_name.to_string(),
            actor_profile_image,
            post_id: post_id.to_string(),
            post_title: post_title.to_string(),
            message: format!("{} liked your post \"{}\"", actor_name, post_title),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_category_decodes_as_general() {
        let post: Post = serde_json::from_value(json!({
            "title": "t",
            "category": "GARDENING",
        }))
        .unwrap();
        assert_eq!(post.category, BlogCategory::General);

        let post: Post = serde_json::from_value(json!({ "category": "TECHNOLOGY" })).unwrap();
        assert_eq!(post.category, BlogCategory::Technology);
        assert_eq!(post.category.display_name(), "Technology");
    }

    #[test]
    fn liked_by_stays_unique() {
        let post: Post = serde_json::from_value(json!({
            "likedBy": ["u1", "u2", "u1"],
        }))
        .unwrap();
        assert_eq!(post.like_count(), 2);

        let liked = post.with_like("u2", true);
        assert_eq!(liked.like_count(), 2);
        let unliked = liked.with_like("u2", false);
        assert!(!unliked.is_liked_by("u2"));
        assert!(unliked.is_liked_by("u1"));
    }

    #[test]
    fn post_without_id_serializes_without_id_field() {
        let author = UserProfile::new("u1", "Ann", "ann@example.com");
        let post = Post::new("Hello", "World", BlogCategory::Technology, author, None, Utc::now());
        let value = serde_json::to_value(&post).unwrap();
        assert!(value.get("id").is_none());
        assert_eq!(value["author"]["uid"], "u1");
        assert_eq!(value["category"], "TECHNOLOGY");
        assert_eq!(value["likedBy"], json!([]));
    }

    #[test]
    fn like_notification_message() {
        let n = Notification::like("bob", "ann", "Ann", None, "p1", "Rust tips");
        assert_eq!(n.message, "Ann liked your post \"Rust tips\"");
        assert!(!n.is_read);
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "LIKE");
        assert_eq!(value["recipientUserId"], "bob");
    }

    #[test]
    fn notification_with_bad_type_is_rejected() {
        let res: Result<Notification, _> = serde_json::from_value(json!({ "type": "POKE" }));
        assert!(res.is_err());
    }
}
