use chrono::{DateTime, Duration, Utc};
use recipe_types::PauseToken;
use serde::{Deserialize, Serialize};

/// A durable pause session: an opaque snapshot plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub token: PauseToken,
    pub recipe: String,
    pub pause_kind: String,
    pub snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        token: PauseToken,
        recipe: impl Into<String>,
        pause_kind: impl Into<String>,
        snapshot: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            token,
            recipe: recipe.into(),
            pause_kind: pause_kind.into(),
            snapshot,
            created_at: now,
            last_accessed_at: now,
        }
    }

    /// Not accessed within `max_age` as of `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.last_accessed_at > max_age
    }
}
