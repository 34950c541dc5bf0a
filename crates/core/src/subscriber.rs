use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A subscriber as the funnel engine sees one: identity, list and tag
/// membership, and free-form custom fields. Profile CRUD lives outside
/// the engine; this is the read model handed to the interpreter and
/// condition evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriberProfile {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub lists: HashSet<Uuid>,
    #[serde(default)]
    pub fields: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SubscriberProfile {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            first_name: None,
            last_name: None,
            tags: HashSet::new(),
            lists: HashSet::new(),
            fields: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }

    pub fn field(&self, name: &str) -> Option<&serde_json::Value> {
        self.fields.get(name)
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn with_list(mut self, list_id: Uuid) -> Self {
        self.lists.insert(list_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_helpers() {
        let list_id = Uuid::new_v4();
        let profile = SubscriberProfile::new("ada@example.com")
            .with_tag("vip")
            .with_field("plan", serde_json::json!("pro"))
            .with_list(list_id);

        assert!(profile.has_tag("vip"));
        assert!(!profile.has_tag("churned"));
        assert_eq!(profile.field("plan"), Some(&serde_json::json!("pro")));
        assert!(profile.lists.contains(&list_id));
    }
}
