//! Condition evaluator — resolves condition-step predicates against
//! subscriber state and engagement facts. Pure lookups, no side effects;
//! the interpreter calls this both for the main check and for every retry
//! re-check.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use funnel_core::collaborators::EngagementSource;
use funnel_core::subscriber::SubscriberProfile;

/// Predicate kinds a `condition` step can branch on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConditionPredicate {
    EmailOpened { message_id: Uuid },
    EmailClicked { message_id: Uuid },
    LinkClicked { url: String },
    TagExists { tag: String },
    FieldValue {
        field: String,
        operator: FieldOperator,
        value: serde_json::Value,
    },
    TaskCompleted { task_id: Uuid },
}

/// Comparison operators for `field_value` predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldOperator {
    Equals,
    NotEquals,
    Contains,
    Empty,
    NotEmpty,
}

/// Evaluate a predicate for one subscriber within one funnel.
pub fn evaluate(
    predicate: &ConditionPredicate,
    subscriber: &SubscriberProfile,
    funnel_id: Uuid,
    engagement: &dyn EngagementSource,
) -> bool {
    match predicate {
        ConditionPredicate::EmailOpened { message_id } => {
            engagement.email_opened(subscriber.id, *message_id)
        }
        ConditionPredicate::EmailClicked { message_id } => {
            engagement.email_clicked(subscriber.id, *message_id)
        }
        ConditionPredicate::LinkClicked { url } => engagement.link_clicked(subscriber.id, url),
        ConditionPredicate::TagExists { tag } => subscriber.has_tag(tag),
        ConditionPredicate::FieldValue {
            field,
            operator,
            value,
        } => compare_field(subscriber.field(field), *operator, value),
        ConditionPredicate::TaskCompleted { task_id } => {
            engagement.task_completed(funnel_id, subscriber.id, *task_id)
        }
    }
}

fn compare_field(
    actual: Option<&serde_json::Value>,
    operator: FieldOperator,
    expected: &serde_json::Value,
) -> bool {
    match operator {
        FieldOperator::Equals => actual.map_or(false, |a| a == expected),
        FieldOperator::NotEquals => actual.map_or(true, |a| a != expected),
        FieldOperator::Contains => actual
            .and_then(|a| a.as_str())
            .zip(expected.as_str())
            .map_or(false, |(a, e)| a.contains(e)),
        FieldOperator::Empty => actual.map_or(true, is_empty_value),
        FieldOperator::NotEmpty => actual.map_or(false, |a| !is_empty_value(a)),
    }
}

fn is_empty_value(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}
