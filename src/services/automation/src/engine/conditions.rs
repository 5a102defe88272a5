//! Condition evaluation against domain events
//!
//! Pure functions, no I/O. Field paths are dot-separated lookups into the
//! event payload (`contact.tags`, `items.0.sku`); a leading `payload.` is
//! accepted and `type` addresses the event type itself.

use crm_shared::{Condition, ConditionGroup, ConditionLogic, ConditionOperator, DomainEvent};
use serde_json::Value;
use std::borrow::Cow;

/// Evaluate a condition group. An empty group is true for both logics.
pub fn evaluate(event: &DomainEvent, group: &ConditionGroup) -> bool {
    if group.conditions.is_empty() {
        return true;
    }

    match group.logic {
        ConditionLogic::And => group
            .conditions
            .iter()
            .all(|condition| evaluate_condition(event, condition)),
        ConditionLogic::Or => group
            .conditions
            .iter()
            .any(|condition| evaluate_condition(event, condition)),
    }
}

/// A condition on an unknown path is false whatever the operator
pub fn evaluate_condition(event: &DomainEvent, condition: &Condition) -> bool {
    let field_value = match resolve_field(event, &condition.field) {
        Some(value) => value,
        None => return false,
    };

    // Binary operators without a value are false
    let expected = condition.value.as_ref();

    match condition.operator {
        ConditionOperator::IsEmpty => is_empty(&field_value),
        ConditionOperator::IsNotEmpty => !is_empty(&field_value),
        ConditionOperator::Equals => expected.map_or(false, |v| values_equal(&field_value, v)),
        ConditionOperator::NotEquals => expected.map_or(false, |v| !values_equal(&field_value, v)),
        ConditionOperator::Contains => expected.map_or(false, |v| contains(&field_value, v)),
        ConditionOperator::GreaterThan => {
            expected.map_or(false, |v| compare_numbers(&field_value, v, |a, b| a > b))
        }
        ConditionOperator::LessThan => {
            expected.map_or(false, |v| compare_numbers(&field_value, v, |a, b| a < b))
        }
    }
}

/// Look up a field on the event. `None` means the path does not exist.
pub fn resolve_field<'a>(event: &'a DomainEvent, field: &str) -> Option<Cow<'a, Value>> {
    let field = field.trim();

    match field {
        "type" | "eventType" | "event_type" => {
            return Some(Cow::Owned(Value::String(event.event_type.clone())))
        }
        "payload" => return Some(Cow::Borrowed(&event.payload)),
        _ => {}
    }

    let path = field.strip_prefix("payload.").unwrap_or(field);
    if path.is_empty() {
        return None;
    }

    let pointer: String = path
        .split('.')
        .map(|segment| format!("/{}", segment.replace('~', "~0").replace('/', "~1")))
        .collect();

    event.payload.pointer(&pointer).map(Cow::Borrowed)
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Loose equality: strings ignore case, numeric strings compare as numbers,
/// "true"/"false" compare as booleans
fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Null, Value::Null) => true,
        (Value::String(a), Value::String(b)) => a.to_lowercase() == b.to_lowercase(),
        (Value::Number(_), Value::Number(_))
        | (Value::Number(_), Value::String(_))
        | (Value::String(_), Value::Number(_)) => match (as_number(left), as_number(right)) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        },
        (Value::Bool(a), Value::Bool(b)) => a == b,
        (Value::Bool(a), Value::String(s)) | (Value::String(s), Value::Bool(a)) => {
            s.trim().eq_ignore_ascii_case(if *a { "true" } else { "false" })
        }
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a
                    .iter()
                    .all(|(key, x)| b.get(key).map_or(false, |y| values_equal(x, y)))
        }
        _ => false,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => match scalar_text(needle) {
            Some(needle) => s.to_lowercase().contains(&needle.to_lowercase()),
            None => false,
        },
        Value::Array(items) => items.iter().any(|item| values_equal(item, needle)),
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => false,
    }
}

fn compare_numbers<F>(left: &Value, right: &Value, comparator: F) -> bool
where
    F: Fn(f64, f64) -> bool,
{
    match (as_number(left), as_number(right)) {
        (Some(a), Some(b)) => comparator(a, b),
        _ => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|n| n.is_finite()),
        _ => None,
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> DomainEvent {
        DomainEvent::new(
            "message.received",
            json!({
                "text": "What is the PRICE of the Pro plan?",
                "contact": {
                    "name": "Ana",
                    "tags": ["vip", "lead"],
                    "score": "42",
                    "optedIn": true,
                    "notes": ""
                },
                "items": [{"sku": "pro-1", "qty": 2}]
            }),
        )
    }

    fn cond(field: &str, operator: ConditionOperator, value: Option<Value>) -> Condition {
        Condition::new(field, operator, value)
    }

    #[test]
    fn test_empty_group_is_true_for_both_logics() {
        let and = ConditionGroup::default();
        let or = ConditionGroup {
            logic: ConditionLogic::Or,
            conditions: vec![],
        };
        assert!(evaluate(&event(), &and));
        assert!(evaluate(&event(), &or));
    }

    #[test]
    fn test_and_or_logic() {
        let hit = cond("contact.name", ConditionOperator::Equals, Some(json!("ana")));
        let miss = cond("contact.name", ConditionOperator::Equals, Some(json!("bob")));

        let and = ConditionGroup {
            logic: ConditionLogic::And,
            conditions: vec![hit.clone(), miss.clone()],
        };
        let or = ConditionGroup {
            logic: ConditionLogic::Or,
            conditions: vec![hit, miss],
        };
        assert!(!evaluate(&event(), &and));
        assert!(evaluate(&event(), &or));
    }

    #[test]
    fn test_path_resolution() {
        let e = event();
        assert_eq!(resolve_field(&e, "type").unwrap().as_ref(), &json!("message.received"));
        assert_eq!(resolve_field(&e, "payload.contact.name").unwrap().as_ref(), &json!("Ana"));
        assert_eq!(resolve_field(&e, "items.0.sku").unwrap().as_ref(), &json!("pro-1"));
        assert!(resolve_field(&e, "contact.email").is_none());
        assert!(resolve_field(&e, "payload.").is_none());
    }

    #[test]
    fn test_unknown_path_is_false_for_every_operator() {
        for operator in [
            ConditionOperator::Equals,
            ConditionOperator::NotEquals,
            ConditionOperator::Contains,
            ConditionOperator::GreaterThan,
            ConditionOperator::LessThan,
            ConditionOperator::IsEmpty,
            ConditionOperator::IsNotEmpty,
        ] {
            assert!(
                !evaluate_condition(&event(), &cond("missing.path", operator, Some(json!("x")))),
                "{:?} on missing path",
                operator
            );
        }
    }

    #[test]
    fn test_equality_coercion() {
        let e = event();
        assert!(evaluate_condition(&e, &cond("contact.score", ConditionOperator::Equals, Some(json!(42)))));
        assert!(evaluate_condition(&e, &cond("contact.optedIn", ConditionOperator::Equals, Some(json!("TRUE")))));
        assert!(evaluate_condition(&e, &cond("contact.tags", ConditionOperator::Equals, Some(json!(["VIP", "lead"])))));
        assert!(evaluate_condition(&e, &cond("contact.name", ConditionOperator::NotEquals, Some(json!("bob")))));
        assert!(!evaluate_condition(&e, &cond("contact.name", ConditionOperator::Equals, Some(json!(1)))));
    }

    #[test]
    fn test_contains() {
        let e = event();
        assert!(evaluate_condition(&e, &cond("text", ConditionOperator::Contains, Some(json!("price")))));
        assert!(evaluate_condition(&e, &cond("contact.tags", ConditionOperator::Contains, Some(json!("VIP")))));
        assert!(evaluate_condition(&e, &cond("contact", ConditionOperator::Contains, Some(json!("tags")))));
        assert!(!evaluate_condition(&e, &cond("contact.tags", ConditionOperator::Contains, Some(json!("churned")))));
    }

    #[test]
    fn test_numeric_comparisons() {
        let e = event();
        assert!(evaluate_condition(&e, &cond("contact.score", ConditionOperator::GreaterThan, Some(json!(40)))));
        assert!(evaluate_condition(&e, &cond("items.0.qty", ConditionOperator::LessThan, Some(json!("3")))));
        assert!(!evaluate_condition(&e, &cond("contact.name", ConditionOperator::GreaterThan, Some(json!(1)))));
    }

    #[test]
    fn test_emptiness() {
        let e = event();
        assert!(evaluate_condition(&e, &cond("contact.notes", ConditionOperator::IsEmpty, None)));
        assert!(evaluate_condition(&e, &cond("contact.tags", ConditionOperator::IsNotEmpty, None)));
        assert!(!evaluate_condition(&e, &cond("contact.name", ConditionOperator::IsEmpty, None)));
    }

    #[test]
    fn test_binary_operator_without_value_is_false() {
        assert!(!evaluate_condition(&event(), &cond("contact.name", ConditionOperator::Equals, None)));
        assert!(!evaluate_condition(&event(), &cond("contact.name", ConditionOperator::NotEquals, None)));
    }
}
