//! Typed binding of loosely-structured JSON payloads onto declared records.
//!
//! A record declares the fields it expects as a list of [`Field`]s, each
//! pointing at a slot to fill. [`bind`] walks the list once and reports every
//! field that was absent or could not be converted. Fields bind
//! independently, so a report with failures still leaves every other slot
//! populated. The declaring type decides which failures invalidate it through
//! [`BindReport::into_bound`].

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Conversion from a JSON value into a declared field type.
///
/// Returns `None` when the value has the wrong shape.
pub trait FromJson: Sized {
    fn from_json(value: &Value) -> Option<Self>;
}

impl FromJson for String {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_str().map(ToOwned::to_owned)
    }
}

impl FromJson for bool {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_bool()
    }
}

impl FromJson for i64 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_i64()
    }
}

impl FromJson for u64 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_u64()
    }
}

impl FromJson for u32 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_u64().and_then(|raw| u32::try_from(raw).ok())
    }
}

impl FromJson for f64 {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_f64()
    }
}

impl FromJson for Value {
    fn from_json(value: &Value) -> Option<Self> {
        Some(value.clone())
    }
}

impl FromJson for Map<String, Value> {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_object().cloned()
    }
}

/// A list binds only if every element converts.
impl<T: FromJson> FromJson for Vec<T> {
    fn from_json(value: &Value) -> Option<Self> {
        value.as_array()?.iter().map(T::from_json).collect()
    }
}

/// `null` binds to `None`; any other value must convert to `T`.
impl<T: FromJson> FromJson for Option<T> {
    fn from_json(value: &Value) -> Option<Self> {
        if value.is_null() {
            return Some(None);
        }
        T::from_json(value).map(Some)
    }
}

/// Why a declared field did not bind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum FailureReason {
    /// The payload has no value under this name.
    Missing,
    /// A value is present but has the wrong shape for the declared type.
    Mistyped,
    /// The same name was declared more than once in one binding.
    Duplicate,
}

/// One field that failed to bind. Nested names are dotted (`parent.child`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldFailure {
    pub name: String,
    pub reason: FailureReason,
}

enum Assign {
    Bound,
    Mistyped,
    Nested(Vec<FieldFailure>),
}

/// A declared (name, target) pair consumed by [`bind`].
pub struct Field<'a> {
    name: &'a str,
    assign: Box<dyn FnOnce(&Value) -> Assign + 'a>,
}

impl Field<'_> {
    pub fn name(&self) -> &str {
        self.name
    }
}

/// Declare a field that binds into `slot`.
///
/// The slot keeps its previous value when binding fails.
pub fn field<'a, T: FromJson + 'a>(name: &'a str, slot: &'a mut T) -> Field<'a> {
    Field {
        name,
        assign: Box::new(move |value| match T::from_json(value) {
            Some(bound) => {
                *slot = bound;
                Assign::Bound
            }
            None => Assign::Mistyped,
        }),
    }
}

/// Declare a nested object whose own fields bind through the same contract.
pub fn nested<'a>(name: &'a str, fields: Vec<Field<'a>>) -> Field<'a> {
    Field {
        name,
        assign: Box::new(move |value| {
            if !value.is_object() {
                return Assign::Mistyped;
            }
            let report = bind(value, fields);
            if report.is_clean() {
                Assign::Bound
            } else {
                Assign::Nested(report.failures)
            }
        }),
    }
}

/// Bind `fields` from `payload`, returning every field that failed.
///
/// A payload that is not an object reports every field as missing.
pub fn bind(payload: &Value, fields: Vec<Field<'_>>) -> BindReport {
    let object = payload.as_object();
    let mut seen = HashSet::new();
    let mut failures = Vec::new();

    for Field { name, assign } in fields {
        if !seen.insert(name) {
            failures.push(FieldFailure {
                name: name.to_owned(),
                reason: FailureReason::Duplicate,
            });
            continue;
        }

        let Some(value) = object.and_then(|object| object.get(name)) else {
            failures.push(FieldFailure {
                name: name.to_owned(),
                reason: FailureReason::Missing,
            });
            continue;
        };

        match assign(value) {
            Assign::Bound => {}
            Assign::Mistyped => failures.push(FieldFailure {
                name: name.to_owned(),
                reason: FailureReason::Mistyped,
            }),
            Assign::Nested(inner) => {
                failures.extend(inner.into_iter().map(|failure| FieldFailure {
                    name: format!("{name}.{}", failure.name),
                    reason: failure.reason,
                }));
            }
        }
    }

    if !failures.is_empty() {
        debug!(failed = ?failures, "payload fields failed to bind");
    }

    BindReport { failures }
}

/// Outcome of a [`bind`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindReport {
    failures: Vec<FieldFailure>,
}

impl BindReport {
    /// `true` when every declared field bound.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[FieldFailure] {
        &self.failures
    }

    pub fn failed_names(&self) -> Vec<String> {
        self.failures.iter().map(|f| f.name.clone()).collect()
    }

    /// Whether `name`, or anything nested under it, failed.
    pub fn has_failed(&self, name: &str) -> bool {
        self.failures.iter().any(|failure| covers(name, &failure.name))
    }

    /// Whether `name` failed for the given reason.
    pub fn failed_with(&self, name: &str, reason: FailureReason) -> bool {
        self.failures
            .iter()
            .any(|failure| failure.name == name && failure.reason == reason)
    }

    /// Package a record with its report; valid unless a `required` name failed.
    pub fn into_bound<T>(self, value: T, required: &[&str]) -> Bound<T> {
        let valid = required.iter().all(|name| !self.has_failed(name));
        Bound {
            value,
            failed: self.failed_names(),
            valid,
        }
    }
}

fn covers(declared: &str, failed: &str) -> bool {
    failed == declared
        || failed
            .strip_prefix(declared)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// A typed record together with its binding report.
#[derive(Debug, Clone, PartialEq)]
pub struct Bound<T> {
    pub value: T,
    /// Every field that failed, required or not.
    pub failed: Vec<String>,
    pub valid: bool,
}

impl<T> Bound<T> {
    /// The record when valid, otherwise the failed field names.
    pub fn into_result(self) -> Result<T, Vec<String>> {
        if self.valid {
            Ok(self.value)
        } else {
            Err(self.failed)
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Bound<U> {
        Bound {
            value: f(self.value),
            failed: self.failed,
            valid: self.valid,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Login {
        token: String,
        id: String,
        server: String,
    }

    fn bind_login(payload: &Value) -> Bound<Login> {
        let mut login = Login::default();
        let report = bind(
            payload,
            vec![
                field("access_token", &mut login.token),
                field("user_id", &mut login.id),
                field("home_server", &mut login.server),
            ],
        );
        report.into_bound(login, &["access_token", "user_id", "home_server"])
    }

    #[test]
    fn binds_complete_payload_without_failures() {
        let bound = bind_login(&json!({
            "access_token": "abc",
            "user_id": "@alice:example.org",
            "home_server": "example.org",
        }));

        assert!(bound.valid);
        assert!(bound.failed.is_empty());
        assert_eq!(bound.value.token, "abc");
        assert_eq!(bound.value.id, "@alice:example.org");
        assert_eq!(bound.value.server, "example.org");
    }

    #[test]
    fn reports_exactly_the_missing_required_field() {
        let bound = bind_login(&json!({
            "user_id": "@alice:example.org",
            "home_server": "example.org",
        }));

        assert!(!bound.valid);
        assert_eq!(bound.failed, vec!["access_token".to_owned()]);
        assert_eq!(bound.value.id, "@alice:example.org");
    }

    #[test]
    fn mistyped_field_fails_without_touching_the_slot() {
        let mut count: u64 = 7;
        let mut label = String::new();
        let report = bind(
            &json!({ "count": "seven", "label": "ok" }),
            vec![field("count", &mut count), field("label", &mut label)],
        );

        assert!(report.failed_with("count", FailureReason::Mistyped));
        assert_eq!(report.failed_names(), vec!["count".to_owned()]);
        assert_eq!(count, 7);
        assert_eq!(label, "ok");
    }

    #[test]
    fn optional_field_tolerates_null_but_still_reports_absence() {
        let mut end: Option<String> = Some("stale".to_owned());
        let report = bind(&json!({ "end": null }), vec![field("end", &mut end)]);
        assert!(report.is_clean());
        assert_eq!(end, None);

        let mut start: Option<String> = None;
        let report = bind(&json!({}), vec![field("start", &mut start)]);
        let bound = report.into_bound((), &[]);
        assert!(bound.valid);
        assert_eq!(bound.failed, vec!["start".to_owned()]);
    }

    #[test]
    fn nested_failures_are_reported_with_dotted_names() {
        let mut highlight: u64 = 0;
        let mut notification: u64 = 0;
        let report = bind(
            &json!({ "unread_notifications": { "highlight_count": 2 } }),
            vec![nested(
                "unread_notifications",
                vec![
                    field("highlight_count", &mut highlight),
                    field("notification_count", &mut notification),
                ],
            )],
        );

        assert_eq!(
            report.failed_names(),
            vec!["unread_notifications.notification_count".to_owned()]
        );
        assert!(report.has_failed("unread_notifications"));
        assert!(!report.has_failed("unread"));
        assert_eq!(highlight, 2);
    }

    #[test]
    fn nested_non_object_is_mistyped() {
        let mut inner = String::new();
        let report = bind(
            &json!({ "timeline": [] }),
            vec![nested("timeline", vec![field("prev_batch", &mut inner)])],
        );
        assert!(report.failed_with("timeline", FailureReason::Mistyped));
    }

    #[test]
    fn duplicate_declarations_do_not_alias() {
        let mut first = String::new();
        let mut second = String::new();
        let report = bind(
            &json!({ "body": "hello" }),
            vec![field("body", &mut first), field("body", &mut second)],
        );

        assert!(report.failed_with("body", FailureReason::Duplicate));
        assert_eq!(first, "hello");
        assert!(second.is_empty());
    }

    #[derive(Debug, PartialEq)]
    struct Member {
        user_id: String,
        power: i64,
    }

    impl FromJson for Member {
        fn from_json(value: &Value) -> Option<Self> {
            let mut member = Member {
                user_id: String::new(),
                power: 0,
            };
            bind(
                value,
                vec![
                    field("user_id", &mut member.user_id),
                    field("power", &mut member.power),
                ],
            )
            .into_bound(member, &["user_id", "power"])
            .into_result()
            .ok()
        }
    }

    #[test]
    fn lists_of_records_bind_through_the_same_contract() {
        let mut members: Vec<Member> = Vec::new();
        let report = bind(
            &json!({ "members": [
                { "user_id": "@a:example.org", "power": 100 },
                { "user_id": "@b:example.org", "power": 0 },
            ]}),
            vec![field("members", &mut members)],
        );
        assert!(report.is_clean());
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].power, 100);

        let mut broken: Vec<Member> = Vec::new();
        let report = bind(
            &json!({ "members": [{ "user_id": "@a:example.org" }] }),
            vec![field("members", &mut broken)],
        );
        assert!(report.failed_with("members", FailureReason::Mistyped));
        assert!(broken.is_empty());
    }

    #[test]
    fn non_object_payload_reports_every_field_missing() {
        let bound = bind_login(&json!(["not", "an", "object"]));
        assert!(!bound.valid);
        assert_eq!(bound.failed.len(), 3);
    }
}
