//! Matcher walks the rule-store snapshot for one record and selects
//! the winning rule.
//!
//! The two pipelines compare severities differently, faithful to the
//! upstream behavior: auditing only lets a strictly higher severity
//! overwrite an earlier hit, while events let a later rule of the
//! same severity overwrite. [`SeverityPolicy`] keeps the choice in
//! one place.

use crate::flatten::flatten_value;
use crate::prelude::*;
use crate::record::{Auditing, KubeEvent, Record};
use crate::rules::{EventType, Expr, Rule, RuleStore, Severity};

/// SeverityPolicy decides when a candidate rule may overwrite the
/// current winner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeverityPolicy {
    /// Only a strictly higher severity wins (auditing).
    Strict,
    /// An equal severity also wins, so a later rule can overwrite an
    /// earlier one (events).
    OrEqual,
}

impl SeverityPolicy {
    fn allows(self, candidate: Severity, winning: Severity) -> bool {
        match self {
            SeverityPolicy::Strict => candidate > winning,
            SeverityPolicy::OrEqual => candidate >= winning,
        }
    }
}

/// Process matches one record against the store, writing the alert
/// fields into it when a rule fires. Returns whether it fired.
pub fn process(record: &mut Record, store: &RuleStore) -> bool {
    match record {
        Record::Auditing(a) => match_auditing(a, store),
        Record::Event(e) => match_event(e, store),
    }
}

/// Match_auditing evaluates the auditing rules against an audit
/// entry.
pub fn match_auditing(a: &mut Auditing, store: &RuleStore) -> bool {
    let body = match serde_json::to_value(&a.event) {
        Ok(v) => v,
        Err(err) => {
            error!(id = %a.event.audit_id, %err, "unable to flatten audit entry");
            return false;
        }
    };
    let flat = flatten_value(&body);

    let mut winning = Severity::Unknown;
    for rule in candidates(store, EventType::Auditing) {
        if !SeverityPolicy::Strict.allows(rule.severity, winning) {
            continue;
        }
        if evaluate(rule, store, &flat) {
            let (message, annotations) = rule.auditing_alert(a, &flat, store);
            a.message = message;
            a.annotations = annotations;
            a.matched_rule = rule.name.clone();
            winning = rule.severity;
        }
    }
    !a.message.is_empty()
}

/// Match_event evaluates the events rules against a cluster event.
pub fn match_event(e: &mut KubeEvent, store: &RuleStore) -> bool {
    let body = match serde_json::to_value(&e.event) {
        Ok(v) => v,
        Err(err) => {
            error!(%err, "unable to flatten event");
            return false;
        }
    };
    let flat = flatten_value(&body);

    let mut winning = Severity::Unknown;
    for rule in candidates(store, EventType::Events) {
        if !SeverityPolicy::OrEqual.allows(rule.severity, winning) {
            continue;
        }
        if evaluate(rule, store, &flat) {
            let (message, annotations) = rule.event_alert(e, &flat, store);
            e.message = message;
            e.annotations = annotations;
            e.matched_rule = rule.name.clone();
            winning = rule.severity;
        }
    }
    !e.message.is_empty()
}

fn candidates(store: &RuleStore, kind: EventType) -> impl Iterator<Item = &Rule> {
    store.iter().filter(move |r| {
        r.enable && r.event_type == Some(kind) && matches!(r.expr, Expr::Rule { .. })
    })
}

fn evaluate(rule: &Rule, store: &RuleStore, flat: &Map<String, Value>) -> bool {
    let cond = match store.resolve_condition(rule) {
        Ok(cond) => cond,
        Err(err) => {
            error!(rule = %rule.qualified_name(), %err, "skipping rule");
            return false;
        }
    };
    match rule_dsl::evaluate(flat, &cond) {
        Ok(matched) => matched,
        Err(err) => {
            error!(rule = %rule.qualified_name(), %err, "evaluation error, skipping rule");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::v1alpha1::{AlertsSpec, ClusterRuleGroup, ClusterRuleGroupSpec, ExprSpec, RuleSpec};
    use k8s_openapi::api::core::v1 as corev1;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use crate::record::{AuditEvent, ObjectRef, UserRef};

    fn rule(name: &str, condition: &str, severity: &str, message: &str) -> RuleSpec {
        RuleSpec {
            name: name.into(),
            enable: true,
            expr: ExprSpec {
                kind: "rule".into(),
                condition: condition.into(),
                ..Default::default()
            },
            alerts: AlertsSpec {
                severity: severity.into(),
                message: message.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn store(kind: &str, rules: Vec<RuleSpec>) -> RuleStore {
        RuleStore::load([Arc::new(ClusterRuleGroup::new(
            "g1",
            ClusterRuleGroupSpec {
                group_type: kind.into(),
                rules,
            },
        ))])
    }

    fn delete_pod() -> Auditing {
        Auditing {
            event: AuditEvent {
                audit_id: "a-1".into(),
                // Ingress lowercases verbs before matching.
                verb: "delete".into(),
                user: UserRef {
                    username: "alice".into(),
                    ..Default::default()
                },
                object_ref: Some(ObjectRef {
                    resource: "pods".into(),
                    namespace: "ns".into(),
                    name: "p1".into(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn fires_with_the_default_message() {
        let store = store(
            "auditing",
            vec![
                RuleSpec {
                    name: "rs".into(),
                    expr: ExprSpec {
                        kind: "list".into(),
                        list: vec!["pods".into(), "secrets".into()],
                        ..Default::default()
                    },
                    ..Default::default()
                },
                rule(
                    "r1",
                    r#"Verb = "delete" and ObjectRef.Resource in ${g1.rs}"#,
                    "WARNING",
                    "",
                ),
            ],
        );
        let mut a = delete_pod();
        assert!(match_auditing(&mut a, &store));
        assert_eq!(a.message, "alice delete pods 'p1' in Namespace ns");
        assert_eq!(a.matched_rule, "r1");
    }

    #[test]
    fn highest_severity_wins() {
        let rules = vec![
            rule("info", r#"Verb = "delete""#, "INFO", "info fired"),
            rule("error", r#"Verb = "delete""#, "ERROR", "error fired"),
        ];

        let mut a = delete_pod();
        assert!(match_auditing(&mut a, &store("auditing", rules.clone())));
        assert_eq!(a.message, "error fired");
        assert_eq!(a.matched_rule, "error");

        // Same outcome on the events side.
        let store = store(
            "events",
            vec![
                rule("info", r#"reason = "Failed""#, "INFO", "info fired"),
                rule("error", r#"reason = "Failed""#, "ERROR", "error fired"),
            ],
        );
        let mut e = failed_event();
        assert!(match_event(&mut e, &store));
        assert_eq!(e.message, "error fired");
    }

    fn failed_event() -> KubeEvent {
        KubeEvent {
            event: corev1::Event {
                metadata: ObjectMeta {
                    name: Some("ev-1".into()),
                    namespace: Some("ns".into()),
                    uid: Some("u-1".into()),
                    ..Default::default()
                },
                involved_object: corev1::ObjectReference {
                    name: Some("pod-1".into()),
                    ..Default::default()
                },
                reason: Some("Failed".into()),
                message: Some("back-off restarting container".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn equal_severity_overwrites_for_events_but_not_auditing() {
        // Two WARNING rules that both match; iteration is in key
        // order, so `a_rule` runs before `b_rule`.
        let mk = |cond: &str| {
            vec![
                rule("a_rule", cond, "WARNING", "first"),
                rule("b_rule", cond, "WARNING", "second"),
            ]
        };

        let mut a = delete_pod();
        assert!(match_auditing(&mut a, &store("auditing", mk(r#"Verb = "delete""#))));
        // Strict comparison: the first WARNING hit sticks.
        assert_eq!(a.message, "first");

        let mut e = failed_event();
        assert!(match_event(&mut e, &store("events", mk(r#"reason = "Failed""#))));
        // Or-equal comparison: the later WARNING hit overwrites.
        assert_eq!(e.message, "second");
    }

    #[test]
    fn disabled_and_foreign_rules_do_not_fire() {
        let mut disabled = rule("off", r#"Verb = "delete""#, "ERROR", "nope");
        disabled.enable = false;
        let s = store("auditing", vec![disabled]);
        let mut a = delete_pod();
        assert!(!match_auditing(&mut a, &s));
        assert!(a.message.is_empty());

        // An events-typed rule never sees auditing records.
        let s = store("events", vec![rule("ev", r#"Verb = "delete""#, "ERROR", "nope")]);
        let mut a = delete_pod();
        assert!(!match_auditing(&mut a, &s));
        assert!(a.message.is_empty());
    }

    #[test]
    fn unmatched_event_does_not_fire() {
        let s = store(
            "events",
            vec![rule("ev", r#"reason = "Killing""#, "ERROR", "killed")],
        );
        let mut e = failed_event();
        assert!(!match_event(&mut e, &s));
        assert!(e.message.is_empty());
        assert!(e.matched_rule.is_empty());
    }

    #[test]
    fn events_default_message_is_the_event_message() {
        let s = store(
            "events",
            vec![rule("ev", r#"reason = "Failed""#, "WARNING", "")],
        );
        let mut e = failed_event();
        assert!(match_event(&mut e, &s));
        assert_eq!(e.message, "back-off restarting container");
    }
}
