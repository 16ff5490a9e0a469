//! Record is the auditing/event payloads flowing through the
//! pipeline.
//!
//! Audit records arrive with capitalized field names (`Verb`,
//! `ObjectRef`, ...) — the upstream audit webhook marshals the
//! internal audit type — and conditions reference the same spelling,
//! so the serde names here are load-bearing. Cluster events wrap the
//! usual core/v1 Event.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1 as corev1;

use crate::prelude::*;
use crate::rules::EventType;

/// AuditEvent is the audit entry proper: the part of an auditing
/// record the rule conditions are evaluated against.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuditEvent {
    /// Unique audit ID, generated for each request.
    #[serde(default, rename = "AuditID", skip_serializing_if = "String::is_empty")]
    pub audit_id: String,
    /// AuditLevel at which the event was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// Stage of the request handling when this event was generated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// RequestURI as sent by the client.
    #[serde(default, rename = "RequestURI", skip_serializing_if = "Option::is_none")]
    pub request_uri: Option<String>,
    /// Verb associated with the request.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub verb: String,
    /// Authenticated user information.
    #[serde(default)]
    pub user: UserRef,
    /// Impersonated user information, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impersonated_user: Option<Value>,
    /// Source IPs from where the request originated.
    #[serde(default, rename = "SourceIPs", skip_serializing_if = "Option::is_none")]
    pub source_ips: Option<Vec<String>>,
    /// UserAgent reported by the client.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    /// Object this request is targeted at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_ref: Option<ObjectRef>,
    /// Response status, populated even when the response object is
    /// not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<Value>,
    /// API object from the request, in JSON format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_object: Option<Value>,
    /// API object returned in the response, in JSON format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_object: Option<Value>,
    /// Time the request reached the apiserver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_received_timestamp: Option<DateTime<Utc>>,
    /// Time the request reached the current audit stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timestamp: Option<DateTime<Utc>>,
}

/// UserRef is the authentication info of an audit record.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct UserRef {
    /// The name that uniquely identifies this user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// A unique value that identifies this user across time.
    #[serde(default, rename = "UID", skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// The names of groups this user is a part of.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

/// ObjectRef names the API object an audit record is about.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ObjectRef {
    /// Resource kind, lowercase plural.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource: String,
    /// Namespace of the object.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Name of the object.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// UID of the object.
    #[serde(default, rename = "UID", skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// API group of the object.
    #[serde(default, rename = "APIGroup", skip_serializing_if = "String::is_empty")]
    pub api_group: String,
    /// API version of the object.
    #[serde(default, rename = "APIVersion", skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    /// Subresource, if any.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subresource: String,
}

/// Auditing is an audit entry as it flows through the pipeline: the
/// event itself plus the labels ingress attaches and the fields the
/// matcher writes when a rule fires.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Auditing {
    /// The audit entry.
    #[serde(flatten)]
    pub event: AuditEvent,
    /// Devops project the entry happened in.
    #[serde(default, rename = "Devops", skip_serializing_if = "String::is_empty")]
    pub devops: String,
    /// Workspace the entry happened in; best-effort populated by
    /// ingress from the namespace labels.
    #[serde(default, rename = "Workspace", skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    /// The alert message; empty until a rule fires.
    #[serde(default, rename = "Message", skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The alert annotations; empty until a rule fires.
    #[serde(default, rename = "Annotations", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Name of the rule that fired.
    #[serde(skip)]
    pub matched_rule: String,
}

/// KubeEvent is a cluster event as it flows through the pipeline.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct KubeEvent {
    /// The cluster event.
    #[serde(default, rename = "Event", alias = "event")]
    pub event: corev1::Event,
    /// Workspace label, unused for events today but kept on the wire.
    #[serde(default, rename = "Workspace", skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    /// The alert message; empty until a rule fires.
    #[serde(default, rename = "Message", skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// The alert annotations; empty until a rule fires.
    #[serde(default, rename = "Annotations", skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Name of the rule that fired.
    #[serde(skip)]
    pub matched_rule: String,
}

/// Record is the kind-tagged unit of work the single worker pool
/// multiplexes on.
#[derive(Clone, Debug)]
pub enum Record {
    /// An audit entry.
    Auditing(Box<Auditing>),
    /// A cluster event.
    Event(Box<KubeEvent>),
}

impl Record {
    /// Kind reports which pipeline the record belongs to.
    pub fn kind(&self) -> EventType {
        match self {
            Record::Auditing(_) => EventType::Auditing,
            Record::Event(_) => EventType::Events,
        }
    }

    /// Id is the record's identity for logs: the audit ID or the
    /// event UID.
    pub fn id(&self) -> String {
        match self {
            Record::Auditing(a) => a.event.audit_id.clone(),
            Record::Event(e) => e.event.metadata.uid.clone().unwrap_or_default(),
        }
    }

    /// Message is the alert message written by the matcher; empty
    /// when no rule fired.
    pub fn message(&self) -> &str {
        match self {
            Record::Auditing(a) => &a.message,
            Record::Event(e) => &e.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn audit_record_wire_names() {
        let a: Auditing = serde_json::from_value(json!({
            "AuditID": "a-1",
            "Verb": "DELETE",
            "User": {"Username": "alice", "Groups": ["admins"]},
            "ObjectRef": {"Resource": "pods", "Namespace": "ns", "Name": "p1"},
            "SourceIPs": ["10.0.0.1"],
            "RequestReceivedTimestamp": "2024-05-01T10:30:00.000000Z",
        }))
        .expect("decodes");
        assert_eq!(a.event.audit_id, "a-1");
        assert_eq!(a.event.verb, "DELETE");
        assert_eq!(a.event.user.username, "alice");
        let oref = a.event.object_ref.as_ref().expect("object ref");
        assert_eq!(oref.resource, "pods");
        assert_eq!(oref.namespace, "ns");

        // The same spelling must come back out: conditions match on it.
        let v = serde_json::to_value(&a.event).expect("encodes");
        assert_eq!(v["Verb"], json!("DELETE"));
        assert_eq!(v["ObjectRef"]["Resource"], json!("pods"));
        assert_eq!(v["User"]["Username"], json!("alice"));
        assert_eq!(v["SourceIPs"], json!(["10.0.0.1"]));
    }

    #[test]
    fn event_record_accepts_both_field_spellings() {
        for key in ["Event", "event"] {
            let e: KubeEvent = serde_json::from_value(json!({
                key: {
                    "metadata": {"name": "ev-1", "namespace": "ns", "uid": "u-1"},
                    "involvedObject": {"name": "pod-1:c1"},
                    "reason": "Failed",
                    "message": "back-off restarting container",
                },
            }))
            .expect("decodes");
            assert_eq!(e.event.reason.as_deref(), Some("Failed"));
            assert_eq!(
                Record::Event(Box::new(e)).id(),
                "u-1".to_string(),
            );
        }
    }
}
