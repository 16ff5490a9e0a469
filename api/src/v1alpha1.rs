//! Module `v1alpha1` implements the v1alpha1 rules API.
use k8s_openapi::ByteString;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// VERSION is the kubernetes API group's version.
pub static VERSION: &str = "v1alpha1";

/// ClusterRuleGroupSpec describes a named bundle of rules sharing an
/// event type.
#[derive(Clone, CustomResource, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[kube(
    group = "logging.kubesphere.io",
    version = "v1alpha1",
    kind = "ClusterRuleGroup",
    shortname = "crg",
    derive = "Default",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRuleGroupSpec {
    /// Type of the records this group applies to: auditing, events or
    /// logging.
    #[serde(default, rename = "type")]
    pub group_type: String,
    /// Rules in this group.
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

/// RuleSpec is a single rule, macro, list or alias.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    /// Rule name, unique within its group.
    #[serde(default)]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desc: String,
    /// Expression of the rule.
    #[serde(default)]
    pub expr: ExprSpec,
    /// Alert output, meaningful for kind `rule` only.
    #[serde(default)]
    pub alerts: AlertsSpec,
    /// Whether the rule is evaluated at all.
    #[serde(default)]
    pub enable: bool,
}

/// ExprSpec is the wire form of a rule expression. Exactly one of
/// `condition`, `macro`, `alias` or `list` is meaningful, selected by
/// `kind`.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExprSpec {
    /// Expression kind: rule, macro, list or alias.
    #[serde(default)]
    pub kind: String,
    /// Condition, for kind `rule`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub condition: String,
    /// Macro text, for kind `macro`.
    #[serde(default, rename = "macro", skip_serializing_if = "String::is_empty")]
    pub macro_text: String,
    /// Alias target field, for kind `alias`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
    /// List elements, for kind `list`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,
}

/// AlertsSpec describes the alert a firing rule produces.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AlertsSpec {
    /// Values can use format strings over the fields of the record.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// The output format of the message sent to the user.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Rule severity: INFO, WARNING, ERROR or CRITICAL.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
}

/// SinkConfig is the receiver document stored in the ruler's
/// ConfigMap under the `config` key.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SinkConfig {
    /// Receivers alerts are delivered to.
    #[serde(default)]
    pub receivers: Vec<Receiver>,
}

/// Receiver configures one alert destination.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Receiver {
    /// Receiver name. Falls back to the derived URL when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Receiver type: webhook, alertmanager or notificationmanager.
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub receiver_type: String,
    /// Connection parameters.
    #[serde(default)]
    pub config: ReceiverClientConfig,
}

/// ReceiverClientConfig holds the connection parameters for a
/// receiver. Exactly one of `url` or `service` should be set.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverClientConfig {
    /// Location of the receiver in standard URL form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Reference to an in-cluster Service backing the receiver.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceReference>,
    /// PEM encoded CA bundle used to validate the receiver's server
    /// certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<ByteString>,
}

/// ServiceReference holds a reference to a Service.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReference {
    /// Namespace of the service.
    pub namespace: String,
    /// Name of the service.
    pub name: String,
    /// Optional URL path sent in requests to this service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Port on the service hosting the receiver. Defaults to 443.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}
