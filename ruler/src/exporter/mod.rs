//! Exporter fans fired records out to the configured alert sinks.
//!
//! The hub holds a factory per receiver type — registered once at
//! startup, before the HTTP server binds — and the live sink table,
//! swapped atomically on reconciliation. Fan-out offers every fired
//! record to every current sink exactly once; a failing sink is
//! logged and the rest still get the record.

use std::collections::HashMap;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use metrics::counter;

use api::v1alpha1::{Receiver, ReceiverClientConfig};

use crate::prelude::*;
use crate::record::{Auditing, KubeEvent, Record};

pub mod alertmanager;
pub mod notificationmanager;
pub mod webhook;

/// WEBHOOK_RECEIVER is the receiver type handled by the webhook sink.
pub const WEBHOOK_RECEIVER: &str = "webhook";
/// ALERTMANAGER_RECEIVER is the receiver type handled by the
/// AlertManager sink.
pub const ALERTMANAGER_RECEIVER: &str = "alertmanager";
/// NOTIFICATION_MANAGER_RECEIVER is the receiver type handled by the
/// Notification Manager sink.
pub const NOTIFICATION_MANAGER_RECEIVER: &str = "notificationmanager";

/// RESERVED_MESSAGE_KEY is where the formatted alert message goes
/// when the rule's own annotations already claim `message`.
pub const RESERVED_MESSAGE_KEY: &str = "ruler_message";

/// Sink is a live alert destination built from a receiver.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Name of the sink; the receiver name, or the derived URL when
    /// the receiver is unnamed.
    fn name(&self) -> String;
    /// Kind is the receiver type this sink serves.
    fn kind(&self) -> &'static str;
    /// Deep_equal reports whether this sink was built from an
    /// equivalent receiver.
    fn deep_equal(&self, receiver: &Receiver) -> bool;
    /// Connect establishes the connection, where the transport has
    /// one.
    async fn connect(&self) -> Result<()>;
    /// Reconnect re-reads the receiver configuration in place.
    async fn reconnect(&self, receiver: &Receiver) -> Result<()>;
    /// Export_auditing delivers an auditing alert.
    async fn export_auditing(&self, record: &Auditing) -> Result<()>;
    /// Export_event delivers an events alert.
    async fn export_event(&self, record: &KubeEvent) -> Result<()>;
}

/// Factory builds a sink from a receiver.
pub type Factory = fn(&Receiver) -> Result<Arc<dyn Sink>>;

/// Hub owns the sink table and reconciles it against the receiver
/// configuration.
pub struct Hub {
    factories: HashMap<&'static str, Factory>,
    sinks: ArcSwap<HashMap<String, Arc<dyn Sink>>>,
    reconcile_lock: tokio::sync::Mutex<()>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    /// New creates a hub with no factories and no sinks.
    pub fn new() -> Hub {
        Hub {
            factories: HashMap::new(),
            sinks: ArcSwap::from_pointee(HashMap::new()),
            reconcile_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Register adds a sink factory for a receiver type. Called at
    /// startup only; the registry is read-only afterwards.
    pub fn register(&mut self, kind: &'static str, factory: Factory) {
        self.factories.insert(kind, factory);
    }

    /// Sink_names lists the live sinks.
    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.load().keys().cloned().collect()
    }

    /// Reconcile rebuilds the sink table against the new receiver
    /// list: an existing sink matched by name, or by type and config
    /// equality, is reconnected in place and retained; anything else
    /// is built fresh via its factory; sinks for receivers that
    /// disappeared are dropped. Failures exclude the receiver until
    /// the next reload.
    #[instrument(skip_all, fields(receivers = receivers.len()))]
    pub async fn reconcile(&self, receivers: &[Receiver]) {
        let _guard = self.reconcile_lock.lock().await;
        let current = self.sinks.load_full();
        let mut next: HashMap<String, Arc<dyn Sink>> = HashMap::new();

        for receiver in receivers {
            if let Some(sink) = find_existing(&current, receiver) {
                match sink.reconnect(receiver).await {
                    Ok(()) => {
                        next.insert(sink.name(), sink);
                        continue;
                    }
                    Err(err) => {
                        error!(receiver = %receiver.name, %err, "receiver reconnect error");
                        continue;
                    }
                }
            }

            let Some(factory) = self.factories.get(receiver.receiver_type.as_str()) else {
                error!(
                    kind = %receiver.receiver_type,
                    "no sink plugin registered for receiver type"
                );
                continue;
            };
            let sink = match factory(receiver) {
                Ok(sink) => sink,
                Err(err) => {
                    error!(receiver = %receiver.name, %err, "unusable receiver config");
                    continue;
                }
            };
            if let Err(err) = sink.connect().await {
                error!(receiver = %receiver.name, %err, "connect to receiver error");
                continue;
            }
            next.insert(sink.name(), sink);
        }

        info!(sinks = next.len(), "sink table reconciled");
        self.sinks.store(Arc::new(next));
    }

    /// Export offers a fired record to every live sink. Per-sink
    /// errors are logged; there is no retry.
    pub async fn export(&self, record: &Record) {
        let sinks = self.sinks.load_full();
        for sink in sinks.values() {
            let res = match record {
                Record::Auditing(a) => sink.export_auditing(a).await,
                Record::Event(e) => sink.export_event(e).await,
            };
            if let Err(err) = res {
                error!(id = %record.id(), sink = %sink.name(), %err, "export error");
                counter!("ruler_export_errors_total", "sink" => sink.name()).increment(1);
            }
        }
    }
}

fn find_existing(
    current: &HashMap<String, Arc<dyn Sink>>,
    receiver: &Receiver,
) -> Option<Arc<dyn Sink>> {
    if !receiver.name.is_empty() {
        if let Some(sink) = current.get(&receiver.name) {
            return Some(sink.clone());
        }
    }
    current
        .values()
        .find(|s| s.kind() == receiver.receiver_type && s.deep_equal(receiver))
        .cloned()
}

/// Service_url derives the receiver URL: the configured `url`
/// verbatim, or one built from the service reference — `https` when
/// a CA bundle is present, `http` otherwise.
pub(crate) fn service_url(config: &ReceiverClientConfig) -> Result<String> {
    if let Some(url) = &config.url {
        return Ok(url.clone());
    }
    let Some(service) = &config.service else {
        return Err(Error::Receiver("neither url nor service is set".into()));
    };
    let scheme = if has_ca_bundle(config) { "https" } else { "http" };
    let mut url = format!("{scheme}://{}.{}", service.name, service.namespace);
    if let Some(port) = service.port {
        url.push_str(&format!(":{port}"));
    }
    if let Some(path) = &service.path {
        url.push_str(path);
    }
    Ok(url)
}

pub(crate) fn has_ca_bundle(config: &ReceiverClientConfig) -> bool {
    config.ca_bundle.as_ref().is_some_and(|b| !b.0.is_empty())
}

pub(crate) fn ca_bundle(config: &ReceiverClientConfig) -> Option<Vec<u8>> {
    config
        .ca_bundle
        .as_ref()
        .map(|b| b.0.clone())
        .filter(|b| !b.is_empty())
}

/// Alert_annotations merges the formatted message into the rule's
/// annotations. The rule's own `message` annotation, if any, keeps
/// its key; the formatted message then goes under
/// [`RESERVED_MESSAGE_KEY`] and the collision is logged.
pub(crate) fn alert_annotations(
    message: &str,
    annotations: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut out = annotations.clone();
    if out.contains_key("message") {
        warn!(
            "rule annotations already carry a message entry, storing the alert message as {}",
            RESERVED_MESSAGE_KEY
        );
        out.insert(RESERVED_MESSAGE_KEY.to_string(), message.to_string());
    } else {
        out.insert("message".to_string(), message.to_string());
    }
    out
}

/// Auditing_labels is the standard label set for auditing alerts.
pub(crate) fn auditing_labels(a: &Auditing) -> BTreeMap<String, String> {
    let oref = a.event.object_ref.clone().unwrap_or_default();
    let mut labels = BTreeMap::new();
    labels.insert("namespace".to_string(), oref.namespace);
    labels.insert("resource".to_string(), oref.resource);
    labels.insert("name".to_string(), oref.name);
    labels.insert("user".to_string(), a.event.user.username.clone());
    labels.insert(
        "group".to_string(),
        serde_json::to_string(&a.event.user.groups).unwrap_or_default(),
    );
    labels.insert("verb".to_string(), a.event.verb.clone());
    labels.insert("alerttype".to_string(), "auditing".to_string());
    labels.insert("alertname".to_string(), a.matched_rule.clone());
    labels.insert(
        "requestReceivedTimestamp".to_string(),
        a.event
            .request_received_timestamp
            .map(|t| t.to_rfc3339())
            .unwrap_or_default(),
    );
    labels
}

/// Event_labels is the standard label set for events alerts.
pub(crate) fn event_labels(e: &KubeEvent) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(
        "namespace".to_string(),
        e.event.metadata.namespace.clone().unwrap_or_default(),
    );
    labels.insert(
        "reason".to_string(),
        e.event.reason.clone().unwrap_or_default(),
    );
    labels.insert(
        "name".to_string(),
        e.event.metadata.name.clone().unwrap_or_default(),
    );
    labels.insert(
        "user".to_string(),
        e.event
            .source
            .as_ref()
            .and_then(|s| s.host.clone())
            .unwrap_or_default(),
    );
    labels.insert(
        "group".to_string(),
        serde_json::to_string(&e.event.series).unwrap_or_default(),
    );
    labels.insert("alerttype".to_string(), "events".to_string());
    labels.insert("alertname".to_string(), e.matched_rule.clone());
    labels
}
