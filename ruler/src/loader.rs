//! Loader watches the upstream configuration and republishes it: the
//! rule store is rebuilt and swapped atomically, and the exporter
//! hub is reconciled against the receiver list.
//!
//! All Kubernetes I/O happens inside [`Loader::run`]; construction
//! only wires up the local caches, so nothing talks to the cluster
//! before the caller is ready.

use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use kube::{
    Api, Client, ResourceExt,
    runtime::{
        WatchStreamExt, reflector,
        reflector::{Store, store::Writer},
        watcher,
    },
};
use tokio_util::sync::CancellationToken;

use api::v1alpha1::{ClusterRuleGroup, Receiver, SinkConfig};

use crate::CONFIGMAP_KEY;
use crate::exporter::Hub;
use crate::prelude::*;
use crate::rules::{RuleStore, StoreHandle};

/// Loader owns the configuration caches and the reload loop.
pub struct Loader {
    client: Client,
    webhook_name: String,
    namespace: String,
    rules: StoreHandle,
    hub: Arc<Hub>,

    ns_reader: Store<Namespace>,
    ns_writer: Writer<Namespace>,
    group_reader: Store<ClusterRuleGroup>,
    group_writer: Writer<ClusterRuleGroup>,
    cm_reader: Store<ConfigMap>,
    cm_writer: Writer<ConfigMap>,
}

impl Loader {
    /// New wires up a loader. `webhook_name` is the receiver
    /// ConfigMap's name, `namespace` the namespace it lives in.
    pub fn new(
        client: Client,
        webhook_name: String,
        namespace: String,
        rules: StoreHandle,
        hub: Arc<Hub>,
    ) -> Loader {
        let (ns_reader, ns_writer) = reflector::store();
        let (group_reader, group_writer) = reflector::store();
        let (cm_reader, cm_writer) = reflector::store();
        Loader {
            client,
            webhook_name,
            namespace,
            rules,
            hub,
            ns_reader,
            ns_writer,
            group_reader,
            group_writer,
            cm_reader,
            cm_writer,
        }
    }

    /// Namespaces hands out the namespace cache for ingress
    /// enrichment. The cache fills once [`Loader::run`] starts.
    pub fn namespaces(&self) -> Store<Namespace> {
        self.ns_reader.clone()
    }

    /// Run drives the watches until cancellation. Every touch of a
    /// rule group or of the receiver ConfigMap triggers a reload.
    #[instrument(skip_all)]
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let Loader {
            client,
            webhook_name,
            namespace,
            rules,
            hub,
            ns_reader: _,
            ns_writer,
            group_reader,
            group_writer,
            cm_reader,
            cm_writer,
        } = self;

        // The namespace reflector only feeds the ingress cache, it
        // never triggers reloads.
        let ns_api = Api::<Namespace>::all(client.clone());
        let ns_stream = reflector(
            ns_writer,
            watcher(ns_api, watcher::Config::default()).default_backoff(),
        );
        let ns_token = token.clone();
        let ns_task = tokio::spawn(async move {
            let mut stream = std::pin::pin!(ns_stream.touched_objects());
            loop {
                tokio::select! {
                    _ = ns_token.cancelled() => break,
                    item = stream.next() => match item {
                        Some(Ok(_)) => {}
                        Some(Err(err)) => warn!(%err, "namespace watch error"),
                        None => break,
                    },
                }
            }
        });

        let group_api = Api::<ClusterRuleGroup>::all(client.clone());
        let groups = reflector(
            group_writer,
            watcher(group_api, watcher::Config::default()).default_backoff(),
        )
        .touched_objects()
        .map(|item| item.map(|_| ()));

        let cm_api = Api::<ConfigMap>::namespaced(client, &namespace);
        let cm_cfg = watcher::Config::default().fields(&format!("metadata.name={webhook_name}"));
        let cms = reflector(cm_writer, watcher(cm_api, cm_cfg).default_backoff())
            .touched_objects()
            .map(|item| item.map(|_| ()));

        info!(
            configmap = %webhook_name,
            namespace = %namespace,
            "config loader started"
        );
        let mut changes = std::pin::pin!(futures::stream::select(groups, cms));
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                item = changes.next() => match item {
                    Some(Ok(())) => {
                        reload(&group_reader, &cm_reader, &webhook_name, &rules, &hub).await;
                    }
                    Some(Err(err)) => warn!(%err, "config watch error"),
                    None => break,
                },
            }
        }

        ns_task.abort();
        info!("config loader stopped");
        Ok(())
    }
}

/// Reload rebuilds the rule store from the cached rule groups and
/// reconciles the hub against the cached receiver document. A
/// failed receiver read keeps the previous sink table.
async fn reload(
    groups: &Store<ClusterRuleGroup>,
    cms: &Store<ConfigMap>,
    webhook_name: &str,
    rules: &StoreHandle,
    hub: &Hub,
) {
    let store = RuleStore::load(groups.state());
    debug!(rules = store.len(), "rule store rebuilt");
    rules.replace(store);

    match receivers(cms, webhook_name) {
        Ok(receivers) => hub.reconcile(&receivers).await,
        Err(err) => {
            error!(%err, "failed to read receiver config, keeping the previous sinks");
        }
    }
}

fn receivers(cms: &Store<ConfigMap>, webhook_name: &str) -> Result<Vec<Receiver>> {
    let cm = cms
        .state()
        .into_iter()
        .find(|cm| cm.name_any() == webhook_name)
        .ok_or_else(|| anyhow::anyhow!("ConfigMap {webhook_name} not found"))?;
    let data = cm
        .data
        .as_ref()
        .and_then(|data| data.get(CONFIGMAP_KEY))
        .ok_or_else(|| anyhow::anyhow!("ConfigMap {webhook_name} has no {CONFIGMAP_KEY} key"))?;
    parse_sink_config(data)
}

/// Parse_sink_config decodes the YAML receiver document.
pub fn parse_sink_config(data: &str) -> Result<Vec<Receiver>> {
    let sink: SinkConfig = serde_yaml::from_str(data)?;
    Ok(sink.receivers)
}
