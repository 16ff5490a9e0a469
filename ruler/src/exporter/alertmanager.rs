//! AlertManager sink: posts alert batches to the AlertManager HTTP
//! API.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use api::v1alpha1::{Receiver, ServiceReference};

use super::{ALERTMANAGER_RECEIVER, Sink, alert_annotations, auditing_labels, event_labels};
use crate::prelude::*;
use crate::record::{Auditing, KubeEvent};

const DEFAULT_NAMESPACE: &str = "kubesphere-monitoring-system";
const DEFAULT_NAME: &str = "alertmanager-main";
const DEFAULT_PORT: i32 = 9093;
const ALERTS_PATH: &str = "/api/v2/alerts";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// AlertmanagerSink delivers alerts via the AlertManager v2 API.
pub struct AlertmanagerSink {
    state: RwLock<AmState>,
}

struct AmState {
    name: String,
    url: String,
    client: reqwest::Client,
    // Kept for DeepEqual against reloaded receivers.
    receiver: Receiver,
}

/// Factory builds an AlertManager sink from a receiver.
pub fn factory(receiver: &Receiver) -> Result<Arc<dyn Sink>> {
    Ok(Arc::new(AlertmanagerSink {
        state: RwLock::new(am_state(receiver)?),
    }))
}

fn am_state(receiver: &Receiver) -> Result<AmState> {
    if receiver.receiver_type != ALERTMANAGER_RECEIVER {
        return Err(Error::Receiver("no alertmanager config".into()));
    }

    // A direct URL is taken as-is; a service reference is merged
    // over the in-cluster defaults and pointed at the alerts API.
    let url = match &receiver.config.url {
        Some(url) => url.clone(),
        None => {
            let defaults = ServiceReference {
                namespace: DEFAULT_NAMESPACE.to_string(),
                name: DEFAULT_NAME.to_string(),
                path: None,
                port: Some(DEFAULT_PORT),
            };
            let service = receiver.config.service.as_ref().unwrap_or(&defaults);
            let port = service.port.unwrap_or(DEFAULT_PORT);
            format!("http://{}.{}:{port}{ALERTS_PATH}", service.name, service.namespace)
        }
    };

    let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    let name = if receiver.name.is_empty() {
        url.clone()
    } else {
        receiver.name.clone()
    };
    Ok(AmState {
        name,
        url,
        client,
        receiver: receiver.clone(),
    })
}

impl AlertmanagerSink {
    async fn post(&self, alerts: Value) -> Result<()> {
        let (client, url) = {
            let state = self.state.read();
            (state.client.clone(), state.url.clone())
        };
        let response = client.post(url).json(&alerts).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(anyhow::anyhow!("unexpected status {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for AlertmanagerSink {
    fn name(&self) -> String {
        self.state.read().name.clone()
    }

    fn kind(&self) -> &'static str {
        ALERTMANAGER_RECEIVER
    }

    fn deep_equal(&self, receiver: &Receiver) -> bool {
        self.state.read().receiver == *receiver
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn reconnect(&self, receiver: &Receiver) -> Result<()> {
        *self.state.write() = am_state(receiver)?;
        self.connect().await
    }

    async fn export_auditing(&self, record: &Auditing) -> Result<()> {
        self.post(json!([{
            "labels": auditing_labels(record),
            "annotations": alert_annotations(&record.message, &record.annotations),
        }]))
        .await
    }

    async fn export_event(&self, record: &KubeEvent) -> Result<()> {
        self.post(json!([{
            "labels": event_labels(record),
            "annotations": alert_annotations(&record.message, &record.annotations),
        }]))
        .await
    }
}
