//! Webhook sink: POSTs a single alert object per fired record.

use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use api::v1alpha1::Receiver;

use super::{
    Sink, WEBHOOK_RECEIVER, alert_annotations, auditing_labels, ca_bundle, event_labels,
    service_url,
};
use crate::prelude::*;
use crate::record::{Auditing, KubeEvent};

const MAX_IDLE_PER_HOST: usize = 8;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// WebhookSink delivers alerts with plain HTTP(S) POSTs.
pub struct WebhookSink {
    state: RwLock<HttpState>,
}

struct HttpState {
    name: String,
    url: String,
    client: reqwest::Client,
}

/// Factory builds a webhook sink from a receiver.
pub fn factory(receiver: &Receiver) -> Result<Arc<dyn Sink>> {
    Ok(Arc::new(WebhookSink {
        state: RwLock::new(http_state(receiver)?),
    }))
}

fn http_state(receiver: &Receiver) -> Result<HttpState> {
    if receiver.receiver_type != WEBHOOK_RECEIVER {
        return Err(Error::Receiver("no webhook receiver config".into()));
    }
    let url = service_url(&receiver.config)?;

    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
        .pool_idle_timeout(IDLE_TIMEOUT)
        .timeout(REQUEST_TIMEOUT);
    if let Some(pem) = ca_bundle(&receiver.config) {
        builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
    }
    let client = builder.build()?;

    let name = if receiver.name.is_empty() {
        url.clone()
    } else {
        receiver.name.clone()
    };
    Ok(HttpState { name, url, client })
}

impl WebhookSink {
    fn client(&self) -> (reqwest::Client, String) {
        let state = self.state.read();
        (state.client.clone(), state.url.clone())
    }

    async fn post(&self, alert: Value) -> Result<()> {
        let (client, url) = self.client();
        let response = client.post(url).json(&alert).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(anyhow::anyhow!("unexpected status {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn name(&self) -> String {
        self.state.read().name.clone()
    }

    fn kind(&self) -> &'static str {
        WEBHOOK_RECEIVER
    }

    // Any config change forces a reconnect.
    fn deep_equal(&self, _: &Receiver) -> bool {
        false
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Reconnect resets the URL, trust store and client.
    async fn reconnect(&self, receiver: &Receiver) -> Result<()> {
        *self.state.write() = http_state(receiver)?;
        Ok(())
    }

    async fn export_auditing(&self, record: &Auditing) -> Result<()> {
        self.post(json!({
            "labels": auditing_labels(record),
            "annotations": alert_annotations(&record.message, &record.annotations),
            "record": record,
        }))
        .await
    }

    async fn export_event(&self, record: &KubeEvent) -> Result<()> {
        self.post(json!({
            "labels": event_labels(record),
            "annotations": alert_annotations(&record.message, &record.annotations),
            "record": record,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::v1alpha1::ReceiverClientConfig;

    #[test]
    fn unnamed_receivers_take_the_url_as_name() {
        let state = http_state(&Receiver {
            receiver_type: WEBHOOK_RECEIVER.into(),
            config: ReceiverClientConfig {
                url: Some("http://alerts:8080/hook".into()),
                ..Default::default()
            },
            ..Default::default()
        })
        .expect("builds");
        assert_eq!(state.name, "http://alerts:8080/hook");
    }

    #[test]
    fn wrong_receiver_type_is_rejected() {
        let err = http_state(&Receiver {
            receiver_type: "alertmanager".into(),
            ..Default::default()
        });
        assert!(err.is_err());
    }
}
