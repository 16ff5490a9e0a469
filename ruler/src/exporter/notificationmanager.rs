//! Notification Manager sink: posts an alertmanager-template `Data`
//! envelope.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::json;

use api::v1alpha1::Receiver;

use super::{
    NOTIFICATION_MANAGER_RECEIVER, Sink, alert_annotations, auditing_labels, event_labels,
    service_url,
};
use crate::prelude::*;
use crate::record::{Auditing, KubeEvent};

/// NotificationManagerSink delivers alerts to a Notification Manager
/// endpoint.
pub struct NotificationManagerSink {
    state: RwLock<NmState>,
}

struct NmState {
    name: String,
    url: String,
    client: reqwest::Client,
}

/// Factory builds a Notification Manager sink from a receiver.
pub fn factory(receiver: &Receiver) -> Result<Arc<dyn Sink>> {
    Ok(Arc::new(NotificationManagerSink {
        state: RwLock::new(nm_state(receiver)?),
    }))
}

fn nm_state(receiver: &Receiver) -> Result<NmState> {
    if receiver.receiver_type != NOTIFICATION_MANAGER_RECEIVER {
        return Err(Error::Receiver(
            "no notification manager receiver config".into(),
        ));
    }
    let url = service_url(&receiver.config)?;
    let name = if receiver.name.is_empty() {
        url.clone()
    } else {
        receiver.name.clone()
    };
    Ok(NmState {
        name,
        url,
        client: reqwest::Client::new(),
    })
}

impl NotificationManagerSink {
    async fn post(&self, data: Value) -> Result<()> {
        let (client, url) = {
            let state = self.state.read();
            (state.client.clone(), state.url.clone())
        };
        let response = client.post(url).json(&data).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Other(anyhow::anyhow!("unexpected status {status}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for NotificationManagerSink {
    fn name(&self) -> String {
        self.state.read().name.clone()
    }

    fn kind(&self) -> &'static str {
        NOTIFICATION_MANAGER_RECEIVER
    }

    fn deep_equal(&self, _: &Receiver) -> bool {
        false
    }

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    /// Reconnect only resets the URL.
    async fn reconnect(&self, receiver: &Receiver) -> Result<()> {
        *self.state.write() = nm_state(receiver)?;
        Ok(())
    }

    async fn export_auditing(&self, record: &Auditing) -> Result<()> {
        self.post(json!({
            "alerts": [{
                "labels": auditing_labels(record),
                "annotations": alert_annotations(&record.message, &record.annotations),
            }],
        }))
        .await
    }

    async fn export_event(&self, record: &KubeEvent) -> Result<()> {
        self.post(json!({
            "alerts": [{
                "labels": event_labels(record),
                "annotations": alert_annotations(&record.message, &record.annotations),
            }],
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use api::v1alpha1::{ReceiverClientConfig, ServiceReference};
    use k8s_openapi::ByteString;

    #[test]
    fn scheme_follows_the_ca_bundle() {
        let mut receiver = Receiver {
            name: "nm".into(),
            receiver_type: NOTIFICATION_MANAGER_RECEIVER.into(),
            config: ReceiverClientConfig {
                service: Some(ServiceReference {
                    namespace: "ns".into(),
                    name: "notification-manager-svc".into(),
                    path: Some("/api/v2/alerts".into()),
                    port: Some(19093),
                }),
                ..Default::default()
            },
        };
        let state = nm_state(&receiver).expect("builds");
        assert_eq!(
            state.url,
            "http://notification-manager-svc.ns:19093/api/v2/alerts"
        );

        receiver.config.ca_bundle = Some(ByteString(b"pem".to_vec()));
        let state = nm_state(&receiver).expect("builds");
        assert_eq!(
            state.url,
            "https://notification-manager-svc.ns:19093/api/v2/alerts"
        );
    }
}
