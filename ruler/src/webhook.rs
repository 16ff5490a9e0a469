//! Webhook is the HTTP ingress for record batches.
//!
//! Both POST endpoints accept either a raw JSON array or an
//! `{"items": [...]}` envelope: the kube-apiserver audit webhook
//! sends the envelope, the fluent-bit style shippers send raw
//! arrays. Enqueueing blocks while the worker queue is full, which
//! is the back-pressure the callers see.

use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{Router, body::Bytes, extract::State, http::StatusCode, routing::get, routing::post};
use k8s_openapi::api::core::v1::Namespace;
use kube::runtime::reflector::{ObjectRef, Store};
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;

use crate::prelude::*;
use crate::record::{Auditing, KubeEvent, Record};
use crate::worker::Pool;
use crate::WORKSPACE_LABEL;

/// AppState is the ingress server state.
pub struct AppState {
    /// The worker pool records are enqueued onto.
    pub pool: Pool,
    /// Namespace cache for workspace enrichment; `None` runs without
    /// enrichment.
    pub namespaces: Option<Store<Namespace>>,
    /// Drain tracks in-flight handlers for `/prestop`.
    pub drain: Drain,
}

impl AppState {
    fn workspace_for(&self, namespace: &str) -> Option<String> {
        workspace_for(self.namespaces.as_ref()?, namespace)
    }
}

/// Workspace_for looks the namespace up in the local cache and
/// returns its workspace label, if any. A cache miss is silent.
pub fn workspace_for(store: &Store<Namespace>, namespace: &str) -> Option<String> {
    let ns = store.get(&ObjectRef::new(namespace))?;
    ns.metadata.labels.as_ref()?.get(WORKSPACE_LABEL).cloned()
}

/// App returns the ingress `axum::Router`.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhook/auditing", post(handle_auditing))
        .route("/webhook/events", post(handle_events))
        .route("/readiness", get(readiness))
        .route("/liveness", get(readiness))
        .route("/prestop", get(prestop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Batch decodes the two accepted POST body shapes.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum Batch<T> {
    Envelope { items: Vec<T> },
    List(Vec<T>),
}

impl<T> Batch<T> {
    pub(crate) fn into_items(self) -> Vec<T> {
        match self {
            Batch::Envelope { items } => items,
            Batch::List(items) => items,
        }
    }
}

#[instrument(skip_all, fields(bytes = body.len()))]
async fn handle_auditing(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let _guard = state.drain.guard();

    let batch: Batch<Auditing> = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(%err, "malformed auditing batch");
            return StatusCode::BAD_REQUEST;
        }
    };

    for mut audit in batch.into_items() {
        audit.event.verb = audit.event.verb.to_lowercase();
        if audit.workspace.is_empty() {
            let namespace = audit
                .event
                .object_ref
                .as_ref()
                .map(|oref| oref.namespace.clone())
                .filter(|ns| !ns.is_empty());
            if let Some(ws) = namespace.and_then(|ns| state.workspace_for(&ns)) {
                audit.workspace = ws;
            }
        }
        if let Err(err) = state.pool.enqueue(Record::Auditing(Box::new(audit))).await {
            warn!(%err, "record not enqueued");
        }
    }

    StatusCode::OK
}

#[instrument(skip_all, fields(bytes = body.len()))]
async fn handle_events(State(state): State<Arc<AppState>>, body: Bytes) -> StatusCode {
    let _guard = state.drain.guard();

    let batch: Batch<KubeEvent> = match serde_json::from_slice(&body) {
        Ok(batch) => batch,
        Err(err) => {
            warn!(%err, "malformed events batch");
            return StatusCode::BAD_REQUEST;
        }
    };

    for event in batch.into_items() {
        if let Err(err) = state.pool.enqueue(Record::Event(Box::new(event))).await {
            warn!(%err, "record not enqueued");
        }
    }

    StatusCode::OK
}

async fn readiness() -> StatusCode {
    StatusCode::OK
}

#[instrument(skip_all)]
async fn prestop(State(state): State<Arc<AppState>>) -> StatusCode {
    info!("prestop: draining ingress handlers");
    state.drain.wait().await;
    state.pool.shutdown().await;
    info!("prestop: drained");
    StatusCode::OK
}

/// Drain counts in-flight ingress handlers so prestop can wait for
/// them before stopping the worker pool.
#[derive(Clone, Default)]
pub struct Drain(Arc<DrainInner>);

#[derive(Default)]
struct DrainInner {
    active: AtomicUsize,
    notify: Notify,
}

impl Drain {
    /// Guard marks a handler in-flight until dropped.
    pub fn guard(&self) -> DrainGuard {
        self.0.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard(self.0.clone())
    }

    /// Wait blocks until no handler is in flight.
    pub async fn wait(&self) {
        loop {
            let notified = self.0.notify.notified();
            if self.0.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// DrainGuard is the in-flight marker; dropping it releases the
/// handler.
pub struct DrainGuard(Arc<DrainInner>);

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.0.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.notify.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use http::Request;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::runtime::{reflector, watcher};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::exporter::Hub;
    use crate::rules::StoreHandle;
    use crate::worker::PoolConfig;

    #[test]
    fn both_batch_shapes_decode() {
        let raw = json!([{"Verb": "GET"}]).to_string();
        let batch: Batch<Auditing> = serde_json::from_str(&raw).expect("raw array");
        assert_eq!(batch.into_items().len(), 1);

        let envelope = json!({"items": [{"Verb": "GET"}, {"Verb": "LIST"}]}).to_string();
        let batch: Batch<Auditing> = serde_json::from_str(&envelope).expect("envelope");
        assert_eq!(batch.into_items().len(), 2);

        assert!(serde_json::from_str::<Batch<Auditing>>("{\"nope\": 1}").is_err());
    }

    #[test]
    fn workspace_comes_from_the_namespace_label() {
        let (reader, mut writer) = reflector::store::<Namespace>();
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("ns-1".into()),
                labels: Some(
                    [(WORKSPACE_LABEL.to_string(), "ws-1".to_string())]
                        .into_iter()
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        };
        writer.apply_watcher_event(&watcher::Event::Apply(ns));

        assert_eq!(workspace_for(&reader, "ns-1").as_deref(), Some("ws-1"));
        assert_eq!(workspace_for(&reader, "other"), None);
    }

    fn test_state() -> Arc<AppState> {
        let (pool, _task) = Pool::spawn(
            PoolConfig::default(),
            StoreHandle::default(),
            Arc::new(Hub::new()),
        );
        Arc::new(AppState {
            pool,
            namespaces: None,
            drain: Drain::default(),
        })
    }

    #[tokio::test]
    async fn malformed_bodies_get_a_400() {
        let app = app(test_state());
        let res = app
            .oneshot(
                Request::post("/webhook/auditing")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from("not json"))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn well_formed_bodies_get_a_200() {
        let state = test_state();
        let app = app(state.clone());
        let body = json!([{"Verb": "DELETE", "ObjectRef": {"Resource": "pods"}}]).to_string();
        let res = app
            .oneshot(
                Request::post("/webhook/auditing")
                    .header("content-type", "application/json")
                    .body(axum::body::Body::from(body))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(state.pool.stats().enqueued(), 1);
    }

    #[tokio::test]
    async fn readiness_is_always_up() {
        let app = app(test_state());
        let res = app
            .oneshot(
                Request::get("/readiness")
                    .body(axum::body::Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let drain = Drain::default();
        let guard = drain.guard();

        let waiter = {
            let drain = drain.clone();
            tokio::spawn(async move { drain.wait().await })
        };
        // The waiter cannot finish while the guard lives.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain completes")
            .expect("waiter does not panic");
    }
}
