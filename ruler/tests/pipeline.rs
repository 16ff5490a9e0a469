//! End-to-end pipeline tests: ingress → worker pool → matcher →
//! exporter hub → a local mock receiver.

use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, http::StatusCode, routing::post};
use serde_json::{Value, json};
use test_log::test;
use tokio::sync::mpsc;

use api::v1alpha1::{
    AlertsSpec, ClusterRuleGroup, ClusterRuleGroupSpec, ExprSpec, Receiver, ReceiverClientConfig,
    RuleSpec,
};
use ruler::exporter::{Hub, WEBHOOK_RECEIVER};
use ruler::rules::{RuleStore, StoreHandle};
use ruler::webhook::{self, AppState, Drain};
use ruler::worker::{Pool, PoolConfig};

fn rule_groups() -> Vec<Arc<ClusterRuleGroup>> {
    vec![Arc::new(ClusterRuleGroup::new(
        "g1",
        ClusterRuleGroupSpec {
            group_type: "auditing".into(),
            rules: vec![
                RuleSpec {
                    name: "rs".into(),
                    expr: ExprSpec {
                        kind: "list".into(),
                        list: vec!["pods".into(), "secrets".into()],
                        ..Default::default()
                    },
                    ..Default::default()
                },
                RuleSpec {
                    name: "r1".into(),
                    enable: true,
                    expr: ExprSpec {
                        kind: "rule".into(),
                        condition: r#"Verb = "delete" and ObjectRef.Resource in ${g1.rs}"#.into(),
                        ..Default::default()
                    },
                    alerts: AlertsSpec {
                        severity: "WARNING".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                // References nothing that exists: pruned at load.
                RuleSpec {
                    name: "broken".into(),
                    enable: true,
                    expr: ExprSpec {
                        kind: "rule".into(),
                        condition: "${zzz}".into(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            ],
        },
    ))]
}

/// Serves a mock webhook receiver on an ephemeral port, forwarding
/// every alert body it is POSTed.
async fn mock_receiver() -> (String, mpsc::Receiver<Value>) {
    let (tx, rx) = mpsc::channel::<Value>(16);
    let router = Router::new().route(
        "/hook",
        post(move |Json(alert): Json<Value>| {
            let tx = tx.clone();
            async move {
                tx.send(alert).await.ok();
                StatusCode::OK
            }
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binds");
    let url = format!("http://{}/hook", listener.local_addr().expect("addr"));
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("mock receiver");
    });
    (url, rx)
}

/// Boots the whole pipeline against the mock receiver and returns
/// the ingress base URL.
async fn boot(receiver_url: String) -> (String, Arc<AppState>) {
    let rules = StoreHandle::default();
    rules.replace(RuleStore::load(rule_groups()));

    let mut hub = Hub::new();
    hub.register(WEBHOOK_RECEIVER, ruler::exporter::webhook::factory);
    let hub = Arc::new(hub);
    hub.reconcile(&[Receiver {
        name: "wh".into(),
        receiver_type: WEBHOOK_RECEIVER.into(),
        config: ReceiverClientConfig {
            url: Some(receiver_url),
            ..Default::default()
        },
    }])
    .await;
    assert_eq!(hub.sink_names(), vec!["wh".to_string()]);

    let (pool, _dispatcher) = Pool::spawn(PoolConfig::default(), rules, hub);
    let state = Arc::new(AppState {
        pool,
        namespaces: None,
        drain: Drain::default(),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binds");
    let base = format!("http://{}", listener.local_addr().expect("addr"));
    let app = webhook::app(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("ingress");
    });
    (base, state)
}

#[test(tokio::test)]
async fn audit_batch_fires_one_webhook_alert() {
    let (receiver_url, mut alerts) = mock_receiver().await;
    let (base, state) = boot(receiver_url).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/webhook/auditing"))
        .json(&json!([{
            "AuditID": "a-1",
            "Verb": "DELETE",
            "ObjectRef": {"Resource": "pods", "Name": "p1", "Namespace": "ns"},
            "User": {"Username": "alice"},
        }]))
        .send()
        .await
        .expect("post");
    assert_eq!(res.status(), 200);
    assert!(res.bytes().await.expect("body").is_empty());

    let alert = tokio::time::timeout(Duration::from_secs(10), alerts.recv())
        .await
        .expect("an alert arrives")
        .expect("channel open");
    assert_eq!(alert["labels"]["alertname"], json!("r1"));
    assert_eq!(alert["labels"]["verb"], json!("delete"));
    assert_eq!(alert["labels"]["resource"], json!("pods"));
    assert_eq!(alert["labels"]["alerttype"], json!("auditing"));
    assert_eq!(
        alert["annotations"]["message"],
        json!("alice delete pods 'p1' in Namespace ns")
    );
    // The record's canonical JSON rides along.
    assert_eq!(alert["record"]["AuditID"], json!("a-1"));
    assert_eq!(state.pool.stats().fired(), 1);
}

#[test(tokio::test)]
async fn envelope_batches_are_accepted_too() {
    let (receiver_url, mut alerts) = mock_receiver().await;
    let (base, _state) = boot(receiver_url).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/webhook/auditing"))
        .json(&json!({"items": [{
            "Verb": "delete",
            "ObjectRef": {"Resource": "secrets", "Name": "s1", "Namespace": "ns"},
            "User": {"Username": "bob"},
        }]}))
        .send()
        .await
        .expect("post");
    assert_eq!(res.status(), 200);

    let alert = tokio::time::timeout(Duration::from_secs(10), alerts.recv())
        .await
        .expect("an alert arrives")
        .expect("channel open");
    assert_eq!(
        alert["annotations"]["message"],
        json!("bob delete secrets 's1' in Namespace ns")
    );
}

#[test(tokio::test)]
async fn unmatched_records_reach_no_sink() {
    let (receiver_url, mut alerts) = mock_receiver().await;
    let (base, state) = boot(receiver_url).await;
    let client = reqwest::Client::new();

    // An event with no events-typed rules loaded at all.
    let res = client
        .post(format!("{base}/webhook/events"))
        .json(&json!([{
            "Event": {
                "metadata": {"name": "ev-1", "namespace": "ns", "uid": "u-1"},
                "involvedObject": {"name": "pod-1"},
                "reason": "Failed",
                "message": "back-off restarting container",
            },
        }]))
        .send()
        .await
        .expect("post");
    assert_eq!(res.status(), 200);

    // And an audit verb no rule matches.
    let res = client
        .post(format!("{base}/webhook/auditing"))
        .json(&json!([{
            "Verb": "get",
            "ObjectRef": {"Resource": "pods", "Name": "p1", "Namespace": "ns"},
            "User": {"Username": "alice"},
        }]))
        .send()
        .await
        .expect("post");
    assert_eq!(res.status(), 200);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(alerts.try_recv().is_err(), "no sink call expected");
    assert_eq!(state.pool.stats().fired(), 0);
    assert_eq!(state.pool.stats().enqueued(), 2);
}

#[test(tokio::test)]
async fn broken_rules_are_pruned_and_readiness_stays_up() {
    let store = RuleStore::load(rule_groups());
    assert!(store.get("g1", "r1").is_some());
    assert!(store.get("g1", "broken").is_none());

    let (receiver_url, _alerts) = mock_receiver().await;
    let (base, _state) = boot(receiver_url).await;
    let client = reqwest::Client::new();
    let res = client
        .get(format!("{base}/readiness"))
        .send()
        .await
        .expect("get");
    assert_eq!(res.status(), 200);

    let res = client
        .get(format!("{base}/liveness"))
        .send()
        .await
        .expect("get");
    assert_eq!(res.status(), 200);
}

#[test(tokio::test)]
async fn malformed_bodies_are_rejected() {
    let (receiver_url, _alerts) = mock_receiver().await;
    let (base, _state) = boot(receiver_url).await;
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{base}/webhook/events"))
        .header("content-type", "application/json")
        .body("not json at all")
        .send()
        .await
        .expect("post");
    assert_eq!(res.status(), 400);
}
