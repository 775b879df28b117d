use std::sync::Arc;

use serde_json::{json, Value};
use tokio::time::Duration;
use wiremock::matchers::{body_string, method, path, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

use consular::consul::ConsulClient;
use consular::errors::BridgeError;
use consular::http;
use consular::marathon::MarathonClient;
use consular::sync::Syncer;

fn syncer_with_fallback(
    marathon_url: &str,
    consul_url: &str,
    agent_port: u16,
    enable_fallback: bool,
) -> Syncer {
    let client = http::build_client().expect("failed building HTTP client");
    let marathon = Arc::new(MarathonClient::new(
        marathon_url,
        client.clone(),
        Duration::from_secs(5),
    ));
    let consul = Arc::new(
        ConsulClient::new(
            consul_url,
            client,
            Duration::from_secs(5),
            Duration::from_secs(2),
            enable_fallback,
        )
        .with_agent_port(agent_port),
    );
    Syncer::new(marathon, consul, "the-uuid".to_string())
}

fn syncer(marathon_url: &str, consul_url: &str, agent_port: u16) -> Syncer {
    syncer_with_fallback(marathon_url, consul_url, agent_port, false)
}

async fn mock_apps(marathon: &MockServer, apps: Value) {
    Mock::given(method("GET"))
        .and(path("/v2/apps"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "apps": apps })))
        .mount(marathon)
        .await;
}

#[tokio::test]
async fn sync_registers_tasks_and_mirrors_labels() {
    let marathon = MockServer::start().await;
    let agent = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(
        &marathon,
        json!([{"id": "/my-app", "labels": {"group": "internal"}}]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [{
                "id": "my-app_0-1396592784349",
                "host": "127.0.0.1",
                "ports": [31372, 31373]
            }]
        })))
        .mount(&marathon)
        .await;

    // Only the first port becomes the service port.
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(wiremock::matchers::body_json(json!({
            "Name": "my-app",
            "ID": "my-app_0-1396592784349",
            "Address": "127.0.0.1",
            "Port": 31372,
            "Tags": [
                "consular-reg-id=the-uuid",
                "consular-app-id=/my-app"
            ]
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&agent)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/kv/consular/my-app/group"))
        .and(body_string("internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&consul)
        .await;
    // Stale key from a label that no longer exists gets cleaned up.
    Mock::given(method("GET"))
        .and(path("/v1/kv/consular/my-app/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            "consular/my-app/group",
            "consular/my-app/retired"
        ])))
        .expect(1)
        .mount(&consul)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/consular/my-app/retired"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&consul)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/consular/my-app/group"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&consul)
        .await;

    syncer(&marathon.uri(), &consul.uri(), agent.address().port())
        .sync_apps(false)
        .await
        .unwrap();
}

#[tokio::test]
async fn sync_flattens_nested_app_ids() {
    let marathon = MockServer::start().await;
    let agent = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/group/my-app", "labels": {}}])).await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/group/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [{"id": "t1", "host": "127.0.0.1", "ports": [8000]}]
        })))
        .mount(&marathon)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(wiremock::matchers::body_partial_json(
            json!({"Name": "group-my-app", "ID": "t1"}),
        ))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&agent)
        .await;

    syncer(&marathon.uri(), &consul.uri(), agent.address().port())
        .sync_apps(false)
        .await
        .unwrap();
}

#[tokio::test]
async fn namespace_clash_aborts_without_writes() {
    let marathon = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/foo/bar"}, {"id": "/foo-bar"}])).await;
    Mock::given(method("GET"))
        .and(path_regex("^/v2/apps/.+/tasks$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tasks": []})))
        .expect(0)
        .mount(&marathon)
        .await;
    for verb in [method("PUT"), method("DELETE")] {
        Mock::given(verb)
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&consul)
            .await;
    }

    let err = syncer(&marathon.uri(), &consul.uri(), consul.address().port())
        .sync_apps(true)
        .await
        .unwrap_err();
    match err {
        BridgeError::NamespaceClash { clashes } => {
            assert_eq!(clashes.len(), 1);
            assert_eq!(clashes[0].app_name, "foo-bar");
            assert_eq!(clashes[0].app_ids, vec!["/foo/bar", "/foo-bar"]);
        }
        other => panic!("expected NamespaceClash, got {:?}", other),
    }
}

#[tokio::test]
async fn empty_label_set_deletes_the_whole_subtree() {
    let marathon = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/my-app", "labels": {}}])).await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tasks": []})))
        .mount(&marathon)
        .await;

    Mock::given(method("GET"))
        .and(path("/v1/kv/consular/my-app/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            "consular/my-app/group",
            "consular/my-app/owner"
        ])))
        .mount(&consul)
        .await;
    for key in ["group", "owner"] {
        Mock::given(method("DELETE"))
            .and(path(format!("/v1/kv/consular/my-app/{}", key)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
            .expect(1)
            .mount(&consul)
            .await;
    }

    syncer(&marathon.uri(), &consul.uri(), consul.address().port())
        .sync_apps(false)
        .await
        .unwrap();
}

#[tokio::test]
async fn label_keys_are_percent_encoded_in_kv_urls() {
    let marathon = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(
        &marathon,
        json!([{"id": "/my-app", "labels": {"owner team": "sre"}}]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"tasks": []})))
        .mount(&marathon)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/kv/consular/my-app/owner%20team"))
        .and(body_string("sre"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&consul)
        .await;
    // Consul reports keys decoded; deleting one must re-encode it.
    Mock::given(method("GET"))
        .and(path("/v1/kv/consular/my-app/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            "consular/my-app/owner team",
            "consular/my-app/old#key"
        ])))
        .mount(&consul)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/v1/kv/consular/my-app/old%23key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(true)))
        .expect(1)
        .mount(&consul)
        .await;

    syncer(&marathon.uri(), &consul.uri(), consul.address().port())
        .sync_apps(false)
        .await
        .unwrap();
}

#[tokio::test]
async fn task_without_ports_is_skipped() {
    let marathon = MockServer::start().await;
    let agent = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/my-app"}])).await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [
                {"id": "portless", "host": "127.0.0.1", "ports": []},
                {"id": "t1", "host": "127.0.0.1", "ports": [8000]}
            ]
        })))
        .mount(&marathon)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .and(wiremock::matchers::body_partial_json(json!({"ID": "t1"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&agent)
        .await;

    syncer(&marathon.uri(), &consul.uri(), agent.address().port())
        .sync_apps(false)
        .await
        .unwrap();
}

#[tokio::test]
async fn failed_agent_registration_falls_back_to_cluster_endpoint() {
    let marathon = MockServer::start().await;
    let agent = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/my-app"}])).await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [{"id": "t1", "host": "127.0.0.1", "ports": [8000]}]
        })))
        .mount(&marathon)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&agent)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&consul)
        .await;

    syncer_with_fallback(&marathon.uri(), &consul.uri(), agent.address().port(), true)
        .sync_apps(false)
        .await
        .unwrap();
}

#[tokio::test]
async fn registration_failure_without_fallback_fails_the_sync() {
    let marathon = MockServer::start().await;
    let agent = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/my-app"}])).await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "tasks": [{"id": "t1", "host": "127.0.0.1", "ports": [8000]}]
        })))
        .mount(&marathon)
        .await;

    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&agent)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/agent/service/register"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&consul)
        .await;

    let err = syncer(&marathon.uri(), &consul.uri(), agent.address().port())
        .sync_apps(false)
        .await
        .unwrap_err();
    assert!(
        matches!(err, BridgeError::UpstreamStatus { status, .. } if status == 500),
        "expected UpstreamStatus, got {:?}",
        err
    );
}

#[tokio::test]
async fn missing_tasks_field_fails_the_sync() {
    let marathon = MockServer::start().await;
    let consul = MockServer::start().await;

    mock_apps(&marathon, json!([{"id": "/my-app"}])).await;
    Mock::given(method("GET"))
        .and(path("/v2/apps/my-app/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&marathon)
        .await;

    let err = syncer(&marathon.uri(), &consul.uri(), consul.address().port())
        .sync_apps(false)
        .await
        .unwrap_err();
    assert!(
        matches!(err, BridgeError::Schema { field, .. } if field == "tasks"),
        "expected Schema error, got {:?}",
        err
    );
}
