//! Integration tests for the HTTP controller client
//!
//! Tests the observable HTTP contract against a mock controller:
//! - Task acquisition (200 with body, 404 as "no task")
//! - Result submission body and method
//! - Out-of-band file upload
//! - Failure classification for the retry layer


use pipeline_plugin::protocol::{ResultPayload, WorkflowType};
use pipeline_plugin::transport::{Controller, FileUpload, HttpController, TransportError};
use serde_json::json;
use test_helpers::test_config;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn controller(server: &MockServer) -> HttpController {
    let dir = tempfile::tempdir().unwrap();
    HttpController::new(&test_config(&server.uri(), dir.path())).unwrap()
}

#[tokio::test]
async fn test_fetch_task_returns_parsed_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks"))
        .and(query_param("pluginId", "ner"))
        .and(query_param("pluginInstance", "ner-pod-0"))
        .and(header("user-agent", "ner:ner-pod-0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": {
                "job": {"_id": "j-1", "workflow": {"type": "GROUP"}},
                "task": {"_id": "t-1", "metadata": {"cacheURL": "http://cache/a.tar.gz"}},
                "project": {"_id": "p-1"},
                "user": {"_id": "u-1"},
                "priority": 3
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let task = controller(&server).fetch_task().await.unwrap().unwrap();

    assert_eq!(task.task_id(), "t-1");
    assert_eq!(task.workflow_type(), WorkflowType::Group);
    assert_eq!(task.metadata.cache_url(), Some("http://cache/a.tar.gz"));
    assert_eq!(task.metadata.extra["priority"], 3);
}

#[tokio::test]
async fn test_fetch_task_404_means_no_task() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    assert!(controller(&server).fetch_task().await.unwrap().is_none());
}

#[tokio::test]
async fn test_fetch_task_failure_classification() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let controller = controller(&server);
    assert!(controller.fetch_task().await.unwrap_err().is_unavailable());
    assert!(matches!(
        controller.fetch_task().await.unwrap_err(),
        TransportError::Transient { .. }
    ));
    assert!(controller.fetch_task().await.unwrap_err().is_fatal());
}

#[tokio::test]
async fn test_connection_refused_is_unavailable() {
    // bind then drop a listener to get a port nobody listens on
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let dir = tempfile::tempdir().unwrap();
    let controller =
        HttpController::new(&test_config(&format!("http://127.0.0.1:{port}"), dir.path()))
            .unwrap();

    let err = controller.fetch_task().await.unwrap_err();

    assert!(err.is_unavailable(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_submit_result_puts_payload() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/tasks/t-1"))
        .and(header("user-agent", "ner:ner-pod-0"))
        .and(body_json(json!({
            "pluginInstance": "ner-pod-0",
            "status": "failure",
            "error": "boom"
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    controller(&server)
        .submit_result("t-1", &ResultPayload::failure("ner-pod-0", "boom"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_submit_result_404_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/v1/tasks/t-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let err = controller(&server)
        .submit_result("t-1", &ResultPayload::failure("ner-pod-0", "boom"))
        .await
        .unwrap_err();

    assert!(matches!(err, TransportError::Transient { .. }));
}

#[tokio::test]
async fn test_upload_file_sends_multipart_form() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/tasks/t-1/files"))
        .and(query_param("pluginId", "ner"))
        .and(query_param("pluginInstance", "ner-pod-0"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let upload = FileUpload {
        identifier: "entities.csv".to_string(),
        metadata: json!({"rows": 2}),
        bytes: bytes::Bytes::from_static(b"name,type\nBerlin,LOC\n"),
    };
    controller(&server).upload_file("t-1", &upload).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let request = &requests[0];
    let content_type = request.headers.get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("multipart/form-data"));

    let body = String::from_utf8_lossy(&request.body);
    assert!(body.contains("name=\"meta\""));
    assert!(body.contains(r#"{"identifier":"entities.csv","metadata":{"rows":2}}"#));
    assert!(body.contains("name=\"file\""));
    assert!(body.contains("Berlin,LOC"));
}
