use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use relay_bridge::{router, BridgeState, HttpTransport, UpstreamClient};
use relay_core::{
    ChannelDispatcher, DeliveryMode, Destination, DispatchError, Message, Outbound,
    PipelineStats, ProbabilityGate, ProviderRegistry, RouteDispatcher, RouteTable, Segment,
    SynthesisPipeline,
};

// Dispatcher that records every outbound item, optionally after a delay
#[derive(Default)]
struct RecordingDispatcher {
    sent: Mutex<Vec<Outbound>>,
    delay_ms: u64,
}

#[async_trait]
impl RouteDispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        _destination: &Destination,
        item: Outbound,
    ) -> Result<(), DispatchError> {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
        self.sent.lock().unwrap().push(item);
        Ok(())
    }
}

type Inbox = Arc<Mutex<Vec<Message>>>;

/// Local HTTP endpoint collecting posted messages.
async fn capture_server() -> (String, Inbox) {
    let inbox: Inbox = Arc::new(Mutex::new(Vec::new()));
    let app = Router::new()
        .route(
            "/inbox",
            post(
                |State(inbox): State<Inbox>, Json(message): Json<Message>| async move {
                    inbox.lock().unwrap().push(message);
                    StatusCode::OK
                },
            ),
        )
        .with_state(inbox.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/inbox", addr), inbox)
}

async fn wait_for<F: Fn() -> bool>(check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

fn state_with(
    dispatcher: Arc<RecordingDispatcher>,
    upstream: Option<UpstreamClient>,
) -> BridgeState {
    let stats = Arc::new(PipelineStats::new(["qq"]));
    let pipeline = SynthesisPipeline::new(
        Arc::new(ProviderRegistry::new(DeliveryMode::Batch)),
        Arc::new(RouteTable::new(vec![(
            "qq".to_string(),
            "http://adapter/qq".to_string(),
        )])),
        ProbabilityGate::new(0.0).unwrap(),
        dispatcher,
        stats.clone(),
    );
    BridgeState::new(Arc::new(pipeline), stats, upstream)
}

fn json_request(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn sample_message(id: &str) -> Value {
    serde_json::json!({
        "id": id,
        "platform": "qq",
        "segment": {"type": "text", "data": "hello"},
        "format": {"content_format": ["text"], "accept_format": ["text", "voice"]}
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let app = router(state_with(Arc::new(RecordingDispatcher::default()), None));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["providers"], 0);
    assert_eq!(body["mode"], "batch");
}

#[tokio::test]
async fn messages_are_accepted_and_processed_in_background() {
    let dispatcher = Arc::new(RecordingDispatcher::default());
    let state = state_with(dispatcher.clone(), None);
    let stats = state.stats.clone();
    let app = router(state);

    let response = app
        .clone()
        .oneshot(json_request("/messages", &sample_message("m1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["message_id"], "m1");

    wait_for(|| dispatcher.sent.lock().unwrap().len() == 1).await;
    assert!(matches!(
        &dispatcher.sent.lock().unwrap()[0],
        Outbound::Text(m) if m.id == "m1"
    ));

    wait_for(|| stats.snapshot().pass_through == 1).await;
    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["handled"], 1);
    assert_eq!(body["platforms"]["qq"]["pass_through"], 1);
}

#[tokio::test]
async fn drain_waits_for_accepted_messages() {
    let dispatcher = Arc::new(RecordingDispatcher {
        delay_ms: 200,
        ..Default::default()
    });
    let state = state_with(dispatcher.clone(), None);
    let app = router(state.clone());

    let response = app
        .oneshot(json_request("/messages", &sample_message("m1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(state.inflight.count(), 1);

    assert!(state.drain(Duration::from_secs(5)).await);
    assert_eq!(state.inflight.count(), 0);
    assert_eq!(dispatcher.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn drain_gives_up_after_grace_period() {
    let dispatcher = Arc::new(RecordingDispatcher {
        delay_ms: 2_000,
        ..Default::default()
    });
    let state = state_with(dispatcher, None);
    router(state.clone())
        .oneshot(json_request("/messages", &sample_message("m1")))
        .await
        .unwrap();

    assert!(!state.drain(Duration::from_millis(50)).await);
}

#[tokio::test]
async fn unrouted_platforms_are_counted_in_one_bucket() {
    let state = state_with(Arc::new(RecordingDispatcher::default()), None);
    let stats = state.stats.clone();
    let app = router(state);

    for i in 0..3 {
        let mut message = sample_message(&format!("m{}", i));
        message["platform"] = Value::String(format!("bogus-{}", i));
        app.clone()
            .oneshot(json_request("/messages", &message))
            .await
            .unwrap();
    }
    wait_for(|| stats.snapshot().dropped == 3).await;

    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    let platforms = body["platforms"].as_object().unwrap();
    assert_eq!(platforms.len(), 2);
    assert_eq!(body["platforms"]["unrouted"]["dropped"], 3);
}

#[tokio::test]
async fn malformed_message_is_a_client_error() {
    let app = router(state_with(Arc::new(RecordingDispatcher::default()), None));
    let response = app
        .oneshot(json_request("/messages", &serde_json::json!({"id": "m1"})))
        .await
        .unwrap();
    assert!(response.status().is_client_error());
}

#[tokio::test]
async fn upstream_without_target_is_unavailable() {
    let app = router(state_with(Arc::new(RecordingDispatcher::default()), None));
    let response = app
        .oneshot(json_request("/upstream", &sample_message("u1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn upstream_forward_advertises_tts_text() {
    let (url, inbox) = capture_server().await;
    let app = router(state_with(
        Arc::new(RecordingDispatcher::default()),
        Some(UpstreamClient::new(url, 2_000)),
    ));

    let response = app
        .oneshot(json_request("/upstream", &sample_message("u1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["advertised"], true);

    let received = inbox.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].format.accept_format,
        vec!["text", "voice", "tts_text"]
    );
}

#[tokio::test]
async fn http_transport_posts_packaged_audio() {
    let (url, inbox) = capture_server().await;
    let dispatcher = ChannelDispatcher::new(HttpTransport::new(2_000), 8);
    let destination = Destination {
        platform: "qq".into(),
        endpoint: url,
    };
    let message = Arc::new(Message::new("m1", "qq", Segment::text("hello")));

    dispatcher
        .dispatch(
            &destination,
            Outbound::Audio {
                message,
                text: "hello".into(),
                audio: b"RIFF".to_vec().into(),
            },
        )
        .await
        .unwrap();

    wait_for(|| inbox.lock().unwrap().len() == 1).await;
    let delivered = inbox.lock().unwrap()[0].clone();
    assert_eq!(delivered.segment.kind, "voice");
    assert_eq!(delivered.format.content_format, vec!["voice"]);
    assert_eq!(delivered.additional_config["original_text"], "hello");
}
