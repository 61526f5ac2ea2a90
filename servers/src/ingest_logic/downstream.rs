use crate::ingest_logic::monitor::PIPELINE_STATUS;
use crate::ingest_logic::reports;
use crate::ingest_logic::state::{AppError, AppState};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        ConnectInfo, Query, Request, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use lib_common::pipeline::admission::request_key;
use lib_common::pipeline::push_gateway::OutboundFrame;
use lib_common::pipeline::Registration;
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

pub const USER_ID_HEADER: &str = "x-user-id";

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/reports/search", post(reports::search_reports))
        .route("/api/pipeline/status", get(status_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admission));

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .merge(api)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(port: u16, state: AppState, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "Downstream server listening");
    serve(listener, state, shutdown).await
}

pub async fn serve(
    listener: TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.recv().await;
        info!("Downstream server shutting down.");
    })
    .await?;
    Ok(())
}

/// `<subject>-<METHOD>-<path>`, the subject taken from the `id` query
/// parameter, then the user header.
pub fn admission_key(request: &Request) -> String {
    let from_query = Query::<HashMap<String, String>>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(params)| params.get("id").cloned());
    let from_header = || {
        request
            .headers()
            .get(USER_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let subject = from_query.or_else(from_header);
    request_key(subject.as_deref(), request.method().as_str(), request.uri().path())
}

async fn admission(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return next.run(request).await;
    }
    let permit = match state.admission.try_admit(admission_key(&request)) {
        Ok(permit) => permit,
        Err(conflict) => return AppError::from(conflict).into_response(),
    };
    let response = next.run(request).await;
    drop(permit);
    response
}

async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn status_handler(State(state): State<AppState>) -> Result<Json<Value>, AppError> {
    let status = state.dispatcher.run_task(PIPELINE_STATUS, Value::Null).await?;
    Ok(Json(status))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, remote, state))
}

async fn handle_socket(socket: WebSocket, remote: SocketAddr, state: AppState) {
    let Registration {
        id,
        generation,
        mut outbound,
        cancel,
    } = state.gateway.register(remote);
    debug!(client_id = %id, "Websocket session started");

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => {
                let message = match frame {
                    Some(OutboundFrame::Text(text)) => Message::Text(text.to_string().into()),
                    Some(OutboundFrame::Ping) => Message::Ping(Bytes::new()),
                    Some(OutboundFrame::Close) | None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    debug!(client_id = %id, error = %e, "Send failed");
                    break;
                }
            }
            _ = cancel.cancelled() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => state.gateway.handle_inbound(&id, generation, text.as_str()),
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) | Some(Ok(Message::Binary(_))) => {
                    state.gateway.mark_alive(&id, generation);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(client_id = %id, error = %e, "Websocket error");
                    break;
                }
            }
        }
    }

    if !state.gateway.deregister(&id, generation) {
        debug!(client_id = %id, "Session already replaced or terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest_logic::monitor::register_tasks;
    use axum::body::Body;
    use lib_common::connections::MemoryStore;
    use lib_common::pipeline::{
        BroadcastEnvelope, EventBus, ImageStorage, NEW_EVENT, Normalizer, PushGateway, TaskDispatcher,
        spawn_normalizer,
    };
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct Harness {
        addr: SocketAddr,
        state: AppState,
        store: Arc<MemoryStore>,
        shutdown: broadcast::Sender<()>,
        _images: tempfile::TempDir,
    }

    async fn start() -> Harness {
        let images = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let (normalizer, _thread) =
            spawn_normalizer(Normalizer::new(store.clone(), ImageStorage::new(images.path()), 1), 8).unwrap();
        let gateway = Arc::new(PushGateway::new());
        let bus = Arc::new(EventBus::<BroadcastEnvelope>::new());
        gateway.attach(&bus);
        let dispatcher = Arc::new(TaskDispatcher::start(store.clone()).unwrap());
        let state = AppState::new(gateway, bus, dispatcher, normalizer);
        register_tasks(&state);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown, rx) = broadcast::channel(1);
        tokio::spawn(serve(listener, state.clone(), rx));
        Harness {
            addr,
            state,
            store,
            shutdown,
            _images: images,
        }
    }

    fn request(method: Method, uri: &str, user: Option<&str>) -> Request {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            builder = builder.header(USER_ID_HEADER, user);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn admission_subject_prefers_query_then_header() {
        let r = request(Method::POST, "/api/reports/search?id=7", Some("9"));
        assert_eq!(admission_key(&r), "7-POST-/api/reports/search");
        let r = request(Method::POST, "/api/reports/search", Some("9"));
        assert_eq!(admission_key(&r), "9-POST-/api/reports/search");
        let r = request(Method::GET, "/api/pipeline/status?x=1", None);
        assert_eq!(admission_key(&r), "anonymous-GET-/api/pipeline/status");
    }

    #[tokio::test]
    async fn websocket_clients_get_acknowledged_and_receive_broadcasts() {
        let harness = start().await;
        let (mut socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", harness.addr))
            .await
            .unwrap();

        let ack = socket.next().await.unwrap().unwrap();
        let ack: Value = serde_json::from_str(ack.to_text().unwrap()).unwrap();
        assert_eq!(ack["type"], "CONNECTION_STATUS");
        assert_eq!(ack["data"]["status"], "connected");

        socket
            .send(WsMessage::text(r#"{"type":"ping"}"#))
            .await
            .unwrap();
        let pong: Value = serde_json::from_str(socket.next().await.unwrap().unwrap().to_text().unwrap()).unwrap();
        assert_eq!(pong["type"], "pong");

        let envelope: BroadcastEnvelope = serde_json::from_value(json!({
            "type": "ALPR",
            "data": {"eventType": "ALPR", "plateNumber": "ABC123", "confidence": 0.9, "device": "device7"}
        }))
        .unwrap();
        assert_eq!(harness.state.bus.publish(NEW_EVENT, &envelope), 1);

        let frame: Value = serde_json::from_str(socket.next().await.unwrap().unwrap().to_text().unwrap()).unwrap();
        assert_eq!(frame["data"]["plateNumber"], "ABC123");

        socket.close(None).await.unwrap();
        for _ in 0..50 {
            if harness.state.gateway.connection_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(harness.state.gateway.connection_count(), 0);
        let _ = harness.shutdown.send(());
    }

    #[tokio::test]
    async fn report_search_runs_through_the_query_executor() {
        let harness = start().await;
        harness.store.set_select_rows(vec![json!({"plateNumber": "ABC123"})]);

        let response = reqwest::Client::new()
            .post(format!("http://{}/api/reports/search", harness.addr))
            .json(&json!({"plateNumber": "ABC"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let rows: Value = response.json().await.unwrap();
        assert_eq!(rows, json!([{"plateNumber": "ABC123"}]));

        let (sql, params) = harness.store.executed_selects().pop().unwrap();
        assert!(sql.contains("ILIKE '%' || $1 || '%'"));
        assert_eq!(params, vec![json!("ABC"), json!(reports::DEFAULT_LIMIT)]);
        let _ = harness.shutdown.send(());
    }

    #[tokio::test]
    async fn malformed_search_body_gets_a_structured_error() {
        let harness = start().await;
        let response = reqwest::Client::new()
            .post(format!("http://{}/api/reports/search", harness.addr))
            .json(&json!({"minSpeed": "fast"}))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["error_type"], "BadRequest");
        assert!(body["message"].as_str().unwrap().contains("minSpeed"));
        assert!(harness.store.executed_selects().is_empty());
        assert_eq!(harness.state.admission.in_flight(), 0);
        let _ = harness.shutdown.send(());
    }

    #[tokio::test]
    async fn duplicate_in_flight_requests_are_rejected() {
        let harness = start().await;
        let client = reqwest::Client::new();
        let url = format!("http://{}/api/pipeline/status?id=42", harness.addr);

        let held = harness
            .state
            .admission
            .try_admit("42-GET-/api/pipeline/status")
            .unwrap();
        let rejected = client.get(&url).send().await.unwrap();
        assert_eq!(rejected.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
        let body: Value = rejected.json().await.unwrap();
        assert_eq!(body["error_type"], "DuplicateRequest");

        drop(held);
        let accepted = client.get(&url).send().await.unwrap();
        assert_eq!(accepted.status(), reqwest::StatusCode::OK);
        let status: Value = accepted.json().await.unwrap();
        assert_eq!(status["connections"], 0);
        assert_eq!(status["subscriptions"], json!([{"eventType": NEW_EVENT, "handlers": 1}]));
        assert_eq!(harness.state.admission.in_flight(), 0);

        let health = client.get(format!("http://{}/health", harness.addr)).send().await.unwrap();
        assert_eq!(health.text().await.unwrap(), "OK");
        let _ = harness.shutdown.send(());
    }
}
