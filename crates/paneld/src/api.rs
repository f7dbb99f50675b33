//! HTTP control surface.
//!
//! Every response body carries `success`; a failed operation answers with
//! status 500 and `success: false`, including requests with the wrong method.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::Query;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::MethodRouter;
use axum::routing::get;
use axum::routing::post;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use crate::daemon::Context;
use crate::device;
use crate::events::BusEvent;
use crate::settings::SettingValue;
use crate::settings::keys;
use crate::watchdog;

/// JSON reply whose status follows its `success` field
struct ApiResponse(Value);

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        let status = if self.0["success"] == true {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (status, Json(self.0)).into_response()
    }
}

fn success(fields: Value) -> ApiResponse {
    let mut body = json!({ "success": true });
    if let (Some(map), Value::Object(extra)) = (body.as_object_mut(), fields) {
        map.extend(extra);
    }
    ApiResponse(body)
}

fn failure(error: impl std::fmt::Display) -> ApiResponse {
    ApiResponse(json!({ "success": false, "error": error.to_string() }))
}

/// Unwrap a JSON body, turning a rejected body into a failure reply
fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiResponse> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => {
            tracing::debug!("Rejected request body: {}", rejection);
            Err(failure(rejection.body_text()))
        }
    }
}

async fn invalid_method() -> ApiResponse {
    failure("Invalid request method")
}

fn with_fallback(route: MethodRouter<Arc<Context>>) -> MethodRouter<Arc<Context>> {
    route.fallback(invalid_method)
}

#[tracing::instrument(skip(ctx))]
async fn hello(State(ctx): State<Arc<Context>>) -> impl IntoResponse {
    Json(ctx.session.hello_document())
}

/// Host and broker identity, for debugging
#[tracing::instrument(skip(ctx))]
async fn info(State(ctx): State<Arc<Context>>) -> ApiResponse {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    success(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "hostname": hostname,
        "clientId": ctx.session.client_id(),
        "mqtt": ctx.session.state().to_string(),
        "display": ctx.actuation.dim_state().to_string(),
    }))
}

#[tracing::instrument(skip(ctx))]
async fn get_settings(State(ctx): State<Arc<Context>>) -> ApiResponse {
    success(json!({ "settings": ctx.settings.all() }))
}

#[tracing::instrument(skip(ctx, payload))]
async fn post_settings(
    State(ctx): State<Arc<Context>>,
    payload: Result<Json<BTreeMap<String, SettingValue>>, JsonRejection>,
) -> ApiResponse {
    let values = match json_body(payload) {
        Ok(values) => values,
        Err(response) => return response,
    };
    tracing::debug!("Updating {} settings", values.len());
    if let Err(e) = ctx.settings.update(values) {
        tracing::error!("Failed to save settings: {}", e);
        return failure(e);
    }

    ctx.bus.publish(BusEvent::SettingsChanged);
    success(json!({ "settings": ctx.settings.all() }))
}

/// Relay index from `?num=`, defaulting to the first relay
fn relay_num(query: &HashMap<String, String>) -> Result<usize, Response> {
    match query.get("num") {
        None => Ok(0),
        Some(raw) => raw
            .parse()
            .map_err(|_| (StatusCode::BAD_REQUEST, "Invalid num").into_response()),
    }
}

#[tracing::instrument(skip(ctx))]
async fn get_relay(
    State(ctx): State<Arc<Context>>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let num = match relay_num(&query) {
        Ok(num) => num,
        Err(response) => return response,
    };

    match ctx.hardware.relay(num) {
        Ok(state) => success(json!({ "state": state })),
        Err(e) => failure(e),
    }
    .into_response()
}

#[derive(Debug, Deserialize)]
struct RelayRequest {
    state: bool,
    num: Option<usize>,
}

#[tracing::instrument(skip(ctx))]
async fn set_relay(
    State(ctx): State<Arc<Context>>,
    Query(query): Query<HashMap<String, String>>,
    payload: Result<Json<RelayRequest>, JsonRejection>,
) -> Response {
    let request = match json_body(payload) {
        Ok(request) => request,
        Err(response) => return response.into_response(),
    };
    let num = match request.num {
        Some(num) => num,
        None => match relay_num(&query) {
            Ok(num) => num,
            Err(response) => return response,
        },
    };

    match ctx.session.switch_relay(num, request.state).await {
        Ok(state) => success(json!({ "state": state })),
        Err(e) => failure(e),
    }
    .into_response()
}

#[tracing::instrument(skip(ctx))]
async fn get_temperature(State(ctx): State<Arc<Context>>) -> ApiResponse {
    match device::read_climate(ctx.hardware.as_ref(), ctx.model) {
        Ok(climate) => success(json!({ "temperature": climate.temperature })),
        Err(e) => failure(e),
    }
}

#[tracing::instrument(skip(ctx))]
async fn get_humidity(State(ctx): State<Arc<Context>>) -> ApiResponse {
    match device::read_climate(ctx.hardware.as_ref(), ctx.model) {
        Ok(climate) => success(json!({ "humidity": climate.humidity })),
        Err(e) => failure(e),
    }
}

#[tracing::instrument(skip(ctx))]
async fn get_lux(State(ctx): State<Arc<Context>>) -> ApiResponse {
    success(json!({ "lux": ctx.sensors.last_lux() }))
}

#[tracing::instrument(skip(ctx))]
async fn get_proximity(State(ctx): State<Arc<Context>>) -> ApiResponse {
    if !ctx.sensors.proximity_supported() {
        return failure(format!("{} has no proximity sensor", ctx.model.friendly_name));
    }
    success(json!({ "distance": ctx.sensors.last_distance() }))
}

#[tracing::instrument(skip(ctx))]
async fn wake(State(ctx): State<Arc<Context>>) -> ApiResponse {
    ctx.actuation.wake().await;
    success(json!({}))
}

#[tracing::instrument(skip(ctx))]
async fn sleep(State(ctx): State<Arc<Context>>) -> ApiResponse {
    ctx.actuation.dim().await;
    success(json!({}))
}

#[derive(Debug, Deserialize)]
struct KeepAliveRequest {
    enabled: bool,
}

#[tracing::instrument(skip(ctx))]
async fn keep_alive(
    State(ctx): State<Arc<Context>>,
    payload: Result<Json<KeepAliveRequest>, JsonRejection>,
) -> ApiResponse {
    let request = match json_body(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    ctx.actuation.set_keep_alive(request.enabled).await;
    success(json!({ "enabled": request.enabled }))
}

#[tracing::instrument(skip(ctx))]
async fn reboot(State(ctx): State<Arc<Context>>) -> ApiResponse {
    match ctx.reboot.reboot(ctx.hardware.as_ref()) {
        Ok(()) => success(json!({})),
        Err(e) => {
            tracing::warn!("Reboot refused: {}", e);
            failure(e)
        }
    }
}

#[derive(Debug, Deserialize)]
struct LaunchRequest {
    package: String,
}

#[tracing::instrument]
async fn launch_app(payload: Result<Json<LaunchRequest>, JsonRejection>) -> ApiResponse {
    let request = match json_body(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    match watchdog::launch(&request.package) {
        Ok(()) => success(json!({})),
        Err(e) => failure(e),
    }
}

/// Create the router with all endpoints
pub fn create_router(ctx: Arc<Context>) -> Router {
    Router::new()
        .route("/", with_fallback(get(hello)))
        .route("/info", with_fallback(get(info)))
        .route("/settings", with_fallback(get(get_settings).post(post_settings)))
        .route("/device/relay", with_fallback(get(get_relay).post(set_relay)))
        .route("/device/getTemperature", with_fallback(get(get_temperature)))
        .route("/device/getHumidity", with_fallback(get(get_humidity)))
        .route("/device/getLux", with_fallback(get(get_lux)))
        .route("/device/getProximity", with_fallback(get(get_proximity)))
        .route("/device/wake", with_fallback(get(wake).post(wake)))
        .route("/device/sleep", with_fallback(get(sleep).post(sleep)))
        .route("/device/keepAlive", with_fallback(post(keep_alive)))
        .route("/device/reboot", with_fallback(post(reboot)))
        .route("/device/launchApp", with_fallback(post(launch_app)))
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

/// Start the HTTP server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: &str,
    port: u16,
    ctx: Arc<Context>,
    shutdown_rx: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(ctx);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP server shutting down gracefully");
        })
        .await?;

    Ok(())
}

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Starts and stops the server to follow the `httpServer` setting
pub struct HttpService {
    listen: String,
    port: u16,
    ctx: Arc<Context>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl HttpService {
    pub fn new(listen: impl Into<String>, port: u16, ctx: Arc<Context>) -> Self {
        Self {
            listen: listen.into(),
            port,
            ctx,
            running: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn reconcile(&self) {
        let enabled = self.ctx.settings.get_bool(keys::HTTP_SERVER_ENABLED);
        let mut running = self.running.lock().await;

        match (enabled, running.is_some()) {
            (true, false) => {
                let (shutdown_tx, shutdown_rx) = oneshot::channel();
                let listen = self.listen.clone();
                let port = self.port;
                let ctx = Arc::clone(&self.ctx);
                let task = tokio::spawn(async move {
                    if let Err(e) = serve(&listen, port, ctx, shutdown_rx).await {
                        tracing::error!("HTTP server error: {}", e);
                    }
                });
                *running = Some(Running { shutdown_tx, task });
            }
            (false, true) => {
                if let Some(server) = running.take() {
                    Self::shut_down(server).await;
                }
            }
            _ => {}
        }
    }

    pub async fn stop(&self) {
        if let Some(server) = self.running.lock().await.take() {
            Self::shut_down(server).await;
        }
    }

    async fn shut_down(server: Running) {
        let _ = server.shutdown_tx.send(());
        if let Err(e) = server.task.await {
            tracing::error!("HTTP server task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;
    use crate::actuation::DimState;
    use crate::daemon::test_context;

    async fn call(ctx: &Arc<Context>, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = create_router(Arc::clone(ctx)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, value)
    }

    #[tokio::test]
    async fn test_hello() {
        let t = test_context("Blake");
        let (status, body) = call(&t.ctx, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["modelName"], "Blake");
        assert_eq!(body["numOfButtons"], 4);
    }

    #[tokio::test]
    async fn test_relay_read_and_switch() {
        let t = test_context("Stargate");

        let (status, body) = call(&t.ctx, "GET", "/device/relay", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "success": true, "state": false }));

        let (status, body) =
            call(&t.ctx, "POST", "/device/relay", Some(json!({ "state": true }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], true);
        assert!(t.hardware.relays.lock().unwrap()[0]);
    }

    #[tokio::test]
    async fn test_relay_num_validation() {
        let t = test_context("Stargate");

        let (status, body) = call(&t.ctx, "GET", "/device/relay?num=abc", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, Value::String("Invalid num".to_string()));

        let (status, body) = call(&t.ctx, "GET", "/device/relay?num=3", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
    }

    /// Send a raw body, optionally without a JSON content type
    async fn call_raw(ctx: &Arc<Context>, uri: &str, body: &str, json: bool) -> (StatusCode, Value) {
        let mut request = Request::builder().method("POST").uri(uri);
        if json {
            request = request.header("content-type", "application/json");
        }
        let request = request.body(Body::from(body.to_string())).unwrap();

        let response = create_router(Arc::clone(ctx)).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_bad_bodies_are_failures() {
        let t = test_context("Stargate");

        let (status, body) =
            call(&t.ctx, "POST", "/device/relay", Some(json!({}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);
        assert!(body["error"].as_str().unwrap().contains("state"));

        let (status, body) = call_raw(&t.ctx, "/device/relay", "", false).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        let (status, body) = call_raw(&t.ctx, "/device/keepAlive", "not json", true).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        let (status, body) = call_raw(&t.ctx, "/device/launchApp", "[1, 2]", true).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        let (status, body) = call_raw(&t.ctx, "/settings", "{\"brightness\": [1]}", true).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        assert!(!t.hardware.relays.lock().unwrap()[0]);
        assert!(!t.ctx.actuation.keep_alive_active());
    }

    #[tokio::test]
    async fn test_sensor_reads() {
        let t = test_context("Stargate");

        let (_, body) = call(&t.ctx, "GET", "/device/getTemperature", None).await;
        assert_eq!(body["temperature"], 22.3);
        let (_, body) = call(&t.ctx, "GET", "/device/getHumidity", None).await;
        assert_eq!(body["humidity"], 57.0);
        let (_, body) = call(&t.ctx, "GET", "/device/getLux", None).await;
        assert_eq!(body["lux"], 0.0);

        let (status, body) = call(&t.ctx, "GET", "/device/getProximity", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        *t.hardware.climate.lock().unwrap() = None;
        let (status, _) = call(&t.ctx, "GET", "/device/getTemperature", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_proximity_on_supported_model() {
        let t = test_context("Atlantis");
        t.ctx.sensors.on_proximity(1.5);
        let (status, body) = call(&t.ctx, "GET", "/device/getProximity", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["distance"], 1.5);
    }

    #[tokio::test]
    async fn test_settings_roundtrip_broadcasts_change() {
        let t = test_context("Stargate");
        let mut rx = t.ctx.bus.subscribe();

        let (status, body) = call(
            &t.ctx,
            "POST",
            "/settings",
            Some(json!({ "brightness": 120, "debugKeys": true, "mqttBroker": "broker.lan" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["settings"]["brightness"], 120);
        assert_eq!(rx.try_recv().unwrap(), BusEvent::SettingsChanged);

        let (_, body) = call(&t.ctx, "GET", "/settings", None).await;
        assert_eq!(body["settings"]["debugKeys"], true);
        assert_eq!(body["settings"]["mqttBroker"], "broker.lan");
    }

    #[tokio::test]
    async fn test_sleep_wake_and_keep_alive() {
        let t = test_context("Stargate");

        let (status, _) = call(&t.ctx, "POST", "/device/sleep", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.ctx.actuation.dim_state(), DimState::Dimmed);

        let (status, _) = call(&t.ctx, "GET", "/device/wake", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.ctx.actuation.dim_state(), DimState::Awake);

        let (status, _) =
            call(&t.ctx, "POST", "/device/keepAlive", Some(json!({ "enabled": true }))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(t.ctx.actuation.keep_alive_active());
    }

    #[tokio::test]
    async fn test_wrong_method_is_failure() {
        let t = test_context("Stargate");

        let (status, body) = call(&t.ctx, "GET", "/device/reboot", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], false);

        let (status, _) = call(&t.ctx, "DELETE", "/device/wake", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reboot_is_rate_limited() {
        let t = test_context("Stargate");

        let (status, body) = call(&t.ctx, "POST", "/device/reboot", None).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("wait"));
        assert_eq!(t.hardware.reboots.load(Ordering::SeqCst), 0);

        tokio::time::advance(std::time::Duration::from_secs(21)).await;
        let (status, _) = call(&t.ctx, "POST", "/device/reboot", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.hardware.reboots.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_info() {
        let t = test_context("Stargate");
        let (status, body) = call(&t.ctx, "GET", "/info", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["mqtt"], "Disconnected");
        assert_eq!(body["display"], "Awake");
        assert_eq!(body["clientId"], t.ctx.session.client_id());
    }

    #[tokio::test]
    async fn test_service_follows_setting() {
        let t = test_context("Stargate");
        let service = HttpService::new("127.0.0.1", 0, Arc::clone(&t.ctx));

        service.reconcile().await;
        assert!(service.is_running().await);

        t.ctx.settings.set(keys::HTTP_SERVER_ENABLED, false).unwrap();
        service.reconcile().await;
        assert!(!service.is_running().await);

        service.stop().await;
    }
}
