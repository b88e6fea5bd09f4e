use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, LastWill, MqttOptions, QoS};
use serde::Serialize;
use tokio::{
    net::TcpListener,
    sync::{mpsc, Mutex},
};
use tracing::{debug, info, warn};

use pool_common::{
    config::{apply_network_update, validate_network_update, NetworkConfigUpdate, NetworkConfigView},
    dispatch,
    ota::OtaStatusResponse,
    types::{ControllerStatus, ValveRequest},
    Command, ControllerConfig, RuntimeConfig, SensorReading, StatusMessage, TemperatureReport,
    ValveAction, ValveController, ValveFeedback, ValvePosition, AVAILABILITY_OFFLINE,
    AVAILABILITY_ONLINE, TOPIC_AVAILABILITY, TOPIC_COMMANDS, TOPIC_STATE, TOPIC_STATUS,
    TOPIC_TEMPERATURE,
};

const CONTROL_TICK_MS: u64 = 200;
const DEFAULT_VALVE_TRAVEL_MS: u64 = 5_000;
const OUTBOX_CAPACITY: usize = 256;
const SIMULATED_ADDRESSES: [[u8; 8]; 2] = [
    [0x28, 0x61, 0x64, 0x12, 0x3c, 0x7e, 0x21, 0x5a],
    [0x28, 0x61, 0x64, 0x12, 0x3f, 0x02, 0x9b, 0x11],
];

#[derive(Clone)]
struct AppState {
    config: Arc<ControllerConfig>,
    valve: Arc<Mutex<ValveController>>,
    hardware: Arc<Mutex<SimulatedValve>>,
    last_report: Arc<Mutex<Option<(TemperatureReport, u64)>>>,
    mqtt_connected: Arc<AtomicBool>,
    mqtt: AsyncClient,
    outbox: mpsc::Sender<Publication>,
    store: AppStore,
}

/// One message waiting for the publisher task.
#[derive(Debug)]
struct Publication {
    topic: &'static str,
    retain: bool,
    payload: Vec<u8>,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

/// Relay outputs and end-stop inputs of a valve that needs `travel_ms` to
/// move between its two positions.
#[derive(Debug)]
struct SimulatedValve {
    travel_ms: u64,
    resting: Option<ValvePosition>,
    driving: Option<(ValvePosition, u64)>,
}

impl SimulatedValve {
    fn new(travel_ms: u64) -> Self {
        Self {
            travel_ms,
            resting: Some(ValvePosition::Regular),
            driving: None,
        }
    }

    fn release(&mut self, now_ms: u64) {
        if let Some((target, since_ms)) = self.driving.take() {
            if now_ms.saturating_sub(since_ms) >= self.travel_ms {
                self.resting = Some(target);
            }
        }
    }

    fn drive(&mut self, target: ValvePosition, now_ms: u64) {
        if self.resting != Some(target) {
            self.resting = None;
        }
        self.driving = Some((target, now_ms));
    }

    fn feedback(&self, now_ms: u64) -> ValveFeedback {
        let position = match self.driving {
            Some((target, since_ms)) if now_ms.saturating_sub(since_ms) >= self.travel_ms => {
                Some(target)
            }
            _ => self.resting,
        };

        ValveFeedback {
            regular: position == Some(ValvePosition::Regular),
            solar: position == Some(ValvePosition::Solar),
        }
    }
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or(runtime.network.mqtt_host.clone());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.network.mqtt_port);

    let mut mqtt_options = MqttOptions::new(
        runtime.network.mqtt_client_id.clone(),
        mqtt_host.clone(),
        mqtt_port,
    );
    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_last_will(LastWill::new(
        TOPIC_AVAILABILITY,
        AVAILABILITY_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or(runtime.network.mqtt_user.clone());
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or(runtime.network.mqtt_pass.clone());
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);
    info!("mqtt broker {mqtt_host}:{mqtt_port}");

    let travel_ms = std::env::var("POOL_SIM_VALVE_TRAVEL_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_VALVE_TRAVEL_MS);

    let mut valve = ValveController::new(&runtime.controller);
    let mut hardware = SimulatedValve::new(travel_ms);
    for action in valve.release_all() {
        if action == ValveAction::Release {
            hardware.release(monotonic_ms());
        }
    }

    let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let app_state = AppState {
        config: Arc::new(runtime.controller.clone()),
        valve: Arc::new(Mutex::new(valve)),
        hardware: Arc::new(Mutex::new(hardware)),
        last_report: Arc::new(Mutex::new(None)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
        mqtt: mqtt.clone(),
        outbox,
        store,
    };

    spawn_publisher(mqtt, outbox_rx);
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_control_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/valve", post(handle_set_valve))
        .route(
            "/api/network",
            get(handle_get_network).put(handle_put_network),
        )
        .route("/api/ota/status", get(handle_get_ota_status))
        .route("/api/ota/apply", post(handle_post_ota_apply))
        .route("/api/restart", post(handle_restart))
        .with_state(app_state);

    let port = std::env::var("POOL_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind controller server at {addr}"))?;

    info!("pool controller listening on http://{addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    // Never awaits the client: only this loop drains its request queue.
                    handle_mqtt_message(&app_state, &message.topic, &message.payload).await;
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                    app_state.mqtt_connected.store(true, Ordering::Relaxed);
                    // The event loop must keep polling for these requests to go out.
                    tokio::spawn(announce(app_state.clone()));
                }
                Ok(_) => {}
                Err(err) => {
                    app_state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!(
                        "mqtt poll error: {err}; retrying in {}s",
                        app_state.config.mqtt_retry_delay_ms / 1000
                    );
                    tokio::time::sleep(Duration::from_millis(app_state.config.mqtt_retry_delay_ms))
                        .await;
                }
            }
        }
    });
}

async fn announce(app_state: AppState) {
    if let Err(err) = app_state
        .mqtt
        .subscribe(TOPIC_COMMANDS, QoS::AtMostOnce)
        .await
    {
        warn!("mqtt subscribe failed: {err}");
        return;
    }
    info!("subscribed to `{TOPIC_COMMANDS}`");

    enqueue(
        &app_state,
        TOPIC_AVAILABILITY,
        true,
        AVAILABILITY_ONLINE.as_bytes().to_vec(),
    );
    publish_status(&app_state, StatusMessage::announcement());
}

fn spawn_publisher(mqtt: AsyncClient, mut outbox: mpsc::Receiver<Publication>) {
    tokio::spawn(async move {
        while let Some(publication) = outbox.recv().await {
            if let Err(err) = mqtt
                .publish(
                    publication.topic,
                    QoS::AtLeastOnce,
                    publication.retain,
                    publication.payload,
                )
                .await
            {
                warn!("publish to `{}` failed: {err}", publication.topic);
            }
        }
    });
}

fn enqueue(app_state: &AppState, topic: &'static str, retain: bool, payload: Vec<u8>) {
    let publication = Publication {
        topic,
        retain,
        payload,
    };
    if let Err(err) = app_state.outbox.try_send(publication) {
        warn!("dropping publication to `{topic}`: {err}");
    }
}

fn spawn_control_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(CONTROL_TICK_MS));
        let mut last_temperature_publish_ms: Option<u64> = None;
        let mut last_state_publish_ms: Option<u64> = None;
        let mut tick: u64 = 0;

        loop {
            interval.tick().await;
            let now_ms = monotonic_ms();

            let feedback = app_state.hardware.lock().await.feedback(now_ms);
            let actions = app_state.valve.lock().await.poll(feedback, now_ms);
            execute_valve_actions(&app_state, actions).await;

            if is_due(
                last_temperature_publish_ms,
                now_ms,
                app_state.config.temperature_publish_interval_ms,
            ) {
                last_temperature_publish_ms = Some(now_ms);
                tick = tick.saturating_add(1);
                let report = simulated_report(tick);
                publish_temperature(&app_state, &report);
                *app_state.last_report.lock().await = Some((report, now_ms));
            }

            if is_due(
                last_state_publish_ms,
                now_ms,
                app_state.config.state_publish_interval_ms,
            ) {
                last_state_publish_ms = Some(now_ms);
                publish_state(&app_state, now_ms).await;
            }
        }
    });
}

fn is_due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last_ms.is_none_or(|last| now_ms.saturating_sub(last) >= interval_ms)
}

// TODO: read real probes through the w1-therm sysfs interface when running on a Linux board.
fn simulated_report(tick: u64) -> TemperatureReport {
    let pool_c = 24.0 + ((tick % 8) as f32 * 0.125);
    let collector_c = 31.0 + ((tick % 12) as f32 * 0.25);

    TemperatureReport::new(vec![
        SensorReading::new(
            pool_common::format_rom_address(SIMULATED_ADDRESSES[0]),
            Some(pool_c),
        ),
        SensorReading::new(
            pool_common::format_rom_address(SIMULATED_ADDRESSES[1]),
            Some(collector_c),
        ),
    ])
}

async fn execute_valve_actions(app_state: &AppState, actions: Vec<ValveAction>) {
    for action in actions {
        let now_ms = monotonic_ms();
        match action {
            ValveAction::Release => {
                app_state.hardware.lock().await.release(now_ms);
                debug!("relays released");
            }
            ValveAction::Drive(position) => {
                app_state.hardware.lock().await.drive(position, now_ms);
                info!("driving valve towards {}", position.as_str());
            }
            ValveAction::Notify(event) => {
                info!("valve event: {event:?}");
                publish_status(app_state, event.status_message());
                publish_state(app_state, now_ms).await;
            }
        }
    }
}

async fn handle_mqtt_message(app_state: &AppState, topic: &str, payload: &[u8]) {
    let Some(decision) = dispatch(topic, payload) else {
        return;
    };

    match decision {
        Ok(command @ Command::Reboot) => {
            info!("reboot requested over mqtt");
            if let Some(status) = command.acknowledgement() {
                publish_status(app_state, status);
            }
            restart();
        }
        Ok(Command::Valve(position)) => {
            info!("valve command received: {}", position.as_str());
            let actions = app_state
                .valve
                .lock()
                .await
                .command(position, monotonic_ms());
            execute_valve_actions(app_state, actions).await;
        }
        Err(err) => {
            warn!("rejected mqtt command on `{topic}`: {err}");
            publish_status(app_state, err.status_message());
        }
    }
}

fn publish_status(app_state: &AppState, status: StatusMessage) {
    enqueue(app_state, TOPIC_STATUS, false, status.to_json().into_bytes());
}

fn publish_temperature(app_state: &AppState, report: &TemperatureReport) {
    match serde_json::to_vec(report) {
        Ok(body) => {
            enqueue(app_state, TOPIC_TEMPERATURE, false, body);
            debug!("temperature report queued");
        }
        Err(err) => warn!("temperature serialization failed: {err}"),
    }
}

async fn publish_state(app_state: &AppState, now_ms: u64) {
    let payload = {
        let valve = app_state.valve.lock().await;
        serde_json::to_vec(&valve.state_payload(now_ms))
    };

    match payload {
        Ok(body) => enqueue(app_state, TOPIC_STATE, true, body),
        Err(err) => warn!("valve state serialization failed: {err}"),
    }
}

/// Exits after the queued publications had time to go out.
fn restart() {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        info!("exiting for restart");
        std::process::exit(0);
    });
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let now_ms = monotonic_ms();
    let valve = state.valve.lock().await.state_payload(now_ms);
    let (sensors, last_reading_age_ms) = match state.last_report.lock().await.as_ref() {
        Some((report, at_ms)) => (report.readings.clone(), Some(now_ms.saturating_sub(*at_ms))),
        None => (Vec::new(), None),
    };

    Json(ControllerStatus {
        valve,
        sensors,
        last_reading_age_ms,
        wifi_connected: true,
        mqtt_connected: state.mqtt_connected.load(Ordering::Relaxed),
        uptime_ms: now_ms,
    })
}

async fn handle_set_valve(
    State(state): State<AppState>,
    Json(request): Json<ValveRequest>,
) -> impl IntoResponse {
    let position = ValvePosition::from_command(&request.position);
    let actions = state.valve.lock().await.command(position, monotonic_ms());
    execute_valve_actions(&state, actions).await;

    let payload = state.valve.lock().await.state_payload(monotonic_ms());
    Json(payload).into_response()
}

async fn handle_get_network(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.load_runtime_config().await {
        Ok(runtime) => Json(NetworkConfigView::from(&runtime.network)).into_response(),
        Err(err) => {
            warn!("network config load failed: {err:#}");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load config")
        }
    }
}

async fn handle_put_network(
    State(state): State<AppState>,
    Json(update): Json<NetworkConfigUpdate>,
) -> impl IntoResponse {
    if let Err(message) = validate_network_update(&update) {
        return error_response(StatusCode::BAD_REQUEST, message);
    }

    let mut runtime = match state.store.load_runtime_config().await {
        Ok(runtime) => runtime,
        Err(err) => {
            warn!("network config load failed: {err:#}");
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load config");
        }
    };

    let response = apply_network_update(&mut runtime.network, update);
    if let Err(err) = state.store.save_runtime_config(&runtime).await {
        warn!("network config save failed: {err:#}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to save config");
    }

    Json(response).into_response()
}

async fn handle_get_ota_status() -> impl IntoResponse {
    Json(OtaStatusResponse::unsupported(
        "OTA apply is only available in ESP32 builds",
    ))
}

async fn handle_post_ota_apply() -> impl IntoResponse {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "OTA apply is only available in ESP32 builds",
    )
}

async fn handle_restart(State(state): State<AppState>) -> impl IntoResponse {
    publish_status(&state, StatusMessage::ok("Restart requested"));
    restart();
    Json(serde_json::json!({ "restarting": true }))
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("POOL_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.poolctl"));

        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(&path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_common::{StatusState, ValveState};

    #[test]
    fn simulated_valve_reports_target_after_travel() {
        let mut valve = SimulatedValve::new(1_000);
        assert!(valve.feedback(0).regular);

        valve.drive(ValvePosition::Solar, 100);
        assert_eq!(valve.feedback(500), ValveFeedback::default());
        assert!(valve.feedback(1_100).solar);

        valve.release(1_200);
        assert!(valve.feedback(5_000).solar);
    }

    #[test]
    fn released_mid_travel_leaves_no_end_stop_closed() {
        let mut valve = SimulatedValve::new(1_000);
        valve.drive(ValvePosition::Solar, 0);
        valve.release(400);

        assert_eq!(valve.feedback(2_000), ValveFeedback::default());
    }

    fn test_state() -> (AppState, mpsc::Receiver<Publication>) {
        let (mqtt, _eventloop) =
            AsyncClient::new(MqttOptions::new("pool-test", "localhost", 1883), 10);
        let (outbox, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let config = ControllerConfig::default();

        let state = AppState {
            valve: Arc::new(Mutex::new(ValveController::new(&config))),
            config: Arc::new(config),
            hardware: Arc::new(Mutex::new(SimulatedValve::new(DEFAULT_VALVE_TRAVEL_MS))),
            last_report: Arc::new(Mutex::new(None)),
            mqtt_connected: Arc::new(AtomicBool::new(true)),
            mqtt,
            outbox,
            store: AppStore::new(),
        };
        (state, outbox_rx)
    }

    fn drain(outbox: &mut mpsc::Receiver<Publication>) -> Vec<Publication> {
        let mut published = Vec::new();
        while let Ok(publication) = outbox.try_recv() {
            published.push(publication);
        }
        published
    }

    #[tokio::test]
    async fn own_publications_are_ignored() {
        let (state, mut outbox) = test_state();

        handle_mqtt_message(&state, TOPIC_STATE, br#"{"state":"IDLE"}"#).await;
        handle_mqtt_message(&state, TOPIC_STATUS, br#"{"state":"OK","message":"x"}"#).await;

        assert!(drain(&mut outbox).is_empty());
        assert_eq!(state.valve.lock().await.target(), None);
    }

    #[tokio::test]
    async fn malformed_valve_payload_keeps_valve_state() {
        let (state, mut outbox) = test_state();

        handle_mqtt_message(&state, "home/garden/pool/valve", br#"{"position":"solar"}"#).await;
        drain(&mut outbox);

        handle_mqtt_message(&state, "home/garden/pool/valve", b"{\"position\":").await;

        let valve = state.valve.lock().await;
        assert_eq!(valve.state(), ValveState::Switching);
        assert_eq!(valve.target(), Some(ValvePosition::Solar));

        let published = drain(&mut outbox);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, TOPIC_STATUS);
        let status: StatusMessage = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(status.state, StatusState::Error);
    }

    #[tokio::test]
    async fn command_burst_is_applied_without_a_publisher() {
        let (state, mut outbox) = test_state();

        for _ in 0..99 {
            handle_mqtt_message(&state, "home/garden/pool/valve", br#"{"position":"regular"}"#)
                .await;
        }
        handle_mqtt_message(&state, "home/garden/pool/valve", br#"{"position":"solar"}"#).await;

        assert_eq!(state.valve.lock().await.target(), Some(ValvePosition::Solar));

        let published = drain(&mut outbox);
        assert_eq!(published.len(), 200);
        assert!(published.iter().all(|p| p.topic == TOPIC_STATUS || p.topic == TOPIC_STATE));
    }

    #[test]
    fn publish_schedule() {
        assert!(is_due(None, 0, 30_000));
        assert!(!is_due(Some(1_000), 30_999, 30_000));
        assert!(is_due(Some(1_000), 31_000, 30_000));
    }
}
