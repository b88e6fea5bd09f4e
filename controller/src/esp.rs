use core::convert::TryInto;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use ds18b20::{Ds18b20, Resolution};
use embedded_svc::{
    http::Method,
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    delay::Ets,
    gpio::{AnyIOPin, AnyOutputPin, Input, InputOutput, Output, PinDriver, Pull},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::modem::Modem,
    hal::prelude::Peripherals,
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, LwtConfiguration, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs},
    ota::EspOta,
    wifi::{BlockingWifi, EspWifi},
};
use log::{debug, info, warn};
use one_wire_bus::{Address, OneWire};
use serde::Serialize;

use pool_common::{
    config::{
        apply_network_update, validate_network_update, NetworkConfig, NetworkConfigUpdate,
        NetworkConfigView,
    },
    dispatch,
    ota::{validate_ota_apply_request, OtaApplyRequest, OtaProgress},
    types::{ControllerStatus, ValveRequest},
    Command, CommandError, ControllerConfig, HardwareConfig, ProbeScan, RuntimeConfig,
    SensorReading, StatusMessage, TemperatureReport, ValveAction, ValveController, ValveFeedback,
    ValvePosition, AVAILABILITY_OFFLINE, AVAILABILITY_ONLINE, TOPIC_AVAILABILITY, TOPIC_COMMANDS,
    TOPIC_STATE, TOPIC_STATUS, TOPIC_TEMPERATURE,
};

use crate::ota::{apply_ota_update, build_ota_status_response, OtaError};

const NVS_NAMESPACE: &str = "poolctl";
const NVS_RUNTIME_KEY: &str = "runtime_json";

const MAX_HTTP_BODY: usize = 4096;
const WATCHDOG_TIMEOUT_SEC: u32 = 90;
const CONTROL_TICK_MS: u64 = 200;
const SENSOR_SCAN_ATTEMPTS: u32 = 10;
const SENSOR_SCAN_RETRY_MS: u64 = 1_000;

type SharedMqtt = Arc<Mutex<EspMqttClient<'static>>>;

/// Handed from the MQTT receiver thread to the control loop. The receiver
/// must return to `next()` promptly, so it never calls the client itself.
enum MqttInbound {
    Connected,
    Command(Result<Command, CommandError>),
}

/// DS18B20 probes sharing one one-wire bus.
struct SensorBus {
    one_wire: OneWire<PinDriver<'static, AnyIOPin, InputOutput>>,
    addresses: Vec<Address>,
    policy: ProbeScan,
    pin: i32,
    delay: Ets,
}

struct ValveHardware {
    relay_regular: PinDriver<'static, AnyOutputPin, Output>,
    relay_solar: PinDriver<'static, AnyOutputPin, Output>,
    feedback_regular: PinDriver<'static, AnyIOPin, Input>,
    feedback_solar: PinDriver<'static, AnyIOPin, Input>,
}

#[derive(Clone)]
pub(crate) struct SharedState {
    config: Arc<ControllerConfig>,
    valve: Arc<Mutex<ValveController>>,
    hardware: Arc<Mutex<ValveHardware>>,
    last_report: Arc<Mutex<Option<(TemperatureReport, u64)>>>,
    pub(crate) ota: Arc<Mutex<OtaProgress>>,
    wifi_connected: Arc<AtomicBool>,
    mqtt_connected: Arc<AtomicBool>,
}

#[derive(Clone)]
pub(crate) struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

impl SensorBus {
    fn new(pin: i32, wanted: u8) -> anyhow::Result<Self> {
        let mut one_wire_pin = PinDriver::input_output_od(unsafe { AnyIOPin::new(pin) })?;
        one_wire_pin.set_pull(Pull::Up)?;
        one_wire_pin.set_high()?;

        let one_wire = OneWire::new(one_wire_pin)
            .map_err(|err| anyhow!("failed to initialize one-wire bus: {err:?}"))?;

        let mut bus = Self {
            one_wire,
            addresses: Vec::new(),
            policy: ProbeScan::new(wanted, SENSOR_SCAN_ATTEMPTS),
            pin,
            delay: Ets,
        };

        let mut attempt = 1;
        loop {
            bus.scan();
            if !bus.policy.retry_at_boot(attempt, bus.addresses.len()) {
                break;
            }
            warn!("no DS18B20 probe on GPIO{pin} (scan {attempt}/{SENSOR_SCAN_ATTEMPTS})");
            thread::sleep(Duration::from_millis(SENSOR_SCAN_RETRY_MS));
            attempt += 1;
        }

        if bus.policy.needs_rescan(bus.addresses.len()) {
            warn!(
                "found {}/{} DS18B20 probe(s) on GPIO{pin}; rescanning before reads",
                bus.addresses.len(),
                bus.policy.wanted
            );
        }

        Ok(bus)
    }

    fn scan(&mut self) {
        let mut found = Vec::new();

        for device in self.one_wire.devices(false, &mut self.delay) {
            match device {
                Ok(address) if address.family_code() == ds18b20::FAMILY_CODE => {
                    if found.len() < self.policy.wanted {
                        info!(
                            "DS18B20 ROM = {}",
                            pool_common::format_rom_address(address.0.to_le_bytes())
                        );
                        found.push(address);
                    }
                }
                Ok(address) => debug!("ignoring one-wire device {address:?}"),
                Err(err) => {
                    warn!("one-wire device scan failed: {err:?}");
                    break;
                }
            }
        }

        self.addresses = found;
    }

    fn read(&mut self) -> TemperatureReport {
        if self.policy.needs_rescan(self.addresses.len()) {
            self.scan();
        }

        if self.addresses.is_empty() {
            warn!("no DS18B20 probes on GPIO{}", self.pin);
            return TemperatureReport::default();
        }

        info!("Requesting temperatures...");
        let converted =
            ds18b20::start_simultaneous_temp_measurement(&mut self.one_wire, &mut self.delay);
        if let Err(err) = &converted {
            warn!("failed to start DS18B20 conversion: {err:?}");
        } else {
            Resolution::Bits12.delay_for_measurement_time(&mut self.delay);
        }

        let mut readings = Vec::with_capacity(self.addresses.len());
        for address in self.addresses.clone() {
            let label = pool_common::format_rom_address(address.0.to_le_bytes());
            let celsius = if converted.is_ok() {
                self.read_probe(address)
            } else {
                None
            };
            readings.push(SensorReading::new(label, celsius));
        }

        TemperatureReport::new(readings)
    }

    fn read_probe(&mut self, address: Address) -> Option<f32> {
        let sensor = match Ds18b20::new::<core::convert::Infallible>(address) {
            Ok(sensor) => sensor,
            Err(err) => {
                warn!("invalid DS18B20 address {address:?}: {err:?}");
                return None;
            }
        };

        match sensor.read_data(&mut self.one_wire, &mut self.delay) {
            Ok(data) => {
                debug!("[DS18B20 {address:?}] {:.2}°C", data.temperature);
                Some(data.temperature)
            }
            Err(err) => {
                warn!("failed to read DS18B20 {address:?}: {err:?}");
                None
            }
        }
    }
}

impl ValveHardware {
    fn new(hardware: &HardwareConfig) -> anyhow::Result<Self> {
        let relay_regular =
            PinDriver::output(unsafe { AnyOutputPin::new(hardware.relay_regular_pin) })?;
        let relay_solar =
            PinDriver::output(unsafe { AnyOutputPin::new(hardware.relay_solar_pin) })?;

        let mut feedback_regular =
            PinDriver::input(unsafe { AnyIOPin::new(hardware.feedback_regular_pin) })?;
        feedback_regular.set_pull(Pull::Down)?;
        let mut feedback_solar =
            PinDriver::input(unsafe { AnyIOPin::new(hardware.feedback_solar_pin) })?;
        feedback_solar.set_pull(Pull::Down)?;

        info!(
            "valve relays on GPIO{}/GPIO{}, feedback on GPIO{}/GPIO{}",
            hardware.relay_regular_pin,
            hardware.relay_solar_pin,
            hardware.feedback_regular_pin,
            hardware.feedback_solar_pin
        );

        Ok(Self {
            relay_regular,
            relay_solar,
            feedback_regular,
            feedback_solar,
        })
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.relay_regular.set_low()?;
        self.relay_solar.set_low()?;
        Ok(())
    }

    fn drive(&mut self, position: ValvePosition) -> anyhow::Result<()> {
        match position {
            ValvePosition::Regular => self.relay_regular.set_high()?,
            ValvePosition::Solar => self.relay_solar.set_high()?,
        }
        Ok(())
    }

    fn feedback(&self) -> ValveFeedback {
        ValveFeedback {
            regular: self.feedback_regular.is_high(),
            solar: self.feedback_solar.is_high(),
        }
    }
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);

    info!(
        "NVS config loaded: ssid=`{}`, mqtt=`{}:{}`, client=`{}`",
        runtime.network.wifi_ssid,
        runtime.network.mqtt_host,
        runtime.network.mqtt_port,
        runtime.network.mqtt_client_id,
    );

    let Peripherals { modem, .. } = Peripherals::take()?;

    let mut valve = ValveController::new(&runtime.controller);
    let mut hardware =
        ValveHardware::new(&runtime.hardware).context("failed to initialize valve GPIO")?;
    for action in valve.release_all() {
        if action == ValveAction::Release {
            hardware.release()?;
        }
    }

    let mut sensors = SensorBus::new(runtime.hardware.one_wire_pin, runtime.hardware.sensor_count)
        .context("failed to initialize one-wire bus")?;

    let wifi = connect_wifi(modem, sys_loop, nvs_partition, &runtime)?;
    disable_wifi_power_save();

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;

    let state = SharedState {
        config: Arc::new(runtime.controller.clone()),
        valve: Arc::new(Mutex::new(valve)),
        hardware: Arc::new(Mutex::new(hardware)),
        last_report: Arc::new(Mutex::new(None)),
        ota: Arc::new(Mutex::new(OtaProgress::default())),
        wifi_connected: Arc::new(AtomicBool::new(true)),
        mqtt_connected: Arc::new(AtomicBool::new(false)),
    };

    let (mqtt_client, mqtt_conn) =
        create_mqtt_client(&runtime.network, runtime.controller.mqtt_retry_delay_ms)?;
    let mqtt = Arc::new(Mutex::new(mqtt_client));

    let (inbox_tx, inbox) = mpsc::channel();
    spawn_mqtt_receiver(state.clone(), mqtt_conn, inbox_tx);

    let server = create_http_server(state.clone(), nvs_store, mqtt.clone())?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    run_control_loop(&state, &mqtt, &inbox, &mut sensors)
}

fn run_control_loop(
    state: &SharedState,
    mqtt: &SharedMqtt,
    inbox: &mpsc::Receiver<MqttInbound>,
    sensors: &mut SensorBus,
) -> anyhow::Result<()> {
    add_current_task_to_watchdog()?;

    let mut wifi_disconnected_since: Option<Instant> = None;
    let mut last_temperature_publish_ms: Option<u64> = None;
    let mut last_state_publish_ms: Option<u64> = None;

    loop {
        feed_watchdog();
        maintain_wifi_health(state, &mut wifi_disconnected_since);

        while let Ok(inbound) = inbox.try_recv() {
            handle_inbound(state, mqtt, inbound);
        }

        let now_ms = monotonic_ms();
        let feedback = state.hardware.lock().unwrap().feedback();
        let actions = state.valve.lock().unwrap().poll(feedback, now_ms);
        execute_valve_actions(state, mqtt, actions);

        if is_due(
            last_temperature_publish_ms,
            now_ms,
            state.config.temperature_publish_interval_ms,
        ) {
            last_temperature_publish_ms = Some(now_ms);
            let report = sensors.read();
            if let Err(err) = publish_temperature(mqtt, &report) {
                warn!("temperature publish failed: {err:#}");
            }
            *state.last_report.lock().unwrap() = Some((report, monotonic_ms()));
        }

        if is_due(
            last_state_publish_ms,
            now_ms,
            state.config.state_publish_interval_ms,
        ) {
            last_state_publish_ms = Some(now_ms);
            if let Err(err) = publish_state(state, mqtt) {
                warn!("valve state publish failed: {err:#}");
            }
        }

        thread::sleep(Duration::from_millis(CONTROL_TICK_MS));
    }
}

fn is_due(last_ms: Option<u64>, now_ms: u64, interval_ms: u64) -> bool {
    last_ms.is_none_or(|last| now_ms.saturating_sub(last) >= interval_ms)
}

fn execute_valve_actions(state: &SharedState, mqtt: &SharedMqtt, actions: Vec<ValveAction>) {
    for action in actions {
        match action {
            ValveAction::Release => {
                if let Err(err) = state.hardware.lock().unwrap().release() {
                    warn!("failed to release valve relays: {err:#}");
                }
            }
            ValveAction::Drive(position) => {
                info!("Setting valve to {}", position.as_str());
                if let Err(err) = state.hardware.lock().unwrap().drive(position) {
                    warn!("failed to drive valve relay: {err:#}");
                }
            }
            ValveAction::Notify(event) => {
                info!("valve event: {event:?}");
                if let Err(err) = publish_status(mqtt, &event.status_message()) {
                    warn!("status publish failed: {err:#}");
                }
                if let Err(err) = publish_state(state, mqtt) {
                    warn!("valve state publish failed: {err:#}");
                }
            }
        }
    }
}

fn publish_status(mqtt: &SharedMqtt, status: &StatusMessage) -> anyhow::Result<()> {
    let payload = status.to_json();
    mqtt.lock()
        .unwrap()
        .publish(TOPIC_STATUS, QoS::AtLeastOnce, false, payload.as_bytes())?;
    Ok(())
}

fn publish_temperature(mqtt: &SharedMqtt, report: &TemperatureReport) -> anyhow::Result<()> {
    if report.is_empty() {
        return Ok(());
    }

    let payload = serde_json::to_vec(report)?;
    mqtt.lock()
        .unwrap()
        .publish(TOPIC_TEMPERATURE, QoS::AtLeastOnce, false, &payload)?;
    info!("Published temperature report");
    Ok(())
}

fn publish_state(state: &SharedState, mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let payload = {
        let valve = state.valve.lock().unwrap();
        serde_json::to_vec(&valve.state_payload(monotonic_ms()))?
    };
    mqtt.lock()
        .unwrap()
        .publish(TOPIC_STATE, QoS::AtLeastOnce, true, &payload)?;
    Ok(())
}

fn create_mqtt_client(
    network: &NetworkConfig,
    retry_delay_ms: u64,
) -> anyhow::Result<(EspMqttClient<'static>, EspMqttConnection)> {
    let url = format!("mqtt://{}:{}", network.mqtt_host, network.mqtt_port);

    let conf = MqttClientConfiguration {
        client_id: Some(network.mqtt_client_id.as_str()),
        username: if network.mqtt_user.is_empty() {
            None
        } else {
            Some(network.mqtt_user.as_str())
        },
        password: if network.mqtt_pass.is_empty() {
            None
        } else {
            Some(network.mqtt_pass.as_str())
        },
        lwt: Some(LwtConfiguration {
            topic: TOPIC_AVAILABILITY,
            payload: AVAILABILITY_OFFLINE.as_bytes(),
            qos: QoS::AtLeastOnce,
            retain: true,
        }),
        keep_alive_interval: Some(Duration::from_secs(60)),
        reconnect_timeout: Some(Duration::from_millis(retry_delay_ms)),
        ..Default::default()
    };

    info!("Attempting MQTT connection to {url}");
    Ok(EspMqttClient::new(url.as_str(), &conf)?)
}

fn announce(mqtt: &SharedMqtt) -> anyhow::Result<()> {
    let mut client = mqtt.lock().unwrap();
    client.subscribe(TOPIC_COMMANDS, QoS::AtMostOnce)?;
    info!("Subscribed to '{TOPIC_COMMANDS}'");
    client.publish(
        TOPIC_AVAILABILITY,
        QoS::AtLeastOnce,
        true,
        AVAILABILITY_ONLINE.as_bytes(),
    )?;
    client.publish(
        TOPIC_STATUS,
        QoS::AtLeastOnce,
        false,
        StatusMessage::announcement().to_json().as_bytes(),
    )?;
    Ok(())
}

fn spawn_mqtt_receiver(
    state: SharedState,
    mut conn: EspMqttConnection,
    inbox: mpsc::Sender<MqttInbound>,
) {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let inbound = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => {
                        info!("mqtt connected");
                        state.mqtt_connected.store(true, Ordering::Relaxed);
                        Some(MqttInbound::Connected)
                    }
                    EventPayload::Disconnected => {
                        state.mqtt_connected.store(false, Ordering::Relaxed);
                        warn!(
                            "mqtt disconnected; client retries in {}s",
                            state.config.mqtt_retry_delay_ms / 1000
                        );
                        None
                    }
                    // Only complete payloads carry a parsable command.
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details: Details::Complete,
                        ..
                    } => dispatch(topic, data).map(MqttInbound::Command),
                    _ => None,
                },
                Err(err) => {
                    state.mqtt_connected.store(false, Ordering::Relaxed);
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_millis(state.config.mqtt_retry_delay_ms));
                    None
                }
            };

            if let Some(inbound) = inbound {
                if inbox.send(inbound).is_err() {
                    warn!("control loop gone; stopping mqtt receiver");
                    break;
                }
            }
        })
        .expect("failed to spawn mqtt receiver thread");
}

fn handle_inbound(state: &SharedState, mqtt: &SharedMqtt, inbound: MqttInbound) {
    match inbound {
        MqttInbound::Connected => {
            if let Err(err) = announce(mqtt) {
                warn!("mqtt subscribe/announce failed: {err:#}");
            }
        }
        MqttInbound::Command(Ok(command @ Command::Reboot)) => {
            info!("Rebooting device");
            if let Some(status) = command.acknowledgement() {
                if let Err(err) = publish_status(mqtt, &status) {
                    warn!("status publish failed: {err:#}");
                }
            }
            schedule_restart(Duration::from_millis(500));
        }
        MqttInbound::Command(Ok(Command::Valve(position))) => {
            info!("Switching valve to {}", position.as_str());
            let actions = state
                .valve
                .lock()
                .unwrap()
                .command(position, monotonic_ms());
            execute_valve_actions(state, mqtt, actions);
        }
        MqttInbound::Command(Err(err)) => {
            warn!("rejected mqtt command: {err}");
            if let Err(err) = publish_status(mqtt, &err.status_message()) {
                warn!("status publish failed: {err:#}");
            }
        }
    }
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
    mqtt: SharedMqtt,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            let payload = build_status(&state);
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        let mqtt = mqtt.clone();
        server.fn_handler::<anyhow::Error, _>("/api/valve", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: ValveRequest = match serde_json::from_slice(&body) {
                Ok(request) => request,
                Err(_) => return write_error(req, 400, "body must be {\"position\": \"...\"}"),
            };

            let position = ValvePosition::from_command(&request.position);
            let actions = state
                .valve
                .lock()
                .unwrap()
                .command(position, monotonic_ms());
            execute_valve_actions(&state, &mqtt, actions);

            let payload = state.valve.lock().unwrap().state_payload(monotonic_ms());
            write_json(req, &payload)
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Get, move |req| {
            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            write_json(req, &NetworkConfigView::from(&runtime.network))
        })?;
    }

    {
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/network", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let update: NetworkConfigUpdate =
                serde_json::from_slice(&body).context("invalid network payload")?;

            if let Err(message) = validate_network_update(&update) {
                return write_error(req, 400, message);
            }

            let mut runtime = nvs_store.load_runtime_config().unwrap_or_default();
            let payload = apply_network_update(&mut runtime.network, update);
            nvs_store.save_runtime_config(&runtime)?;
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/status", Method::Get, move |req| {
            let payload = build_ota_status_response(&state);
            write_json(req, &payload)
        })?;
    }

    {
        let state = state.clone();
        let nvs_store = nvs_store.clone();
        server.fn_handler::<anyhow::Error, _>("/api/ota/apply", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let request: OtaApplyRequest =
                serde_json::from_slice(&body).context("invalid ota payload")?;

            if let Err(message) = validate_ota_apply_request(&request) {
                return write_error(req, 400, message);
            }

            let runtime = nvs_store.load_runtime_config().unwrap_or_default();
            match apply_ota_update(&state, &runtime.network.ota_password, request) {
                Ok(payload) => write_json(req, &payload),
                Err(OtaError::InvalidPassword) => write_error(req, 403, "invalid OTA password"),
                Err(OtaError::InProgress) => {
                    write_error(req, 409, "OTA update already in progress")
                }
                Err(OtaError::Spawn(err)) => {
                    warn!("failed to start OTA apply: {err:#}");
                    write_error(req, 500, "Failed to start OTA apply")
                }
            }
        })?;
    }

    server.fn_handler::<anyhow::Error, _>("/api/restart", Method::Post, move |req| {
        schedule_restart(Duration::from_millis(500));
        write_json(req, &serde_json::json!({ "restarting": true }))
    })?;

    Ok(server)
}

fn build_status(state: &SharedState) -> ControllerStatus {
    let now_ms = monotonic_ms();
    let valve = state.valve.lock().unwrap().state_payload(now_ms);
    let (sensors, last_reading_age_ms) = match state.last_report.lock().unwrap().as_ref() {
        Some((report, at_ms)) => (report.readings.clone(), Some(now_ms.saturating_sub(*at_ms))),
        None => (Vec::new(), None),
    };

    ControllerStatus {
        valve,
        sensors,
        last_reading_age_ms,
        wifi_connected: state.wifi_connected.load(Ordering::Relaxed),
        mqtt_connected: state.mqtt_connected.load(Ordering::Relaxed),
        uptime_ms: now_ms,
    }
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message }))?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        runtime.network.wifi_ssid = option_env!("WIFI_SSID").unwrap_or_default().to_string();
    }

    if runtime.network.wifi_pass.is_empty() {
        runtime.network.wifi_pass = option_env!("WIFI_PASS").unwrap_or_default().to_string();
    }

    if let Some(host) = option_env!("MQTT_HOST") {
        if runtime.network.mqtt_host == NetworkConfig::default().mqtt_host {
            runtime.network.mqtt_host = host.to_string();
        }
    }
}

/// Brings the station up or restarts the device once every attempt failed.
#[allow(unreachable_code)]
fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    runtime: &RuntimeConfig,
) -> anyhow::Result<EspWifi<'static>> {
    let network = &runtime.network;
    let attempts = runtime.controller.wifi_connect_attempts;
    let retry_delay = Duration::from_millis(runtime.controller.wifi_retry_delay_ms);

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    if network.wifi_ssid.trim().is_empty() {
        warn!("no wifi ssid configured; set WIFI_SSID at build time or via /api/network");
    }

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("Connecting to `{}`", network.wifi_ssid);

    for attempt in 1..=attempts {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                match wifi.wifi().sta_netif().get_ip_info() {
                    Ok(ip_info) => info!("WiFi connected, IP address: {}", ip_info.ip),
                    Err(err) => warn!("WiFi connected but IP info unavailable: {err:?}"),
                }
                drop(wifi);
                return Ok(esp_wifi);
            }
            Err(err) => {
                warn!("wifi connect attempt {attempt}/{attempts} failed: {err:#}");
                let _ = wifi.disconnect();
                thread::sleep(retry_delay);
            }
        }
    }

    warn!("wifi unavailable after {attempts} attempts; restarting device");
    thread::sleep(Duration::from_millis(100));
    unsafe { esp_idf_svc::sys::esp_restart() };
    Err(anyhow!("restart after wifi failure did not take effect"))
}

pub(crate) fn schedule_restart(delay: Duration) {
    let spawned = thread::Builder::new()
        .name("restart-request".into())
        .spawn(move || {
            thread::sleep(delay);
            unsafe { esp_idf_svc::sys::esp_restart() };
        });

    if let Err(err) = spawned {
        warn!("failed to spawn restart thread ({err}); restarting now");
        unsafe { esp_idf_svc::sys::esp_restart() };
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => {
                let mut runtime = serde_json::from_str::<RuntimeConfig>(value)?;
                runtime.sanitize();
                Ok(runtime)
            }
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}

fn disable_wifi_power_save() {
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_set_ps(0) };
    if rc == esp_idf_svc::sys::ESP_OK {
        info!("wifi power save disabled");
    } else {
        warn!("failed to disable wifi power save: esp_err_t={rc}");
    }
}

fn is_wifi_station_connected() -> bool {
    let mut ap_info = esp_idf_svc::sys::wifi_ap_record_t::default();
    let rc = unsafe { esp_idf_svc::sys::esp_wifi_sta_get_ap_info(&mut ap_info) };
    rc == esp_idf_svc::sys::ESP_OK
}

fn maintain_wifi_health(state: &SharedState, wifi_disconnected_since: &mut Option<Instant>) {
    let connected = is_wifi_station_connected();
    state.wifi_connected.store(connected, Ordering::Relaxed);

    if connected {
        *wifi_disconnected_since = None;
        return;
    }

    let grace_ms = state.config.wifi_restart_grace_ms;
    match wifi_disconnected_since {
        Some(disconnected_since)
            if disconnected_since.elapsed().as_millis() as u64 >= grace_ms =>
        {
            warn!(
                "wifi disconnected for {}s; restarting device for recovery",
                grace_ms / 1000
            );
            thread::sleep(Duration::from_millis(100));
            unsafe { esp_idf_svc::sys::esp_restart() };
        }
        Some(_) => {}
        None => {
            warn!("wifi connection lost; reconnecting");
            let rc = unsafe { esp_idf_svc::sys::esp_wifi_connect() };
            if rc != esp_idf_svc::sys::ESP_OK {
                warn!("wifi reconnect request failed: esp_err_t={rc}");
            }
            *wifi_disconnected_since = Some(Instant::now());
        }
    }
}

pub(crate) fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
