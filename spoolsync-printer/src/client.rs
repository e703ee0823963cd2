/**
 * CLIENT - Session MQTT d'une imprimante
 *
 * RÔLE :
 * Point d'entrée public : connexion, lecture de l'état agrégé, abonnement aux
 * événements, commandes, lecture / écriture des profils de calibration.
 *
 * FONCTIONNEMENT :
 * - La pompe réseau (mqtt.rs) pousse des `TransportEvent` dans un canal mpsc
 * - Une tâche de session unique consomme ce canal : elle seule modifie l'état,
 *   le détecteur de cycle et le détecteur AMS
 * - Les lecteurs prennent un instantané sous verrou (jamais tenu à travers un await)
 * - Lecture de calibration : rendez-vous one-shot résolu par la tâche de
 *   session, timeout + retries bornés, lectures concurrentes mises en file
 */

use parking_lot::Mutex;
use rumqttc::QoS;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::calibration::{self, CalibrationWaiter, ProfileDelete, ProfileWrite};
use crate::commands::{self, PrinterCommand};
use crate::config::PrinterConfig;
use crate::error::{PrinterError, Result};
use crate::events::PrinterEvent;
use crate::family::DeviceFamily;
use crate::health::{LinkHealth, LinkHealthReport};
use crate::lifecycle::PrintLifecycle;
use crate::message_log::{Direction, LogEntry, MessageLog};
use crate::models::{CalibrationProfile, DeviceState};
use crate::mqtt::{self, Publisher, TransportEvent};
use crate::router::ReportRouter;
use crate::state::{new_state, snapshot, Shared};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const TRANSPORT_CHANNEL_CAPACITY: usize = 128;
/// Nozzle used for the unanswered first read after connect.
const PRIMING_NOZZLE: &str = "0.4";

/// Handle on one printer session. Cheap to clone.
#[derive(Clone)]
pub struct PrinterClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: PrinterConfig,
    family: DeviceFamily,
    report_topic: String,
    request_topic: String,
    state: Shared<DeviceState>,
    router: Mutex<ReportRouter>,
    publisher: Mutex<Option<Arc<dyn Publisher>>>,
    sequence: AtomicU64,
    log: Shared<MessageLog>,
    link: Shared<LinkHealth>,
    waiter: CalibrationWaiter,
    read_queue: tokio::sync::Mutex<()>,
    events: broadcast::Sender<PrinterEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PrinterClient {
    pub fn new(config: PrinterConfig) -> Result<Self> {
        config.validate()?;
        let serial = config.serial.clone();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let inner = Inner {
            family: DeviceFamily::from_serial(&serial),
            report_topic: mqtt::report_topic(&serial),
            request_topic: mqtt::request_topic(&serial),
            state: new_state(DeviceState::default()),
            router: Mutex::new(ReportRouter::new(serial)),
            publisher: Mutex::new(None),
            sequence: AtomicU64::new(0),
            log: new_state(MessageLog::new(config.log_capacity)),
            link: new_state(LinkHealth::new()),
            waiter: CalibrationWaiter::new(),
            read_queue: tokio::sync::Mutex::new(()),
            events,
            tasks: Mutex::new(Vec::new()),
            config,
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Opens the TLS session. Returns once the network task is running;
    /// the connection itself is reported through `PrinterEvent::StateChanged`.
    pub fn connect(&self) -> Result<()> {
        let cfg = &self.inner.config;
        info!("[{}] connecting to {}:{}", cfg.serial, cfg.host, cfg.port);

        let (client, eventloop) = mqtt::connect_client(cfg)?;
        let transport = self.attach(Arc::new(client));
        let pump = mqtt::spawn_event_pump(
            eventloop,
            transport,
            cfg.serial.clone(),
            cfg.reconnect_delay(),
        );
        self.inner.tasks.lock().push(pump);
        Ok(())
    }

    /// Starts the session task on top of an arbitrary publisher.
    ///
    /// The returned sender is the inbound side: whoever owns it feeds
    /// connection events and reports to the session.
    pub fn attach(&self, publisher: Arc<dyn Publisher>) -> mpsc::Sender<TransportEvent> {
        self.stop_tasks();
        *self.inner.publisher.lock() = Some(publisher);

        let (tx, rx) = mpsc::channel(TRANSPORT_CHANNEL_CAPACITY);
        let session = tokio::spawn(run_session(self.inner.clone(), rx));
        self.inner.tasks.lock().push(session);
        tx
    }

    pub fn disconnect(&self) {
        let publisher = self.inner.publisher.lock().take();
        if let Some(publisher) = publisher {
            if let Err(e) = publisher.disconnect() {
                debug!("[{}] disconnect request failed: {e}", self.serial());
            }
        }
        self.stop_tasks();
        self.inner.waiter.cancel();
        self.inner.link.lock().mark_disconnected();

        let was_connected = std::mem::replace(&mut self.inner.state.lock().connected, false);
        if was_connected {
            info!("[{}] disconnected", self.serial());
            self.inner.emit_state();
        }
    }

    fn stop_tasks(&self) {
        for handle in self.inner.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn serial(&self) -> &str {
        &self.inner.config.serial
    }

    pub fn family(&self) -> DeviceFamily {
        self.inner.family
    }

    pub fn config(&self) -> &PrinterConfig {
        &self.inner.config
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Point-in-time copy of the aggregated state.
    pub fn state(&self) -> DeviceState {
        snapshot(&self.inner.state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrinterEvent> {
        self.inner.events.subscribe()
    }

    pub fn lifecycle(&self) -> PrintLifecycle {
        self.inner.router.lock().lifecycle().clone()
    }

    /// Restores lifecycle tracking saved from a previous run.
    pub fn restore_lifecycle(&self, lifecycle: PrintLifecycle) {
        self.inner.router.lock().set_lifecycle(lifecycle);
    }

    pub fn link_health(&self) -> LinkHealthReport {
        self.inner.link.lock().report(Instant::now())
    }

    // --- diagnostics ---

    pub fn enable_logging(&self, enabled: bool) {
        self.inner.log.lock().set_enabled(enabled);
    }

    pub fn logging_enabled(&self) -> bool {
        self.inner.log.lock().is_enabled()
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.inner.log.lock().entries()
    }

    pub fn clear_logs(&self) {
        self.inner.log.lock().clear();
    }

    // --- commands ---

    /// Publishes a raw JSON payload on the request topic.
    pub fn send_command(&self, payload: &Value) -> bool {
        if !self.is_connected() {
            warn!("[{}] cannot send command: not connected", self.serial());
            return false;
        }
        match self.inner.publish_json(payload, QoS::AtMostOnce) {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] command publish failed: {e}", self.serial());
                false
            }
        }
    }

    /// Sends a command. `false` when disconnected or refused by the client;
    /// nothing is queued or retried.
    pub fn dispatch(&self, command: &PrinterCommand) -> bool {
        if !self.is_connected() {
            warn!("[{}] cannot send {command}: not connected", self.serial());
            return false;
        }

        let sequence_id = self.inner.next_sequence();
        for payload in command.payloads(sequence_id) {
            if let Err(e) = self.inner.publish_json(&payload, command.qos()) {
                warn!("[{}] failed to send {command}: {e}", self.serial());
                return false;
            }
        }
        info!("[{}] sent {command}", self.serial());
        true
    }

    fn dispatch_checked(&self, command: Result<PrinterCommand>) -> bool {
        match command {
            Ok(command) => self.dispatch(&command),
            Err(e) => {
                warn!("[{}] command rejected: {e}", self.serial());
                false
            }
        }
    }

    pub fn request_status_update(&self) -> bool {
        self.dispatch(&PrinterCommand::PushAll)
    }

    pub fn start_print(&self, filename: &str, plate_id: u32) -> bool {
        self.dispatch_checked(PrinterCommand::start_print(filename, plate_id))
    }

    pub fn pause_print(&self) -> bool {
        self.dispatch(&PrinterCommand::Pause)
    }

    pub fn resume_print(&self) -> bool {
        self.dispatch(&PrinterCommand::Resume)
    }

    pub fn stop_print(&self) -> bool {
        self.dispatch(&PrinterCommand::Stop)
    }

    pub fn send_gcode(&self, gcode: &str) -> bool {
        self.dispatch_checked(PrinterCommand::gcode(gcode))
    }

    pub fn set_bed_temperature(&self, target: i32) -> bool {
        self.dispatch_checked(PrinterCommand::bed_temperature(target))
    }

    pub fn set_nozzle_temperature(&self, target: i32, nozzle: u8) -> bool {
        self.dispatch_checked(PrinterCommand::nozzle_temperature(target, nozzle))
    }

    pub fn set_print_speed(&self, mode: u8) -> bool {
        self.dispatch_checked(PrinterCommand::print_speed(mode))
    }

    pub fn set_fan_speed(&self, fan: u8, speed: i32) -> bool {
        self.dispatch_checked(PrinterCommand::fan(fan, speed))
    }

    pub fn set_part_fan(&self, speed: i32) -> bool {
        self.set_fan_speed(1, speed)
    }

    pub fn set_aux_fan(&self, speed: i32) -> bool {
        self.set_fan_speed(2, speed)
    }

    pub fn set_chamber_fan(&self, speed: i32) -> bool {
        self.set_fan_speed(3, speed)
    }

    pub fn set_chamber_light(&self, on: bool) -> bool {
        self.dispatch(&PrinterCommand::ChamberLight(on))
    }

    pub fn home_axes(&self, axes: &str) -> bool {
        self.dispatch_checked(PrinterCommand::home(axes))
    }

    pub fn move_axis(&self, axis: &str, distance: f64, speed: Option<u32>) -> bool {
        self.dispatch_checked(PrinterCommand::move_axis(axis, distance, speed))
    }

    pub fn enable_motors(&self) -> bool {
        self.dispatch(&PrinterCommand::Motors(true))
    }

    pub fn disable_motors(&self) -> bool {
        self.dispatch(&PrinterCommand::Motors(false))
    }

    pub fn ams_load_filament(&self, tray: u16) -> bool {
        self.dispatch_checked(PrinterCommand::load_filament(tray))
    }

    pub fn ams_unload_filament(&self) -> bool {
        self.dispatch(&PrinterCommand::unload_filament())
    }

    pub fn ams_control(&self, action: &str) -> bool {
        self.dispatch_checked(PrinterCommand::ams_control(action))
    }

    pub fn set_timelapse(&self, enabled: bool) -> bool {
        self.dispatch(&PrinterCommand::Timelapse(enabled))
    }

    pub fn set_live_view(&self, enabled: bool) -> bool {
        self.dispatch(&PrinterCommand::LiveView(enabled))
    }

    // --- calibration ---

    /// Reads the calibration profiles with the configured timeout and retries.
    pub async fn read_calibration(&self, nozzle_diameter: &str) -> Vec<CalibrationProfile> {
        let cfg = &self.inner.config;
        self.read_calibration_with(
            nozzle_diameter,
            cfg.calibration_timeout(),
            cfg.calibration.max_retries,
        )
        .await
    }

    /// Empty result when disconnected or when every attempt times out.
    /// Concurrent calls wait for each other.
    pub async fn read_calibration_with(
        &self,
        nozzle_diameter: &str,
        timeout: Duration,
        max_retries: u32,
    ) -> Vec<CalibrationProfile> {
        let serial = self.serial();
        let _turn = self.inner.read_queue.lock().await;

        if !self.is_connected() {
            warn!("[{serial}] cannot read calibration profiles: not connected");
            return Vec::new();
        }

        let mut answer = match self.inner.waiter.register(nozzle_diameter) {
            Ok(rx) => rx,
            Err(e) => {
                warn!("[{serial}] {e}");
                return Vec::new();
            }
        };
        let _slot = self.inner.waiter.guard();
        let attempts = max_retries.max(1);
        let backoff = self.inner.config.calibration_backoff();

        for attempt in 1..=attempts {
            let sequence_id = self.inner.next_sequence();
            info!(
                "[{serial}] requesting calibration profiles for nozzle {nozzle_diameter} \
                 (attempt {attempt}/{attempts})"
            );
            let request = calibration::read_request(sequence_id, nozzle_diameter);
            if let Err(e) = self.inner.publish_json(&request, QoS::AtMostOnce) {
                warn!("[{serial}] calibration request not sent: {e}");
            }

            match tokio::time::timeout(timeout, &mut answer).await {
                Ok(Ok(profiles)) => {
                    info!(
                        "[{serial}] got {} calibration profiles on attempt {attempt}",
                        profiles.len()
                    );
                    return profiles;
                }
                Ok(Err(_)) => {
                    warn!("[{serial}] calibration read cancelled");
                    return Vec::new();
                }
                Err(_) => {
                    warn!("[{serial}] calibration read timed out (attempt {attempt}/{attempts})");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        error!("[{serial}] no calibration answer after {attempts} attempts");
        Vec::new()
    }

    /// Creates or edits a profile. Not reflected locally until the next read.
    pub fn write_calibration(&self, profile: &ProfileWrite) -> bool {
        if !self.is_connected() {
            warn!("[{}] cannot write calibration profile: not connected", self.serial());
            return false;
        }
        let sequence_id = self.inner.next_sequence();
        let request = calibration::write_request(self.inner.family, sequence_id, profile);
        info!(
            "[{}] writing calibration profile {} = {} (cali_idx {:?}, family {:?})",
            self.serial(),
            profile.name,
            profile.k_value,
            profile.cali_idx,
            self.inner.family
        );
        self.inner.publish_logged(&request, QoS::AtLeastOnce)
    }

    pub fn delete_calibration(&self, profile: &ProfileDelete) -> bool {
        if !self.is_connected() {
            warn!("[{}] cannot delete calibration profile: not connected", self.serial());
            return false;
        }
        let sequence_id = self.inner.next_sequence();
        let request = calibration::delete_request(self.inner.family, sequence_id, profile);
        info!(
            "[{}] deleting calibration profile cali_idx={} filament={}",
            self.serial(),
            profile.cali_idx,
            profile.filament_id
        );
        self.inner.publish_logged(&request, QoS::AtLeastOnce)
    }
}

impl Inner {
    fn serial(&self) -> &str {
        &self.config.serial
    }

    fn is_connected(&self) -> bool {
        self.publisher.lock().is_some() && self.state.lock().connected
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn publisher(&self) -> Result<Arc<dyn Publisher>> {
        self.publisher
            .lock()
            .clone()
            .ok_or_else(|| PrinterError::NotConnected(self.config.serial.clone()))
    }

    fn publish_json(&self, payload: &Value, qos: QoS) -> Result<()> {
        let bytes = serde_json::to_vec(payload)?;
        self.publisher()?.publish(&self.request_topic, qos, bytes)?;
        trace!("[{}] -> {}", self.serial(), payload);
        self.log.lock().record(&self.request_topic, Direction::Outbound, payload);
        Ok(())
    }

    fn publish_logged(&self, payload: &Value, qos: QoS) -> bool {
        match self.publish_json(payload, qos) {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] publish failed: {e}", self.serial());
                false
            }
        }
    }

    fn emit(&self, event: PrinterEvent) {
        trace!("[{}] event {}", self.serial(), event.kind());
        // no subscriber is fine
        let _ = self.events.send(event);
    }

    fn emit_state(&self) {
        let state = Arc::new(snapshot(&self.state));
        self.emit(PrinterEvent::StateChanged { state });
    }

    fn on_connected(&self) {
        self.state.lock().connected = true;
        self.link.lock().mark_connected();

        match self.publisher() {
            Ok(publisher) => {
                if let Err(e) = publisher.subscribe(&self.report_topic, QoS::AtMostOnce) {
                    error!("[{}] subscribe {} failed: {e}", self.serial(), self.report_topic);
                }
            }
            Err(e) => warn!("[{}] {e}", self.serial()),
        }

        self.publish_logged(&commands::push_all(), QoS::AtMostOnce);

        // the first calibration read after connect is usually ignored by the device
        let priming = calibration::read_request(self.next_sequence(), PRIMING_NOZZLE);
        debug!("[{}] sending calibration priming request", self.serial());
        self.publish_logged(&priming, QoS::AtMostOnce);

        self.emit_state();
    }

    fn on_connection_lost(&self, reason: &str) {
        {
            let mut link = self.link.lock();
            if link.should_ignore_disconnect(Instant::now(), self.config.disconnect_grace()) {
                debug!("[{}] ignoring spurious disconnect ({reason})", self.serial());
                return;
            }
            link.mark_lost();
        }

        let was_connected = std::mem::replace(&mut self.state.lock().connected, false);
        if was_connected {
            warn!("[{}] MQTT disconnected: {reason}", self.serial());
            self.emit_state();
        } else {
            debug!("[{}] still disconnected: {reason}", self.serial());
        }
    }

    fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.report_topic {
            trace!("[{}] ignoring message on {topic}", self.serial());
            return;
        }
        let value: Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                trace!("[{}] dropping undecodable payload: {e}", self.serial());
                return;
            }
        };

        self.link.lock().record_message(Instant::now());
        self.log.lock().record(topic, Direction::Inbound, &value);

        let (outcome, state) = {
            let mut router = self.router.lock();
            let mut state = self.state.lock();
            let reconnected = !state.connected;
            state.connected = true;
            let outcome = router.route(&mut state, &value);
            let changed = outcome.state_changed || reconnected;
            (outcome, changed.then(|| Arc::new(state.clone())))
        };

        if let Some(reply) = &outcome.calibration {
            if self.waiter.resolve(reply) {
                debug!("[{}] calibration read answered", self.serial());
            }
        }

        for event in outcome.events {
            self.emit(event);
        }
        if let Some(state) = state {
            self.emit(PrinterEvent::StateChanged { state });
        }
    }
}

async fn run_session(inner: Arc<Inner>, mut transport: mpsc::Receiver<TransportEvent>) {
    debug!("[{}] session task started", inner.serial());
    while let Some(event) = transport.recv().await {
        match event {
            TransportEvent::Connected => inner.on_connected(),
            TransportEvent::ConnectionLost(reason) => inner.on_connection_lost(&reason),
            TransportEvent::Message { topic, payload } => inner.on_message(&topic, &payload),
        }
    }
    debug!("[{}] session task stopped", inner.serial());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingPublisher {
        sent: Mutex<Vec<(String, QoS, Value)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<()> {
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().push((topic.to_string(), qos, value));
            Ok(())
        }

        fn subscribe(&self, _topic: &str, _qos: QoS) -> Result<()> {
            Ok(())
        }

        fn disconnect(&self) -> Result<()> {
            Ok(())
        }
    }

    fn client() -> PrinterClient {
        PrinterClient::new(PrinterConfig::new("127.0.0.1", "01P00A1", "code")).unwrap()
    }

    #[tokio::test]
    async fn dispatch_without_session_fails() {
        let client = client();
        assert!(!client.pause_print());
        assert!(!client.set_bed_temperature(60));
        assert!(!client.request_status_update());
        assert!(!client.write_calibration(&ProfileWrite::new("GFA00", "PLA", "0.02")));
    }

    #[tokio::test]
    async fn connect_sequence_and_dispatch() {
        let client = client();
        let publisher = Arc::new(RecordingPublisher::default());
        let mut events = client.subscribe();
        let transport = client.attach(publisher.clone());

        transport.send(TransportEvent::Connected).await.unwrap();
        let event = events.recv().await.unwrap();
        assert!(matches!(event, PrinterEvent::StateChanged { ref state } if state.connected));

        {
            let sent = publisher.sent.lock();
            assert_eq!(sent[0].2["pushing"]["command"], "pushall");
            assert_eq!(sent[1].2["print"]["command"], "extrusion_cali_get");
            assert_eq!(sent[1].0, "device/01P00A1/request");
        }

        assert!(client.set_fan_speed(2, 999));
        assert!(!client.set_print_speed(9));
        let sent = publisher.sent.lock();
        let last = &sent.last().unwrap().2;
        assert_eq!(last["print"]["param"], "M106 P2 S255");
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let client = client();
        let publisher = Arc::new(RecordingPublisher::default());
        let transport = client.attach(publisher);
        let mut events = client.subscribe();

        transport
            .send(TransportEvent::Message {
                topic: "device/01P00A1/report".into(),
                payload: b"{not json".to_vec(),
            })
            .await
            .unwrap();
        transport
            .send(TransportEvent::Message {
                topic: "device/01P00A1/report".into(),
                payload: br#"{"print":{"mc_percent":33}}"#.to_vec(),
            })
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            PrinterEvent::StateChanged { state } => assert_eq!(state.progress, 33.0),
            other => panic!("unexpected event {other:?}"),
        }
    }
}
