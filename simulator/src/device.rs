use crate::behavior::DeviceKind;
use crate::reporter::{ReportSchedule, ReportTimer};
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transport::payload::{StatusPayload, STATUS_OFFLINE, STATUS_ONLINE};
use transport::topics::{command_topic, status_topic, REGISTER_TOPIC};
use transport::{Connectivity, InboundMessage, Transport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub device_id: String,
    pub kind: DeviceKind,
    /// Zero disables periodic reporting.
    pub report_interval_secs: u64,
    pub initially_on: bool,
}

#[derive(Debug, Clone)]
pub struct DeviceTiming {
    pub reconnect_backoff: Duration,
    pub first_report_delay: Duration,
    /// Pause after the final offline status so it leaves before DISCONNECT.
    pub offline_flush: Duration,
}

impl Default for DeviceTiming {
    fn default() -> Self {
        Self {
            reconnect_backoff: Duration::from_secs(10),
            first_report_delay: Duration::from_secs(2),
            offline_flush: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected,
    Connecting,
    Connected,
    Stopped,
}

/// Observer/controller for a running device.
#[derive(Clone)]
pub struct DeviceHandle {
    device_id: String,
    power: Arc<AtomicBool>,
    phase: watch::Receiver<Phase>,
    shutdown: CancellationToken,
}

impl DeviceHandle {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn is_on(&self) -> bool {
        self.power.load(Ordering::SeqCst)
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    #[cfg(test)]
    pub async fn wait_for_phase(&self, target: Phase) -> bool {
        let mut phase = self.phase.clone();
        let reached = phase.wait_for(|p| *p == target).await.is_ok();
        reached
    }
}

/// One simulated field device and its connection/command state machine.
pub struct SimulatedDevice {
    config: DeviceConfig,
    timing: DeviceTiming,
    transport: Arc<dyn Transport>,
    power: Arc<AtomicBool>,
    phase: watch::Sender<Phase>,
    reporter: ReportTimer,
    shutdown: CancellationToken,
}

impl SimulatedDevice {
    pub fn new(
        config: DeviceConfig,
        timing: DeviceTiming,
        transport: Arc<dyn Transport>,
        shutdown: CancellationToken,
    ) -> Self {
        info!(
            "Device [{}] configured: type={}, interval={}s, initial={}",
            config.device_id,
            config.kind,
            config.report_interval_secs,
            if config.initially_on { "ON" } else { "OFF" }
        );
        let (phase, _) = watch::channel(Phase::Disconnected);
        Self {
            power: Arc::new(AtomicBool::new(config.initially_on)),
            config,
            timing,
            transport,
            phase,
            reporter: ReportTimer::default(),
            shutdown,
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            device_id: self.config.device_id.clone(),
            power: self.power.clone(),
            phase: self.phase.subscribe(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Control loop. Never returns an error: failures turn into state
    /// transitions or skipped operations.
    pub async fn run(mut self) {
        let id = self.config.device_id.clone();
        info!("Device [{}] starting", id);

        // The adapter resubscribes this pattern on every (re)connect.
        let mut commands = match self
            .transport
            .subscribe(&command_topic(&id), QoS::AtLeastOnce)
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                error!("Device [{}] cannot subscribe to its command topic: {}", id, e);
                self.set_phase(Phase::Stopped);
                return;
            }
        };
        let mut connectivity = self.transport.watch_connectivity();

        while !self.shutdown.is_cancelled() {
            match self.current_phase() {
                Phase::Disconnected | Phase::Connecting => self.try_connect().await,
                Phase::Connected => {
                    if !self.serve(&mut commands, &mut connectivity).await {
                        break;
                    }
                }
                Phase::Stopped => break,
            }
        }

        self.terminate().await;
        info!("Device [{}] stopped", id);
    }

    async fn try_connect(&mut self) {
        self.set_phase(Phase::Connecting);

        let result = tokio::select! {
            result = self.transport.connect() => result,
            _ = self.shutdown.cancelled() => {
                self.set_phase(Phase::Disconnected);
                return;
            }
        };

        match result {
            Ok(()) => {
                self.set_phase(Phase::Connected);
                info!("Device [{}] connected", self.config.device_id);
                self.on_connected().await;
            }
            Err(e) => {
                self.set_phase(Phase::Disconnected);
                error!(
                    "Device [{}] failed to connect: {}. Retrying in {:?}",
                    self.config.device_id, e, self.timing.reconnect_backoff
                );
                tokio::select! {
                    _ = tokio::time::sleep(self.timing.reconnect_backoff) => {}
                    _ = self.shutdown.cancelled() => {
                        warn!(
                            "Device [{}] stop requested while waiting to reconnect",
                            self.config.device_id
                        );
                    }
                }
            }
        }
    }

    /// Waits for the next event while connected. Returns false when the
    /// loop should end.
    async fn serve(
        &mut self,
        commands: &mut mpsc::Receiver<InboundMessage>,
        connectivity: &mut watch::Receiver<Connectivity>,
    ) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            message = commands.recv() => match message {
                Some(message) => {
                    self.handle_command(&message.payload_str()).await;
                    true
                }
                None => {
                    error!("Device [{}] command channel closed", self.config.device_id);
                    false
                }
            },
            changed = connectivity.changed() => {
                let lost = changed.is_err()
                    || *connectivity.borrow_and_update() == Connectivity::Disconnected;
                if lost {
                    self.on_connection_lost();
                }
                true
            }
        }
    }

    async fn on_connected(&mut self) {
        let power_on = self.power.load(Ordering::SeqCst);
        let status = status_for(power_on);

        let registration = StatusPayload::new(self.config.device_id.as_str(), status)
            .with_type(self.config.kind.type_name());
        self.publish_retained(REGISTER_TOPIC, &registration).await;
        self.publish_status(status).await;

        if power_on {
            self.start_reporting();
        }
    }

    fn on_connection_lost(&mut self) {
        warn!("Device [{}] lost its broker connection", self.config.device_id);
        self.reporter.stop();
        self.set_phase(Phase::Disconnected);
    }

    async fn handle_command(&mut self, payload: &str) {
        let id = self.config.device_id.clone();
        info!("Device [{}] received command '{}'", id, payload);

        match payload.trim().to_ascii_uppercase().as_str() {
            "ON" => {
                if self
                    .power
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    info!("Device [{}] switched ON remotely", id);
                    self.start_reporting();
                    self.publish_status(STATUS_ONLINE).await;
                } else {
                    info!("Device [{}] already ON", id);
                }
            }
            "OFF" => {
                if self
                    .power
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    info!("Device [{}] switched OFF remotely", id);
                    self.reporter.stop();
                    self.publish_status(STATUS_OFFLINE).await;
                } else {
                    info!("Device [{}] already OFF", id);
                }
            }
            _ => warn!("Device [{}] ignoring unknown command '{}'", id, payload),
        }
    }

    fn start_reporting(&mut self) {
        let id = &self.config.device_id;

        if !self.config.kind.reports_periodically() {
            info!("Device [{}] is a {}, status changes only", id, self.config.kind);
            return;
        }
        if self.config.report_interval_secs == 0 {
            info!("Device [{}] has reporting disabled", id);
            return;
        }

        self.reporter.start(
            ReportSchedule {
                device_id: id.clone(),
                kind: self.config.kind,
                first_delay: self.timing.first_report_delay,
                interval: Duration::from_secs(self.config.report_interval_secs),
            },
            self.transport.clone(),
            self.power.clone(),
        );
    }

    async fn publish_status(&self, status: &str) {
        let payload = StatusPayload::new(self.config.device_id.as_str(), status);
        self.publish_retained(&status_topic(&self.config.device_id), &payload)
            .await;
    }

    async fn publish_retained(&self, topic: &str, payload: &StatusPayload) {
        let bytes = match payload.to_bytes() {
            Ok(b) => b,
            Err(e) => {
                error!("Device [{}] failed to encode status: {}", self.config.device_id, e);
                return;
            }
        };

        match self
            .transport
            .publish(topic, bytes, QoS::AtLeastOnce, true)
            .await
        {
            Ok(()) => info!(
                "Device [{}] published '{}' to {}",
                self.config.device_id, payload.status, topic
            ),
            Err(e) => error!(
                "Device [{}] failed to publish '{}' to {}: {}",
                self.config.device_id, payload.status, topic, e
            ),
        }
    }

    async fn terminate(&mut self) {
        info!("Shutting down device [{}]", self.config.device_id);
        self.reporter.stop();

        if self.transport.connectivity() == Connectivity::Connected {
            self.publish_status(STATUS_OFFLINE).await;
            tokio::time::sleep(self.timing.offline_flush).await;
        }

        if let Err(e) = self.transport.disconnect().await {
            error!("Device [{}] failed to disconnect: {}", self.config.device_id, e);
        }

        self.set_phase(Phase::Stopped);
    }

    fn current_phase(&self) -> Phase {
        *self.phase.borrow()
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }
}

fn status_for(power_on: bool) -> &'static str {
    if power_on {
        STATUS_ONLINE
    } else {
        STATUS_OFFLINE
    }
}
