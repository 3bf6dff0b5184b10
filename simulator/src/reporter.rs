use crate::behavior::DeviceKind;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rumqttc::QoS;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, trace, warn};
use transport::topics::report_topic;
use transport::{Connectivity, Transport};

pub struct ReportSchedule {
    pub device_id: String,
    pub kind: DeviceKind,
    pub first_delay: Duration,
    pub interval: Duration,
}

/// Periodic report task of one device. At most one runs at a time.
#[derive(Default)]
pub struct ReportTimer {
    task: Option<JoinHandle<()>>,
}

impl ReportTimer {
    pub fn start(
        &mut self,
        schedule: ReportSchedule,
        transport: Arc<dyn Transport>,
        power: Arc<AtomicBool>,
    ) {
        self.stop();
        info!(
            "Device [{}] reporting every {:?}",
            schedule.device_id, schedule.interval
        );
        self.task = Some(tokio::spawn(run_reports(schedule, transport, power)));
    }

    /// Returns whether a running timer was cancelled.
    pub fn stop(&mut self) -> bool {
        match self.task.take() {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for ReportTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_reports(
    schedule: ReportSchedule,
    transport: Arc<dyn Transport>,
    power: Arc<AtomicBool>,
) {
    let topic = report_topic(&schedule.device_id);
    let mut rng = StdRng::from_entropy();
    let mut ticker = interval_at(Instant::now() + schedule.first_delay, schedule.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        if !power.load(Ordering::SeqCst) || transport.connectivity() != Connectivity::Connected {
            trace!("Device [{}] off or offline, skipping report", schedule.device_id);
            continue;
        }

        let Some(report) = schedule.kind.generate_report(&mut rng, &schedule.device_id) else {
            continue;
        };

        let payload = match serde_json::to_vec(&report) {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to serialize report for [{}]: {}", schedule.device_id, e);
                continue;
            }
        };

        match transport.publish(&topic, payload, QoS::AtLeastOnce, false).await {
            Ok(()) => info!(
                "Device [{}] reported temperature={} humidity={}",
                schedule.device_id, report.temperature, report.humidity
            ),
            Err(e) => warn!("Device [{}] failed to publish report: {}", schedule.device_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use transport::memory::MemoryTransport;

    fn schedule(kind: DeviceKind) -> ReportSchedule {
        ReportSchedule {
            device_id: "sensor-th-001".to_string(),
            kind,
            first_delay: Duration::from_millis(10),
            interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_timer_publishes_and_stops() {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect().await.unwrap();
        let power = Arc::new(AtomicBool::new(true));

        let mut timer = ReportTimer::default();
        timer.start(schedule(DeviceKind::TempHumSensor), transport.clone(), power);
        assert!(timer.is_running());

        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(timer.stop());
        assert!(!timer.stop());

        let published = transport.published_to("device/report/sensor-th-001").len();
        assert!(published >= 2, "expected at least two reports, got {}", published);
        assert!(transport.published().iter().all(|m| !m.retain && m.qos == QoS::AtLeastOnce));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(transport.published_to("device/report/sensor-th-001").len(), published);
    }

    #[tokio::test]
    async fn test_timer_skips_while_powered_off() {
        let transport = Arc::new(MemoryTransport::new());
        transport.connect().await.unwrap();
        let power = Arc::new(AtomicBool::new(false));

        let mut timer = ReportTimer::default();
        timer.start(schedule(DeviceKind::TempHumSensor), transport.clone(), power);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(transport.published().is_empty());
    }
}
