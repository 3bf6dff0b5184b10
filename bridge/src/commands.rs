use crate::errors::{Error, Result};
use crate::metrics::COMMANDS_PUBLISHED_TOTAL;
use crate::registry::DeviceRegistry;
use crate::validate::normalize_command;
use std::sync::Arc;
use tracing::{info, warn};
use transport::topics::command_topic;
use transport::{Connectivity, QoS, Transport};

/// Publishes ON/OFF commands to registered devices over the bridge session.
pub struct CommandService {
    registry: Arc<dyn DeviceRegistry>,
    transport: Arc<dyn Transport>,
}

impl CommandService {
    pub fn new(registry: Arc<dyn DeviceRegistry>, transport: Arc<dyn Transport>) -> Self {
        Self {
            registry,
            transport,
        }
    }

    /// Returns the normalized command that was published.
    pub async fn send_command(&self, uid: &str, command: &str) -> Result<&'static str> {
        if !self.registry.exists_by_uid(uid).await? {
            return Err(Error::NotFound(uid.to_string()));
        }

        let command = normalize_command(command)?;

        if self.transport.connectivity() != Connectivity::Connected {
            warn!("Command {} for [{}] rejected, broker connection is down", command, uid);
            return Err(Error::ServiceUnavailable("broker connection is down".to_string()));
        }

        let topic = command_topic(uid);
        self.transport
            .publish(&topic, command.as_bytes().to_vec(), QoS::AtLeastOnce, false)
            .await
            .map_err(|e| Error::ServiceUnavailable(e.to_string()))?;

        COMMANDS_PUBLISHED_TOTAL.inc();
        info!("Published command {} to {}", command, topic);
        Ok(command)
    }

    /// Publishes a raw text message to any concrete topic at QoS 1.
    pub async fn publish_message(&self, topic: &str, message: &str) -> Result<()> {
        if topic.trim().is_empty() || topic.contains(['+', '#']) {
            return Err(Error::Validation(format!(
                "'{}' is not a publishable topic",
                topic
            )));
        }

        if self.transport.connectivity() != Connectivity::Connected {
            warn!("Publish to {} rejected, broker connection is down", topic);
            return Err(Error::ServiceUnavailable("broker connection is down".to_string()));
        }

        self.transport
            .publish(topic, message.as_bytes().to_vec(), QoS::AtLeastOnce, false)
            .await
            .map_err(|e| Error::ServiceUnavailable(e.to_string()))?;

        info!("Published {} bytes to {}", message.len(), topic);
        Ok(())
    }
}
