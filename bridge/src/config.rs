use std::env;
use std::time::Duration;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Without it the registry lives in memory.
    pub database_url: Option<String>,
    pub mqtt_broker: String,
    pub mqtt_port: u16,
    pub http_addr: String,
    /// Browser origin allowed to call the HTTP API.
    pub cors_origin: String,
    pub channel_capacity: usize,
    pub sse_timeout: Duration,
    pub reconnect_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let database_url = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty());
        let mqtt_broker = env::var("MQTT_BROKER").unwrap_or_else(|_| "localhost".to_string());
        let mqtt_port: u16 = env::var("MQTT_PORT")
            .unwrap_or_else(|_| "1883".to_string())
            .parse()
            .unwrap_or(1883);
        let http_addr = env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let cors_origin =
            env::var("CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:5173".to_string());
        let channel_capacity: usize = env::var("CHANNEL_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse()
            .unwrap_or(1024);
        let sse_timeout_secs: u64 = env::var("SSE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3600);
        let reconnect_backoff_secs: u64 = env::var("RECONNECT_BACKOFF_SECS")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .unwrap_or(5);

        Self {
            database_url,
            mqtt_broker,
            mqtt_port,
            http_addr,
            cors_origin,
            channel_capacity,
            sse_timeout: Duration::from_secs(sse_timeout_secs),
            reconnect_backoff: Duration::from_secs(reconnect_backoff_secs),
        }
    }

    /// Database location with credentials stripped, for logging.
    pub fn database_host(&self) -> &str {
        self.database_url
            .as_deref()
            .map(|url| url.split('@').last().unwrap_or("***"))
            .unwrap_or("in-memory")
    }
}
