use clap::{Args, Parser};
use elbd_kubernetes::controller::{
    config::{
        Config, DEFAULT_IP_STRATEGY, DEFAULT_KEEPALIVED_HTTP_PORT, DEFAULT_METRICS_ADDR,
        DEFAULT_READINESS_ADDR, DEFAULT_REQUEUE_INTERVAL, DEFAULT_SPEAKER_ENDPOINT,
        DEFAULT_SPEAKER_TIMEOUT, DEFAULT_WEBHOOK_PORT,
    },
    error::Error,
};

#[derive(Debug, Clone, Parser)]
pub struct ControllerCmd {
    #[command(flatten)]
    pub server: ServerArgs,
}

/// Flags shared by the controller and the agent. Unset flags keep the value
/// from the config file.
#[derive(Debug, Clone, Default, Args)]
pub struct ServerArgs {
    #[arg(short = 'f', long, help = "Config file path")]
    pub file: Option<String>,

    #[arg(long = "webhook-port", help = format!("Webhook serving port [default: {DEFAULT_WEBHOOK_PORT}]"))]
    pub webhook_port: Option<u16>,

    #[arg(long = "metrics-addr", help = format!("Address the metrics endpoint binds to [default: {DEFAULT_METRICS_ADDR}]"))]
    pub metrics_addr: Option<String>,

    #[arg(long = "readiness-addr", help = format!("Address the health probes bind to, 0 disables them [default: {DEFAULT_READINESS_ADDR}]"))]
    pub readiness_addr: Option<String>,

    #[arg(long = "keepalived-http-port", help = format!("Keepalived HTTP port [default: {DEFAULT_KEEPALIVED_HTTP_PORT}]"))]
    pub keepalived_http_port: Option<u16>,

    #[arg(long = "speaker-endpoint", help = format!("gRPC endpoint of the local BGP speaker [default: {DEFAULT_SPEAKER_ENDPOINT}]"))]
    pub speaker_endpoint: Option<String>,

    #[arg(long = "speaker-timeout", help = format!("Timeout in seconds of a speaker call [default: {DEFAULT_SPEAKER_TIMEOUT}]"))]
    pub speaker_timeout: Option<u64>,

    #[arg(long = "requeue-interval", help = format!("Interval in seconds to re-verify bound services [default: {DEFAULT_REQUEUE_INTERVAL}]"))]
    pub requeue_interval: Option<u64>,

    #[arg(long = "ip-strategy", help = format!("Address selection strategy (default, hash) [default: {DEFAULT_IP_STRATEGY}]"))]
    pub ip_strategy: Option<String>,
}

impl ServerArgs {
    pub fn config(&self) -> Result<Config, Error> {
        let mut config = match &self.file {
            None => Config::default(),
            Some(file) => Config::load(file)?,
        };

        if let Some(port) = self.webhook_port {
            config.webhook_port = port;
        }
        if let Some(addr) = &self.metrics_addr {
            config.metrics_addr = addr.clone();
        }
        if let Some(addr) = &self.readiness_addr {
            config.readiness_addr = addr.clone();
        }
        if let Some(port) = self.keepalived_http_port {
            config.keepalived_http_port = port;
        }
        if let Some(endpoint) = &self.speaker_endpoint {
            config.speaker_endpoint = endpoint.clone();
        }
        if let Some(timeout) = self.speaker_timeout {
            config.speaker_timeout = timeout;
        }
        if let Some(interval) = self.requeue_interval {
            config.requeue_interval = interval;
        }
        if let Some(strategy) = &self.ip_strategy {
            config.ip_strategy = strategy.clone();
        }
        Ok(config)
    }
}
