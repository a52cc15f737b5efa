use std::str::FromStr;

use tracing_subscriber::{filter::LevelFilter, prelude::*, Registry};

use super::error::Error;

#[derive(Debug, Clone)]
pub struct TraceConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
}

pub fn prepare_tracing(conf: TraceConfig) -> Result<(), Error> {
    let level =
        LevelFilter::from_str(&conf.level).map_err(|_| Error::InvalidLevel(conf.level.clone()))?;
    let telemetry = tracing_opentelemetry::layer();
    let json = conf.format == "json";

    match conf.file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            let layer = tracing_subscriber::fmt::Layer::new()
                .with_writer(file)
                .with_ansi(false);
            if json {
                Registry::default()
                    .with(telemetry)
                    .with(layer.json())
                    .with(level)
                    .try_init()?;
            } else {
                Registry::default()
                    .with(telemetry)
                    .with(layer)
                    .with(level)
                    .try_init()?;
            }
        }
        None => {
            let layer = tracing_subscriber::fmt::Layer::new().with_ansi(true);
            if json {
                Registry::default()
                    .with(telemetry)
                    .with(layer.json())
                    .with(level)
                    .try_init()?;
            } else {
                Registry::default()
                    .with(telemetry)
                    .with(layer)
                    .with(level)
                    .try_init()?;
            }
        }
    }
    Ok(())
}
