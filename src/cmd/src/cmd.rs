use clap::{Parser, Subcommand, ValueEnum};

use elbd_kubernetes::controller::{error::Error, server, server::Role};
use elbd_trace::init::TraceConfig;

use crate::{agent::AgentCmd, controller::ControllerCmd};

pub const NODE_NAME_ENV: &str = "MY_NODE_NAME";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cmd {
    #[arg(
        short,
        long,
        global = true,
        required = false,
        default_value = "info",
        help = "Log level(trace, debug, info, warn, error)"
    )]
    pub level: String,

    #[arg(
        value_enum,
        short = 'd',
        long,
        global = true,
        required = false,
        default_value = "plain",
        help = "Log display format"
    )]
    pub format: Format,

    #[arg(short = 'o', long = "log-file", global = true, help = "Log output file path")]
    pub log_file: Option<String>,

    #[clap(subcommand)]
    pub sub: SubCmd,
}

#[derive(Debug, Clone, Parser, ValueEnum)]
pub enum Format {
    Plain,
    Json,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Format::Plain => write!(f, "plain"),
            Format::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum SubCmd {
    Controller(ControllerCmd),
    Agent(AgentCmd),
    Version,
}

pub fn version() -> String {
    format!(
        "elbd {} ({})",
        env!("CARGO_PKG_VERSION"),
        option_env!("ELBD_BUILD").unwrap_or("dev")
    )
}

pub fn run() -> Result<(), Error> {
    let command = Cmd::parse();

    let trace_conf = TraceConfig {
        level: command.level,
        format: command.format.to_string(),
        file: command.log_file,
    };

    match command.sub {
        SubCmd::Version => {
            println!("{}", version());
            Ok(())
        }
        SubCmd::Controller(c) => {
            let config = c.server.config()?;
            server::start(config, trace_conf, Role::Controller)
        }
        SubCmd::Agent(a) => {
            let node_name = std::env::var(NODE_NAME_ENV).map_err(|_| Error::MissingNodeName)?;
            let config = a.config()?;
            server::start(config, trace_conf, Role::Agent { node_name })
        }
    }
}
