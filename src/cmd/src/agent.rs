use clap::Parser;
use elbd_kubernetes::controller::{
    config::{Config, PortForward},
    error::{ConfigError, Error},
};
use elbd_route::iptables::DEFAULT_LOCAL_BGP_PORT;

use crate::controller::ServerArgs;

#[derive(Debug, Clone, Parser)]
pub struct AgentCmd {
    #[command(flatten)]
    pub server: ServerArgs,

    #[arg(
        long = "bgp-port-forward",
        help = "Forward BGP sessions from the router to the local speaker"
    )]
    pub bgp_port_forward: bool,

    #[arg(long = "router-addr", help = "Address of the BGP router peering with this node")]
    pub router_addr: Option<String>,

    #[arg(
        long = "local-bgp-port",
        default_value_t = DEFAULT_LOCAL_BGP_PORT,
        help = "Port the local speaker listens on in port-forward mode"
    )]
    pub local_bgp_port: u16,

    #[arg(
        long = "local-addr",
        help = "Destination address of forwarded sessions (defaults to the node address)"
    )]
    pub local_addr: Option<String>,
}

impl AgentCmd {
    pub fn config(&self) -> Result<Config, Error> {
        let mut config = self.server.config()?;
        if !self.bgp_port_forward {
            return Ok(config);
        }
        let router_addr = match (&self.router_addr, &config.port_forward) {
            (Some(addr), _) => addr.clone(),
            (None, Some(pf)) => pf.router_addr.clone(),
            (None, None) => {
                return Err(Error::Config(ConfigError::InvalidArgument(
                    "--router-addr is required with --bgp-port-forward".to_string(),
                )))
            }
        };
        let local_addr = self
            .local_addr
            .clone()
            .or_else(|| config.port_forward.as_ref().and_then(|pf| pf.local_addr.clone()));
        config.port_forward = Some(PortForward {
            router_addr,
            local_bgp_port: self.local_bgp_port,
            local_addr,
        });
        Ok(config)
    }
}
