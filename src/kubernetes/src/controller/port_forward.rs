use std::net::IpAddr;

use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};

use elbd_route::iptables::{CommandRunner, ForwardRule, PortForwarder};

use crate::util::first_node_address;

use super::{
    config::PortForward,
    error::{ConfigError, Error},
};

/// Address of `node_name` as reported in its status.
#[tracing::instrument(skip(client))]
pub async fn node_address(client: Client, node_name: &str) -> Result<IpAddr, Error> {
    let nodes = Api::<Node>::all(client);
    let node = nodes.get(node_name).await.map_err(Error::Kube)?;
    first_node_address(&node).ok_or_else(|| Error::NodeAddressNotFound(node_name.to_string()))
}

/// Installs the DNAT rule of port-forward mode for this node. The local
/// address falls back to the node address when it is not configured.
#[tracing::instrument(skip(client, pf, forwarder))]
pub async fn setup<R: CommandRunner>(
    client: Client,
    node_name: &str,
    pf: &PortForward,
    forwarder: &PortForwarder<R>,
) -> Result<ForwardRule, Error> {
    let router = parse_addr(&pf.router_addr)?;
    let local = match &pf.local_addr {
        Some(addr) => parse_addr(addr)?,
        None => node_address(client, node_name).await?,
    };
    if router.is_ipv4() != local.is_ipv4() {
        return Err(Error::Config(ConfigError::InvalidArgument(format!(
            "router {router} and local address {local} are of different families"
        ))));
    }
    let rule = ForwardRule::new(router, local, pf.local_bgp_port);
    forwarder.ensure_forward(&rule).await.map_err(Error::Route)?;
    tracing::info!(rule = %rule, "port forwarding for BGP is ready");
    Ok(rule)
}

pub async fn teardown<R: CommandRunner>(
    rule: &ForwardRule,
    forwarder: &PortForwarder<R>,
) -> Result<(), Error> {
    forwarder.delete_forward(rule).await.map_err(Error::Route)?;
    Ok(())
}

fn parse_addr(addr: &str) -> Result<IpAddr, Error> {
    addr.parse()
        .map_err(|_| Error::Config(ConfigError::InvalidArgument(addr.to_string())))
}
