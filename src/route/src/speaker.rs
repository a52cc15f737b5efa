use std::{
    collections::BTreeSet,
    net::IpAddr,
    str::FromStr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use elbd_proto::elbd::v1::{
    bgp_api_client::BgpApiClient, AddPathRequest, DeletePathRequest, GetPathRequest,
    HealthRequest,
};
use ipnet::IpNet;
use tonic::transport::Channel;

use super::error::Error;

/// A prefix advertised by the speaker together with its next hops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub prefix: IpNet,
    pub nexthops: BTreeSet<IpAddr>,
}

/// Route programming surface of the BGP speaker on this node.
///
/// `add_route` and `delete_routes` are idempotent with respect to the
/// currently advertised next hop set. `delete_routes` with no next hops
/// withdraws the prefix entirely, and deleting a missing route succeeds.
#[async_trait]
pub trait Speaker: Send + Sync {
    async fn add_route(&self, prefix: IpAddr, nexthops: &[IpAddr]) -> Result<(), Error>;

    async fn delete_routes(&self, prefix: IpAddr, nexthops: &[IpAddr]) -> Result<(), Error>;

    async fn get_route(&self, prefix: IpAddr, prefix_len: u8) -> Result<Option<Route>, Error>;

    async fn is_route_added(&self, prefix: IpAddr, prefix_len: u8) -> Result<bool, Error> {
        Ok(self.get_route(prefix, prefix_len).await?.is_some())
    }
}

pub fn host_prefix_len(addr: &IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NexthopDiff {
    pub added: Vec<IpAddr>,
    pub removed: Vec<IpAddr>,
}

impl NexthopDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_nexthops(current: &BTreeSet<IpAddr>, desired: &BTreeSet<IpAddr>) -> NexthopDiff {
    NexthopDiff {
        added: desired.difference(current).copied().collect(),
        removed: current.difference(desired).copied().collect(),
    }
}

/// Talks to the speaker's gRPC API. A connection is made per call and every
/// call is bounded by `timeout`.
#[derive(Debug, Clone)]
pub struct GrpcSpeaker {
    endpoint: String,
    timeout: Duration,
}

impl GrpcSpeaker {
    pub fn new(endpoint: &str, timeout: Duration) -> GrpcSpeaker {
        GrpcSpeaker {
            endpoint: endpoint.to_string(),
            timeout,
        }
    }

    pub async fn health(&self) -> Result<(), Error> {
        let mut client = connect_bgp_with_retry(&self.endpoint, self.timeout).await?;
        tokio::time::timeout(self.timeout, client.health(HealthRequest {}))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }
}

#[async_trait]
impl Speaker for GrpcSpeaker {
    #[tracing::instrument(skip(self))]
    async fn add_route(&self, prefix: IpAddr, nexthops: &[IpAddr]) -> Result<(), Error> {
        let mut client = connect_bgp_with_retry(&self.endpoint, self.timeout).await?;
        let req = AddPathRequest {
            prefix: IpNet::from(prefix).to_string(),
            nexthops: nexthops.iter().map(|n| n.to_string()).collect(),
        };
        tokio::time::timeout(self.timeout, client.add_path(req))
            .await
            .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn delete_routes(&self, prefix: IpAddr, nexthops: &[IpAddr]) -> Result<(), Error> {
        let mut client = connect_bgp_with_retry(&self.endpoint, self.timeout).await?;
        let req = DeletePathRequest {
            prefix: IpNet::from(prefix).to_string(),
            nexthops: nexthops.iter().map(|n| n.to_string()).collect(),
        };
        match tokio::time::timeout(self.timeout, client.delete_path(req))
            .await
            .map_err(|_| Error::Timeout)?
        {
            Ok(_) => Ok(()),
            Err(s) if s.code() == tonic::Code::NotFound => Ok(()),
            Err(s) => Err(Error::GotgRPC(s)),
        }
    }

    #[tracing::instrument(skip(self))]
    async fn get_route(&self, prefix: IpAddr, prefix_len: u8) -> Result<Option<Route>, Error> {
        let mut client = connect_bgp_with_retry(&self.endpoint, self.timeout).await?;
        let prefix = IpNet::new(prefix, prefix_len)
            .map_err(|_| Error::InvalidNexthop(format!("{prefix}/{prefix_len}")))?;
        let req = GetPathRequest {
            prefix: prefix.to_string(),
        };
        let res = match tokio::time::timeout(self.timeout, client.get_path(req))
            .await
            .map_err(|_| Error::Timeout)?
        {
            Ok(res) => res.into_inner(),
            Err(s) if s.code() == tonic::Code::NotFound => return Ok(None),
            Err(s) => return Err(Error::GotgRPC(s)),
        };
        let path = match res.path {
            Some(path) => path,
            None => return Ok(None),
        };
        let nexthops = path
            .nexthops
            .iter()
            .map(|n| IpAddr::from_str(n).map_err(|_| Error::InvalidNexthop(n.clone())))
            .collect::<Result<BTreeSet<IpAddr>, Error>>()?;
        Ok(Some(Route { prefix, nexthops }))
    }
}

async fn connect_bgp(endpoint: &str) -> Result<BgpApiClient<Channel>, Error> {
    let endpoint_url = format!("http://{}", endpoint);
    BgpApiClient::connect(endpoint_url)
        .await
        .map_err(Error::FailedToCommunicateWithgRPC)
}

#[tracing::instrument]
async fn connect_bgp_with_retry(
    endpoint: &str,
    timeout: Duration,
) -> Result<BgpApiClient<Channel>, Error> {
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() > deadline {
            return Err(Error::Timeout);
        }
        match connect_bgp(endpoint).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                tracing::error!(error=?e, "failed to connect bgp speaker");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}
