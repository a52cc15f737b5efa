use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Arc, Mutex},
};

use elbd_proto::elbd::v1::{
    bgp_api_server::{BgpApi, BgpApiServer},
    AddPathRequest, AddPathResponse, DeletePathRequest, DeletePathResponse, GetPathRequest,
    GetPathResponse, HealthRequest, Path,
};
use tonic::{transport::Server, Request, Response, Status};

#[derive(Clone, Debug, Default)]
pub struct MockBgpApiServer {
    inner: Arc<Mutex<MockBgpApiServerInner>>,
}

#[derive(Clone, Debug, Default)]
pub struct MockBgpApiServerInner {
    // prefix -> next hops
    pub paths: BTreeMap<String, BTreeSet<String>>,
}

impl MockBgpApiServer {
    pub fn new_with(inner: Arc<Mutex<MockBgpApiServerInner>>) -> Self {
        Self { inner }
    }
}

pub async fn run(port: u32) {
    let sock_addr = format!("0.0.0.0:{port}").parse().unwrap();

    Server::builder()
        .add_service(BgpApiServer::new(MockBgpApiServer::default()))
        .serve(sock_addr)
        .await
        .unwrap();
}

pub async fn run_with(inner: Arc<Mutex<MockBgpApiServerInner>>, port: u32) {
    let sock_addr = format!("0.0.0.0:{port}").parse().unwrap();

    Server::builder()
        .add_service(BgpApiServer::new(MockBgpApiServer::new_with(inner)))
        .serve(sock_addr)
        .await
        .unwrap();
}

#[tonic::async_trait]
impl BgpApi for MockBgpApiServer {
    async fn health(&self, _req: Request<HealthRequest>) -> Result<Response<()>, Status> {
        Ok(Response::new(()))
    }

    async fn get_path(
        &self,
        req: Request<GetPathRequest>,
    ) -> Result<Response<GetPathResponse>, Status> {
        let inner = self.inner.lock().unwrap();
        let path = inner.paths.get(&req.get_ref().prefix).map(|nexthops| Path {
            prefix: req.get_ref().prefix.clone(),
            nexthops: nexthops.iter().cloned().collect(),
        });
        Ok(Response::new(GetPathResponse { path }))
    }

    async fn add_path(
        &self,
        req: Request<AddPathRequest>,
    ) -> Result<Response<AddPathResponse>, Status> {
        let req = req.into_inner();
        if req.nexthops.is_empty() {
            return Err(Status::invalid_argument("path must have next hops"));
        }
        {
            let mut inner = self.inner.lock().unwrap();
            inner.paths.entry(req.prefix).or_default().extend(req.nexthops);
        }
        Ok(Response::new(AddPathResponse {}))
    }

    async fn delete_path(
        &self,
        req: Request<DeletePathRequest>,
    ) -> Result<Response<DeletePathResponse>, Status> {
        let req = req.into_inner();
        {
            let mut inner = self.inner.lock().unwrap();
            let remove = match inner.paths.get_mut(&req.prefix) {
                None => return Err(Status::not_found(req.prefix)),
                Some(nexthops) => {
                    nexthops.retain(|n| !req.nexthops.is_empty() && !req.nexthops.contains(n));
                    nexthops.is_empty()
                }
            };
            if remove {
                inner.paths.remove(&req.prefix);
            }
        }
        Ok(Response::new(DeletePathResponse {}))
    }
}
