use std::{sync::Arc, time::Duration};

use actix_web::{
    dev::Server, get, middleware, web::Data, App, HttpRequest, HttpResponse, HttpServer,
    Responder,
};
use kube::Client;
use prometheus::{Encoder, TextEncoder};

use elbd_ipam::pool::PoolRegistry;
use elbd_route::{
    iptables::{HostRunner, PortForwarder},
    speaker::GrpcSpeaker,
};
use elbd_trace::init::{prepare_tracing, TraceConfig};

use super::{
    config::{bind_addr, Config},
    context::{LbComponent, State},
    error::Error,
    metrics::Metrics,
    port_forward,
    reconciler,
    selector::StrategyRegistry,
};

/// Which part of the system this process plays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    Controller,
    Agent { node_name: String },
}

impl Role {
    fn name(&self) -> &'static str {
        match self {
            Role::Controller => "elbd-controller",
            Role::Agent { .. } => "elbd-agent",
        }
    }

    fn node_name(&self) -> Option<String> {
        match self {
            Role::Controller => None,
            Role::Agent { node_name } => Some(node_name.clone()),
        }
    }
}

pub fn start(config: Config, trace: TraceConfig, role: Role) -> Result<(), Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(Error::StdIo)?
        .block_on(run(config, trace, role))
}

#[tracing::instrument(skip_all, fields(role = role.name()))]
async fn run(config: Config, trace_config: TraceConfig, role: Role) -> Result<(), Error> {
    prepare_tracing(trace_config).map_err(Error::Trace)?;

    let state = State::new(role.name());
    let metrics = Metrics::default()
        .register(&state.registry)
        .map_err(Error::Metrics)?;
    let selector = StrategyRegistry::new().get(&config.ip_strategy)?;
    let client = Client::try_default().await.map_err(Error::Kube)?;

    let speaker = GrpcSpeaker::new(
        &config.speaker_endpoint,
        Duration::from_secs(config.speaker_timeout),
    );
    if let Err(e) = speaker.health().await {
        tracing::warn!(endpoint = %config.speaker_endpoint, error = ?e, "BGP speaker is not reachable yet");
    }

    let component = LbComponent {
        registry: PoolRegistry::new(),
        speaker: Arc::new(speaker),
        selector,
        node_name: role.node_name(),
    };
    reconciler::restore(client.clone(), &component).await?;

    // port forwarding must be in place before the speaker can peer
    let forwarder = PortForwarder::new(HostRunner);
    let forward_rule = match (&role, &config.port_forward) {
        (Role::Agent { node_name }, Some(pf)) => {
            Some(port_forward::setup(client.clone(), node_name, pf, &forwarder).await?)
        }
        _ => None,
    };

    let servers = serve(&config, &state)?;
    tracing::info!(
        metrics_addr = %config.metrics_addr,
        readiness_addr = %config.readiness_addr,
        webhook_port = config.webhook_port,
        keepalived_http_port = config.keepalived_http_port,
        ip_strategy = %config.ip_strategy,
        "elbd is running"
    );

    let eip_state = state.clone();
    let eip_client = client.clone();
    let eip_component = component.clone();
    let eip_metrics = metrics.clone();
    let interval = config.requeue_interval;
    let eip_task = tokio::spawn(async move {
        reconciler::eip::run(eip_state, eip_client, interval, eip_component, eip_metrics).await;
    });

    let svc_state = state.clone();
    let svc_task = tokio::spawn(async move {
        reconciler::service_watcher::run(svc_state, client, interval, component, metrics).await;
    });

    let (servers, eip, svc) = tokio::join!(
        futures::future::try_join_all(servers),
        eip_task,
        svc_task
    );
    if let Err(e) = eip {
        tracing::error!(error = ?e, "Eip reconciler aborted");
    }
    if let Err(e) = svc {
        tracing::error!(error = ?e, "Service reconciler aborted");
    }

    if let Some(rule) = forward_rule {
        port_forward::teardown(&rule, &forwarder).await?;
        tracing::info!(rule = %rule, "removed port forwarding for BGP");
    }

    servers.map_err(Error::StdIo)?;
    Ok(())
}

fn serve(config: &Config, state: &State) -> Result<Vec<Server>, Error> {
    let mut servers = Vec::new();

    if let Some(addr) = bind_addr(&config.metrics_addr)? {
        let server_state = state.clone();
        let server = HttpServer::new(move || {
            App::new()
                .app_data(Data::new(server_state.clone()))
                .service(index)
                .service(metrics_)
                .wrap(middleware::Logger::default().exclude("/metrics"))
        })
        .bind(&addr)
        .map_err(Error::StdIo)?
        .shutdown_timeout(5)
        .run();
        servers.push(server);
    }

    if let Some(addr) = bind_addr(&config.readiness_addr)? {
        let server = HttpServer::new(|| App::new().service(health).service(ready))
            .bind(&addr)
            .map_err(Error::StdIo)?
            .shutdown_timeout(5)
            .run();
        servers.push(server);
    }

    Ok(servers)
}

#[get("/healthz")]
async fn health(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn ready(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("ready")
}

#[get("/metrics")]
async fn metrics_(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let metrics = c.metrics();
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    match encoder.encode(&metrics, &mut buffer) {
        Ok(_) => HttpResponse::Ok().body(buffer),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

#[get("/")]
async fn index(c: Data<State>, _req: HttpRequest) -> impl Responder {
    let d = c.diagnostics().await;
    HttpResponse::Ok().json(&d)
}
