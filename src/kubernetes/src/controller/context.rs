use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
pub use kube::{
    runtime::{
        controller::Action,
        events::{Event, EventType, Recorder, Reporter},
    },
    Client, Resource,
};
use serde::Serialize;
use tokio::sync::RwLock;

use elbd_ipam::pool::PoolRegistry;
use elbd_route::speaker::Speaker;
use elbd_trace::error::TraceableError;

use crate::util::get_namespaced_name;

use super::{error::Error, metrics::Metrics, requeue::RequeueTable, selector::Selector};

pub trait Ctx {
    fn metrics(&self) -> &Metrics;
    fn client(&self) -> &Client;
    fn requeue(&self) -> &RequeueTable;
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    // Kubernetes client
    pub client: Client,
    // Reconcile interval
    pub interval: u64,
    // Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    // Prometheus metrics
    pub metrics: Metrics,
    // Backoff shared by every reconciler
    pub requeue: Arc<RequeueTable>,
}

impl Ctx for Context {
    fn client(&self) -> &Client {
        &self.client
    }

    fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    fn requeue(&self) -> &RequeueTable {
        &self.requeue
    }
}

pub struct ContextWith<T: Clone> {
    pub(crate) inner: Context,
    pub component: T,
}

impl<T: Clone> Ctx for ContextWith<T> {
    fn client(&self) -> &Client {
        &self.inner.client
    }

    fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    fn requeue(&self) -> &RequeueTable {
        &self.inner.requeue
    }
}

impl<T: Clone> ContextWith<T> {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.inner.interval)
    }

    pub async fn touch(&self) {
        self.inner.diagnostics.write().await.last_event = Utc::now();
    }

    /// Records an event on `res`. Failing to publish never fails the
    /// reconciliation that produced it.
    pub async fn publish<K: Resource<DynamicType = ()>>(
        &self,
        res: &K,
        type_: EventType,
        reason: &str,
        action: &str,
        note: String,
    ) {
        let recorder = self
            .inner
            .diagnostics
            .read()
            .await
            .recorder(self.inner.client.clone(), res);
        if let Err(e) = recorder
            .publish(Event {
                type_,
                reason: reason.to_string(),
                note: Some(note),
                action: action.to_string(),
                secondary: None,
            })
            .await
        {
            tracing::warn!(name = get_namespaced_name(res), reason, error = ?e, "failed to publish event");
        }
    }
}

/// What the EIP and Service reconcilers share: the pool registry, the route
/// plane and the strategy picking addresses for services.
#[derive(Clone)]
pub struct LbComponent {
    pub registry: PoolRegistry,
    pub speaker: Arc<dyn Speaker>,
    pub selector: Arc<dyn Selector>,
    // set when running as the per-node agent
    pub node_name: Option<String>,
}

impl LbComponent {
    /// Agents only program their local speaker. Allocation and every status
    /// write belong to the controller.
    pub fn is_agent(&self) -> bool {
        self.node_name.is_some()
    }
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    pub registry: prometheus::Registry,
    pub requeue: Arc<RequeueTable>,
}

impl State {
    pub fn new(component: &str) -> State {
        State {
            diagnostics: Arc::new(RwLock::new(Diagnostics::new(component.to_string()))),
            registry: prometheus::Registry::default(),
            requeue: Arc::new(RequeueTable::new()),
        }
    }
    /// Metrics getter
    pub fn metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    pub fn to_context_with<T: Clone>(
        &self,
        client: Client,
        interval: u64,
        component: T,
        metrics: Metrics,
    ) -> Arc<ContextWith<T>> {
        Arc::new(ContextWith {
            inner: Context {
                client,
                interval,
                diagnostics: self.diagnostics.clone(),
                metrics,
                requeue: self.requeue.clone(),
            },
            component,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}

impl Diagnostics {
    pub fn new(component: String) -> Self {
        Self {
            last_event: Utc::now(),
            reporter: component.into(),
        }
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "elbd".into(),
        }
    }
}

impl Diagnostics {
    fn recorder<T: Resource<DynamicType = ()>>(&self, client: Client, res: &T) -> Recorder {
        Recorder::new(client, self.reporter.clone(), res.object_ref(&()))
    }
}

#[tracing::instrument(skip_all)]
pub fn error_policy<T: Resource<DynamicType = ()>, C: Ctx>(
    resource: Arc<T>,
    error: &Error,
    ctx: Arc<C>,
) -> Action {
    let key = get_namespaced_name(resource.as_ref());
    ctx.metrics()
        .reconcile_failure::<T>(&error.metric_label());
    if error.is_not_found() {
        ctx.requeue().forget(&key);
        return Action::await_change();
    }
    if error.is_conflict() {
        tracing::info!(name = key, "conflicted with a newer version, retrying");
        return Action::requeue(Duration::from_secs(1));
    }
    let after = ctx.requeue().get_requeue_time(&key);
    tracing::warn!(name = key, error = %error, requeue_after = after.as_secs(), "reconcile failed");
    Action::requeue(after)
}
