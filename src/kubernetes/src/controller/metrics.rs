use kube::Resource;
use prometheus::{histogram_opts, opts, HistogramVec, IntCounterVec};
use prometheus::{IntGaugeVec, Registry};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Metrics {
    pub reconciliations: IntCounterVec,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    pub eip_addresses: IntGaugeVec,
    pub eip_used_addresses: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "elbd_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds"
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["controller"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!(
                "elbd_reconcile_failures_total",
                "Total count of reconciliation errors",
            ),
            &["controller", "error"],
        )
        .unwrap();
        let reconciliations = IntCounterVec::new(
            opts!(
                "elbd_reconciliations_total",
                "Total count of reconciliations",
            ),
            &["controller"],
        )
        .unwrap();
        let eip_addresses = IntGaugeVec::new(
            opts!(
                "elbd_eip_addresses",
                "The number of addresses an EIP pool holds"
            ),
            &["eip"],
        )
        .unwrap();
        let eip_used_addresses = IntGaugeVec::new(
            opts!(
                "elbd_eip_used_addresses",
                "The number of addresses of an EIP pool bound to services"
            ),
            &["eip"],
        )
        .unwrap();

        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            eip_addresses,
            eip_used_addresses,
        }
    }
}

fn controller_of<T: Resource<DynamicType = ()>>() -> String {
    T::kind(&()).to_lowercase()
}

impl Metrics {
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.eip_addresses.clone()))?;
        registry.register(Box::new(self.eip_used_addresses.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure<T: Resource<DynamicType = ()>>(&self, label: &str) {
        self.failures
            .with_label_values(&[&controller_of::<T>(), label])
            .inc()
    }

    /// Counts one reconciliation of `T` and times it until the returned guard is dropped.
    pub fn count_and_measure<T: Resource<DynamicType = ()>>(&self) -> ReconcileMeasurer {
        let controller = controller_of::<T>();
        self.reconciliations.with_label_values(&[&controller]).inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            controller,
        }
    }

    pub fn eip_set(&self, eip: &str, size: i64, used: i64) {
        self.eip_addresses.with_label_values(&[eip]).set(size);
        self.eip_used_addresses.with_label_values(&[eip]).set(used);
    }

    pub fn eip_remove(&self, eip: &str) {
        let _ = self.eip_addresses.remove_label_values(&[eip]);
        let _ = self.eip_used_addresses.remove_label_values(&[eip]);
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    controller: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[&self.controller])
            .observe(duration);
    }
}
