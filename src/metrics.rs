//! Metrics and span instrumentation, feature-gated like the rest of the
//! observability stack (`metrics` for Prometheus counters, `tracing` for
//! span helpers).

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
};
#[cfg(feature = "metrics")]
use opentelemetry_prometheus::PrometheusExporter;

#[cfg(feature = "metrics")]
pub static METRICS: Lazy<RowguardMetrics> = Lazy::new(RowguardMetrics::init);

#[cfg(feature = "metrics")]
pub struct RowguardMetrics {
    pub exporter: PrometheusExporter,
    pub queries_total: Counter<u64>,
    pub query_errors_total: Counter<u64>,
    pub query_duration: Histogram<f64>,
    pub mutations_total: Counter<u64>,
    pub mutation_duration: Histogram<f64>,
    pub guard_rejections_total: Counter<u64>,
    pub idempotency_claims_total: Counter<u64>,
    pub idempotency_conflicts_total: Counter<u64>,
    pub idempotency_replays_total: Counter<u64>,
}

#[cfg(feature = "metrics")]
impl RowguardMetrics {
    pub fn init() -> Self {
        let exporter = opentelemetry_prometheus::exporter()
            .build()
            .expect("failed to build prometheus exporter");
        let meter = global::meter("rowguard");

        let queries_total = meter
            .u64_counter("rowguard_queries_total")
            .with_description("Total queries executed")
            .build();

        let query_errors_total = meter
            .u64_counter("rowguard_query_errors_total")
            .with_description("Queries that returned an error")
            .build();

        let query_duration = meter
            .f64_histogram("rowguard_query_duration_seconds")
            .with_description("Duration of queries")
            .build();

        let mutations_total = meter
            .u64_counter("rowguard_mutations_total")
            .with_description("Mutation transactions committed")
            .build();

        let mutation_duration = meter
            .f64_histogram("rowguard_mutation_duration_seconds")
            .with_description("Duration of mutation transactions, begin to commit")
            .build();

        let guard_rejections_total = meter
            .u64_counter("rowguard_guard_rejections_total")
            .with_description("Mutations aborted by a business guard")
            .build();

        let idempotency_claims_total = meter
            .u64_counter("rowguard_idempotency_claims_total")
            .with_description("Idempotency keys claimed")
            .build();

        let idempotency_conflicts_total = meter
            .u64_counter("rowguard_idempotency_conflicts_total")
            .with_description("Requests rejected because their key was in flight")
            .build();

        let idempotency_replays_total = meter
            .u64_counter("rowguard_idempotency_replays_total")
            .with_description("Requests answered from a finalized idempotency record")
            .build();

        Self {
            exporter,
            queries_total,
            query_errors_total,
            query_duration,
            mutations_total,
            mutation_duration,
            guard_rejections_total,
            idempotency_claims_total,
            idempotency_conflicts_total,
            idempotency_replays_total,
        }
    }

    pub fn record_query_duration(&self, elapsed: std::time::Duration) {
        self.queries_total.add(1, &[]);
        self.query_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_query_error(&self) {
        self.query_errors_total.add(1, &[]);
    }

    pub fn record_mutation(&self, elapsed: std::time::Duration) {
        self.mutations_total.add(1, &[]);
        self.mutation_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_guard_rejection(&self) {
        self.guard_rejections_total.add(1, &[]);
    }

    pub fn record_idempotency_claim(&self) {
        self.idempotency_claims_total.add(1, &[]);
    }

    pub fn record_idempotency_conflict(&self) {
        self.idempotency_conflicts_total.add(1, &[]);
    }

    pub fn record_idempotency_replay(&self) {
        self.idempotency_replays_total.add(1, &[]);
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::Span;

    /// Install a minimal registry subscriber so spans have somewhere to go
    /// when the embedding application does not bring its own.
    pub fn init_registry() {
        use tracing_subscriber::util::SubscriberInitExt;
        let _ = tracing_subscriber::registry().try_init();
    }

    pub fn acquire_connection_span() -> Span {
        tracing::debug_span!("acquire_connection")
    }

    pub fn begin_transaction_span() -> Span {
        tracing::debug_span!("begin_transaction")
    }

    pub fn commit_transaction_span() -> Span {
        tracing::debug_span!("commit_transaction")
    }

    pub fn rollback_transaction_span() -> Span {
        tracing::debug_span!("rollback_transaction")
    }

    pub fn execute_query_span(sql: &str) -> Span {
        tracing::debug_span!("execute_query", sql = %sql)
    }

    pub fn mutation_span(action: &str) -> Span {
        tracing::info_span!("mutation", action = %action)
    }

    pub fn idempotency_claim_span(key: &str) -> Span {
        tracing::debug_span!("idempotency_claim", key = %key)
    }
}
