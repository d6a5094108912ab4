use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub events_received_total: IntCounterVec,
    pub events_processed_total: IntCounterVec,
    pub intake_overflow_total: IntCounterVec,
    pub extraction_invocations_total: IntCounterVec,
    pub store_deferred_total: IntCounterVec,
    pub retry_attempts_total: IntCounterVec,

    pub dispatch_duration_seconds: HistogramVec,
    pub pending_queue_depth: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let events_received_total = IntCounterVec::new(
            Opts::new("card_sync_events_received_total", "Notifications accepted by intake"),
            &["action_kind"],
        )
        .expect("metric");

        let events_processed_total = IntCounterVec::new(
            Opts::new(
                "card_sync_events_processed_total",
                "Notifications finalized by the dispatcher",
            ),
            &["class", "result"], // class: new|desc_changed|metadata_only|irrelevant, result: success|failed|dropped
        )
        .expect("metric");

        let intake_overflow_total = IntCounterVec::new(
            Opts::new(
                "card_sync_intake_overflow_total",
                "Notifications acked but dropped because the dispatcher channel was full",
            ),
            &["action_kind"],
        )
        .expect("metric");

        let extraction_invocations_total = IntCounterVec::new(
            Opts::new(
                "card_sync_extraction_invocations_total",
                "Extractor invocations",
            ),
            &["result"], // success|failed|timeout
        )
        .expect("metric");

        let store_deferred_total = IntCounterVec::new(
            Opts::new(
                "card_sync_store_deferred_total",
                "Store operations deferred to the pending-updates queue",
            ),
            &["operation_kind"],
        )
        .expect("metric");

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("card_sync_retry_attempts_total", "Retry worker attempts"),
            &["outcome"], // succeeded|failed|failed_terminal
        )
        .expect("metric");

        let dispatch_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "card_sync_dispatch_duration_seconds",
                "Time to process one notification end to end",
            ),
            &["class"],
        )
        .expect("metric");

        let pending_queue_depth = IntGaugeVec::new(
            Opts::new("card_sync_pending_queue_depth", "Pending-updates rows by status"),
            &["status"],
        )
        .expect("metric");

        for c in [
            Box::new(events_received_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(events_processed_total.clone()),
            Box::new(intake_overflow_total.clone()),
            Box::new(extraction_invocations_total.clone()),
            Box::new(store_deferred_total.clone()),
            Box::new(retry_attempts_total.clone()),
            Box::new(dispatch_duration_seconds.clone()),
            Box::new(pending_queue_depth.clone()),
        ] {
            registry.register(c).expect("register metric");
        }

        Self {
            registry,
            events_received_total,
            events_processed_total,
            intake_overflow_total,
            extraction_invocations_total,
            store_deferred_total,
            retry_attempts_total,
            dispatch_duration_seconds,
            pending_queue_depth,
        }
    }

    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .expect("encode metrics");
        String::from_utf8(buffer).expect("utf8 metrics")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
