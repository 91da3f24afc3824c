//! Dispatch metrics

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};

/// Which pass a send belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPass {
    New,
    Retry,
}

impl SendPass {
    fn as_str(self) -> &'static str {
        match self {
            SendPass::New => "new",
            SendPass::Retry => "retry",
        }
    }
}

/// Prometheus collectors for dispatcher runs
#[derive(Clone)]
pub struct DispatchMetrics {
    /// Gateway sends by pass and outcome
    messages: IntCounterVec,
    /// Campaign outcomes per run (processed, waiting, skipped, failed)
    campaigns: IntCounterVec,
    runs: IntCounter,
    run_duration: Histogram,
}

impl DispatchMetrics {
    /// Create the collectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let messages = IntCounterVec::new(
            Opts::new("outreach_messages_total", "Gateway sends by pass and outcome"),
            &["pass", "outcome"],
        )?;
        registry.register(Box::new(messages.clone()))?;

        let campaigns = IntCounterVec::new(
            Opts::new("outreach_campaign_outcomes_total", "Campaign outcomes per dispatch run"),
            &["outcome"],
        )?;
        registry.register(Box::new(campaigns.clone()))?;

        let runs = IntCounter::with_opts(Opts::new(
            "outreach_dispatch_runs_total",
            "Completed dispatch runs",
        ))?;
        registry.register(Box::new(runs.clone()))?;

        let run_duration = Histogram::with_opts(
            HistogramOpts::new(
                "outreach_dispatch_run_duration_seconds",
                "Wall time of a dispatch run",
            )
            .buckets(vec![0.05, 0.25, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        )?;
        registry.register(Box::new(run_duration.clone()))?;

        Ok(Self {
            messages,
            campaigns,
            runs,
            run_duration,
        })
    }

    pub fn record_send(&self, pass: SendPass, success: bool) {
        let outcome = if success { "sent" } else { "failed" };
        self.messages
            .with_label_values(&[pass.as_str(), outcome])
            .inc();
    }

    pub fn record_campaign(&self, outcome: &str) {
        self.campaigns.with_label_values(&[outcome]).inc();
    }

    pub fn record_run(&self, seconds: f64) {
        self.runs.inc();
        self.run_duration.observe(seconds);
    }
}
