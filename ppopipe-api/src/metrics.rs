use ppopipe_core::Result;
use ppopipe_core::report::Report;
use tracing::info;

/// Receives one report per training iteration.
pub trait MetricSink {
    fn send(&mut self, report: &Report) -> Result<()>;
}

impl<F: FnMut(&Report) -> Result<()>> MetricSink for F {
    fn send(&mut self, report: &Report) -> Result<()> {
        self(report)
    }
}

/// Logs every metric through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn send(&mut self, report: &Report) -> Result<()> {
        for (metric, value) in report.iter() {
            info!(target: "ppopipe::metrics", metric, value);
        }
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CollectingSink {
    pub reports: Vec<Report>,
}

impl MetricSink for CollectingSink {
    fn send(&mut self, report: &Report) -> Result<()> {
        self.reports.push(report.clone());
        Ok(())
    }
}
