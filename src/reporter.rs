use crate::config::Config;
use crate::probe_result::{ProbeKind, ProbeResult, RunReport};
use anyhow::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ProbeReporter: Send + Sync {
    /// Called once before the first probe starts.
    async fn begin(&self, _config: &Config) -> Result<()> {
        Ok(())
    }

    async fn probe_finished(&self, _kind: ProbeKind, _result: &ProbeResult) -> Result<()> {
        Ok(())
    }

    async fn report(&self, report: &RunReport) -> Result<()>;

    fn name(&self) -> &str;
}
