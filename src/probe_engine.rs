use crate::config::Config;
use crate::grpc::{GrpcCalls, GrpcStream};
use crate::http_rpc::HttpCalls;
use crate::output::countdown;
use crate::precheck::{Availability, HealthCheck};
use crate::probe::{self, Probe, ProbeSettings};
use crate::probe_result::{ProbeKind, ProbeResult, RunReport};
use crate::reporter::ProbeReporter;
use crate::websocket::WsLogs;
use anyhow::{Result, anyhow};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Builds the transport adapter for one probe kind.
pub trait TransportFactory: Send + Sync {
    fn build(&self, kind: ProbeKind, config: &Config) -> Result<Probe>;
}

/// Real network adapters.
pub struct LiveTransports;

impl TransportFactory for LiveTransports {
    fn build(&self, kind: ProbeKind, config: &Config) -> Result<Probe> {
        let endpoint = config
            .endpoint(kind)
            .ok_or_else(|| anyhow!("no endpoint configured for {}", kind))?
            .to_string();
        let token = config.grpc_token.clone();
        let commitment = config.commitment;

        Ok(match kind {
            ProbeKind::GrpcStream => {
                Probe::Stream(Box::new(GrpcStream::new(endpoint, token, commitment)))
            }
            ProbeKind::GrpcCalls => Probe::Poll(Box::new(GrpcCalls::new(endpoint, token, commitment))),
            ProbeKind::WebSocketStream => Probe::Stream(Box::new(WsLogs::new(endpoint, commitment))),
            ProbeKind::HttpCalls => Probe::Poll(Box::new(HttpCalls::new(
                endpoint,
                config.accounts.clone(),
                commitment,
            ))),
        })
    }
}

pub struct ProbeEngine {
    config: Arc<Config>,
    transports: Arc<dyn TransportFactory>,
    health: Arc<dyn HealthCheck>,
    reporters: Vec<Box<dyn ProbeReporter>>,
}

impl ProbeEngine {
    pub fn new(
        config: Config,
        transports: Arc<dyn TransportFactory>,
        health: Arc<dyn HealthCheck>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            transports,
            health,
            reporters: Vec::new(),
        }
    }

    pub fn register_reporter(&mut self, reporter: Box<dyn ProbeReporter>) -> &mut Self {
        self.reporters.push(reporter);
        self
    }

    /// Run every enabled probe once and hand the assembled report to the
    /// reporters. Probe failures never abort the run.
    pub async fn run(&self) -> Result<RunReport> {
        if self.reporters.is_empty() {
            return Err(anyhow!("No reporters registered"));
        }

        for reporter in &self.reporters {
            if let Err(e) = reporter.begin(&self.config).await {
                error!("Reporter '{}' failed to start: {}", reporter.name(), e);
            }
        }

        let kinds = self.config.probes.kinds();
        if kinds.is_empty() {
            warn!("No probes enabled, nothing to test");
        }

        let started_at = Utc::now();
        let started = Instant::now();
        let results = if self.config.parallel {
            self.run_parallel(&kinds).await
        } else {
            self.run_sequential(&kinds).await
        };

        let report = RunReport::new(
            started_at,
            started.elapsed(),
            self.config.as_ref().clone(),
            results,
        );
        info!(
            "Probe run completed in {:.2}s - {}/{} probes clean",
            report.total_duration.as_secs_f64(),
            report.results.iter().filter(|(_, r)| !r.failed).count(),
            report.results.len()
        );

        self.notify_reporters(&report).await;
        Ok(report)
    }

    async fn run_sequential(&self, kinds: &[ProbeKind]) -> Vec<(ProbeKind, ProbeResult)> {
        let mut results = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            countdown(kind, self.config.interval()).await;
            let result = self.execute(kind).await;
            self.notify_finished(kind, &result).await;
            results.push((kind, result));
        }
        results
    }

    async fn run_parallel(&self, kinds: &[ProbeKind]) -> Vec<(ProbeKind, ProbeResult)> {
        info!("Running {} probes in parallel", kinds.len());
        join_all(kinds.iter().map(|&kind| async move {
            let result = self.execute(kind).await;
            self.notify_finished(kind, &result).await;
            (kind, result)
        }))
        .await
    }

    /// Runs one probe on its own task so a panic inside it is contained.
    async fn execute(&self, kind: ProbeKind) -> ProbeResult {
        let task = tokio::spawn(execute_probe(
            kind,
            self.config.clone(),
            self.transports.clone(),
            self.health.clone(),
        ));
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!("{} probe aborted: {}", kind, e);
                ProbeResult::sentinel()
            }
        }
    }

    async fn notify_finished(&self, kind: ProbeKind, result: &ProbeResult) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.probe_finished(kind, result).await {
                error!("Reporter '{}' failed: {}", reporter.name(), e);
            }
        }
    }

    async fn notify_reporters(&self, report: &RunReport) {
        for reporter in &self.reporters {
            if let Err(e) = reporter.report(report).await {
                error!("Reporter '{}' failed: {}", reporter.name(), e);
            }
        }
    }
}

async fn execute_probe(
    kind: ProbeKind,
    config: Arc<Config>,
    transports: Arc<dyn TransportFactory>,
    health: Arc<dyn HealthCheck>,
) -> ProbeResult {
    if config.precheck {
        if let Some(endpoint) = config.endpoint(kind) {
            if health.check(endpoint).await == Availability::Unavailable {
                warn!("{} endpoint is under maintenance, skipping", kind);
                return ProbeResult::sentinel();
            }
        }
    }

    let settings = ProbeSettings::from_config(kind, &config);
    let probe = match transports.build(kind, &config) {
        Ok(probe) => probe,
        Err(e) => {
            error!("{} could not be set up: {}", kind, settings.describe(&e));
            return ProbeResult::sentinel();
        }
    };

    probe::run(probe, &settings).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProbeSet;
    use crate::probe::Inbound;
    use crate::probe::tests::{ACCOUNT, FakePoller, FakeStream, event};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedSender;

    /// gRPC stream refuses to connect, gRPC calls panic, the WebSocket sees two
    /// events and HTTP polling succeeds.
    #[derive(Default)]
    struct ScriptedTransports {
        healthy: bool,
        built: Mutex<Vec<ProbeKind>>,
        senders: Mutex<Vec<UnboundedSender<Result<Inbound>>>>,
    }

    impl ScriptedTransports {
        fn healthy() -> Self {
            Self {
                healthy: true,
                ..Self::default()
            }
        }

        fn open_stream(&self, messages: Vec<Result<Inbound>>) -> Probe {
            let (stream, tx) = FakeStream::new(messages);
            self.senders.lock().unwrap().push(tx);
            Probe::Stream(Box::new(stream))
        }
    }

    impl TransportFactory for ScriptedTransports {
        fn build(&self, kind: ProbeKind, _config: &Config) -> Result<Probe> {
            self.built.lock().unwrap().push(kind);
            if self.healthy {
                return Ok(match kind {
                    ProbeKind::GrpcStream | ProbeKind::WebSocketStream => {
                        self.open_stream(Vec::new())
                    }
                    ProbeKind::GrpcCalls | ProbeKind::HttpCalls => {
                        Probe::Poll(Box::new(FakePoller::succeeding()))
                    }
                });
            }
            match kind {
                ProbeKind::GrpcStream => Ok(Probe::Stream(Box::new(FakeStream::failing()))),
                ProbeKind::GrpcCalls => panic!("poller exploded"),
                ProbeKind::WebSocketStream => {
                    Ok(self.open_stream(vec![event(&[ACCOUNT]), event(&[ACCOUNT])]))
                }
                ProbeKind::HttpCalls => Ok(Probe::Poll(Box::new(FakePoller::succeeding()))),
            }
        }
    }

    struct Maintenance(Vec<&'static str>);

    #[async_trait]
    impl HealthCheck for Maintenance {
        async fn check(&self, endpoint: &str) -> Availability {
            if self.0.iter().any(|down| *down == endpoint) {
                Availability::Unavailable
            } else {
                Availability::Available
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ProbeReporter for Recorder {
        async fn begin(&self, _config: &Config) -> Result<()> {
            self.events.lock().unwrap().push("begin".into());
            Ok(())
        }

        async fn probe_finished(&self, kind: ProbeKind, _result: &ProbeResult) -> Result<()> {
            self.events.lock().unwrap().push(format!("finished {}", kind));
            Ok(())
        }

        async fn report(&self, report: &RunReport) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("report {}", report.results.len()));
            Ok(())
        }

        fn name(&self) -> &str {
            "recorder"
        }
    }

    fn config(interval_secs: u64) -> Config {
        Config {
            grpc_url: Some("https://grpc.test:443".into()),
            ws_url: Some("wss://ws.test".into()),
            http_url: Some("https://http.test".into()),
            duration_secs: 10,
            interval_secs,
            precheck: false,
            probes: ProbeSet::all(),
            ..Config::default()
        }
    }

    fn engine(
        config: Config,
        transports: Arc<ScriptedTransports>,
        down: Vec<&'static str>,
    ) -> (ProbeEngine, Arc<Mutex<Vec<String>>>) {
        let mut engine = ProbeEngine::new(config, transports, Arc::new(Maintenance(down)));
        let recorder = Recorder::default();
        let events = recorder.events.clone();
        engine.register_reporter(Box::new(recorder));
        (engine, events)
    }

    #[tokio::test(start_paused = true)]
    async fn failing_probes_do_not_stop_the_run() {
        let transports = Arc::new(ScriptedTransports::default());
        let (engine, events) = engine(config(2), transports.clone(), Vec::new());

        let report = engine.run().await.unwrap();

        assert_eq!(report.result(ProbeKind::GrpcStream), Some(&ProbeResult::sentinel()));
        assert_eq!(report.result(ProbeKind::GrpcCalls), Some(&ProbeResult::sentinel()));
        assert_eq!(
            report.result(ProbeKind::WebSocketStream),
            Some(&ProbeResult::completed("10 seconds".into(), 2))
        );
        assert_eq!(
            report.result(ProbeKind::HttpCalls),
            Some(&ProbeResult::completed("10 seconds".into(), 10))
        );
        assert_eq!(*transports.built.lock().unwrap(), ProbeKind::ALL.to_vec());

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                "begin",
                "finished gRPC Stream",
                "finished gRPC Calls",
                "finished WebSocket Stream",
                "finished HTTP Calls",
                "report 4",
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn sequential_run_counts_down_between_probes() {
        let (engine, _) = engine(config(2), Arc::new(ScriptedTransports::healthy()), Vec::new());
        let report = engine.run().await.unwrap();

        assert!(report.results.iter().all(|(_, r)| !r.failed));
        assert!(report.total_duration >= Duration::from_secs(48));
        assert!(report.total_duration < Duration::from_secs(49));
    }

    #[tokio::test(start_paused = true)]
    async fn parallel_run_overlaps_probes_and_keeps_order() {
        let mut config = config(5);
        config.parallel = true;
        let (engine, _) = engine(config, Arc::new(ScriptedTransports::healthy()), Vec::new());

        let report = engine.run().await.unwrap();

        let kinds: Vec<_> = report.results.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, ProbeKind::ALL.to_vec());
        assert!(report.results.iter().all(|(_, r)| !r.failed));
        assert!(report.total_duration < Duration::from_secs(11));
    }

    #[tokio::test(start_paused = true)]
    async fn maintenance_skips_the_probe_without_connecting() {
        let mut config = config(0);
        config.precheck = true;
        let transports = Arc::new(ScriptedTransports::healthy());
        let (engine, _) = engine(config, transports.clone(), vec!["wss://ws.test"]);

        let report = engine.run().await.unwrap();

        assert_eq!(
            report.result(ProbeKind::WebSocketStream),
            Some(&ProbeResult::sentinel())
        );
        assert!(!report.result(ProbeKind::HttpCalls).unwrap().failed);
        assert!(
            !transports
                .built
                .lock()
                .unwrap()
                .contains(&ProbeKind::WebSocketStream)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn empty_probe_set_still_reports() {
        let mut config = config(3);
        config.probes = ProbeSet::empty();
        let (engine, events) = engine(config, Arc::new(ScriptedTransports::healthy()), Vec::new());

        let report = engine.run().await.unwrap();

        assert!(report.results.is_empty());
        assert_eq!(*events.lock().unwrap(), vec!["begin", "report 0"]);
    }

    struct Unbuildable;

    impl TransportFactory for Unbuildable {
        fn build(&self, kind: ProbeKind, _config: &Config) -> Result<Probe> {
            Err(anyhow!("endpoint rejected").context(format!("cannot build {}", kind)))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn setup_failures_are_sentinels_in_both_verbosity_modes() {
        for verbose_errors in [false, true] {
            let config = Config {
                verbose_errors,
                ..config(0)
            };
            let mut engine = ProbeEngine::new(
                config,
                Arc::new(Unbuildable),
                Arc::new(Maintenance(Vec::new())),
            );
            engine.register_reporter(Box::new(Recorder::default()));

            let report = engine.run().await.unwrap();
            assert_eq!(report.results.len(), 4);
            assert!(report.results.iter().all(|(_, r)| *r == ProbeResult::sentinel()));
        }
    }

    #[tokio::test]
    async fn run_requires_a_reporter() {
        let engine = ProbeEngine::new(
            config(0),
            Arc::new(ScriptedTransports::healthy()),
            Arc::new(Maintenance(Vec::new())),
        );
        assert!(engine.run().await.is_err());
    }
}
