use crate::config::Config;
use crate::elapsed::format_duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Sentinel elapsed value meaning "no meaningful duration".
pub const NO_ELAPSED: &str = "-1";
/// Sentinel count meaning "no events observed and an error occurred".
pub const NO_EVENTS: i64 = -1;

/// Transport exercised by a probe. Declaration order is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProbeKind {
    GrpcStream,
    GrpcCalls,
    WebSocketStream,
    HttpCalls,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 4] = [
        ProbeKind::GrpcStream,
        ProbeKind::GrpcCalls,
        ProbeKind::WebSocketStream,
        ProbeKind::HttpCalls,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            ProbeKind::GrpcStream => "gRPC Stream",
            ProbeKind::GrpcCalls => "gRPC Calls",
            ProbeKind::WebSocketStream => "WebSocket Stream",
            ProbeKind::HttpCalls => "HTTP Calls",
        }
    }
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub elapsed: String,
    pub event_count: i64,
    pub failed: bool,
}

/// How a result is presented to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Clean,
    Partial,
    Failed,
}

impl ProbeResult {
    /// The fixed "no useful measurement obtained" result.
    pub fn sentinel() -> Self {
        ProbeResult {
            elapsed: NO_ELAPSED.to_string(),
            event_count: NO_EVENTS,
            failed: true,
        }
    }

    pub fn completed(elapsed: String, event_count: u64) -> Self {
        ProbeResult {
            elapsed,
            event_count: event_count as i64,
            failed: false,
        }
    }

    /// Result of an error path. Events counted before the error are kept,
    /// otherwise the sentinel is returned.
    pub fn from_error(elapsed: String, event_count: u64) -> Self {
        if event_count == 0 {
            return Self::sentinel();
        }
        ProbeResult {
            elapsed,
            event_count: event_count as i64,
            failed: true,
        }
    }

    pub fn outcome(&self) -> Outcome {
        match (self.failed, self.event_count > 0) {
            (false, _) => Outcome::Clean,
            (true, true) => Outcome::Partial,
            (true, false) => Outcome::Failed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub total_elapsed: String,
    #[serde(skip)]
    pub total_duration: Duration,
    pub config: Config,
    pub results: Vec<(ProbeKind, ProbeResult)>,
}

impl RunReport {
    /// Results are stored in probe execution order regardless of completion order.
    pub fn new(
        started_at: DateTime<Utc>,
        total_duration: Duration,
        config: Config,
        mut results: Vec<(ProbeKind, ProbeResult)>,
    ) -> Self {
        results.sort_by_key(|(kind, _)| *kind);
        Self {
            started_at,
            total_elapsed: format_duration(total_duration),
            total_duration,
            config,
            results,
        }
    }

    #[cfg(test)]
    pub fn result(&self, kind: ProbeKind) -> Option<&ProbeResult> {
        self.results
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, result)| result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holds_invariants(result: &ProbeResult) -> bool {
        (result.event_count != NO_EVENTS || result.failed)
            && (result.elapsed != NO_ELAPSED || result.event_count == NO_EVENTS)
    }

    #[test]
    fn error_without_events_is_sentinel() {
        let result = ProbeResult::from_error("12 seconds".into(), 0);
        assert_eq!(result, ProbeResult::sentinel());
        assert!(holds_invariants(&result));
        assert_eq!(result.outcome(), Outcome::Failed);
    }

    #[test]
    fn error_after_events_is_partial() {
        let result = ProbeResult::from_error("5 seconds".into(), 3);
        assert_eq!(result.event_count, 3);
        assert!(result.failed);
        assert_eq!(result.elapsed, "5 seconds");
        assert!(holds_invariants(&result));
        assert_eq!(result.outcome(), Outcome::Partial);
    }

    #[test]
    fn clean_run_with_zero_events_is_success() {
        let result = ProbeResult::completed("1 minute".into(), 0);
        assert!(!result.failed);
        assert!(holds_invariants(&result));
        assert_eq!(result.outcome(), Outcome::Clean);
    }

    #[test]
    fn report_orders_results_by_kind() {
        let report = RunReport::new(
            Utc::now(),
            Duration::from_secs(61),
            Config::default(),
            vec![
                (ProbeKind::HttpCalls, ProbeResult::sentinel()),
                (ProbeKind::GrpcStream, ProbeResult::completed("1 second".into(), 1)),
            ],
        );
        let kinds: Vec<_> = report.results.iter().map(|(k, _)| *k).collect();
        assert_eq!(kinds, vec![ProbeKind::GrpcStream, ProbeKind::HttpCalls]);
        assert_eq!(report.total_elapsed, "1 minute, 1 second");
        assert!(report.result(ProbeKind::GrpcCalls).is_none());
    }
}
