use crate::config::Config;
use crate::probe_result::{Outcome, ProbeKind, ProbeResult, RunReport};
use crate::reporter::ProbeReporter;
use anyhow::Result;
use async_trait::async_trait;
use colored::{ColoredString, Colorize};
use std::fmt::Write as _;
use std::io::Write as _;
use std::time::Duration;

const ERROR_SUFFIX: &str = " - Error occurred";

fn paint(text: String, styled: bool, style: impl FnOnce(&str) -> ColoredString) -> String {
    if styled {
        style(&text).to_string()
    } else {
        text
    }
}

fn orange(text: &str) -> ColoredString {
    text.truecolor(255, 165, 0)
}

fn run_time(elapsed: &str) -> String {
    if elapsed.is_empty() {
        "0 seconds".to_string()
    } else {
        elapsed.to_string()
    }
}

fn enabled(on: bool) -> &'static str {
    if on { "Enabled" } else { "Disabled" }
}

/// Configuration summary printed around a run. The token is never echoed.
pub fn render_banner(config: &Config, title: &str, styled: bool) -> String {
    let unset = "not set";
    let mut lines = vec![
        format!("gRPC URL: {}", config.grpc_url.as_deref().unwrap_or(unset)),
        format!(
            "gRPC Token: {}",
            if config.grpc_token.is_some() { "set" } else { unset }
        ),
        format!("HTTP URL: {}", config.http_url.as_deref().unwrap_or(unset)),
        format!("WebSocket URL: {}", config.ws_url.as_deref().unwrap_or(unset)),
        format!("Accounts: {}", config.accounts.join(", ")),
        format!("Commitment: {}", config.commitment.as_str()),
        format!("Test Duration: {} seconds", config.duration_secs),
        format!("Test Interval: {} seconds", config.interval_secs),
        format!(
            "Mode: {}",
            if config.parallel { "parallel" } else { "sequential" }
        ),
        String::new(),
    ];
    for kind in ProbeKind::ALL {
        lines.push(format!("Test {}: {}", kind, enabled(config.probes.has(kind))));
    }

    let mut out = String::new();
    let _ = writeln!(out, "\n{}\n", paint(format!("{}:", title), styled, |s| s.bold().yellow()));
    for line in lines {
        let _ = writeln!(out, "{}", paint(line, styled, |s| s.yellow()));
    }
    out
}

fn render_result(kind: ProbeKind, result: &ProbeResult, styled: bool) -> String {
    let (run_time, data_count) = match result.outcome() {
        Outcome::Clean => (
            paint(run_time(&result.elapsed), styled, |s| s.green()),
            paint(result.event_count.to_string(), styled, |s| s.green()),
        ),
        Outcome::Partial => (
            paint(format!("{}{}", run_time(&result.elapsed), ERROR_SUFFIX), styled, orange),
            paint(format!("{}{}", result.event_count, ERROR_SUFFIX), styled, orange),
        ),
        Outcome::Failed => (
            paint(format!("0{}", ERROR_SUFFIX), styled, |s| s.red()),
            paint(format!("0{}", ERROR_SUFFIX), styled, |s| s.red()),
        ),
    };

    format!(
        "{}\nRun Time: {}\nData Count: {}\n\n",
        paint(format!("{} Results:", kind), styled, |s| s.cyan()),
        run_time,
        data_count
    )
}

pub fn render_results(report: &RunReport, styled: bool) -> String {
    let mut out = format!("{}\n\n", paint("Test Results:".into(), styled, |s| s.bold()));
    if report.results.is_empty() {
        out.push_str("No probes were run.\n\n");
    }
    for (kind, result) in &report.results {
        out.push_str(&render_result(*kind, result, styled));
    }
    out
}

/// Results, the configuration they were produced with and the total run time.
pub fn render_report(report: &RunReport, styled: bool) -> String {
    let mut out = render_results(report, styled);
    out.push_str(&render_banner(&report.config, "Configuration used in tests", styled));
    let _ = writeln!(
        out,
        "\n{}",
        paint(format!("Done in {}", report.total_elapsed), styled, |s| s.green())
    );
    out
}

pub fn render_status(kind: ProbeKind, result: &ProbeResult, styled: bool) -> String {
    if result.failed {
        paint(
            format!("{} encountered an error, continuing with other endpoint tests...", kind),
            styled,
            |s| s.red(),
        )
    } else {
        paint(format!("{} test completed!", kind), styled, |s| s.green())
    }
}

/// In-place countdown printed before a probe starts. Returns immediately for a
/// zero interval.
pub async fn countdown(kind: ProbeKind, interval: Duration) {
    let seconds = interval.as_secs();
    if seconds == 0 {
        return;
    }

    let mut stdout = std::io::stdout();
    for remaining in (1..=seconds).rev() {
        let message = format!("Starting {} test in {}s...", kind, remaining);
        let _ = write!(stdout, "\r{}", message.blue());
        let _ = stdout.flush();
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    let _ = writeln!(stdout);
}

pub struct ConsoleReporter {
    styled: bool,
}

impl ConsoleReporter {
    pub fn new(styled: bool) -> Self {
        Self { styled }
    }
}

#[async_trait]
impl ProbeReporter for ConsoleReporter {
    async fn begin(&self, config: &Config) -> Result<()> {
        print!("{}", render_banner(config, "Configuration", self.styled));
        Ok(())
    }

    async fn probe_finished(&self, kind: ProbeKind, result: &ProbeResult) -> Result<()> {
        println!("{}\n", render_status(kind, result, self.styled));
        Ok(())
    }

    async fn report(&self, report: &RunReport) -> Result<()> {
        print!("{}", render_report(report, self.styled));
        Ok(())
    }

    fn name(&self) -> &str {
        "console"
    }
}

/// Prints the whole run report as JSON on stdout.
pub struct JsonReporter;

#[async_trait]
impl ProbeReporter for JsonReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }

    fn name(&self) -> &str {
        "json"
    }
}
