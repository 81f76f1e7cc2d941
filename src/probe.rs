use crate::config::{Config, KEEPALIVE_INTERVAL};
use crate::elapsed::format_duration;
use crate::error::ProbeError;
use crate::probe_result::{ProbeKind, ProbeResult};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A decoded inbound message of a push transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The server accepted the subscription.
    Acknowledged,
    /// Reply to a keepalive ping.
    Pong,
    /// A data event referencing `accounts`.
    Event {
        accounts: Vec<String>,
        signature: Option<String>,
    },
    /// Valid message with nothing to count.
    Skipped(String),
}

pub type InboundStream = BoxStream<'static, Result<Inbound>>;

/// When the elapsed-time clock of a push probe starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockStart {
    Subscribed,
    Acknowledged,
}

/// Outbound half of an open subscription.
#[async_trait]
pub trait StreamControl: Send + 'static {
    /// Graceful shutdown. Errors are logged, never surfaced.
    async fn close(&mut self);
}

/// Periodic ping on a connection that needs one to stay open.
#[async_trait]
pub trait Keepalive: Send + 'static {
    async fn ping(&mut self) -> Result<()>;
}

pub struct Subscription {
    pub inbound: InboundStream,
    pub control: Box<dyn StreamControl>,
    pub keepalive: Option<Box<dyn Keepalive>>,
    pub clock: ClockStart,
}

/// Push transport: connects and registers a subscription for the tracked accounts.
#[async_trait]
pub trait StreamTransport: Send + 'static {
    async fn subscribe(&mut self, accounts: &[String]) -> Result<Subscription>;
}

/// Request/response transport polled in a loop.
#[async_trait]
pub trait PollTransport: Send + 'static {
    async fn connect(&mut self) -> Result<()>;

    /// Issue one request. Returns a short description of the reply.
    async fn call(&mut self) -> Result<String>;
}

pub enum Probe {
    Stream(Box<dyn StreamTransport>),
    Poll(Box<dyn PollTransport>),
}

#[derive(Debug, Clone)]
pub struct ProbeSettings {
    pub kind: ProbeKind,
    pub duration: Duration,
    pub accounts: Vec<String>,
    pub keepalive_interval: Duration,
    pub request_timeout: Duration,
    pub verbose_errors: bool,
}

impl ProbeSettings {
    pub fn from_config(kind: ProbeKind, config: &Config) -> Self {
        Self {
            kind,
            duration: config.duration(),
            accounts: config.accounts.clone(),
            keepalive_interval: KEEPALIVE_INTERVAL,
            request_timeout: config.request_timeout(),
            verbose_errors: config.verbose_errors,
        }
    }

    pub fn describe(&self, error: &anyhow::Error) -> String {
        if self.verbose_errors {
            format!("{:?}", error)
        } else {
            format!("{:#}", error)
        }
    }
}

pub async fn run(probe: Probe, settings: &ProbeSettings) -> ProbeResult {
    match probe {
        Probe::Stream(transport) => run_stream_probe(transport, settings).await,
        Probe::Poll(transport) => run_poll_probe(transport, settings).await,
    }
}

struct Tally {
    kind: ProbeKind,
    subscribed_at: Instant,
    clock: Option<Instant>,
    count: u64,
    elapsed: String,
}

impl Tally {
    fn new(kind: ProbeKind, subscribed_at: Instant, clock: ClockStart) -> Self {
        Self {
            kind,
            subscribed_at,
            clock: match clock {
                ClockStart::Subscribed => Some(subscribed_at),
                ClockStart::Acknowledged => None,
            },
            count: 0,
            elapsed: String::from("0"),
        }
    }

    fn active_for(&self) -> String {
        let started = self.clock.unwrap_or(self.subscribed_at);
        format_duration(Instant::now().duration_since(started))
    }

    fn handle(&mut self, message: Inbound, tracked: &[String]) {
        match message {
            Inbound::Acknowledged => {
                if self.clock.is_none() {
                    info!("{} subscription acknowledged", self.kind);
                    self.clock = Some(Instant::now());
                }
            }
            Inbound::Pong => info!("{}: processed ping response", self.kind),
            Inbound::Event {
                accounts,
                signature,
            } => {
                let signature = signature.as_deref().unwrap_or("-");
                for account in tracked.iter().filter(|account| accounts.contains(account)) {
                    self.count += 1;
                    self.elapsed = self.active_for();
                    info!(
                        "{}: {}: matching account {} detected, signature {}, active for {}, detected count {}",
                        self.kind,
                        Utc::now().format("%a, %d %b %Y %H:%M:%S UTC"),
                        account,
                        signature,
                        self.elapsed,
                        self.count
                    );
                }
            }
            Inbound::Skipped(reason) => debug!("{}: skipped message: {}", self.kind, reason),
        }
    }
}

/// Run a push probe until its deadline or first error.
///
/// The deadline is armed once the subscription is registered. On either exit
/// path the keepalive task is stopped and inbound messages are detached before
/// the connection is closed, so a late ping cannot fail on a closed stream.
pub async fn run_stream_probe(
    mut transport: Box<dyn StreamTransport>,
    settings: &ProbeSettings,
) -> ProbeResult {
    let kind = settings.kind;
    let subscribed = match timeout(settings.request_timeout, transport.subscribe(&settings.accounts)).await {
        Ok(subscribed) => subscribed,
        Err(_) => Err(ProbeError::RequestTimeout(settings.request_timeout).into()),
    };
    let subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(e) => {
            error!("{} failed to subscribe: {}", kind, settings.describe(&e));
            return ProbeResult::sentinel();
        }
    };
    info!(
        "{} subscribed for {} account(s), running for {}",
        kind,
        settings.accounts.len(),
        format_duration(settings.duration)
    );

    let Subscription {
        mut inbound,
        mut control,
        keepalive,
        clock,
    } = subscription;
    let mut tally = Tally::new(kind, Instant::now(), clock);

    let cancel = CancellationToken::new();
    let (failure_tx, mut failure_rx) = mpsc::channel(1);
    let pinger = keepalive.map(|keepalive| {
        tokio::spawn(keepalive_loop(
            keepalive,
            settings.keepalive_interval,
            cancel.clone(),
            failure_tx,
        ))
    });

    let deadline = sleep(settings.duration);
    tokio::pin!(deadline);

    let failure = loop {
        tokio::select! {
            biased;
            _ = &mut deadline => break None,
            Some(e) = failure_rx.recv() => break Some(e),
            next = inbound.next() => match next {
                Some(Ok(message)) => tally.handle(message, &settings.accounts),
                Some(Err(e)) => break Some(e),
                None => break Some(ProbeError::StreamEnded.into()),
            },
        }
    };

    cancel.cancel();
    drop(inbound);
    if let Some(pinger) = pinger {
        if let Err(e) = pinger.await {
            warn!("{} keepalive task aborted: {}", kind, e);
        }
    }
    if timeout(CLOSE_TIMEOUT, control.close()).await.is_err() {
        warn!("{} did not close within {:?}", kind, CLOSE_TIMEOUT);
    }

    match failure {
        None => {
            let elapsed = tally.active_for();
            info!(
                "{} finished after {} with {} detection(s)",
                kind, elapsed, tally.count
            );
            ProbeResult::completed(elapsed, tally.count)
        }
        Some(e) => {
            error!("{} stream error: {}", kind, settings.describe(&e));
            ProbeResult::from_error(tally.elapsed, tally.count)
        }
    }
}

/// Pings every `period` until cancelled. The pinger is dropped on return, before
/// the connection is closed. A failed write is reported once unless
/// cancellation has already begun.
async fn keepalive_loop(
    mut keepalive: Box<dyn Keepalive>,
    period: Duration,
    cancel: CancellationToken,
    failures: mpsc::Sender<anyhow::Error>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            sent = keepalive.ping() => sent,
        };

        match sent {
            Ok(()) => debug!("keepalive ping sent"),
            Err(e) => {
                if !cancel.is_cancelled() {
                    let error = ProbeError::KeepaliveFailed(format!("{:#}", e));
                    let _ = failures.send(error.into()).await;
                }
                break;
            }
        }
    }
}

/// Poll `transport` until the configured duration has elapsed. A single failed
/// or timed-out request ends the probe; calls already made are kept.
pub async fn run_poll_probe(
    mut transport: Box<dyn PollTransport>,
    settings: &ProbeSettings,
) -> ProbeResult {
    let kind = settings.kind;
    let started = Instant::now();

    let connected = match timeout(settings.request_timeout, transport.connect()).await {
        Ok(connected) => connected,
        Err(_) => Err(ProbeError::RequestTimeout(settings.request_timeout).into()),
    };
    if let Err(e) = connected {
        error!("{} failed to connect: {}", kind, settings.describe(&e));
        return ProbeResult::sentinel();
    }

    let mut calls = 0u64;
    loop {
        let active = started.elapsed();
        let elapsed = format_duration(active);
        if active >= settings.duration {
            info!("{} finished after {} with {} call(s)", kind, elapsed, calls);
            return ProbeResult::completed(elapsed, calls);
        }

        let reply = match timeout(settings.request_timeout, transport.call()).await {
            Ok(reply) => reply,
            Err(_) => Err(ProbeError::RequestTimeout(settings.request_timeout).into()),
        };

        match reply {
            Ok(detail) => {
                calls += 1;
                info!(
                    "{}: {}, active for {}, calls made {}",
                    kind, detail, elapsed, calls
                );
            }
            Err(e) => {
                error!("{} request failed: {}", kind, settings.describe(&e));
                return ProbeResult::from_error(elapsed, calls);
            }
        }
    }
}
