//! Sequence orchestrator
//!
//! One `SequenceRunner` actor per protocol drives the perpetual probe loop:
//! take the Token's current target, open a fresh connection, walk the action
//! chain through the ActionHandler, report every outcome to the metrics
//! collector, advance the Token, and sleep the inter-probe delay.
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → connect → action chain → record samples → advance token → ProbeEvent → [HealthMonitor, ...]
//!     ↑
//!     └─── Commands (ProbeNow, UpdateInterval, Shutdown)
//! ```
//!
//! All failures are contained within one cycle: a timed-out or broken
//! sequence records its outcome, closes its connection, and the loop moves
//! on to the next target.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant as TokioInstant, interval_at};
use tracing::{debug, error, instrument, warn};
use url::Url;

use crate::action::{self, Action, RequestTemplate, SEQUENCE_LABEL};
use crate::codec::{InboundMessage, epp, whois};
use crate::config::{EppConfig, TlsConfig, WhoisConfig};
use crate::connection;
use crate::handler::{ActionHandler, ActionResult};
use crate::metrics::MetricsCollector;
use crate::token::Token;
use crate::{Outcome, ProbeEvent, Protocol};

/// Commands that can be sent to a SequenceRunner
#[derive(Debug)]
pub enum RunnerCommand {
    /// Run one probe cycle immediately (bypassing the interval timer)
    ProbeNow {
        /// Channel to send the sequence-level outcome back
        respond_to: oneshot::Sender<Outcome>,
    },

    /// Update the inter-probe delay
    UpdateInterval { interval_secs: u64 },

    /// Gracefully shut down the runner
    Shutdown,
}

/// Where a protocol's connections go.
#[derive(Debug, Clone)]
enum Backend {
    /// Connect to `host` (or `whois.nic.<target>` when unset)
    Whois { host: Option<String>, port: u16 },

    /// Connect to the fixed EPP endpoint
    Epp {
        host: String,
        port: u16,
        tls: TlsConfig,
    },
}

/// Actor that owns one protocol's probe loop.
pub struct SequenceRunner {
    protocol: Protocol,
    token: Token,
    actions: Arc<Vec<Action>>,
    backend: Backend,

    /// Fixed margin added on top of the summed action timeouts
    budget_margin: Duration,

    metrics: Arc<MetricsCollector>,

    /// Broadcast sender for sequence-level events
    event_tx: broadcast::Sender<ProbeEvent>,

    /// Command receiver for control messages
    command_rx: mpsc::Receiver<RunnerCommand>,

    /// Current inter-probe delay
    interval_duration: Duration,
}

impl SequenceRunner {
    fn whois(
        config: &WhoisConfig,
        metrics: Arc<MetricsCollector>,
        event_tx: broadcast::Sender<ProbeEvent>,
        command_rx: mpsc::Receiver<RunnerCommand>,
    ) -> Result<Self> {
        let actions = whois_actions(config)?;
        Ok(Self {
            protocol: Protocol::Whois,
            token: Token::new(config.targets.clone())?,
            actions: Arc::new(actions),
            backend: Backend::Whois {
                host: config.host.clone(),
                port: config.port,
            },
            budget_margin: config.budget_margin(),
            metrics,
            event_tx,
            command_rx,
            interval_duration: config.interval(),
        })
    }

    fn epp(
        config: &EppConfig,
        metrics: Arc<MetricsCollector>,
        event_tx: broadcast::Sender<ProbeEvent>,
        command_rx: mpsc::Receiver<RunnerCommand>,
    ) -> Result<Self> {
        let actions = action::epp_sequence(config);
        action::validate_sequence(&actions)?;
        Ok(Self {
            protocol: Protocol::Epp,
            token: Token::new(config.targets.clone())?,
            actions: Arc::new(actions),
            backend: Backend::Epp {
                host: config.host.clone(),
                port: config.port,
                tls: config.tls.clone(),
            },
            budget_margin: config.budget_margin(),
            metrics,
            event_tx,
            command_rx,
            interval_duration: config.interval(),
        })
    }

    /// Run the actor's main loop until shutdown.
    #[instrument(skip(self), fields(protocol = %self.protocol))]
    pub async fn run(mut self) {
        debug!("starting sequence runner");

        // first probe after one full period, not at spawn time
        let mut ticker = interval_at(
            TokioInstant::now() + self.interval_duration,
            self.interval_duration,
        );

        loop {
            tokio::select! {
                // Timer tick - run one probe cycle
                _ = ticker.tick() => {
                    self.run_cycle().await;
                }

                // Handle commands
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        RunnerCommand::ProbeNow { respond_to } => {
                            debug!("received ProbeNow command");
                            let outcome = self.run_cycle().await;
                            let _ = respond_to.send(outcome);
                        }

                        RunnerCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.interval_duration = Duration::from_secs(interval_secs);
                            ticker = interval_at(
                                TokioInstant::now() + self.interval_duration,
                                self.interval_duration,
                            );
                        }

                        RunnerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                // Command channel closed - exit
                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        debug!("sequence runner stopped");
    }

    /// One full cycle: probe the current target, record, advance, publish.
    ///
    /// The whole cycle runs under a wall-clock budget of the summed action
    /// timeouts plus a margin; slow-drip delivery that never trips a single
    /// action timeout is still forcibly aborted as a sequence-level TIMEOUT.
    async fn run_cycle(&self) -> Outcome {
        let target = self.token.current();
        let budget = action::sequence_budget(&self.actions, self.budget_margin);
        let start = Instant::now();

        let outcome = match tokio::time::timeout(budget, self.probe_target(&target)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("sequence against {target} exceeded its wall-clock budget");
                Outcome::Timeout
            }
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        self.metrics
            .record(self.protocol, SEQUENCE_LABEL, outcome, elapsed_ms);

        // Always advance, success or not; monitoring must never get stuck
        // on one target.
        self.token.advance();

        let event = ProbeEvent {
            protocol: self.protocol,
            target,
            outcome,
            elapsed_ms,
            timestamp: Utc::now(),
        };
        if self.event_tx.send(event).is_err() {
            debug!("no receivers for probe event");
        }

        outcome
    }

    /// Walk the action chain against one target over one fresh connection.
    #[instrument(skip(self), fields(protocol = %self.protocol, probe_target = target))]
    async fn probe_target(&self, target: &str) -> Outcome {
        let connect_timeout = self.actions[0].timeout;

        let connected = match &self.backend {
            Backend::Whois { host, port } => {
                let host = host.clone().unwrap_or_else(|| whois::probe_host(target));
                connection::connect_whois(&host, *port, connect_timeout).await
            }
            Backend::Epp { host, port, tls } => {
                connection::connect_epp(host, *port, tls, connect_timeout).await
            }
        };

        let mut handler: ActionHandler = match connected {
            Ok(handler) => handler,
            Err(e) => {
                warn!("connect failed: {e:#}");
                return Outcome::ConnectionError;
            }
        };

        // one throwaway domain per cycle, shared by all domain commands so a
        // created domain is the one deleted again
        let probe_domain = epp::probe_domain(&epp::new_client_trid(), target);

        for current in self.actions.iter() {
            let start = Instant::now();
            let request = current.request.build(target, &probe_domain);

            let handle = match handler.apply(request.bytes.clone(), current.timeout).await {
                Ok(handle) => handle,
                Err(e) => {
                    // one-in-flight violation or reuse of a dead connection;
                    // a prober bug, not a server failure
                    error!(action = current.name, "internal error in apply: {e:#}");
                    let elapsed_ms = start.elapsed().as_millis() as u64;
                    self.metrics
                        .record(self.protocol, current.name, Outcome::Failure, elapsed_ms);
                    return Outcome::Failure;
                }
            };

            let result = match handle.resolve().await {
                ActionResult::Success(InboundMessage::Http(response)) => {
                    self.follow_whois_redirects(response, current, target).await
                }
                other => other,
            };
            let mut outcome = result.outcome();

            if let ActionResult::Success(message) = &result {
                let validation = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    current.expect.validate(message, request.cl_trid.as_deref())
                }));
                match validation {
                    Ok(Ok(())) => {}
                    Ok(Err(reason)) => {
                        warn!(action = current.name, "response rejected: {reason}");
                        outcome = Outcome::ProtocolError;
                    }
                    Err(_) => {
                        error!(action = current.name, "validation predicate panicked");
                        outcome = Outcome::ProtocolError;
                    }
                }
            } else {
                warn!(action = current.name, "action did not complete: {result:?}");
            }

            let elapsed_ms = start.elapsed().as_millis() as u64;
            self.metrics
                .record(self.protocol, current.name, outcome, elapsed_ms);

            if !outcome.is_success() {
                handler.close().await;
                return outcome;
            }
        }

        handler.close().await;
        Outcome::Success
    }

    /// Chase a WHOIS 30x chain to its final response.
    ///
    /// Each hop opens a fresh connection to the redirected location (plain or
    /// TLS per the location's scheme) and replays the GET there. The chain is
    /// bounded by [`MAX_REDIRECT_HOPS`]; the action's latency sample spans
    /// all hops, and the cycle's wall-clock budget still applies.
    async fn follow_whois_redirects(
        &self,
        mut response: whois::HttpResponse,
        action: &Action,
        target: &str,
    ) -> ActionResult {
        if !response.is_redirect() {
            return ActionResult::Success(InboundMessage::Http(response));
        }

        let path = match &action.request {
            RequestTemplate::WhoisGet { path } => path.as_str(),
            _ => return ActionResult::Success(InboundMessage::Http(response)),
        };
        let mut base = match Url::parse(&format!("http://{}{}", whois::probe_host(target), path)) {
            Ok(url) => url,
            Err(e) => return ActionResult::ProtocolError(format!("invalid request URL: {e}")),
        };

        for _ in 0..MAX_REDIRECT_HOPS {
            let Some(location) = response.location() else {
                // a 30x without a Location is left to the expectation check
                return ActionResult::Success(InboundMessage::Http(response));
            };
            let next = match base.join(location) {
                Ok(url) => url,
                Err(e) => {
                    return ActionResult::ProtocolError(format!(
                        "unusable Location {location:?}: {e}"
                    ));
                }
            };
            let Some(host) = next.host_str().map(str::to_string) else {
                return ActionResult::ProtocolError(format!("Location {location:?} has no host"));
            };
            let https = next.scheme() == "https";
            let Some(port) = next.port_or_known_default() else {
                return ActionResult::ProtocolError(format!(
                    "Location {location:?} has no usable port"
                ));
            };
            debug!(host, port, "following redirect");

            let connected = if https {
                connection::connect_whois_tls(&host, port, action.timeout).await
            } else {
                connection::connect_whois(&host, port, action.timeout).await
            };
            let mut handler = match connected {
                Ok(handler) => handler,
                Err(e) => return ActionResult::ConnectionError(format!("{e:#}")),
            };

            let mut hop_path = next.path().to_string();
            if let Some(query) = next.query() {
                hop_path.push('?');
                hop_path.push_str(query);
            }
            let request = whois::build_request(&host, &hop_path);

            let result = match handler.apply(Some(request), action.timeout).await {
                Ok(handle) => handle.resolve().await,
                Err(e) => ActionResult::ConnectionError(format!("{e:#}")),
            };
            handler.close().await;

            match result {
                ActionResult::Success(InboundMessage::Http(hop)) if hop.is_redirect() => {
                    base = next;
                    response = hop;
                }
                other => return other,
            }
        }

        ActionResult::ProtocolError(format!("more than {MAX_REDIRECT_HOPS} redirects"))
    }
}

/// Upper bound on chased WHOIS redirect hops per cycle.
const MAX_REDIRECT_HOPS: usize = 5;

fn whois_actions(config: &WhoisConfig) -> Result<Vec<Action>> {
    let actions = action::whois_sequence(config)?;
    action::validate_sequence(&actions)?;
    Ok(actions)
}

/// Handle for controlling a SequenceRunner
///
/// This handle provides a typed API for sending commands to the actor.
/// It can be cloned and shared across tasks.
#[derive(Clone)]
pub struct SequenceHandle {
    sender: mpsc::Sender<RunnerCommand>,
    pub protocol: Protocol,
}

impl SequenceHandle {
    /// Spawn the WHOIS probe loop.
    pub fn spawn_whois(
        config: &WhoisConfig,
        metrics: Arc<MetricsCollector>,
        event_tx: broadcast::Sender<ProbeEvent>,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let runner = SequenceRunner::whois(config, metrics, event_tx, cmd_rx)?;

        tokio::spawn(runner.run());

        Ok(Self {
            sender: cmd_tx,
            protocol: Protocol::Whois,
        })
    }

    /// Spawn the EPP probe loop.
    pub fn spawn_epp(
        config: &EppConfig,
        metrics: Arc<MetricsCollector>,
        event_tx: broadcast::Sender<ProbeEvent>,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let runner = SequenceRunner::epp(config, metrics, event_tx, cmd_rx)?;

        tokio::spawn(runner.run());

        Ok(Self {
            sender: cmd_tx,
            protocol: Protocol::Epp,
        })
    }

    /// Run one probe cycle immediately and return its outcome.
    pub async fn probe_now(&self) -> Result<Outcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RunnerCommand::ProbeNow { respond_to: tx })
            .await
            .context("failed to send ProbeNow command")?;

        rx.await.context("failed to receive probe outcome")
    }

    /// Update the inter-probe delay.
    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(RunnerCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    /// Gracefully shut down the runner.
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(RunnerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
