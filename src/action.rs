//! Probe actions and per-protocol sequences
//!
//! An [`Action`] is one send/await/validate step: an outbound message
//! template, an expected-response predicate, and a timeout. The
//! protocol-specific request and expectation variants are tagged enums fixed
//! at startup; the orchestrator never type-checks messages at runtime.

use std::time::Duration;

use anyhow::ensure;
use bytes::Bytes;
use regex::Regex;

use crate::codec::{InboundMessage, epp, whois};
use crate::config::{EppConfig, EppProbeFlow, WhoisConfig};

/// Metric label used for sequence-level samples.
pub const SEQUENCE_LABEL: &str = "sequence";

/// One named step within a probe sequence. Immutable after startup.
#[derive(Debug, Clone)]
pub struct Action {
    pub name: &'static str,
    pub timeout: Duration,
    pub request: RequestTemplate,
    pub expect: Expectation,
}

/// Outbound message template, applied to the current target per cycle.
#[derive(Debug, Clone)]
pub enum RequestTemplate {
    /// Send nothing; the EPP server greets on connect.
    EppGreet,
    EppLogin { client_id: String, password: String },
    EppCheck,
    EppCreate,
    EppDelete,
    EppLogout,
    WhoisGet { path: String },
}

/// A built outbound message together with its correlation id, if any.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub bytes: Option<Bytes>,
    pub cl_trid: Option<String>,
}

impl RequestTemplate {
    /// Instantiate the template for `target`.
    ///
    /// `probe_domain` is the throwaway domain this cycle operates on; the
    /// domain-bearing commands of one cycle all reference the same one, so a
    /// created domain is the one deleted again.
    pub fn build(&self, target: &str, probe_domain: &str) -> OutboundRequest {
        match self {
            RequestTemplate::EppGreet => OutboundRequest {
                bytes: None,
                cl_trid: None,
            },
            RequestTemplate::EppLogin {
                client_id,
                password,
            } => epp::login_request(client_id, password).into(),
            RequestTemplate::EppCheck => epp::check_request(probe_domain).into(),
            RequestTemplate::EppCreate => epp::create_request(probe_domain).into(),
            RequestTemplate::EppDelete => epp::delete_request(probe_domain).into(),
            RequestTemplate::EppLogout => epp::logout_request().into(),
            RequestTemplate::WhoisGet { path } => OutboundRequest {
                bytes: Some(whois::build_request(&whois::probe_host(target), path)),
                cl_trid: None,
            },
        }
    }
}

impl From<epp::EppRequest> for OutboundRequest {
    fn from(request: epp::EppRequest) -> Self {
        OutboundRequest {
            bytes: Some(request.bytes),
            cl_trid: Some(request.cl_trid),
        }
    }
}

/// Expected-response predicate for one action.
#[derive(Debug, Clone)]
pub enum Expectation {
    /// A greeting document with no result element.
    EppGreeting,

    /// A response whose result code is one of `codes` and whose clTRID
    /// echoes the one we sent.
    EppResult { codes: &'static [u16] },

    /// An HTTP response with an accepted status and, optionally, a body.
    Http {
        expected_status: Option<Vec<u16>>,
        body_pattern: Option<Regex>,
    },
}

impl Expectation {
    /// Check a parsed reply against this expectation.
    ///
    /// A failed check is classified PROTOCOL_ERROR by the orchestrator and
    /// aborts the remaining actions of the sequence.
    pub fn validate(&self, message: &InboundMessage, sent_trid: Option<&str>) -> Result<(), String> {
        match (self, message) {
            (Expectation::EppGreeting, InboundMessage::Epp(reply)) => {
                if reply.is_greeting() {
                    Ok(())
                } else {
                    Err("expected a greeting document".to_string())
                }
            }

            (Expectation::EppResult { codes }, InboundMessage::Epp(reply)) => {
                let code = reply
                    .result_code
                    .ok_or_else(|| "response carries no result code".to_string())?;
                if !codes.contains(&code) {
                    return Err(format!("unexpected result code {code}, wanted one of {codes:?}"));
                }
                if let Some(sent) = sent_trid {
                    match reply.cl_trid.as_deref() {
                        Some(echoed) if echoed == sent => {}
                        Some(echoed) => {
                            return Err(format!(
                                "clTRID mismatch: sent {sent:?}, reply echoed {echoed:?}"
                            ));
                        }
                        None => return Err("reply echoed no clTRID".to_string()),
                    }
                }
                Ok(())
            }

            (
                Expectation::Http {
                    expected_status,
                    body_pattern,
                },
                InboundMessage::Http(response),
            ) => {
                let status_ok = match expected_status {
                    Some(expected) => expected.contains(&response.status),
                    None => (200..300).contains(&response.status),
                };
                if !status_ok {
                    return Err(format!("unexpected status code: {}", response.status));
                }
                if let Some(pattern) = body_pattern {
                    if !pattern.is_match(&response.body_text()) {
                        return Err(format!("body does not match /{}/", pattern.as_str()));
                    }
                }
                Ok(())
            }

            _ => Err("reply is of the wrong protocol for this action".to_string()),
        }
    }
}

/// The EPP probe sequence: await greeting, login, the configured probe flow,
/// logout. One connection per cycle.
pub fn epp_sequence(config: &EppConfig) -> Vec<Action> {
    let timeout = config.action_timeout();
    let mut actions = vec![
        Action {
            name: "greet",
            timeout,
            request: RequestTemplate::EppGreet,
            expect: Expectation::EppGreeting,
        },
        Action {
            name: "login",
            timeout,
            request: RequestTemplate::EppLogin {
                client_id: config.client_id.clone(),
                password: config.password.clone(),
            },
            expect: Expectation::EppResult { codes: &[1000] },
        },
    ];

    match config.flow {
        EppProbeFlow::Check => actions.push(Action {
            name: "send-query",
            timeout,
            request: RequestTemplate::EppCheck,
            expect: Expectation::EppResult { codes: &[1000] },
        }),
        // 1001 covers registries that only queue the mutation for review.
        EppProbeFlow::CreateDelete => {
            actions.push(Action {
                name: "create",
                timeout,
                request: RequestTemplate::EppCreate,
                expect: Expectation::EppResult { codes: &[1000, 1001] },
            });
            actions.push(Action {
                name: "delete",
                timeout,
                request: RequestTemplate::EppDelete,
                expect: Expectation::EppResult { codes: &[1000, 1001] },
            });
        }
    }

    actions.push(Action {
        name: "logout",
        timeout,
        request: RequestTemplate::EppLogout,
        expect: Expectation::EppResult { codes: &[1500] },
    });
    actions
}

/// The WHOIS probe sequence: a single HTTP exchange.
pub fn whois_sequence(config: &WhoisConfig) -> anyhow::Result<Vec<Action>> {
    let body_pattern = config
        .body_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()?;

    Ok(vec![Action {
        name: "send-query",
        timeout: config.action_timeout(),
        request: RequestTemplate::WhoisGet {
            path: config.path.clone(),
        },
        expect: Expectation::Http {
            expected_status: config.expected_status.clone(),
            body_pattern,
        },
    }])
}

/// Wall-clock budget for a whole sequence: the sum of action timeouts plus a
/// fixed margin, defending against slow-drip byte delivery that never trips
/// a single action timeout.
pub fn sequence_budget(actions: &[Action], margin: Duration) -> Duration {
    actions.iter().map(|action| action.timeout).sum::<Duration>() + margin
}

/// An empty sequence is a configuration error, same as an empty target list.
pub fn validate_sequence(actions: &[Action]) -> anyhow::Result<()> {
    ensure!(!actions.is_empty(), "probe sequence must not be empty");
    Ok(())
}
