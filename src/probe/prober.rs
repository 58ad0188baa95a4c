use std::io;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Url;
use tokio::net::TcpStream;

use super::ProbeResult;
use crate::client::EventSink;
use crate::crd::{EndpointAddress, HttpGetAction, Probe, ProbeHandler, ThirdComponent};
use crate::error::{Error, Result};
use crate::metrics::Metrics;

/// Outcome of one handler run that reached a verdict.
#[derive(Debug)]
struct Outcome {
    result: ProbeResult,
    message: String,
}

impl Outcome {
    fn success() -> Self {
        Self {
            result: ProbeResult::Success,
            message: String::new(),
        }
    }

    fn failure(message: String) -> Self {
        Self {
            result: ProbeResult::Failure,
            message,
        }
    }

    fn unknown(message: String) -> Self {
        Self {
            result: ProbeResult::Unknown,
            message,
        }
    }
}

/// Runs HTTP and TCP health checks against endpoints.
///
/// Transport errors are retried inside the same tick; a definitive answer
/// (a status code, a refused or timed out connection) is returned at once.
pub struct Prober {
    http: reqwest::Client,
    events: Arc<dyn EventSink>,
    metrics: Metrics,
    attempts: u32,
}

impl std::fmt::Debug for Prober {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prober")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

impl Prober {
    /// Creates a prober that reports failures to `events` and outcomes to `metrics`.
    ///
    /// # Errors
    ///
    /// Fails when the HTTP client cannot be built (e.g. no TLS backend).
    pub fn new(events: Arc<dyn EventSink>, metrics: Metrics, attempts: u32) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("thirdcomponent-prober/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("building probe http client: {e}")))?;

        Ok(Self {
            http,
            events,
            metrics,
            attempts: attempts.max(1),
        })
    }

    /// Probes one endpoint of `component`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ProbeTransport`] when every attempt failed before a
    /// verdict was reached. Callers drop such ticks.
    pub async fn probe(
        &self,
        component: &ThirdComponent,
        address: &EndpointAddress,
        probe: &Probe,
    ) -> Result<ProbeResult> {
        let Some(handler) = probe.handler() else {
            return Ok(ProbeResult::Unknown);
        };
        let timeout = probe.timeout();

        let mut last_error = None;
        for attempt in 1..=self.attempts {
            let outcome = match handler {
                ProbeHandler::HttpGet(action) => self.http_get(address, action, timeout).await,
                ProbeHandler::TcpSocket => tcp_connect(address, timeout).await,
            };

            match outcome {
                Ok(outcome) => {
                    self.metrics
                        .observe_probe(component, address.as_str(), outcome.result);
                    if outcome.result != ProbeResult::Success {
                        tracing::debug!(
                            component = %component.key(),
                            endpoint = %address,
                            result = outcome.result.as_str(),
                            "{}",
                            outcome.message
                        );
                        self.emit(component, "ProbeFailed", outcome.message);
                    }
                    return Ok(outcome.result);
                }
                Err(e) => {
                    tracing::debug!(
                        component = %component.key(),
                        endpoint = %address,
                        attempt,
                        error = %e,
                        "probe attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let err = last_error
            .unwrap_or_else(|| Error::ProbeTransport(format!("no probe attempt for {address}")));
        self.metrics
            .observe_probe(component, address.as_str(), ProbeResult::Unknown);
        self.emit(
            component,
            "ProbeError",
            format!("probe of {address} failed after {} attempts: {err}", self.attempts),
        );
        Err(err)
    }

    fn emit(&self, component: &ThirdComponent, reason: &'static str, note: String) {
        let events = Arc::clone(&self.events);
        let component = component.clone();
        tokio::spawn(async move {
            events.warn(&component, reason, note).await;
        });
    }

    async fn http_get(
        &self,
        address: &EndpointAddress,
        action: &HttpGetAction,
        timeout: Duration,
    ) -> Result<Outcome> {
        let Some(url) = probe_url(address, &action.path) else {
            return Ok(Outcome::unknown(format!("cannot build probe url from {address}")));
        };

        let mut request = self.http.get(url.clone()).timeout(timeout);
        for header in &action.http_headers {
            request = request.header(header.name.as_str(), header.value.as_str());
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                if (200..400).contains(&status.as_u16()) {
                    Ok(Outcome::success())
                } else {
                    Ok(Outcome::failure(format!("GET {url} returned {status}")))
                }
            }
            Err(e) if e.is_timeout() => Ok(Outcome::failure(format!(
                "GET {url} timed out after {timeout:?}"
            ))),
            Err(e) if is_connection_refused(&e) => {
                Ok(Outcome::failure(format!("GET {url}: connection refused")))
            }
            Err(e) if e.is_builder() => {
                Ok(Outcome::unknown(format!("invalid request to {url}: {e}")))
            }
            Err(e) => Err(Error::ProbeTransport(format!("GET {url}: {e}"))),
        }
    }
}

async fn tcp_connect(address: &EndpointAddress, timeout: Duration) -> Result<Outcome> {
    let Some(port) = address.port() else {
        return Ok(Outcome::unknown(format!("no port in {address}")));
    };

    match tokio::time::timeout(timeout, TcpStream::connect((address.host(), port))).await {
        Ok(Ok(_stream)) => Ok(Outcome::success()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
            Ok(Outcome::failure(format!("connect {address}: connection refused")))
        }
        Ok(Err(e)) => Err(Error::ProbeTransport(format!("connect {address}: {e}"))),
        Err(_) => Ok(Outcome::failure(format!(
            "connect {address} timed out after {timeout:?}"
        ))),
    }
}

/// Builds the probe URL, defaulting the scheme to `http`.
fn probe_url(address: &EndpointAddress, path: &str) -> Option<Url> {
    let base = if address.scheme().is_some() {
        address.as_str().to_string()
    } else {
        format!("http://{address}")
    };
    let mut url = Url::parse(&base).ok()?;

    if !path.is_empty() {
        let (path, query) = match path.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (path, None),
        };
        if path.starts_with('/') {
            url.set_path(path);
        } else {
            url.set_path(&format!("/{path}"));
        }
        url.set_query(query);
    }

    Some(url)
}

fn is_connection_refused(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut source = Some(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::ConnectionRefused {
                return true;
            }
        }
        source = e.source();
    }
    false
}
