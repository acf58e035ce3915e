//! The WinRM client handle: one blocking HTTP round trip per SOAP
//! request, serialized by a per-client mutex.
//!
//! The remote shell and enumeration protocols are stateful conversations
//! (context tokens, command ids) that must not be interleaved from two
//! threads against the same session, hence the single lock. A fresh HTTP
//! connection is opened and closed per round trip; there is no pooling
//! across calls.

use std::fmt;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use parking_lot::Mutex;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use tracing::{debug, trace, warn};

use crate::envelope::{self, OptionSet, SelectorSet};
use crate::error::{Error, Result};
use crate::fault;
use crate::xml::Element;

/// Default WinRM HTTP port.
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default socket-level timeout for one round trip. Windows terminates the
/// TCP connection after 120 seconds without requests, and a long receive
/// poll can legitimately take the full operation timeout; the socket waits
/// somewhat longer than that.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(150);

/// Default wall-clock budget for retrying connection-level errors.
pub const DEFAULT_RETRY_BUDGET: Duration = Duration::from_secs(20);

/// Default fixed delay between connection retries.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Connection configuration for one WinRM endpoint.
#[derive(Clone)]
pub struct WinRmConfig {
    /// Target hostname or IP address.
    pub address: String,
    /// WinRM port (usually 5985).
    pub port: u16,
    /// Basic-auth username.
    pub username: String,
    /// Basic-auth password.
    pub password: String,
    /// Socket-level timeout for one request/response pair.
    pub http_timeout: Duration,
    /// Wall-clock budget for retrying connection-level errors.
    pub retry_budget: Duration,
    /// Fixed delay between connection retries.
    pub retry_delay: Duration,
}

impl WinRmConfig {
    pub fn new(
        address: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        WinRmConfig {
            address: address.into(),
            port,
            username: username.into(),
            password: password.into(),
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// The full endpoint URL requests are POSTed to.
    pub fn endpoint_url(&self) -> String {
        format!("http://{}:{}/wsman", self.address, self.port)
    }

    /// `address:port` form used in log and error messages.
    pub fn netloc(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl fmt::Debug for WinRmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmConfig")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Why a round trip failed below the protocol layer.
#[derive(Debug)]
pub enum TransportError {
    /// The response did not arrive within the socket timeout. Not retried:
    /// a long poll timing out is an expected outcome.
    Timeout,
    /// Everything else: connection refused, reset, DNS failure. Retried
    /// with fixed backoff up to the configured budget.
    Failed(String),
}

/// A raw SOAP response: HTTP status plus body bytes.
#[derive(Debug, Clone)]
pub struct SoapResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One HTTP POST of a SOAP envelope. The seam between the protocol logic
/// and the wire; tests script it with canned responses.
pub trait Transport: Send + Sync {
    fn round_trip(&self, request: &[u8]) -> std::result::Result<SoapResponse, TransportError>;
}

/// The production transport: a blocking POST to `/wsman` with Basic auth,
/// building a fresh client (and so a fresh connection) per call.
pub struct HttpTransport {
    url: String,
    authorization: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(config: &WinRmConfig) -> Self {
        let credentials = format!("{}:{}", config.username, config.password);
        HttpTransport {
            url: config.endpoint_url(),
            authorization: format!("Basic {}", BASE64_STANDARD.encode(credentials)),
            timeout: config.http_timeout,
        }
    }
}

impl Transport for HttpTransport {
    fn round_trip(&self, request: &[u8]) -> std::result::Result<SoapResponse, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| TransportError::Failed(format!("failed to build HTTP client: {e}")))?;
        let response = client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .header(AUTHORIZATION, self.authorization.as_str())
            .body(request.to_vec())
            .send()
            .map_err(classify)?;
        let status = response.status().as_u16();
        let body = response.bytes().map_err(classify)?.to_vec();
        Ok(SoapResponse { status, body })
    }
}

fn classify(error: reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Failed(error.to_string())
    }
}

// ============================================================================
// Client
// ============================================================================

/// A WinRM endpoint handle.
///
/// `WinRm` has only generic functions; it knows nothing of particular WMI
/// classes or of CMD and PowerShell scripts. The typed operations live in
/// the WMI facade, the shell transport, and the script wrapper, all built
/// on [`WinRm::act`].
pub struct WinRm {
    netloc: String,
    transport: Box<dyn Transport>,
    lock: Mutex<()>,
    retry_budget: Duration,
    retry_delay: Duration,
}

impl WinRm {
    /// Connect-less constructor: WinRM is request/response, so the first
    /// actual operation is the first round trip.
    pub fn new(config: WinRmConfig) -> Self {
        let transport = HttpTransport::new(&config);
        Self::with_transport(config, Box::new(transport))
    }

    /// Build a client over a custom transport. The seam used by tests and
    /// by anything that needs to tunnel the SOAP exchange.
    pub fn with_transport(config: WinRmConfig, transport: Box<dyn Transport>) -> Self {
        WinRm {
            netloc: config.netloc(),
            transport,
            lock: Mutex::new(()),
            retry_budget: config.retry_budget,
            retry_delay: config.retry_delay,
        }
    }

    /// `address:port` of the endpoint.
    pub fn netloc(&self) -> &str {
        &self.netloc
    }

    /// One generic WS-Man operation: build the envelope, exchange it,
    /// decode faults, verify `RelatesTo`, and return the response body.
    pub(crate) fn act(
        &self,
        resource_uri: &str,
        action: &str,
        body: &str,
        selectors: &SelectorSet,
        options: &OptionSet,
        timeout_sec: Option<f64>,
    ) -> Result<Element> {
        let envelope = envelope::build(resource_uri, action, body, selectors, options, timeout_sec);
        trace!(%resource_uri, %action, request = %envelope.xml, "WS-Man request");

        let response = {
            let _serialized = self.lock.lock();
            self.round_trip_with_retry(envelope.xml.as_bytes())?
        };
        debug!(
            status = response.status,
            bytes = response.body.len(),
            %action,
            "WS-Man response"
        );

        if response.status != 200 {
            return Err(fault::decode(&self.netloc, response.status, &response.body));
        }
        let text = std::str::from_utf8(&response.body)
            .map_err(|_| Error::protocol("response is not UTF-8"))?;
        trace!(response = %text, "WS-Man response body");
        envelope::parse_body(&envelope.message_id, text)
    }

    fn round_trip_with_retry(&self, request: &[u8]) -> Result<SoapResponse> {
        let started = Instant::now();
        loop {
            match self.transport.round_trip(request) {
                Ok(response) => return Ok(response),
                Err(TransportError::Timeout) => return Err(Error::HttpResponseTimeout),
                Err(TransportError::Failed(message)) => {
                    if started.elapsed() + self.retry_delay > self.retry_budget {
                        return Err(Error::Connection { message });
                    }
                    warn!(%message, netloc = %self.netloc, "connection error, retrying");
                    std::thread::sleep(self.retry_delay);
                }
            }
        }
    }
}

impl fmt::Debug for WinRm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WinRm({})", self.netloc)
    }
}
