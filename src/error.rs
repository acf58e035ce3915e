//! Error types for the WinRM client.
//!
//! The protocol surfaces a closed set of failures, decoded from HTTP
//! statuses and SOAP fault bodies. Everything propagates typed so that
//! callers can branch: [`Error::ObjectNotFound`] usually means "does not
//! exist" rather than "abort", while [`Error::OperationTimeout`] tells a
//! polling caller to simply try again.

use thiserror::Error;

use crate::envelope::{SelectorSet, WmiObject};
use crate::resource;

/// Result type alias for WinRM operations.
pub type Result<T> = std::result::Result<T, Error>;

/// MSFT_WmiError status codes commonly reported by providers.
///
/// See: https://docs.microsoft.com/en-us/previous-versions/windows/desktop/ramgmtpsprov/msft-wmierror
pub mod wmi_status {
    pub const INVALID_PARAMETER: i32 = 4;
    pub const NOT_FOUND: i32 = 6;
    pub const ALREADY_EXISTS: i32 = 11;
}

/// The closed error taxonomy of the WinRM client.
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-level failure (socket reset, DNS failure, TCP timeout).
    /// Retried internally with fixed backoff; raised only once the
    /// wall-clock retry budget is exhausted.
    #[error("connection failed: {message}")]
    Connection {
        /// Last transport error message observed.
        message: String,
    },

    /// The HTTP response did not arrive within the socket timeout.
    ///
    /// Distinct from [`Error::Connection`]: it is not retried by the
    /// transport loop, and the shell receive path treats it as "no output
    /// arrived yet".
    #[error("timed out waiting for the HTTP response")]
    HttpResponseTimeout,

    /// WinRM-level operation timeout (SOAP fault code 0x80338029).
    ///
    /// An expected outcome for long polls: the caller retries.
    #[error("WinRM operation timed out")]
    OperationTimeout,

    /// HTTP 401: the supplied credentials were rejected.
    #[error("{netloc}: unauthorized")]
    Unauthorized {
        /// `address:port` of the endpoint that rejected the request.
        netloc: String,
    },

    /// HTTP 404/500 with an empty body: a local misconfiguration or a
    /// transient network blip, never a well-formed WinRM outcome.
    #[error("error {status} with empty body; {hint}")]
    EmptyResponse {
        /// HTTP status that carried no body.
        status: u16,
        /// Remediation hint matching the status.
        hint: &'static str,
    },

    /// WMI reports no instance matching the selectors
    /// (SOAP fault code 0x80338000).
    #[error("WMI object not found during {operation} ({parameter_info}) in provider {provider_name}")]
    ObjectNotFound {
        operation: String,
        parameter_info: String,
        provider_name: String,
    },

    /// The caller supplied an invalid selector key (SOAP subcode
    /// `InvalidSelectors`). A programming error, never retried.
    #[error("bad selectors: {message}")]
    BadSelectors {
        message: String,
        /// Namespace of the fault subcode.
        code_ns: String,
    },

    /// A WMI-provider-specific fault nested inside the SOAP fault detail.
    #[error("WMI fault: {message}")]
    WmiFault { message: String },

    /// A `MSFT_WmiError` CIM error element.
    #[error("error code {code}: {message}")]
    WmiError {
        /// `CIMStatusCode`; see [`wmi_status`] for common values.
        code: i32,
        message: String,
    },

    /// A WMI method returned a non-zero `ReturnValue`.
    #[error(
        "non-zero return value {} of {cls}.{method}({params:?}) where {selectors:?}:\n{output:#?}",
        format_return_value(.return_value)
    )]
    InvokeFailed {
        cls: String,
        selectors: SelectorSet,
        method: String,
        params: WmiObject,
        return_value: u32,
        output: Option<WmiObject>,
    },

    /// Catch-all for any other SOAP fault; always carries the raw
    /// code/subcode/message for diagnosis.
    #[error("SOAP fault {code_ns}#{code_value}: {message}")]
    SoapFault {
        message: String,
        code_ns: String,
        code_value: String,
    },

    /// The remote PowerShell wrapper reported a `"fail"` outcome.
    #[error("remote script raised {type_name} ({category}): {message}")]
    RemoteScript {
        /// Full .NET type name of the remote exception.
        type_name: String,
        /// PowerShell error category name.
        category: String,
        message: String,
    },

    /// The remote interpreter produced no stdout at all: it crashed before
    /// the wrapper could report an outcome. Distinct from
    /// [`Error::RemoteScript`].
    #[error("remote script produced no output (exit code {exit_code:?}); stderr: {stderr}")]
    EmptyStdout {
        exit_code: Option<i64>,
        stderr: String,
    },

    /// A short resource name whose namespace cannot be determined.
    #[error(
        "cannot guess namespace of {name}; Win32_ classes are unambiguous: \
         they are all in one namespace; MSFT_ classes are distributed across \
         several namespaces"
    )]
    UnresolvableResourceUri { name: String },

    /// A remote command did not finish within the caller's wait deadline.
    #[error("command still running after {seconds:.1} seconds")]
    WaitTimeout { seconds: f64 },

    /// A command line that the WinRM shell cannot carry.
    #[error("{message}")]
    InvalidCommandLine { message: String },

    /// A violated protocol invariant: mismatched `RelatesTo`, a running
    /// command carrying an exit code, an unparseable response. Fatal.
    #[error("protocol violation: {message}")]
    Protocol { message: String },
}

impl Error {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Error::Protocol {
            message: message.into(),
        }
    }
}

/// Render a method return value, with the symbolic Win32/WBEM name when the
/// code is a known HRESULT-style failure.
fn format_return_value(value: &u32) -> String {
    if value & 0x8000_0000 != 0 {
        let name = resource::win32_error_name(*value).unwrap_or("unknown");
        format!("{value:#X} ({name})")
    } else {
        value.to_string()
    }
}

/// Build an [`Error::InvokeFailed`] from the pieces of a failed invocation.
pub(crate) fn invoke_failed(
    cls: &str,
    selectors: &SelectorSet,
    method: &str,
    params: &WmiObject,
    return_value: u32,
    output: Option<&WmiObject>,
) -> Error {
    Error::InvokeFailed {
        cls: cls.to_owned(),
        selectors: selectors.clone(),
        method: method.to_owned(),
        params: params.clone(),
        return_value,
        output: output.cloned(),
    }
}
