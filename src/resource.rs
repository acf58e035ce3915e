//! Resource addressing: short-name resolution and the fixed namespace
//! tables of the protocol.
//!
//! WS-Man calls require a full resource URI, but WMI classes are usually
//! referred to only by name. The tables here are process-wide immutable
//! constants; there is no lifecycle beyond process start.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::error::{Error, Result};

// ============================================================================
// Namespace URIs
// ============================================================================

pub(crate) const NS_XML: &str = "http://www.w3.org/XML/1998/namespace";
pub(crate) const NS_ENV: &str = "http://www.w3.org/2003/05/soap-envelope";
pub(crate) const NS_ENUM: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";
pub(crate) const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub(crate) const NS_XS: &str = "http://www.w3.org/2001/XMLSchema";
pub(crate) const NS_CIM: &str = "http://schemas.dmtf.org/wbem/wscim/1/common";
pub(crate) const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
pub(crate) const NS_CIMBINDING: &str = "http://schemas.dmtf.org/wbem/wsman/1/cimbinding.xsd";
pub(crate) const NS_TRANSFER: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer";
pub(crate) const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub(crate) const NS_MS_WSMAN: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
pub(crate) const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
pub(crate) const NS_CONFIG: &str = "http://schemas.microsoft.com/wbem/wsman/1/config";
pub(crate) const NS_WSMANFAULT: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsmanfault";
pub(crate) const NS_CIM_ERROR: &str =
    "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2/MSFT_WmiError";
pub(crate) const NS_STORAGE_CIM_ERROR: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/microsoft/windows/storage/MSFT_WmiError";
pub(crate) const NS_NETWORK_CIM_ERROR: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/standardcimv2/MSFT_WmiError";
pub(crate) const NS_EXTENDED_STATUS: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/__ExtendedStatus";

/// Namespace/alias pairs declared on every request envelope.
///
/// The URIs are fixed by the protocol; the aliases are arbitrary but kept
/// close to the ones used in WMI documentation examples.
/// See: Table A-1 in
/// https://www.dmtf.org/sites/default/files/standards/documents/DSP0226_1.0.0.pdf
pub(crate) const NAMESPACE_ALIASES: &[(&str, &str)] = &[
    (NS_XML, "xml"),
    (NS_ENV, "env"),
    (NS_ENUM, "n"),
    (NS_XSI, "xsi"),
    (NS_XS, "xs"),
    (NS_CIM, "cim"),
    (NS_WSMAN, "w"),
    (NS_CIMBINDING, "b"),
    (NS_TRANSFER, "t"),
    (NS_ADDRESSING, "a"),
    (NS_MS_WSMAN, "p"),
    (NS_SHELL, "rsp"),
    (NS_CONFIG, "cfg"),
    (NS_WSMANFAULT, "fault"),
    (NS_CIM_ERROR, "cim_error"),
    (NS_STORAGE_CIM_ERROR, "storage_cim_error"),
    (NS_EXTENDED_STATUS, "extended_status"),
    (NS_NETWORK_CIM_ERROR, "network_cim_error"),
];

/// alias → namespace URI, for resolving fault subcode prefixes.
static ALIAS_TO_NAMESPACE: Lazy<HashMap<&'static str, &'static str>> =
    Lazy::new(|| NAMESPACE_ALIASES.iter().map(|&(uri, alias)| (alias, uri)).collect());

pub(crate) fn alias_namespace(alias: &str) -> Option<&'static str> {
    ALIAS_TO_NAMESPACE.get(alias).copied()
}

// ============================================================================
// Resource URI aliases
// ============================================================================

/// Short aliases for resource URI prefixes. See `winrm help aliases`.
static RESOURCE_ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("wmi", "http://schemas.microsoft.com/wbem/wsman/1/wmi"),
        ("wmicimv2", "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2"),
        ("cimv2", "http://schemas.dmtf.org/wbem/wscim/1/cim-schema/2"),
        ("winrm", "http://schemas.microsoft.com/wbem/wsman/1"),
        ("wsman", "http://schemas.microsoft.com/wbem/wsman/1"),
        ("shell", "http://schemas.microsoft.com/wbem/wsman/1/windows/shell"),
    ])
});

/// Resolve a namespace alias or find the right namespace for a class name.
///
/// Full URIs (anything containing `//`) pass through unchanged. An
/// `alias/rest` form is resolved against the alias table. A bare `Win32_*`
/// class name lives in the default WMI v2 namespace; all other bare names
/// are ambiguous (MSFT_ classes are spread across several namespaces) and
/// fail with [`Error::UnresolvableResourceUri`].
pub fn resolve(short_uri: &str) -> Result<String> {
    if short_uri.contains("//") {
        return Ok(short_uri.to_owned());
    }
    if let Some((alias, rest)) = short_uri.split_once('/') {
        let base = RESOURCE_ALIASES
            .get(alias)
            .ok_or_else(|| Error::UnresolvableResourceUri {
                name: short_uri.to_owned(),
            })?;
        return Ok(format!("{base}/{rest}"));
    }
    if short_uri.starts_with("Win32_") {
        return Ok(format!("{}/{}", RESOURCE_ALIASES["wmicimv2"], short_uri));
    }
    Err(Error::UnresolvableResourceUri {
        name: short_uri.to_owned(),
    })
}

/// Split a full resource URI into its canonical namespace and the tag that
/// names response objects of that class.
///
/// The namespace part is lowercased: servers are not consistent about
/// letter case in the URIs they echo back, so all comparisons against the
/// result must stay case-insensitive.
pub(crate) fn xml_bits(uri: &str) -> (String, String) {
    let (directory, name) = uri.rsplit_once('/').unwrap_or(("", uri));
    let canonical = format!("{}/{}", directory.to_lowercase(), name);
    (canonical, name.to_owned())
}

// ============================================================================
// Win32 / WBEM error codes
// ============================================================================

/// Exit status of a process terminated by Ctrl-C.
/// See: https://msdn.microsoft.com/en-us/library/cc704588.aspx
pub const STATUS_CONTROL_C_EXIT: u32 = 0xC000_013A;

/// Known Win32/WBEM error constants, for diagnostics only.
///
/// Explanation: https://docs.microsoft.com/en-us/windows/desktop/WmiSdk/wmi-error-constants
/// More: https://docs.microsoft.com/en-us/windows/desktop/adsi/win32-error-codes
static WIN32_ERROR_CODES: Lazy<HashMap<u32, &'static str>> = Lazy::new(|| {
    HashMap::from([
        // Errors originating in the core operating system.
        // Remove 0x8007, look up the last 4 hex digits.
        // See: https://docs.microsoft.com/en-us/windows/desktop/debug/system-error-codes
        (0x8007_1392, "ERROR_OBJECT_ALREADY_EXISTS"),
        // WBEM errors.
        (0x8004_1005, "WBEM_E_TYPE_MISMATCH"),
        (0x8004_1008, "WBEM_E_INVALID_PARAMETER"),
    ])
});

/// Symbolic name of a Win32/WBEM error code, when known.
pub fn win32_error_name(code: u32) -> Option<&'static str> {
    WIN32_ERROR_CODES.get(&code).copied()
}
