//! Decodes an HTTP status plus SOAP body into one structured error.
//!
//! The walk is depth-first and most-specific-first: a WMI error nested
//! inside a generic fault must surface as [`Error::WmiError`], not as the
//! catch-all [`Error::SoapFault`]. That ordering is load-bearing.

use crate::error::Error;
use crate::resource::{
    self, NS_CIM_ERROR, NS_ENV, NS_EXTENDED_STATUS, NS_NETWORK_CIM_ERROR,
    NS_STORAGE_CIM_ERROR, NS_WSMANFAULT,
};
use crate::xml::Element;

/// WS-Man fault code: the operation did not complete within
/// `w:OperationTimeout`.
const CODE_OPERATION_TIMEOUT: u32 = 0x8033_8029;

/// WS-Man fault code: the WMI provider found no matching object.
const CODE_OBJECT_NOT_FOUND: u32 = 0x8033_8000;

/// Turn a non-2xx response into the matching structured error.
pub(crate) fn decode(netloc: &str, status: u16, content: &[u8]) -> Error {
    match status {
        401 => Error::Unauthorized {
            netloc: netloc.to_owned(),
        },
        404 if content.is_empty() => Error::EmptyResponse {
            status: 404,
            hint: "check IP settings on the NIC the request goes through or reboot",
        },
        500 => decode_fault_body(content),
        _ => Error::protocol(format!("unexpected status {status}")),
    }
}

fn decode_fault_body(content: &[u8]) -> Error {
    if content.is_empty() {
        return Error::EmptyResponse {
            status: 500,
            hint: "may be caused by the disabling of unencrypted traffic; \
                   check: `winrm g winrm/config/service`; \
                   fix: `winrm s winrm/config/service @{AllowUnencrypted=\"true\"}`",
        };
    }
    let text = match std::str::from_utf8(content) {
        Ok(text) => text,
        Err(_) => {
            return Error::protocol("can't decode WinRM message: response is not UTF-8")
        }
    };
    let root = match Element::parse(text) {
        Ok(root) => root,
        Err(_) => return Error::protocol(format!("can't decode WinRM message:\n{text}")),
    };
    let Some(fault) = root.find(&[(NS_ENV, "Body"), (NS_ENV, "Fault")]) else {
        return Error::protocol(format!("WinRM error:\n{text}"));
    };
    decode_fault(fault)
}

/// Walk a `env:Fault` element looking for the most specific marker before
/// falling back to the generic reason/code reader.
fn decode_fault(fault: &Element) -> Error {
    let detail = fault.child(NS_ENV, "Detail");

    if let Some(wsman_fault) = detail.and_then(|d| d.child(NS_WSMANFAULT, "WSManFault")) {
        if let Some(code) = wsman_fault.attr("Code").and_then(|c| c.parse::<u32>().ok()) {
            if code == CODE_OBJECT_NOT_FOUND {
                return object_not_found(wsman_fault);
            }
            if code == CODE_OPERATION_TIMEOUT {
                return Error::OperationTimeout;
            }
        }
    }

    // A provider fault wrapped inside the outer WSManFault message.
    if let Some(wmi_fault) = fault.find(&[
        (NS_ENV, "Detail"),
        (NS_WSMANFAULT, "WSManFault"),
        (NS_WSMANFAULT, "Message"),
        (NS_WSMANFAULT, "ProviderFault"),
        (NS_WSMANFAULT, "WSManFault"),
        (NS_WSMANFAULT, "Message"),
    ]) {
        return Error::WmiFault {
            message: wmi_fault.deep_text(),
        };
    }

    // MSFT_WmiError arrives under one of three namespaces depending on
    // which CIM provider raised it.
    for namespace in [NS_CIM_ERROR, NS_STORAGE_CIM_ERROR, NS_NETWORK_CIM_ERROR] {
        let Some(cim_error) = detail.and_then(|d| d.child(namespace, "MSFT_WmiError")) else {
            continue;
        };
        let code = cim_error
            .child(namespace, "CIMStatusCode")
            .and_then(|e| e.text.parse::<i32>().ok());
        let message = cim_error
            .child(namespace, "Message")
            .map(|e| e.text.clone());
        if let (Some(code), Some(message)) = (code, message) {
            return Error::WmiError { code, message };
        }
    }

    generic_fault(fault)
}

fn object_not_found(wsman_fault: &Element) -> Error {
    let extended_status = wsman_fault.find(&[
        (NS_WSMANFAULT, "Message"),
        (NS_WSMANFAULT, "ProviderFault"),
        (NS_WSMANFAULT, "ExtendedError"),
        (NS_EXTENDED_STATUS, "__ExtendedStatus"),
    ]);
    let Some(extended_status) = extended_status else {
        return Error::protocol("object-not-found fault without extended status");
    };
    let field = |name: &str| {
        extended_status
            .child(NS_EXTENDED_STATUS, name)
            .map(|e| e.text.clone())
            .unwrap_or_default()
    };
    Error::ObjectNotFound {
        operation: field("Operation"),
        parameter_info: field("ParameterInfo"),
        provider_name: field("ProviderName"),
    }
}

fn generic_fault(fault: &Element) -> Error {
    let Some(reason) = fault.find(&[(NS_ENV, "Reason"), (NS_ENV, "Text")]) else {
        return Error::protocol("SOAP fault without a Reason");
    };
    let message = reason.deep_text();

    let Some(subcode) = fault.find(&[(NS_ENV, "Code"), (NS_ENV, "Subcode")]) else {
        return Error::protocol(format!("SOAP fault without a Subcode: {message}"));
    };
    let code_full = subcode.deep_text();
    let (alias, code_value) = code_full
        .split_once(':')
        .unwrap_or(("", code_full.as_str()));
    // The subcode prefix is resolved against the fixed alias table; an
    // unknown prefix is kept verbatim rather than failing the decode.
    let code_ns = resource::alias_namespace(alias).unwrap_or(alias).to_owned();

    if code_value == "InvalidSelectors" {
        return Error::BadSelectors { message, code_ns };
    }
    Error::SoapFault {
        message,
        code_ns,
        code_value: code_value.to_owned(),
    }
}
