//! Parameterized PowerShell execution with a structured outcome.
//!
//! A script body and a map of named parameters become a decorated script:
//! a function taking one parameter per key, each argument JSON-deserialized
//! inside the remote interpreter, and the result (or the caught error)
//! serialized as the command's entire stdout:
//!
//! ```text
//! ["success", [<result>]]
//! ["fail", [<exceptionTypeFullName>, <categoryName>, <message>]]
//! ```
//!
//! The decoder treats empty stdout as a distinct hard failure: the
//! interpreter crashed before the wrapper could report anything.

use std::collections::BTreeMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::shell::WinRmShell;

/// Named parameters handed to a script; values are embedded as JSON.
pub type ScriptParams = BTreeMap<String, Value>;

/// Decorate a script body into the self-reporting form described above.
pub fn wrap_script(body: &str, params: &ScriptParams) -> String {
    let param_names: Vec<String> = params.keys().map(|name| format!("${name}")).collect();
    let arguments: String = params
        .iter()
        .map(|(name, value)| {
            format!(
                " -{name} ('{}' | ConvertFrom-Json)",
                powershell_quote(&value.to_string())
            )
        })
        .collect();
    format!(
        "function Invoke-Script {{\n\
         param({param_list})\n\
         {body}\n\
         }}\n\
         $ErrorActionPreference = 'Stop'\n\
         try {{\n\
         $result = Invoke-Script{arguments}\n\
         $outcome = @('success', @($result))\n\
         }} catch {{\n\
         $outcome = @('fail', @(\n\
         $_.Exception.GetType().FullName,\n\
         $_.CategoryInfo.Category.ToString(),\n\
         $_.Exception.Message))\n\
         }}\n\
         ConvertTo-Json -Compress -Depth 32 @($outcome)",
        param_list = param_names.join(", "),
    )
}

/// The PowerShell invocation convention: the whole script goes on the
/// command line, base64 over UTF-16LE.
pub fn powershell_command_line(script: &str) -> String {
    let utf16le: Vec<u8> = script
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    format!(
        "powershell -NoProfile -NonInteractive -ExecutionPolicy Unrestricted -EncodedCommand {}",
        BASE64_STANDARD.encode(utf16le)
    )
}

/// Run a script body with named parameters in the given shell and decode
/// its structured outcome.
pub fn run_powershell_script(
    shell: &WinRmShell<'_>,
    body: &str,
    params: &ScriptParams,
    timeout: Option<Duration>,
) -> Result<Value> {
    debug!(params = ?params.keys().collect::<Vec<_>>(), "run PowerShell script");
    let script = wrap_script(body, params);
    let command_line = powershell_command_line(&script);
    let mut command = shell.run_command_line(&command_line)?;
    let output = command.wait_with_output(timeout)?;
    decode_outcome(&output.stdout, Some(output.exit_code), &output.stderr)
}

/// Decode the wrapper's stdout contract.
pub fn decode_outcome(stdout: &[u8], exit_code: Option<i64>, stderr: &[u8]) -> Result<Value> {
    let text = String::from_utf8_lossy(stdout);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(Error::EmptyStdout {
            exit_code,
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        });
    }
    let outcome: Value = serde_json::from_str(trimmed)
        .map_err(|e| Error::protocol(format!("script outcome is not JSON ({e}): {trimmed}")))?;
    let pair = outcome.as_array().filter(|array| array.len() == 2);
    let Some([tag, payload]) = pair.map(|array| [&array[0], &array[1]]) else {
        return Err(Error::protocol(format!(
            "unexpected script outcome shape: {trimmed}"
        )));
    };
    let payload = payload
        .as_array()
        .ok_or_else(|| Error::protocol(format!("unexpected script outcome shape: {trimmed}")))?;
    match tag.as_str() {
        Some("success") => Ok(payload.first().cloned().unwrap_or(Value::Null)),
        Some("fail") => {
            let field = |index: usize| {
                payload
                    .get(index)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned()
            };
            Err(Error::RemoteScript {
                type_name: field(0),
                category: field(1),
                message: field(2),
            })
        }
        _ => Err(Error::protocol(format!(
            "unexpected script outcome tag: {trimmed}"
        ))),
    }
}

/// Escape a string for a single-quoted PowerShell literal.
fn powershell_quote(raw: &str) -> String {
    raw.replace('\'', "''")
}
