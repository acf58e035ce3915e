//! The WinRS remote shell transport.
//!
//! State machine per shell: `Created → (Command → Running → Done)* →
//! Deleted`. The shell is owned by its creator, which must call
//! [`WinRmShell::close`] on every exit path; commands are driven by a
//! blocking send/receive/signal cycle with base64 streams.

use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::client::WinRm;
use crate::envelope::{OptionSet, SelectorSet, SelectorValue};
use crate::error::{Error, Result};
use crate::resource::NS_SHELL;
use crate::xml::{escape, Element};

/// Resource URI of the cmd shell.
pub const SHELL_RESOURCE_URI: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";

const COMMAND_STATE_DONE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";
const COMMAND_STATE_PENDING: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Pending";
const COMMAND_STATE_RUNNING: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running";

const SIGNAL_CODE_PREFIX: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/";

/// Upper bound on one receive poll inside a wait loop, so a deadline is
/// checked at a reasonable cadence.
const RECEIVE_POLL_SEC: f64 = 10.0;

/// Options for creating a shell. Working directory and environment are
/// fixed at shell creation; commands inherit them.
#[derive(Debug, Clone)]
pub struct ShellOptions {
    pub working_directory: Option<String>,
    pub env_vars: Vec<(String, String)>,
    /// Console code page; 65001 is UTF-8.
    pub codepage: u32,
    /// `rsp:IdleTimeOut` as an xs:duration string.
    pub idle_timeout: Option<String>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        ShellOptions {
            working_directory: None,
            env_vars: Vec::new(),
            codepage: 65001,
            idle_timeout: None,
        }
    }
}

/// Signals deliverable to a running command.
///
/// Signals: https://docs.microsoft.com/en-us/windows/console/ctrl-c-and-ctrl-break-signals
/// WSMV signal codes: https://msdn.microsoft.com/en-us/library/cc761132.aspx
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    CtrlC,
    CtrlBreak,
    Terminate,
}

impl SignalKind {
    fn code(self) -> &'static str {
        match self {
            SignalKind::CtrlC => "ctrl_c",
            SignalKind::CtrlBreak => "ctrl_break",
            SignalKind::Terminate => "terminate",
        }
    }
}

// ============================================================================
// Shell
// ============================================================================

/// An open remote shell, created by one WS-Transfer Create and destroyed
/// by an explicit [`WinRmShell::close`].
pub struct WinRmShell<'a> {
    client: &'a WinRm,
    shell_id: String,
    client_ip: String,
    closed: bool,
}

impl<'a> WinRmShell<'a> {
    /// Create a remote shell.
    pub fn open(client: &'a WinRm, options: &ShellOptions) -> Result<Self> {
        let mut shell = String::from(
            "<rsp:InputStreams>stdin</rsp:InputStreams>\
             <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>",
        );
        if let Some(directory) = &options.working_directory {
            shell.push_str(&format!(
                "<rsp:WorkingDirectory>{}</rsp:WorkingDirectory>",
                escape(directory)
            ));
        }
        if let Some(idle_timeout) = &options.idle_timeout {
            shell.push_str(&format!(
                "<rsp:IdleTimeOut>{}</rsp:IdleTimeOut>",
                escape(idle_timeout)
            ));
        }
        if !options.env_vars.is_empty() {
            let variables: String = options
                .env_vars
                .iter()
                .map(|(name, value)| {
                    format!(
                        r#"<rsp:Variable Name="{}">{}</rsp:Variable>"#,
                        escape(name),
                        escape(value)
                    )
                })
                .collect();
            shell.push_str(&format!("<rsp:Environment>{variables}</rsp:Environment>"));
        }
        let body = format!("<rsp:Shell>{shell}</rsp:Shell>");
        let create_options = OptionSet::from_pairs([
            ("WINRS_NOPROFILE".to_owned(), "FALSE".to_owned()),
            ("WINRS_CODEPAGE".to_owned(), options.codepage.to_string()),
        ]);

        let response = client.act(
            SHELL_RESOURCE_URI,
            ACTION_CREATE,
            &body,
            &SelectorSet::new(),
            &create_options,
            None,
        )?;
        let created = response
            .child(NS_SHELL, "Shell")
            .ok_or_else(|| Error::protocol("no Shell in create response"))?;
        let shell_id = created
            .child(NS_SHELL, "ShellId")
            .ok_or_else(|| Error::protocol("no ShellId in create response"))?
            .text
            .clone();
        let client_ip = created
            .child(NS_SHELL, "ClientIP")
            .ok_or_else(|| Error::protocol("no ClientIP in create response"))?
            .text
            .clone();
        debug!(%shell_id, %client_ip, "created remote shell");

        Ok(WinRmShell {
            client,
            shell_id,
            client_ip,
            closed: false,
        })
    }

    pub fn shell_id(&self) -> &str {
        &self.shell_id
    }

    /// The client address as observed by the server.
    pub fn client_ip(&self) -> &str {
        &self.client_ip
    }

    /// Start one command line from argv, quoted for `cmd /c`.
    pub fn run(&self, argv: &[&str]) -> Result<RemoteCommand<'_>> {
        let command_line = args_to_command_line(argv)?;
        self.start_command(&command_line)
    }

    /// Start one raw command line, passed through unquoted.
    pub fn run_command_line(&self, command_line: &str) -> Result<RemoteCommand<'_>> {
        if command_line.contains('\n') {
            return Err(Error::InvalidCommandLine {
                message: format!(
                    "newlines are not supported by the WinRM shell: {command_line:?}"
                ),
            });
        }
        self.start_command(command_line)
    }

    fn start_command(&self, command_line: &str) -> Result<RemoteCommand<'_>> {
        debug!(command = %command_line, "start remote command");
        // Commands are executed with `cmd /c`, which has its own special
        // (but simple) quoting rules: quote normally, then simply put
        // quotes around. Thoroughly read the output of `cmd /?`.
        let body = format!(
            "<rsp:CommandLine><rsp:Command>\"{}\"</rsp:Command></rsp:CommandLine>",
            escape(command_line)
        );
        let response = self.invoke("Command", &body, None)?;
        let command_id = response
            .find(&[(NS_SHELL, "CommandResponse"), (NS_SHELL, "CommandId")])
            .ok_or_else(|| Error::protocol("no CommandId in command response"))?
            .text
            .clone();
        Ok(RemoteCommand {
            shell: self,
            command_id,
            returncode: None,
        })
    }

    /// WS-Transfer Delete of the shell. Tolerates the shell already being
    /// gone.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let selectors = shell_selectors(&self.shell_id);
        match self.client.act(
            SHELL_RESOURCE_URI,
            ACTION_DELETE,
            "",
            &selectors,
            &OptionSet::empty(),
            None,
        ) {
            Ok(_) => {}
            // The shell being gone already is a success for close.
            Err(Error::Connection { .. }) => info!("WinRM session is already closed"),
            Err(Error::ObjectNotFound { .. }) | Err(Error::SoapFault { .. }) => {
                info!(shell_id = %self.shell_id, "remote shell is already gone")
            }
            Err(error) => return Err(error),
        }
        self.closed = true;
        Ok(())
    }

    /// One shell-scoped WS-Man action addressed by the ShellId selector.
    fn invoke(&self, method: &str, body: &str, timeout_sec: Option<f64>) -> Result<Element> {
        let selectors = shell_selectors(&self.shell_id);
        let action = format!("{NS_SHELL}/{method}");
        self.client.act(
            SHELL_RESOURCE_URI,
            &action,
            body,
            &selectors,
            &OptionSet::empty(),
            timeout_sec,
        )
    }
}

impl Drop for WinRmShell<'_> {
    fn drop(&mut self) {
        if !self.closed {
            warn!(shell_id = %self.shell_id, "remote shell dropped without close");
        }
    }
}

fn shell_selectors(shell_id: &str) -> SelectorSet {
    SelectorSet::from([(
        "ShellId".to_owned(),
        SelectorValue::Str(shell_id.to_owned()),
    )])
}

// ============================================================================
// Command
// ============================================================================

/// Accumulated output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

/// One result of polling a running command.
enum PollOutcome {
    /// The server answered within the operation timeout.
    Output {
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        exit_code: Option<i64>,
    },
    /// No output arrived within the window; poll again.
    TimedOut,
}

/// A command running (or finished) inside a remote shell.
///
/// `returncode` is `None` until a receive observes the `Done` state; once
/// set it is frozen and further receives return empty output without
/// re-deriving it.
pub struct RemoteCommand<'a> {
    shell: &'a WinRmShell<'a>,
    command_id: String,
    returncode: Option<i64>,
}

impl RemoteCommand<'_> {
    pub fn command_id(&self) -> &str {
        &self.command_id
    }

    pub fn returncode(&self) -> Option<i64> {
        self.returncode
    }

    /// Stream a chunk of stdin; `is_last` closes the stream.
    /// See: https://msdn.microsoft.com/en-us/library/cc251742.aspx
    pub fn send(&self, stdin: &[u8], is_last: bool) -> Result<usize> {
        let end = if is_last { r#" End="true""# } else { "" };
        let body = format!(
            r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{}"{end}>{}</rsp:Stream></rsp:Send>"#,
            escape(&self.command_id),
            BASE64_STANDARD.encode(stdin),
        );
        self.shell.invoke("Send", &body, None)?;
        Ok(stdin.len())
    }

    /// Single poll for output.
    ///
    /// An operation timeout is not an error here: it means no output
    /// arrived within the window, and the empty chunk lets a polling loop
    /// simply retry.
    pub fn receive(&mut self, timeout_sec: Option<f64>) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.returncode.is_some() {
            return Ok((Vec::new(), Vec::new()));
        }
        match self.poll(timeout_sec)? {
            PollOutcome::TimedOut => Ok((Vec::new(), Vec::new())),
            PollOutcome::Output {
                stdout,
                stderr,
                exit_code,
            } => {
                if let Some(code) = exit_code {
                    self.returncode = Some(code);
                }
                Ok((stdout, stderr))
            }
        }
    }

    fn poll(&self, timeout_sec: Option<f64>) -> Result<PollOutcome> {
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            escape(&self.command_id)
        );
        let response = match self.shell.invoke("Receive", &body, timeout_sec) {
            Ok(response) => response,
            Err(Error::OperationTimeout) | Err(Error::HttpResponseTimeout) => {
                return Ok(PollOutcome::TimedOut)
            }
            Err(error) => return Err(error),
        };
        let receive = response
            .child(NS_SHELL, "ReceiveResponse")
            .ok_or_else(|| Error::protocol("no ReceiveResponse in response"))?;
        let (stdout, stderr) = parse_streams(receive)?;
        let exit_code = parse_command_state(receive)?;
        Ok(PollOutcome::Output {
            stdout,
            stderr,
            exit_code,
        })
    }

    /// Poll until the command finishes, accumulating output.
    pub fn wait_with_output(&mut self, timeout: Option<Duration>) -> Result<CommandOutput> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            if let Some(exit_code) = self.returncode {
                return Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code,
                });
            }
            let poll_timeout = match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(Error::WaitTimeout {
                            seconds: timeout.as_secs_f64(),
                        });
                    }
                    Some(remaining.as_secs_f64().min(RECEIVE_POLL_SEC))
                }
                _ => None,
            };
            let (out, err) = self.receive(poll_timeout)?;
            stdout.extend(out);
            stderr.extend(err);
        }
    }

    /// Poll until the command finishes, discarding output.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<i64> {
        self.wait_with_output(timeout)
            .map(|output| output.exit_code)
    }

    /// Deliver a signal. Idempotent once the command is already done.
    pub fn signal(&self, kind: SignalKind) -> Result<()> {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{SIGNAL_CODE_PREFIX}{}</rsp:Code></rsp:Signal>"#,
            escape(&self.command_id),
            kind.code(),
        );
        self.shell.invoke("Signal", &body, None)?;
        debug!(command_id = %self.command_id, signal = kind.code(), "signal delivered");
        Ok(())
    }
}

/// Decode any stdout/stderr stream chunks present.
/// Stream tags are absent if streams are closed but the process still runs.
fn parse_streams(receive: &Element) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    for stream in receive.children_named(NS_SHELL, "Stream") {
        let content = stream.text.trim();
        if content.is_empty() {
            continue;
        }
        let decoded = BASE64_STANDARD
            .decode(content)
            .map_err(|e| Error::protocol(format!("bad stream encoding: {e}")))?;
        match stream.attr("Name") {
            Some("stdout") => stdout.extend_from_slice(&decoded),
            Some("stderr") => stderr.extend_from_slice(&decoded),
            _ => {}
        }
    }
    Ok((stdout, stderr))
}

/// Read the command-state element: `Done` carries the exit code, `Pending`
/// and `Running` carry none — a running command with an exit code is a
/// protocol violation.
fn parse_command_state(receive: &Element) -> Result<Option<i64>> {
    let state_element = receive
        .child(NS_SHELL, "CommandState")
        .ok_or_else(|| Error::protocol("no CommandState in receive response"))?;
    let state = state_element
        .attr("State")
        .ok_or_else(|| Error::protocol("CommandState without a State"))?;
    let exit_code = state_element.child(NS_SHELL, "ExitCode");
    match state {
        COMMAND_STATE_DONE => {
            let code = exit_code
                .ok_or_else(|| Error::protocol("done command without an exit code"))?
                .text
                .parse::<i64>()
                .map_err(|e| Error::protocol(format!("bad exit code: {e}")))?;
            Ok(Some(code))
        }
        COMMAND_STATE_PENDING => Ok(None),
        COMMAND_STATE_RUNNING => {
            if exit_code.is_some() {
                return Err(Error::protocol("running command with an exit code"));
            }
            Ok(None)
        }
        other => Err(Error::protocol(format!(
            "command in unexpected state {other}"
        ))),
    }
}

/// Quote argv for the Windows command line, following the same rules as
/// `subprocess.list2cmdline`: quote arguments containing whitespace (or
/// empty ones), double backslashes before quotes, backslash-escape quotes.
pub fn args_to_command_line(args: &[&str]) -> Result<String> {
    let mut line = String::new();
    for (index, arg) in args.iter().enumerate() {
        if arg.contains('\n') {
            return Err(Error::InvalidCommandLine {
                message: format!("newlines are not supported by the WinRM shell: {arg:?}"),
            });
        }
        if index > 0 {
            line.push(' ');
        }
        let needs_quoting = arg.is_empty() || arg.contains(' ') || arg.contains('\t');
        if needs_quoting {
            line.push('"');
        }
        let mut backslashes = 0usize;
        for c in arg.chars() {
            match c {
                '\\' => backslashes += 1,
                '"' => {
                    line.push_str(&"\\".repeat(backslashes * 2));
                    line.push_str("\\\"");
                    backslashes = 0;
                }
                other => {
                    line.push_str(&"\\".repeat(backslashes));
                    backslashes = 0;
                    line.push(other);
                }
            }
        }
        line.push_str(&"\\".repeat(backslashes));
        if needs_quoting {
            // Trailing backslashes must be doubled before the closing quote.
            line.push_str(&"\\".repeat(backslashes));
            line.push('"');
        }
    }
    Ok(line)
}
