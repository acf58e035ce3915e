//! # Winrs - A WS-Management (WinRM) Protocol Client
//!
//! Winrs is a from-scratch client for the WS-Management protocol: SOAP/XML
//! over HTTP, used to query and mutate CIM/WMI objects on a remote Windows
//! host and to create, drive, and tear down a remote command shell.
//!
//! ## Core Concepts
//!
//! - **Resource URI**: the fully-qualified namespace+class identifier a
//!   request addresses; short names like `Win32_Service` are resolved
//!   through a fixed alias table
//! - **Selector Set**: the key/value address of one CIM instance
//!   (analogous to a primary key), possibly keyed by another object's
//!   reference
//! - **Enumeration Context**: the opaque continuation token behind the
//!   lazy Enumerate/Pull sequence
//! - **WinRS**: the remote shell sub-protocol
//!   (Create/Command/Send/Receive/Signal/Delete)
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │   WMI facade          Remote shell          Script wrapper    │
//! │  (get/put/create/    (create/command/      (parameterized     │
//! │   delete/invoke/      send/receive/         PowerShell with   │
//! │   associations/wql)   signal/delete)        JSON outcome)     │
//! └───────────────────────────────────────────────────────────────┘
//!                │                 │                  │
//!                ▼                 ▼                  ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │        Enumeration engine        │       WinRm::act           │
//! │     (Enumerate/Pull iterator)    │  (one envelope round trip) │
//! └───────────────────────────────────────────────────────────────┘
//!                │                                │
//!                ▼                                ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │   Envelope codec + resource addressing + fault decoder        │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All operations are blocking; a single mutex per client serializes the
//! stateful protocol conversations. Connection-level errors are retried
//! with fixed backoff; protocol-level faults surface as the closed
//! [`Error`] taxonomy.
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use winrs::{WinRm, WinRmConfig, SelectorSet, ShellOptions, WinRmShell};
//!
//! let client = WinRm::new(WinRmConfig::new("10.0.0.3", 5985, "Administrator", "secret"));
//!
//! // One WMI instance by its key.
//! let selectors = SelectorSet::from([("Name".to_owned(), "Spooler".into())]);
//! let service = client.get("Win32_Service", &selectors)?;
//!
//! // A remote process, drained to completion.
//! let mut shell = WinRmShell::open(&client, &ShellOptions::default())?;
//! let exit_code = shell.run(&["whoami"])?.wait(None)?;
//! shell.close()?;
//! # Ok::<(), winrs::Error>(())
//! ```

/// The WinRM client handle and its transport seam.
pub mod client;

/// The Enumerate/Pull session state machine.
pub mod enumerate;

/// SOAP envelope codec and the typed addressing data model.
pub mod envelope;

/// Error types.
pub mod error;

/// Resource addressing and the fixed protocol tables.
pub mod resource;

/// Parameterized PowerShell execution.
pub mod script;

/// The WinRS remote shell transport.
pub mod shell;

/// WMI operations over WS-Transfer and WS-Enumeration.
pub mod wmi;

mod fault;
mod xml;

pub use client::{
    HttpTransport, SoapResponse, Transport, TransportError, WinRm, WinRmConfig,
    DEFAULT_WINRM_PORT,
};
pub use enumerate::Enumeration;
pub use envelope::{OptionSet, Reference, SelectorSet, SelectorValue, WmiObject, WmiValue};
pub use error::{Error, Result};
pub use resource::{resolve, STATUS_CONTROL_C_EXIT};
pub use script::{run_powershell_script, ScriptParams};
pub use shell::{
    CommandOutput, RemoteCommand, ShellOptions, SignalKind, WinRmShell, SHELL_RESOURCE_URI,
};
