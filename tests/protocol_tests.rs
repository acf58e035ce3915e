//! End-to-end protocol tests over a scripted transport: canned SOAP
//! responses are exchanged for real requests, exercising envelope
//! building, fault decoding, enumeration, the shell cycle, and the
//! script wrapper without a Windows host.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use pretty_assertions::assert_eq;
use serde_json::json;

use winrs::{
    run_powershell_script, Error, ScriptParams, SelectorSet, SelectorValue, ShellOptions,
    SignalKind, SoapResponse, Transport, TransportError, WinRm, WinRmConfig, WinRmShell,
    WmiObject, WmiValue,
};

const NS_ENV: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_ENUM: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";
const NS_TRANSFER: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";
const NS_WSMANFAULT: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsmanfault";
const NS_XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

const SERVICE_URI: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Service";

// ============================================================================
// Scripted transport
// ============================================================================

enum Canned {
    Response { status: u16, body: String },
    Timeout,
}

#[derive(Clone)]
struct Scripted {
    inner: Arc<ScriptedInner>,
}

struct ScriptedInner {
    canned: Mutex<VecDeque<Canned>>,
    requests: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(canned: impl IntoIterator<Item = Canned>) -> Self {
        Scripted {
            inner: Arc::new(ScriptedInner {
                canned: Mutex::new(canned.into_iter().collect()),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    fn requests(&self) -> Vec<String> {
        self.inner.requests.lock().unwrap().clone()
    }

    fn client(&self) -> WinRm {
        let config = WinRmConfig::new("windows-host", 5985, "Administrator", "secret");
        WinRm::with_transport(config, Box::new(self.clone()))
    }
}

impl Transport for Scripted {
    fn round_trip(&self, request: &[u8]) -> Result<SoapResponse, TransportError> {
        let request = std::str::from_utf8(request).expect("request is not UTF-8");
        self.inner.requests.lock().unwrap().push(request.to_owned());
        let message_id = between(request, "<a:MessageID>", "</a:MessageID>").to_owned();
        match self.inner.canned.lock().unwrap().pop_front() {
            Some(Canned::Response { status, body }) => Ok(SoapResponse {
                status,
                body: body.replace("{{MESSAGE_ID}}", &message_id).into_bytes(),
            }),
            Some(Canned::Timeout) => Err(TransportError::Timeout),
            None => panic!("unexpected extra request:\n{request}"),
        }
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> &'a str {
    let start = text.find(open).expect("opening marker") + open.len();
    let end = text[start..].find(close).expect("closing marker") + start;
    &text[start..end]
}

fn ok(body: &str) -> Canned {
    Canned::Response {
        status: 200,
        body: response_envelope(body),
    }
}

fn response_envelope(body: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="{NS_ENV}" xmlns:a="{NS_ADDRESSING}" xmlns:w="{NS_WSMAN}"
              xmlns:n="{NS_ENUM}" xmlns:t="{NS_TRANSFER}" xmlns:rsp="{NS_SHELL}"
              xmlns:xsi="{NS_XSI}">
  <env:Header><a:RelatesTo>{{{{MESSAGE_ID}}}}</a:RelatesTo></env:Header>
  <env:Body>{body}</env:Body>
</env:Envelope>"#
    )
}

fn fault(code: Option<u32>, subcode: &str, reason: &str, extra_detail: &str) -> Canned {
    let wsman_fault = match code {
        Some(code) => format!(
            r#"<f:WSManFault xmlns:f="{NS_WSMANFAULT}" Code="{code}"><f:Message>{reason}</f:Message></f:WSManFault>"#
        ),
        None => String::new(),
    };
    let body = format!(
        r#"<env:Fault>
  <env:Code>
    <env:Value>env:Receiver</env:Value>
    <env:Subcode><env:Value>{subcode}</env:Value></env:Subcode>
  </env:Code>
  <env:Reason><env:Text xml:lang="en-US">{reason}</env:Text></env:Reason>
  <env:Detail>{wsman_fault}{extra_detail}</env:Detail>
</env:Fault>"#
    );
    Canned::Response {
        status: 500,
        body: response_envelope(&body),
    }
}

fn service_selectors(name: &str) -> SelectorSet {
    SelectorSet::from([("Name".to_owned(), SelectorValue::Str(name.to_owned()))])
}

// ============================================================================
// WS-Transfer operations
// ============================================================================

#[test]
fn get_decodes_fields_and_addresses_the_resolved_uri() {
    let transport = Scripted::new([ok(&format!(
        r#"<p:Win32_Service xmlns:p="{SERVICE_URI}">
             <p:Name>Spooler</p:Name>
             <p:State>Running</p:State>
             <p:Description xsi:nil="true"/>
           </p:Win32_Service>"#
    ))]);
    let client = transport.client();

    let object = client.get("Win32_Service", &service_selectors("Spooler")).unwrap();

    let expected = WmiObject::from([
        ("Name".to_owned(), WmiValue::Str("Spooler".to_owned())),
        ("State".to_owned(), WmiValue::Str("Running".to_owned())),
        ("Description".to_owned(), WmiValue::Null),
    ]);
    assert_eq!(object, expected);

    let request = &transport.requests()[0];
    assert!(request.contains(&format!(
        r#"<w:ResourceURI env:mustUnderstand="true">{SERVICE_URI}</w:ResourceURI>"#
    )));
    assert!(request.contains(r#"<w:Selector Name="Name">Spooler</w:Selector>"#));
    assert!(request.contains("transfer/Get</a:Action>"));
}

#[test]
fn create_returns_the_new_reference() {
    let uri = "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/Win32_Environment";
    let transport = Scripted::new([ok(&format!(
        r#"<t:ResourceCreated>
             <a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
             <a:ReferenceParameters>
               <w:ResourceURI>{uri}</w:ResourceURI>
               <w:SelectorSet><w:Selector Name="Name">PATH</w:Selector></w:SelectorSet>
             </a:ReferenceParameters>
           </t:ResourceCreated>"#
    ))]);
    let client = transport.client();

    let properties = WmiObject::from([("Name".to_owned(), WmiValue::Str("PATH".to_owned()))]);
    let reference = client.create("Win32_Environment", &properties).unwrap();

    assert!(reference.uri.eq_ignore_ascii_case(uri));
    assert_eq!(
        reference.selectors,
        SelectorSet::from([("Name".to_owned(), SelectorValue::Str("PATH".to_owned()))])
    );
    assert!(transport.requests()[0]
        .contains(&format!(r#"<Win32_Environment xmlns="{uri}"><Name>PATH</Name></Win32_Environment>"#)));
}

#[test]
fn create_rejects_a_mismatched_resource_uri() {
    let transport = Scripted::new([ok(
        r#"<t:ResourceCreated>
             <a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
             <a:ReferenceParameters>
               <w:ResourceURI>http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/SomethingElse</w:ResourceURI>
             </a:ReferenceParameters>
           </t:ResourceCreated>"#,
    )]);
    let client = transport.client();

    let outcome = client.create("Win32_Environment", &WmiObject::new());
    assert!(matches!(outcome, Err(Error::Protocol { .. })));
}

#[test]
fn mismatched_relates_to_is_fatal() {
    let transport = Scripted::new([Canned::Response {
        status: 200,
        body: response_envelope("").replace("{{MESSAGE_ID}}", "uuid:someone-else"),
    }]);
    let client = transport.client();

    let outcome = client.delete("Win32_Environment", &SelectorSet::new());
    assert!(matches!(outcome, Err(Error::Protocol { .. })));
}

// ============================================================================
// Fault decoding through the client
// ============================================================================

#[test]
fn http_401_is_unauthorized() {
    let transport = Scripted::new([Canned::Response {
        status: 401,
        body: String::new(),
    }]);
    let client = transport.client();

    let outcome = client.get("Win32_Service", &service_selectors("Spooler"));
    match outcome {
        Err(Error::Unauthorized { netloc }) => assert_eq!(netloc, "windows-host:5985"),
        other => panic!("expected Unauthorized, got {other:?}"),
    }
}

#[test]
fn object_not_found_fault_is_typed() {
    let extended = format!(
        r#"<x:__ExtendedStatus xmlns:x="http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/__ExtendedStatus">
             <x:Operation>GetObject</x:Operation>
             <x:ParameterInfo>Win32_Service.Name="NoSuch"</x:ParameterInfo>
             <x:ProviderName>CIMWin32</x:ProviderName>
           </x:__ExtendedStatus>"#
    );
    let detail = format!(
        r#"<f:WSManFault xmlns:f="{NS_WSMANFAULT}" Code="2150858752">
             <f:Message>
               <f:ProviderFault>
                 <f:ExtendedError>{extended}</f:ExtendedError>
               </f:ProviderFault>
             </f:Message>
           </f:WSManFault>"#
    );
    let transport = Scripted::new([fault(None, "w:InternalError", "not found", &detail)]);
    let client = transport.client();

    let outcome = client.get("Win32_Service", &service_selectors("NoSuch"));
    match outcome {
        Err(Error::ObjectNotFound {
            operation,
            provider_name,
            ..
        }) => {
            assert_eq!(operation, "GetObject");
            assert_eq!(provider_name, "CIMWin32");
        }
        other => panic!("expected ObjectNotFound, got {other:?}"),
    }
}

#[test]
fn operation_timeout_fault_propagates_to_wmi_callers() {
    let transport = Scripted::new([fault(
        Some(0x8033_8029),
        "w:TimedOut",
        "The operation timed out",
        "",
    )]);
    let client = transport.client();

    let outcome = client.get("Win32_Service", &service_selectors("Spooler"));
    assert!(matches!(outcome, Err(Error::OperationTimeout)));
}

#[test]
fn invalid_selectors_fault_is_bad_selectors() {
    let transport = Scripted::new([fault(None, "w:InvalidSelectors", "bad key", "")]);
    let client = transport.client();

    let outcome = client.get("Win32_Service", &service_selectors("Spooler"));
    assert!(matches!(outcome, Err(Error::BadSelectors { .. })));
}

// ============================================================================
// Enumeration
// ============================================================================

fn service_item(name: &str) -> String {
    format!(
        r#"<w:Item>
             <p:Win32_Service xmlns:p="{SERVICE_URI}"><p:Name>{name}</p:Name></p:Win32_Service>
             <a:EndpointReference>
               <a:Address>http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address>
               <a:ReferenceParameters>
                 <w:ResourceURI>{SERVICE_URI}</w:ResourceURI>
                 <w:SelectorSet><w:Selector Name="Name">{name}</w:Selector></w:SelectorSet>
               </a:ReferenceParameters>
             </a:EndpointReference>
           </w:Item>"#
    )
}

#[test]
fn enumeration_spans_pulls_until_end_of_sequence() {
    let start = format!(
        r#"<n:EnumerateResponse>
             <n:EnumerationContext>CTX-1</n:EnumerationContext>
             <w:Items>{}{}</w:Items>
           </n:EnumerateResponse>"#,
        service_item("Alpha"),
        service_item("Beta"),
    );
    let middle = format!(
        r#"<n:PullResponse>
             <n:EnumerationContext>CTX-2</n:EnumerationContext>
             <n:Items>{}{}</n:Items>
           </n:PullResponse>"#,
        service_item("Gamma"),
        service_item("Delta"),
    );
    let last = format!(
        r#"<n:PullResponse>
             <n:Items>{}</n:Items>
             <n:EndOfSequence/>
           </n:PullResponse>"#,
        service_item("Epsilon"),
    );
    let transport = Scripted::new([ok(&start), ok(&middle), ok(&last)]);
    let client = transport.client();

    let pairs: Vec<_> = client
        .all("Win32_Service")
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let names: Vec<_> = pairs
        .iter()
        .map(|(_, object)| match object.get("Name").unwrap() {
            WmiValue::Str(name) => name.as_str(),
            other => panic!("unexpected Name value {other:?}"),
        })
        .collect();
    assert_eq!(names, ["Alpha", "Beta", "Gamma", "Delta", "Epsilon"]);

    // Every item carries its addressable reference.
    assert!(pairs[0].0.uri.eq_ignore_ascii_case(SERVICE_URI));
    assert_eq!(
        pairs[0].0.selectors,
        SelectorSet::from([("Name".to_owned(), SelectorValue::Str("Alpha".to_owned()))])
    );

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].contains("<w:EnumerationMode>EnumerateObjectAndEPR</w:EnumerationMode>"));
    assert!(requests[0].contains("enumeration/Enumerate</a:Action>"));
    assert!(requests[1].contains("<n:EnumerationContext>CTX-1</n:EnumerationContext>"));
    assert!(requests[1].contains("enumeration/Pull</a:Action>"));
    assert!(requests[2].contains("<n:EnumerationContext>CTX-2</n:EnumerationContext>"));
}

#[test]
fn empty_first_page_is_not_end_of_sequence() {
    let start = r#"<n:EnumerateResponse>
                     <n:EnumerationContext>CTX-1</n:EnumerationContext>
                   </n:EnumerateResponse>"#;
    let last = format!(
        r#"<n:PullResponse>
             <n:Items>{}</n:Items>
             <n:EndOfSequence/>
           </n:PullResponse>"#,
        service_item("Lonely"),
    );
    let transport = Scripted::new([ok(start), ok(&last)]);
    let client = transport.client();

    let pairs: Vec<_> = client
        .all("Win32_Service")
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(pairs.len(), 1);
    assert_eq!(transport.requests().len(), 2);
}

#[test]
fn wql_sends_the_query_dialect() {
    let transport = Scripted::new([ok(
        r#"<n:EnumerateResponse><w:EndOfSequence/></n:EnumerateResponse>"#,
    )]);
    let client = transport.client();

    let pairs: Vec<_> = client
        .wql("wmi/root/cimv2/*", "SELECT * FROM Win32_Process WHERE Handle=4")
        .unwrap()
        .collect();
    assert!(pairs.is_empty());

    let request = &transport.requests()[0];
    assert!(request
        .contains(r#"Dialect="http://schemas.microsoft.com/wbem/wsman/1/WQL""#));
    assert!(request.contains("SELECT * FROM Win32_Process WHERE Handle=4"));
}

#[test]
fn associated_filter_names_the_relationship_fields() {
    let transport = Scripted::new([ok(
        r#"<n:EnumerateResponse><w:EndOfSequence/></n:EnumerateResponse>"#,
    )]);
    let client = transport.client();

    let pairs: Vec<_> = client
        .associated(
            "Win32_DiskDrive",
            &SelectorSet::from([(
                "DeviceID".to_owned(),
                SelectorValue::Str("\\\\.\\PHYSICALDRIVE0".to_owned()),
            )]),
            Some("Win32_DiskDriveToDiskPartition"),
            None,
            None,
            None,
        )
        .unwrap()
        .collect();
    assert!(pairs.is_empty());

    let request = &transport.requests()[0];
    assert!(request.contains("cimbinding/associationFilter"));
    assert!(request.contains(
        "<b:AssociationClassName>Win32_DiskDriveToDiskPartition</b:AssociationClassName>"
    ));
    assert!(request.contains("<b:ResultClassName/>"));
    // Association filters enumerate against the whole namespace.
    assert!(request.contains("wmi/root/cimv2/*</w:ResourceURI>"));
}

// ============================================================================
// Method invocation
// ============================================================================

fn invoke_output(return_value: &str) -> String {
    format!(
        r#"<p:StartService_OUTPUT xmlns:p="{SERVICE_URI}">
             <p:ReturnValue>{return_value}</p:ReturnValue>
           </p:StartService_OUTPUT>"#
    )
}

#[test]
fn invoke_with_zero_return_value_succeeds() {
    let transport = Scripted::new([ok(&invoke_output("0"))]);
    let client = transport.client();

    let output = client
        .invoke(
            "Win32_Service",
            &service_selectors("Spooler"),
            "StartService",
            &WmiObject::new(),
            None,
        )
        .unwrap()
        .unwrap();
    assert_eq!(
        output.get("ReturnValue"),
        Some(&WmiValue::Str("0".to_owned()))
    );

    let request = &transport.requests()[0];
    assert!(request.contains(&format!("{SERVICE_URI}/StartService</a:Action>")));
    assert!(request.contains(&format!(r#"<p:StartService_INPUT xmlns:p="{SERVICE_URI}""#)));
}

#[test]
fn invoke_failure_reports_decimal_and_symbolic_codes() {
    let transport = Scripted::new([ok(&invoke_output("5"))]);
    let client = transport.client();

    let outcome = client.invoke(
        "Win32_Service",
        &service_selectors("Spooler"),
        "StartService",
        &WmiObject::new(),
        None,
    );
    match outcome {
        Err(error @ Error::InvokeFailed { return_value: 5, .. }) => {
            assert!(error.to_string().contains('5'));
        }
        other => panic!("expected InvokeFailed, got {other:?}"),
    }
}

#[test]
fn invoke_failure_decodes_known_wbem_codes() {
    let transport = Scripted::new([ok(&invoke_output("2147749896"))]);
    let client = transport.client();

    let outcome = client.invoke(
        "Win32_Service",
        &service_selectors("Spooler"),
        "ChangeStartMode",
        &WmiObject::from([("StartMode".to_owned(), WmiValue::Str("Automatic".to_owned()))]),
        None,
    );
    let message = outcome.unwrap_err().to_string();
    assert!(message.contains("0x80041008"));
    assert!(message.contains("WBEM_E_INVALID_PARAMETER"));
}

#[test]
fn invoke_without_output_is_a_valid_success() {
    let transport = Scripted::new([ok(&format!(
        r#"<p:Disable_OUTPUT xmlns:p="{SERVICE_URI}" xsi:nil="true"/>"#
    ))]);
    let client = transport.client();

    let output = client
        .invoke(
            "Win32_Service",
            &service_selectors("Spooler"),
            "Disable",
            &WmiObject::new(),
            None,
        )
        .unwrap();
    assert_eq!(output, None);
}

// ============================================================================
// Remote shell
// ============================================================================

fn shell_created() -> Canned {
    ok(r#"<rsp:Shell>
            <rsp:ShellId>SHELL-1</rsp:ShellId>
            <rsp:ClientIP>10.0.0.7</rsp:ClientIP>
          </rsp:Shell>"#)
}

fn command_started(command_id: &str) -> Canned {
    ok(&format!(
        r#"<rsp:CommandResponse><rsp:CommandId>{command_id}</rsp:CommandId></rsp:CommandResponse>"#
    ))
}

fn receive_running(stdout: &str) -> Canned {
    ok(&format!(
        r#"<rsp:ReceiveResponse>
             <rsp:Stream Name="stdout" CommandId="CMD-1">{}</rsp:Stream>
             <rsp:CommandState CommandId="CMD-1" State="{NS_SHELL}/CommandState/Running"/>
           </rsp:ReceiveResponse>"#,
        BASE64_STANDARD.encode(stdout),
    ))
}

fn receive_done(exit_code: i64, stderr: &str) -> Canned {
    let stderr_stream = if stderr.is_empty() {
        String::new()
    } else {
        format!(
            r#"<rsp:Stream Name="stderr" CommandId="CMD-1">{}</rsp:Stream>"#,
            BASE64_STANDARD.encode(stderr),
        )
    };
    ok(&format!(
        r#"<rsp:ReceiveResponse>
             {stderr_stream}
             <rsp:CommandState CommandId="CMD-1" State="{NS_SHELL}/CommandState/Done">
               <rsp:ExitCode>{exit_code}</rsp:ExitCode>
             </rsp:CommandState>
           </rsp:ReceiveResponse>"#
    ))
}

#[test]
fn shell_runs_a_command_to_completion() {
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        receive_running("123"),
        receive_running("456"),
        receive_done(0, "warning"),
        ok("<rsp:SignalResponse/>"),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    assert_eq!(shell.shell_id(), "SHELL-1");
    assert_eq!(shell.client_ip(), "10.0.0.7");

    let mut command = shell.run(&["echo", "123"]).unwrap();
    let output = command.wait_with_output(None).unwrap();
    assert_eq!(output.exit_code, 0);
    assert_eq!(output.stdout, b"123456");
    assert_eq!(output.stderr, b"warning");
    assert_eq!(command.returncode(), Some(0));

    // Once the exit code is frozen, further receives return empty output
    // without touching the wire.
    assert_eq!(command.receive(None).unwrap(), (Vec::new(), Vec::new()));

    command.signal(SignalKind::Terminate).unwrap();
    drop(command);
    shell.close().unwrap();

    let requests = transport.requests();
    assert_eq!(requests.len(), 7);
    assert!(requests[0].contains(r#"<w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>"#));
    assert!(requests[0].contains(r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option>"#));
    assert!(requests[1].contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
    assert!(requests[1].contains("<rsp:Command>\"echo 123\"</rsp:Command>"));
    assert!(requests[5].contains("shell/signal/terminate"));
    assert!(requests[6].contains("transfer/Delete</a:Action>"));
}

#[test]
fn receive_translates_operation_timeout_into_empty_chunks() {
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        fault(Some(0x8033_8029), "w:TimedOut", "no output yet", ""),
        receive_done(0, ""),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let mut command = shell.run(&["ping", "-n", "10", "127.0.0.1"]).unwrap();

    // The fault is not an error: a polling loop simply retries.
    assert_eq!(command.receive(Some(1.0)).unwrap(), (Vec::new(), Vec::new()));
    assert_eq!(command.returncode(), None);

    assert_eq!(command.wait(None).unwrap(), 0);
    drop(command);
    shell.close().unwrap();
}

#[test]
fn http_response_timeout_also_means_no_output_yet() {
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        Canned::Timeout,
        receive_done(0, ""),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let mut command = shell.run(&["more"]).unwrap();
    assert_eq!(command.receive(Some(1.0)).unwrap(), (Vec::new(), Vec::new()));
    assert_eq!(command.wait(None).unwrap(), 0);
    drop(command);
    shell.close().unwrap();
}

#[test]
fn running_command_with_exit_code_is_a_protocol_violation() {
    let broken = ok(&format!(
        r#"<rsp:ReceiveResponse>
             <rsp:CommandState CommandId="CMD-1" State="{NS_SHELL}/CommandState/Running">
               <rsp:ExitCode>0</rsp:ExitCode>
             </rsp:CommandState>
           </rsp:ReceiveResponse>"#
    ));
    let transport = Scripted::new([shell_created(), command_started("CMD-1"), broken, ok("")]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let mut command = shell.run(&["whoami"]).unwrap();
    assert!(matches!(
        command.receive(None),
        Err(Error::Protocol { .. })
    ));
    drop(command);
    shell.close().unwrap();
}

#[test]
fn stdin_chunks_are_base64_streams() {
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        ok("<rsp:SendResponse/>"),
        ok("<rsp:SendResponse/>"),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let command = shell.run(&["more"]).unwrap();
    assert_eq!(command.send(b"chunk 0\n", false).unwrap(), 8);
    command.send(b"", true).unwrap();
    drop(command);
    shell.close().unwrap();

    let requests = transport.requests();
    assert!(requests[2].contains(&format!(
        r#"<rsp:Stream Name="stdin" CommandId="CMD-1">{}</rsp:Stream>"#,
        BASE64_STANDARD.encode("chunk 0\n"),
    )));
    assert!(requests[3].contains(r#"End="true""#));
}

#[test]
fn shell_env_vars_and_working_directory_go_into_the_create_body() {
    let transport = Scripted::new([shell_created(), ok("")]);
    let client = transport.client();

    let options = ShellOptions {
        working_directory: Some("C:\\Temp".to_owned()),
        env_vars: vec![("FOO".to_owned(), "bar".to_owned())],
        codepage: 437,
        idle_timeout: None,
    };
    let mut shell = WinRmShell::open(&client, &options).unwrap();
    shell.close().unwrap();

    let request = &transport.requests()[0];
    assert!(request.contains("<rsp:WorkingDirectory>C:\\Temp</rsp:WorkingDirectory>"));
    assert!(request.contains(r#"<rsp:Variable Name="FOO">bar</rsp:Variable>"#));
    assert!(request.contains(r#"<w:Option Name="WINRS_CODEPAGE">437</w:Option>"#));
}

#[test]
fn wait_deadline_raises_wait_timeout() {
    let transport = Scripted::new([shell_created(), command_started("CMD-1"), ok("")]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let mut command = shell.run(&["ping", "-n", "10", "127.0.0.1"]).unwrap();
    let outcome = command.wait(Some(Duration::ZERO));
    assert!(matches!(outcome, Err(Error::WaitTimeout { .. })));
    drop(command);
    shell.close().unwrap();
}

// ============================================================================
// Script wrapper
// ============================================================================

#[test]
fn script_wrapper_decodes_a_success_outcome() {
    let stdout = r#"["success", [{"Total": 7}]]"#;
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        receive_done_with_stdout(stdout),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let params = ScriptParams::from([("Count".to_owned(), json!(7))]);
    let result =
        run_powershell_script(&shell, "@{ Total = $Count }", &params, None).unwrap();
    assert_eq!(result, json!({"Total": 7}));
    shell.close().unwrap();

    let command_request = &transport.requests()[1];
    assert!(command_request.contains("-EncodedCommand"));
    assert!(command_request.contains("-NoProfile -NonInteractive -ExecutionPolicy Unrestricted"));
}

#[test]
fn script_wrapper_raises_typed_errors_on_fail() {
    let stdout = r#"["fail", ["System.UnauthorizedAccessException", "PermissionDenied", "Access is denied"]]"#;
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        receive_done_with_stdout(stdout),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let outcome = run_powershell_script(&shell, "throw 'nope'", &ScriptParams::new(), None);
    match outcome {
        Err(Error::RemoteScript { category, .. }) => assert_eq!(category, "PermissionDenied"),
        other => panic!("expected RemoteScript, got {other:?}"),
    }
    shell.close().unwrap();
}

#[test]
fn interpreter_crash_surfaces_as_empty_stdout() {
    let transport = Scripted::new([
        shell_created(),
        command_started("CMD-1"),
        receive_done(1, "powershell.exe - Application Error"),
        ok(""),
    ]);
    let client = transport.client();

    let mut shell = WinRmShell::open(&client, &ShellOptions::default()).unwrap();
    let outcome = run_powershell_script(&shell, "1 + 1", &ScriptParams::new(), None);
    match outcome {
        Err(Error::EmptyStdout { exit_code, stderr }) => {
            assert_eq!(exit_code, Some(1));
            assert!(stderr.contains("Application Error"));
        }
        other => panic!("expected EmptyStdout, got {other:?}"),
    }
    shell.close().unwrap();
}

fn receive_done_with_stdout(stdout: &str) -> Canned {
    ok(&format!(
        r#"<rsp:ReceiveResponse>
             <rsp:Stream Name="stdout" CommandId="CMD-1">{}</rsp:Stream>
             <rsp:CommandState CommandId="CMD-1" State="{NS_SHELL}/CommandState/Done">
               <rsp:ExitCode>0</rsp:ExitCode>
             </rsp:CommandState>
           </rsp:ReceiveResponse>"#,
        BASE64_STANDARD.encode(stdout),
    ))
}
