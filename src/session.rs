//! The IMAP proxy session engine (4.F in the design doc) — the core of the
//! crate. Grounded directly on
//! `examples/original_source/oauth2imap/imap.py` (`parse_client_command`,
//! `parse_server_command`, `Context`, `Downstream`, `Upstream`, `session`),
//! re-expressed as a small `Transport` capability per spec.md §9's Design
//! Note, instead of the teacher's typed `imap` crate — that crate cannot
//! pass arbitrary client bytes through untouched, which the relay phase's
//! byte-transparency invariant requires.

use std::io::{self, BufRead, BufReader, Read, Stdin, Stdout, Write};
use std::net::TcpStream;
use std::path::Path;

use anyhow::{Context as _, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use log::debug;
use native_tls::{TlsConnector, TlsStream};

use crate::downstream_auth;
use crate::oauth_client;
use crate::provider::Provider;
use crate::sasl::{self, SaslMethod};

/// Two socket-shaped endpoints an IMAP session talks over: a downstream
/// client (TCP or stdio) and the upstream TLS connection. Both need only
/// `read_line`/`write_bytes`, per spec.md §9's "small capability set" note.
pub trait Transport {
    /// Reads one CRLF-terminated line, trailing terminator included.
    /// `Ok(None)` signals a clean EOF.
    fn read_line(&mut self) -> Result<Option<Vec<u8>>>;
    fn write_bytes(&mut self, data: &[u8]) -> Result<()>;
}

/// A transport backed by a single bidirectional stream (`TcpStream` or a
/// TLS-wrapped one). Reads go through a `BufReader`; writes borrow the
/// same underlying stream via `get_mut`, so there is exactly one owner.
pub struct StreamTransport<S> {
    label: String,
    reader: BufReader<S>,
}

impl<S: Read + Write> StreamTransport<S> {
    pub fn new(label: impl Into<String>, stream: S) -> Self {
        Self {
            label: label.into(),
            reader: BufReader::new(stream),
        }
    }
}

impl<S: Read + Write> Transport for StreamTransport<S> {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("reading from {}", self.label))?;
        if n == 0 {
            return Ok(None);
        }
        debug!("--> {}: {:?}", self.label, String::from_utf8_lossy(&buf));
        Ok(Some(buf))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        debug!("<-- {}: {:?}", self.label, String::from_utf8_lossy(data));
        let stream = self.reader.get_mut();
        stream
            .write_all(data)
            .with_context(|| format!("writing to {}", self.label))?;
        stream
            .flush()
            .with_context(|| format!("flushing {}", self.label))
    }
}

pub type TcpTransport = StreamTransport<TcpStream>;
pub type UpstreamTransport = StreamTransport<TlsStream<TcpStream>>;

/// The stdio-pair transport used by the tunnel front-end — `stdin` and
/// `stdout` are distinct handles, so unlike `StreamTransport` this keeps
/// them separate rather than sharing one stream object.
pub struct StdioTransport {
    reader: BufReader<Stdin>,
    writer: Stdout,
}

impl StdioTransport {
    pub fn new() -> Self {
        Self {
            reader: BufReader::new(io::stdin()),
            writer: io::stdout(),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for StdioTransport {
    fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
        let mut buf = Vec::new();
        let n = self
            .reader
            .read_until(b'\n', &mut buf)
            .context("reading from pipe")?;
        if n == 0 {
            return Ok(None);
        }
        debug!("--> pipe: {:?}", String::from_utf8_lossy(&buf));
        Ok(Some(buf))
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
        debug!("<-- pipe: {:?}", String::from_utf8_lossy(data));
        self.writer.write_all(data).context("writing to pipe")?;
        self.writer.flush().context("flushing pipe")
    }
}

/// Per-connection state (3. DATA MODEL's `SessionContext`).
pub struct SessionContext {
    pub tag: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub authorized: bool,
}

impl SessionContext {
    pub fn new(username: Option<String>, password: Option<String>) -> Self {
        Self {
            tag: String::new(),
            username,
            password,
            authorized: false,
        }
    }

    fn downstream_credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u, p)),
            _ => None,
        }
    }
}

/// Splits a client command line into `(tag, COMMAND, args)`, upper-casing
/// the command. A line with no space at all is treated as a bare tag with
/// an empty command rather than panicking (the original `imap.py` assumes
/// well-formed input and would raise `ValueError`).
pub fn parse_client_command(line: &str) -> (String, String, String) {
    let line = line.trim_end_matches(['\r', '\n']);
    match line.split_once(' ') {
        Some((tag, rest)) => {
            let rest = rest.trim_start();
            match rest.split_once(' ') {
                Some((cmd, args)) => (tag.to_string(), cmd.to_uppercase(), args.to_string()),
                None => (tag.to_string(), rest.to_uppercase(), String::new()),
            }
        }
        None => (line.to_string(), String::new(), String::new()),
    }
}

/// Classification of an upstream response line, per spec.md §4.F.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerLine {
    UntaggedStatus(String),
    Continuation,
    Tagged { tag: String, status: String },
    Data,
}

pub fn classify_server_line(line: &str) -> ServerLine {
    let line = line.trim_end_matches(['\r', '\n']);

    if line.starts_with('+') {
        return ServerLine::Continuation;
    }

    let mut parts = line.splitn(3, ' ');
    let first = parts.next().unwrap_or("");
    let second = parts.next().unwrap_or("");

    if first == "*" && matches!(second, "OK" | "NO" | "BAD" | "PREAUTH" | "BYE") {
        return ServerLine::UntaggedStatus(second.to_string());
    }

    if !first.is_empty() && matches!(second, "OK" | "NO" | "BAD") {
        return ServerLine::Tagged {
            tag: first.to_string(),
            status: second.to_string(),
        };
    }

    ServerLine::Data
}

/// Result of the upstream TLS + SASL bind: a ready transport plus the
/// capability list collected along the way (needed for the downstream
/// pre-auth `CAPABILITY` response).
pub struct UpstreamHandle {
    pub transport: UpstreamTransport,
    pub capabilities: Vec<String>,
}

/// Opens a TLS connection to `provider.imap-endpoint:993`, fetches its
/// capability list, and runs the SASL `AUTHENTICATE` exchange with the
/// bearer token. Any failure here means the caller must abort the session
/// without greeting the downstream client (spec.md §4.F item 1).
pub fn bind_upstream(provider: &Provider, access_token: &str) -> Result<UpstreamHandle> {
    let host = provider.require("imap-endpoint")?;
    let tcp = TcpStream::connect((host, 993))
        .with_context(|| format!("connecting to upstream {host}:993"))?;

    let connector = TlsConnector::new().context("building TLS connector")?;
    let tls = connector
        .connect(host, tcp)
        .with_context(|| format!("TLS handshake with {host}"))?;

    let mut transport = StreamTransport::new(format!("upstream:{host}"), tls);

    transport
        .read_line()?
        .context("upstream closed before sending its greeting")?;

    transport.write_bytes(b"X0 CAPABILITY\r\n")?;
    let mut capabilities = Vec::new();
    loop {
        let line = transport
            .read_line()?
            .context("upstream closed during CAPABILITY")?;
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);

        if let Some(rest) = trimmed.strip_prefix("* CAPABILITY ") {
            capabilities = rest.split_whitespace().map(String::from).collect();
            continue;
        }

        if let ServerLine::Tagged { tag, status } = classify_server_line(trimmed) {
            if tag == "X0" {
                if status != "OK" {
                    bail!("upstream rejected CAPABILITY: {trimmed}");
                }
                break;
            }
        }
    }

    let method = SaslMethod::parse(provider.require("sasl-method")?)?;
    let user = provider.require("username")?;
    let initial_response = sasl::build_initial_response(method, user, host, access_token);

    transport.write_bytes(format!("X1 AUTHENTICATE {}\r\n", method.name()).as_bytes())?;

    let continuation = transport
        .read_line()?
        .context("upstream closed before requesting SASL continuation")?;
    if !continuation.starts_with(b"+") {
        bail!(
            "upstream did not issue a SASL continuation request: {:?}",
            String::from_utf8_lossy(&continuation)
        );
    }

    let encoded = STANDARD.encode(&initial_response);
    transport.write_bytes(format!("{encoded}\r\n").as_bytes())?;

    loop {
        let line = transport
            .read_line()?
            .context("upstream closed during AUTHENTICATE")?;
        let text = String::from_utf8_lossy(&line);
        let trimmed = text.trim_end_matches(['\r', '\n']);

        match classify_server_line(trimmed) {
            ServerLine::Tagged { tag, status } if tag == "X1" => {
                if status != "OK" {
                    bail!("upstream authenticate failed: {trimmed}");
                }
                break;
            }
            _ => continue,
        }
    }

    Ok(UpstreamHandle {
        transport,
        capabilities,
    })
}

/// Resolves a valid bearer token, binds upstream, and runs the full
/// downstream session. The downstream greeting is only emitted once the
/// upstream SASL exchange has already succeeded.
pub fn run<D: Transport>(
    mut downstream: D,
    provider: &Provider,
    tokens_file: &Path,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let access_token = oauth_client::obtain_access_token(provider, tokens_file)
        .context("obtaining upstream access token")?;

    let handle = bind_upstream(provider, &access_token).context("authenticating to upstream")?;

    let mut ctx = SessionContext::new(username, password);
    run_session(&mut downstream, handle.transport, &handle.capabilities, &mut ctx)
}

/// The relay state machine: `GREETING -> UNAUTH -> AUTH -> RELAY <-> RELAY
/// -> CLOSED` from spec.md §4.F.
fn run_session<D: Transport>(
    downstream: &mut D,
    mut upstream: UpstreamTransport,
    upstream_capabilities: &[String],
    ctx: &mut SessionContext,
) -> Result<()> {
    downstream.write_bytes(b"* OK IMAP4rev1 Service Ready\r\n")?;

    loop {
        let Some(raw_line) = downstream.read_line()? else {
            break;
        };

        let text = String::from_utf8_lossy(&raw_line);
        let trimmed = text.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            continue;
        }

        let (tag, cmd, args) = parse_client_command(trimmed);
        ctx.tag = tag;

        let is_logout = cmd == "LOGOUT";

        if !ctx.authorized {
            match cmd.as_str() {
                "CAPABILITY" => {
                    send_capability(downstream, ctx, upstream_capabilities)?;
                    continue;
                }
                "AUTHENTICATE" => {
                    ctx.authorized = handle_authenticate(downstream, ctx, &args)?;
                    continue;
                }
                "LOGIN" => {
                    ctx.authorized = handle_login(downstream, ctx, &args)?;
                    continue;
                }
                // Any other pre-auth command is forwarded upstream as-is —
                // spec.md §9 flags this as surprising (upstream has already
                // authenticated on the client's behalf) but preserves it.
                _ => {}
            }
        }

        upstream.write_bytes(&raw_line)?;

        loop {
            let Some(resp) = upstream.read_line()? else {
                bail!("upstream closed mid-command");
            };
            downstream.write_bytes(&resp)?;

            let resp_text = String::from_utf8_lossy(&resp);
            let resp_trimmed = resp_text.trim_end_matches(['\r', '\n']);
            if let ServerLine::Tagged { tag, status } = classify_server_line(resp_trimmed) {
                if tag == ctx.tag && matches!(status.as_str(), "OK" | "NO" | "BAD") {
                    break;
                }
            }
        }

        if is_logout {
            break;
        }
    }

    Ok(())
}

fn send_capability<D: Transport>(
    downstream: &mut D,
    ctx: &SessionContext,
    upstream_capabilities: &[String],
) -> Result<()> {
    let mut parts = vec!["*".to_string(), "CAPABILITY".to_string(), "IMAP4rev1".to_string()];

    if ctx.downstream_credentials().is_some() {
        parts.push("AUTH=CRAM-MD5".to_string());
        parts.push("AUTH=PLAIN".to_string());
    }

    for cap in upstream_capabilities {
        if !cap.starts_with("AUTH=") && !cap.eq_ignore_ascii_case("IMAP4rev1") {
            parts.push(cap.clone());
        }
    }

    downstream.write_bytes(format!("{}\r\n", parts.join(" ")).as_bytes())?;
    downstream.write_bytes(format!("{} OK CAPABILITY completed\r\n", ctx.tag).as_bytes())
}

fn handle_authenticate<D: Transport>(
    downstream: &mut D,
    ctx: &SessionContext,
    arg: &str,
) -> Result<bool> {
    if !arg.eq_ignore_ascii_case("CRAM-MD5") {
        downstream
            .write_bytes(format!("{} NO unsupported authentication mechanism\r\n", ctx.tag).as_bytes())?;
        return Ok(false);
    }

    let Some((user, password)) = ctx.downstream_credentials() else {
        downstream.write_bytes(format!("{} NO authenticate failure\r\n", ctx.tag).as_bytes())?;
        return Ok(false);
    };

    let challenge = downstream_auth::new_cram_challenge();
    downstream.write_bytes(format!("+ {}\r\n", challenge.base64).as_bytes())?;

    let Some(response_line) = downstream.read_line()? else {
        bail!("client closed during CRAM-MD5 challenge-response");
    };
    let response_text = String::from_utf8_lossy(&response_line);
    let response_trimmed = response_text.trim_end_matches(['\r', '\n']);

    let (ok, msg) = downstream_auth::verify_cram_md5(&challenge, user, password, response_trimmed);
    if ok {
        downstream.write_bytes(format!("{} OK CRAM-MD5 authentication successful\r\n", ctx.tag).as_bytes())?;
    } else {
        downstream.write_bytes(format!("{} NO {}\r\n", ctx.tag, msg).as_bytes())?;
    }
    Ok(ok)
}

fn handle_login<D: Transport>(downstream: &mut D, ctx: &SessionContext, args: &str) -> Result<bool> {
    let Some((user, password)) = ctx.downstream_credentials() else {
        downstream.write_bytes(format!("{} NO authenticate failure\r\n", ctx.tag).as_bytes())?;
        return Ok(false);
    };

    let (ok, msg) = downstream_auth::verify_plain(user, password, args);
    if ok {
        downstream.write_bytes(format!("{} OK LOGIN authentication successful\r\n", ctx.tag).as_bytes())?;
    } else {
        downstream.write_bytes(format!("{} NO {}\r\n", ctx.tag, msg).as_bytes())?;
    }
    Ok(ok)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tagged_command_with_args() {
        let (tag, cmd, args) = parse_client_command("A001 LIST \"\" \"*\"\r\n");
        assert_eq!(tag, "A001");
        assert_eq!(cmd, "LIST");
        assert_eq!(args, "\"\" \"*\"");
    }

    #[test]
    fn parses_tagged_command_without_args() {
        let (tag, cmd, args) = parse_client_command("A002 LOGOUT\r\n");
        assert_eq!(tag, "A002");
        assert_eq!(cmd, "LOGOUT");
        assert_eq!(args, "");
    }

    #[test]
    fn command_is_uppercased() {
        let (_, cmd, _) = parse_client_command("a003 capability");
        assert_eq!(cmd, "CAPABILITY");
    }

    #[test]
    fn untagged_status_is_classified() {
        assert_eq!(
            classify_server_line("* OK IMAP4rev1 Service Ready"),
            ServerLine::UntaggedStatus("OK".to_string())
        );
        assert_eq!(
            classify_server_line("* BYE logging out"),
            ServerLine::UntaggedStatus("BYE".to_string())
        );
    }

    #[test]
    fn continuation_is_classified() {
        assert_eq!(classify_server_line("+ "), ServerLine::Continuation);
    }

    #[test]
    fn tagged_status_is_classified() {
        assert_eq!(
            classify_server_line("A010 OK LIST completed"),
            ServerLine::Tagged {
                tag: "A010".to_string(),
                status: "OK".to_string(),
            }
        );
    }

    #[test]
    fn untagged_server_data_is_classified_as_data() {
        assert_eq!(
            classify_server_line("* LIST () \"/\" INBOX"),
            ServerLine::Data
        );
    }

    struct ScriptedTransport {
        inbound: Vec<Vec<u8>>,
        outbound: Vec<Vec<u8>>,
    }

    impl ScriptedTransport {
        fn new(inbound: Vec<&str>) -> Self {
            Self {
                inbound: inbound
                    .into_iter()
                    .rev()
                    .map(|s| s.as_bytes().to_vec())
                    .collect(),
                outbound: Vec::new(),
            }
        }
    }

    impl Transport for ScriptedTransport {
        fn read_line(&mut self) -> Result<Option<Vec<u8>>> {
            Ok(self.inbound.pop())
        }

        fn write_bytes(&mut self, data: &[u8]) -> Result<()> {
            self.outbound.push(data.to_vec());
            Ok(())
        }
    }

    #[test]
    fn capability_pre_auth_lists_cram_and_plain_when_credentials_configured() {
        let mut ds = ScriptedTransport::new(vec![]);
        let mut ctx = SessionContext::new(Some("alice".into()), Some("s3cret".into()));
        ctx.tag = "A001".to_string();

        let caps = vec!["IMAP4rev1".to_string(), "AUTH=XOAUTH2".to_string(), "IDLE".to_string()];
        send_capability(&mut ds, &ctx, &caps).unwrap();

        assert_eq!(
            ds.outbound[0],
            b"* CAPABILITY IMAP4rev1 AUTH=CRAM-MD5 AUTH=PLAIN IDLE\r\n".to_vec()
        );
        assert_eq!(ds.outbound[1], b"A001 OK CAPABILITY completed\r\n".to_vec());
    }

    #[test]
    fn login_success_authorizes_session() {
        let mut ds = ScriptedTransport::new(vec![]);
        let mut ctx = SessionContext::new(Some("alice".into()), Some("s3cret".into()));
        ctx.tag = "A002".to_string();

        let ok = handle_login(&mut ds, &ctx, "alice s3cret").unwrap();
        assert!(ok);
        assert_eq!(
            ds.outbound[0],
            b"A002 OK LOGIN authentication successful\r\n".to_vec()
        );
    }

    #[test]
    fn login_failure_keeps_session_unauthorized() {
        let mut ds = ScriptedTransport::new(vec![]);
        let mut ctx = SessionContext::new(Some("alice".into()), Some("s3cret".into()));
        ctx.tag = "A003".to_string();

        let ok = handle_login(&mut ds, &ctx, "alice wrong").unwrap();
        assert!(!ok);
        assert_eq!(ds.outbound[0], b"A003 NO authenticate failure\r\n".to_vec());
    }
}
