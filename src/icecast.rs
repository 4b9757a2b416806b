//! Icecast connection handling.
//!
//! [`IcecastClient`] is a small source client for Icecast/SHOUTcast-family
//! servers: it opens the mountpoint with a `SOURCE` request over a plain
//! TCP connection, then streams the bitstream bytes in non-blocking mode
//! through an internal send queue. [`IcecastSink`] is the pipeline-facing
//! wrapper that pulls from a stream handle and pushes into the client.
//!
//! TLS is not compiled into this build: the permissive modes
//! ([`TlsMode::Disabled`], [`TlsMode::Auto`]) are accepted and everything
//! that *requires* TLS fails with [`Error::NoSys`].

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::stream::StreamHandle;
use crate::Error;

/// Bytes pulled from the pipeline per [`IcecastSink::iter`] call.
const SEND_CHUNK: usize = 1024;

/// Upper bound on unsent bytes queued while the socket is congested.
const MAX_PENDING: usize = 1 << 20;

/// Timeout for the server's response to the `SOURCE` request.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TLS policy for the server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain TCP only.
    #[default]
    Disabled,
    /// Use TLS if the server offers it, plain otherwise.
    Auto,
    /// Like [`TlsMode::Auto`] but refuse plain connections.
    AutoNoPlain,
    /// TLS as in RFC 2818 (dedicated port).
    Rfc2818,
    /// TLS via HTTP upgrade as in RFC 2817.
    Rfc2817,
}

impl TlsMode {
    fn requires_tls(self) -> bool {
        !matches!(self, TlsMode::Disabled | TlsMode::Auto)
    }
}

/// Connection parameters for the streaming server.
#[derive(Debug, Clone)]
pub struct IcecastConfig {
    /// Server host name or address.
    pub hostname: String,
    /// Server port.
    pub port: u16,
    /// TLS policy.
    pub tls_mode: TlsMode,
    /// Directory with trusted CA certificates.
    pub ca_directory: Option<String>,
    /// File with trusted CA certificates.
    pub ca_file: Option<String>,
    /// Client certificate for mutual TLS.
    pub client_certificate: Option<String>,
    /// Mountpoint to stream to, including the leading slash.
    pub mount: String,
    /// Source user name; `source` when absent.
    pub username: Option<String>,
    /// Source password.
    pub password: String,
    /// Client software name, for the User-Agent header.
    pub software_name: Option<String>,
    /// Client software version.
    pub software_version: Option<String>,
    /// Free-form comment appended to the User-Agent.
    pub software_comment: Option<String>,
}

impl Default for IcecastConfig {
    fn default() -> Self {
        IcecastConfig {
            hostname: "localhost".to_string(),
            port: 8000,
            tls_mode: TlsMode::Disabled,
            ca_directory: None,
            ca_file: None,
            client_certificate: None,
            mount: "/stream.ogg".to_string(),
            username: None,
            password: String::new(),
            software_name: None,
            software_version: None,
            software_comment: None,
        }
    }
}

impl IcecastConfig {
    /// Composes the User-Agent, dropping absent fields gracefully. The
    /// library identifies itself after the client software.
    fn user_agent(&self) -> String {
        let lib = concat!("oggcast/", env!("CARGO_PKG_VERSION"));

        match (
            &self.software_name,
            &self.software_version,
            &self.software_comment,
        ) {
            (Some(name), Some(version), Some(comment)) => {
                format!("{name}/{version} ({comment}) {lib}")
            }
            (Some(name), Some(version), None) => format!("{name}/{version} {lib}"),
            (Some(name), None, _) => format!("{name} {lib}"),
            _ => lib.to_string(),
        }
    }
}

/// A non-blocking source-client connection.
pub struct IcecastClient {
    config: IcecastConfig,
    socket: Option<TcpStream>,
    pending: VecDeque<u8>,
}

impl IcecastClient {
    /// Creates an unconfigured, unconnected client.
    pub fn new() -> Self {
        IcecastClient {
            config: IcecastConfig::default(),
            socket: None,
            pending: VecDeque::new(),
        }
    }

    /// Copies the connection parameters. Fails with [`Error::NoSys`] when
    /// the configuration needs TLS features this build does not have, and
    /// with [`Error::Connected`] while a connection is open.
    pub fn set_config(&mut self, config: &IcecastConfig) -> Result<(), Error> {
        if self.socket.is_some() {
            return Err(Error::Connected);
        }

        if config.tls_mode.requires_tls()
            || config.ca_directory.is_some()
            || config.ca_file.is_some()
            || config.client_certificate.is_some()
        {
            tracing::error!("TLS options requested but TLS is not compiled in");
            return Err(Error::NoSys);
        }

        self.config = config.clone();
        Ok(())
    }

    /// True while the connection is open.
    pub fn connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Opens the connection and negotiates the mountpoint.
    ///
    /// The TCP connect and the handshake are blocking; once the mount is
    /// accepted the socket switches to non-blocking mode for streaming.
    pub fn connect(&mut self) -> Result<(), Error> {
        if self.socket.is_some() {
            return Err(Error::Connected);
        }

        let address = (self.config.hostname.as_str(), self.config.port);
        tracing::info!(
            host = %self.config.hostname,
            port = self.config.port,
            mount = %self.config.mount,
            "connecting to streaming server"
        );

        let mut socket = TcpStream::connect(address).map_err(|err| {
            tracing::error!(%err, "connect failed");
            Error::from(err)
        })?;

        let user = self.config.username.as_deref().unwrap_or("source");
        let credentials = BASE64.encode(format!("{user}:{}", self.config.password));

        let request = format!(
            "SOURCE {} HTTP/1.0\r\n\
             Authorization: Basic {credentials}\r\n\
             User-Agent: {}\r\n\
             Content-Type: application/ogg\r\n\
             \r\n",
            self.config.mount,
            self.config.user_agent(),
        );

        socket.write_all(request.as_bytes()).map_err(Error::from)?;

        socket
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(Error::from)?;
        let status = read_status_line(&mut socket)?;

        if !status_accepted(&status) {
            tracing::error!(status = %status.trim_end(), "server rejected the mount");
            return Err(if status.contains("401") {
                Error::Perm
            } else {
                Error::ConnRefused
            });
        }

        socket.set_read_timeout(None).map_err(Error::from)?;
        socket.set_nonblocking(true).map_err(Error::from)?;

        self.pending.clear();
        self.socket = Some(socket);
        tracing::info!("mount accepted, streaming");
        Ok(())
    }

    /// Queues `data` and flushes as much of the queue as the socket
    /// accepts right now.
    pub fn send(&mut self, data: &[u8]) -> Result<(), Error> {
        if self.socket.is_none() {
            return Err(Error::Unconnected);
        }
        if self.pending.len() + data.len() > MAX_PENDING {
            tracing::error!(pending = self.pending.len(), "send queue overflow");
            return Err(Error::Busy);
        }

        self.pending.extend(data);
        self.flush_pending()
    }

    /// Retries whatever is still queued.
    pub fn sync(&mut self) -> Result<(), Error> {
        if self.socket.is_none() {
            return Err(Error::Unconnected);
        }
        self.flush_pending()
    }

    /// Bytes queued but not yet accepted by the socket.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn flush_pending(&mut self) -> Result<(), Error> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(Error::Unconnected);
        };

        while !self.pending.is_empty() {
            let (chunk, _) = self.pending.as_slices();
            match socket.write(chunk) {
                Ok(0) => return Err(Error::Unconnected),
                Ok(n) => {
                    self.pending.drain(..n);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    tracing::error!(%err, "send failed");
                    return Err(Error::from(err));
                }
            }
        }

        Ok(())
    }

    /// Closes the connection. Queued but unsent bytes are discarded.
    pub fn close(&mut self) {
        if self.socket.take().is_some() {
            tracing::info!("connection closed");
        }
        self.pending.clear();
    }
}

impl Default for IcecastClient {
    fn default() -> Self {
        IcecastClient::new()
    }
}

fn read_status_line(socket: &mut TcpStream) -> Result<String, Error> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        match socket.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                line.push(byte[0]);
                if line.len() > 512 {
                    return Err(Error::Generic);
                }
            }
            Err(err) => return Err(Error::from(err)),
        }
    }

    Ok(String::from_utf8_lossy(&line).into_owned())
}

fn status_accepted(status: &str) -> bool {
    // "HTTP/1.0 200 OK" from Icecast, "ICY 200 OK" from legacy servers.
    let mut parts = status.split_whitespace();
    matches!((parts.next(), parts.next()), (Some(_), Some("200")))
}

struct SinkCore {
    client: IcecastClient,
    input: Option<StreamHandle>,
    need_next_segment: bool,
}

/// The pipeline-facing network sink.
///
/// Clones share the same connection; the session worker holds one while
/// the session object holds another.
#[derive(Clone)]
pub struct IcecastSink {
    core: Arc<Mutex<SinkCore>>,
}

impl IcecastSink {
    /// Creates a sink with no configuration and no input.
    pub fn new() -> Self {
        IcecastSink {
            core: Arc::new(Mutex::new(SinkCore {
                client: IcecastClient::new(),
                input: None,
                need_next_segment: false,
            })),
        }
    }

    /// See [`IcecastClient::set_config`].
    pub fn set_config(&self, config: &IcecastConfig) -> Result<(), Error> {
        self.core.lock().unwrap().client.set_config(config)
    }

    /// Attaches (or with `None`, detaches) the bitstream input.
    pub fn attach(&self, input: Option<StreamHandle>) {
        self.core.lock().unwrap().input = input;
    }

    /// Opens the server connection. Already being connected is not an
    /// error.
    pub fn start(&self) -> Result<(), Error> {
        let mut core = self.core.lock().unwrap();
        if core.client.connected() {
            return Ok(());
        }
        core.client.connect()
    }

    /// Closes the server connection.
    pub fn stop(&self) {
        self.core.lock().unwrap().client.close();
    }

    /// Moves one chunk from the pipeline to the server and returns how
    /// many bytes were pulled from the input.
    ///
    /// While the socket is congested no new input is pulled, so the
    /// pipeline is paced by what the server actually accepts. Errors
    /// reflect the network side; an input that has nothing to give only
    /// raises the [`IcecastSink::need_next_segment`] flag.
    pub fn iter(&self) -> Result<usize, Error> {
        let mut core = self.core.lock().unwrap();
        let core = &mut *core;

        if !core.client.connected() {
            return Err(Error::Unconnected);
        }

        if core.client.pending() >= SEND_CHUNK {
            core.client.sync()?;
            return Ok(0);
        }

        let mut buf = [0u8; SEND_CHUNK];
        let got = match core.input.as_mut() {
            Some(input) => match input.read(&mut buf) {
                Ok(n) => n,
                Err(err) => {
                    tracing::debug!(%err, "input read failed, waiting for next segment");
                    0
                }
            },
            None => 0,
        };

        if got > 0 {
            core.need_next_segment = false;
            core.client.send(&buf[..got])?;
        } else {
            core.need_next_segment = true;
        }

        core.client.sync()?;
        Ok(got)
    }

    /// True when the most recent [`IcecastSink::iter`] got nothing from
    /// its input and the segment should be swapped.
    pub fn need_next_segment(&self) -> bool {
        self.core.lock().unwrap().need_next_segment
    }
}

impl Default for IcecastSink {
    fn default() -> Self {
        IcecastSink::new()
    }
}
