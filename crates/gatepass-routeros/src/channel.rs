//! The device control channel.
//!
//! One authenticated API connection per channel. Channels are opened
//! for a single operation sequence and closed (or dropped) when it
//! ends; they are never pooled or shared. Transport-class failures
//! inside [`Channel::execute`] close and reopen the connection a
//! bounded number of times with linear backoff, then give up with the
//! last error.

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;

use crate::command::Command;
use crate::error::Error;
use crate::proto::{self, Reply, ReplyKind};
use crate::rows::Row;

/// Default API port (plaintext).
pub const API_PORT: u16 = 8728;
/// TLS API port. Connecting here switches the channel to TLS.
pub const API_TLS_PORT: u16 = 8729;

// ── Endpoint ─────────────────────────────────────────────────────────

/// Where and how to reach one appliance.
#[derive(Debug, Clone)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: SecretString,
}

impl DeviceEndpoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        secret: SecretString,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            secret,
        }
    }

    /// TLS is a property of the port, never separate configuration.
    pub fn uses_tls(&self) -> bool {
        self.port == API_TLS_PORT
    }

    /// All four connection parameters must be present before any I/O.
    fn validate(&self) -> Result<(), Error> {
        if self.host.trim().is_empty() {
            return Err(Error::MissingField { field: "host" });
        }
        if self.port == 0 {
            return Err(Error::MissingField { field: "port" });
        }
        if self.username.trim().is_empty() {
            return Err(Error::MissingField { field: "username" });
        }
        if self.secret.expose_secret().is_empty() {
            return Err(Error::MissingField { field: "secret" });
        }
        Ok(())
    }
}

// ── Tuning ───────────────────────────────────────────────────────────

/// Channel tuning. Defaults match production behavior; tests shrink
/// the delays.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Budget for TCP connect, TLS handshake, and login, each.
    pub connect_timeout: Duration,
    /// Close-and-reopen attempts after a transport-class failure.
    pub reconnect_attempts: u32,
    /// Backoff grows linearly: `attempt x backoff_base`.
    pub backoff_base: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl ChannelConfig {
    pub fn with_connect_timeout(timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            ..Self::default()
        }
    }
}

// ── Transport ────────────────────────────────────────────────────────

#[derive(Debug)]
enum Transport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Transport {
    async fn write_sentence(&mut self, words: &[String]) -> Result<(), Error> {
        match self {
            Self::Plain(s) => proto::write_sentence(s, words).await,
            Self::Tls(s) => proto::write_sentence(s, words).await,
        }
    }

    async fn read_sentence(&mut self) -> Result<Vec<String>, Error> {
        match self {
            Self::Plain(s) => proto::read_sentence(s).await,
            Self::Tls(s) => proto::read_sentence(s).await,
        }
    }

    async fn shutdown(&mut self) -> Result<(), Error> {
        match self {
            Self::Plain(s) => s.shutdown().await?,
            Self::Tls(s) => s.shutdown().await?,
        }
        Ok(())
    }
}

// ── Channel ──────────────────────────────────────────────────────────

/// One authenticated control connection to an appliance.
#[derive(Debug)]
pub struct Channel {
    endpoint: DeviceEndpoint,
    config: ChannelConfig,
    transport: Option<Transport>,
}

impl Channel {
    /// Validate the endpoint, connect under the timeout, and log in.
    ///
    /// A wedged TCP connect is abandoned by the timeout wrapper; the
    /// caller gets [`Error::ConnectTimeout`] while the dropped future
    /// tears down the half-open socket.
    pub async fn open(endpoint: DeviceEndpoint, config: ChannelConfig) -> Result<Self, Error> {
        endpoint.validate()?;
        let mut channel = Self {
            endpoint,
            config,
            transport: None,
        };
        channel.connect().await?;
        Ok(channel)
    }

    /// Open with default tuning.
    pub async fn open_default(endpoint: DeviceEndpoint) -> Result<Self, Error> {
        Self::open(endpoint, ChannelConfig::default()).await
    }

    pub fn endpoint(&self) -> &DeviceEndpoint {
        &self.endpoint
    }

    /// Send one command and collect its `!re` rows.
    ///
    /// Transport-class failures (I/O, timeout, trap, fatal) close the
    /// connection and retry through a fresh one, up to
    /// `reconnect_attempts` times with linear backoff. Other errors
    /// propagate immediately.
    pub async fn execute(&mut self, command: &Command) -> Result<Vec<Row>, Error> {
        let mut last_err = match self.execute_once(command).await {
            Ok(rows) => return Ok(rows),
            Err(err) if err.is_transport_class() => err,
            Err(err) => return Err(err),
        };

        for attempt in 1..=self.config.reconnect_attempts {
            let delay = self.config.backoff_base * attempt;
            tracing::warn!(
                path = command.path(),
                attempt,
                error = %last_err,
                delay_ms = delay.as_millis() as u64,
                "transport failure, reopening channel"
            );
            tokio::time::sleep(delay).await;
            self.close().await;
            if let Err(err) = self.connect().await {
                last_err = err;
                continue;
            }
            match self.execute_once(command).await {
                Ok(rows) => return Ok(rows),
                Err(err) if err.is_transport_class() => last_err = err,
                Err(err) => return Err(err),
            }
        }
        Err(last_err)
    }

    /// Cheap read-only probe: the session is usable iff this succeeds.
    pub async fn is_alive(&mut self) -> bool {
        self.execute_once(&Command::new("/system/identity/print"))
            .await
            .is_ok()
    }

    /// Best-effort close. Dropping the channel closes the socket too;
    /// this exists for explicit shutdown points.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(err) = transport.shutdown().await {
                tracing::debug!(error = %err, "channel shutdown");
            }
        }
    }

    async fn connect(&mut self) -> Result<(), Error> {
        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port)),
        )
        .await
        .map_err(|_| self.timeout_error())??;
        stream.set_nodelay(true)?;

        let mut transport = if self.endpoint.uses_tls() {
            let connector = tls_connector()?;
            let server_name = rustls_pki_types::ServerName::try_from(self.endpoint.host.clone())
                .map_err(|e| Error::Tls(e.to_string()))?;
            let tls = tokio::time::timeout(
                self.config.connect_timeout,
                connector.connect(server_name, stream),
            )
            .await
            .map_err(|_| self.timeout_error())?
            .map_err(|e| Error::Tls(e.to_string()))?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(stream)
        };

        login(&mut transport, &self.endpoint).await?;
        self.transport = Some(transport);
        tracing::debug!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            tls = self.endpoint.uses_tls(),
            "channel open"
        );
        Ok(())
    }

    async fn execute_once(&mut self, command: &Command) -> Result<Vec<Row>, Error> {
        let transport = self.transport.as_mut().ok_or(Error::Closed)?;
        let result = run_command(transport, command).await;
        if matches!(
            result,
            Err(Error::Fatal { .. } | Error::Io(_) | Error::Protocol(_))
        ) {
            // The connection is no longer aligned; don't reuse it.
            self.transport = None;
        }
        result
    }

    fn timeout_error(&self) -> Error {
        Error::ConnectTimeout {
            host: self.endpoint.host.clone(),
            port: self.endpoint.port,
            timeout_secs: self.config.connect_timeout.as_secs(),
        }
    }
}

// ── Command execution ────────────────────────────────────────────────

async fn run_command(transport: &mut Transport, command: &Command) -> Result<Vec<Row>, Error> {
    transport.write_sentence(command.words()).await?;
    let mut rows = Vec::new();
    loop {
        let reply = read_reply(transport).await?;
        match reply.kind {
            ReplyKind::Data => rows.push(Row::new(reply.attributes)),
            ReplyKind::Done => return Ok(rows),
            ReplyKind::Trap => {
                let message = reply.message().unwrap_or("unspecified trap").to_owned();
                let category = reply.attributes.get("category").cloned();
                // The appliance still closes the command with !done.
                drain_to_done(transport).await?;
                return Err(Error::Trap { message, category });
            }
            ReplyKind::Fatal => return Err(Error::Fatal {
                message: fatal_message(&reply),
            }),
        }
    }
}

async fn drain_to_done(transport: &mut Transport) -> Result<(), Error> {
    loop {
        let reply = read_reply(transport).await?;
        match reply.kind {
            ReplyKind::Done => return Ok(()),
            ReplyKind::Fatal => {
                return Err(Error::Fatal {
                    message: fatal_message(&reply),
                });
            }
            ReplyKind::Data | ReplyKind::Trap => {}
        }
    }
}

/// Read the next non-empty reply sentence. Empty sentences are
/// keep-alives and are skipped.
async fn read_reply(transport: &mut Transport) -> Result<Reply, Error> {
    loop {
        let words = transport.read_sentence().await?;
        if words.is_empty() {
            continue;
        }
        return Reply::parse(words);
    }
}

fn fatal_message(reply: &Reply) -> String {
    if reply.plain.is_empty() {
        "connection closed by device".to_owned()
    } else {
        reply.plain.join(" ")
    }
}

// ── Login ────────────────────────────────────────────────────────────

async fn login(transport: &mut Transport, endpoint: &DeviceEndpoint) -> Result<(), Error> {
    let plain = Command::new("/login")
        .attr("name", &endpoint.username)
        .attr("password", endpoint.secret.expose_secret());
    transport.write_sentence(plain.words()).await?;

    let reply = read_reply(transport).await?;
    match reply.kind {
        ReplyKind::Done => {
            // Pre-6.43 firmware ignores the plain form and answers the
            // challenge handshake instead.
            if let Some(challenge) = reply.attributes.get("ret") {
                let challenge = challenge.clone();
                return challenge_login(transport, endpoint, &challenge).await;
            }
            Ok(())
        }
        ReplyKind::Trap => Err(Error::AuthenticationFailed {
            message: reply.message().unwrap_or("login rejected").to_owned(),
        }),
        ReplyKind::Fatal => Err(Error::Fatal {
            message: fatal_message(&reply),
        }),
        ReplyKind::Data => Err(Error::Protocol("unexpected !re during login".into())),
    }
}

/// Pre-6.43 challenge: reply with `00` + md5(0x00 || password || challenge).
async fn challenge_login(
    transport: &mut Transport,
    endpoint: &DeviceEndpoint,
    challenge_hex: &str,
) -> Result<(), Error> {
    let challenge = hex::decode(challenge_hex)
        .map_err(|e| Error::Protocol(format!("bad login challenge: {e}")))?;

    let mut seed = Vec::with_capacity(1 + challenge.len() + 32);
    seed.push(0u8);
    seed.extend_from_slice(endpoint.secret.expose_secret().as_bytes());
    seed.extend_from_slice(&challenge);
    let response = format!("00{:x}", md5::compute(&seed));

    let cmd = Command::new("/login")
        .attr("name", &endpoint.username)
        .attr("response", &response);
    transport.write_sentence(cmd.words()).await?;

    let reply = read_reply(transport).await?;
    match reply.kind {
        ReplyKind::Done => Ok(()),
        ReplyKind::Trap => Err(Error::AuthenticationFailed {
            message: reply.message().unwrap_or("login rejected").to_owned(),
        }),
        ReplyKind::Fatal => Err(Error::Fatal {
            message: fatal_message(&reply),
        }),
        ReplyKind::Data => Err(Error::Protocol("unexpected !re during login".into())),
    }
}

// ── TLS ──────────────────────────────────────────────────────────────

/// Appliances ship self-signed certificates; the TLS layer protects the
/// admin secret in transit, not endpoint identity.
#[derive(Debug)]
struct AcceptAnyCert {
    schemes: Vec<rustls::SignatureScheme>,
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls_pki_types::CertificateDer<'_>,
        _intermediates: &[rustls_pki_types::CertificateDer<'_>],
        _server_name: &rustls_pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls_pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls_pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.schemes.clone()
    }
}

fn tls_connector() -> Result<TlsConnector, Error> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let schemes = provider
        .signature_verification_algorithms
        .supported_schemes();
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCert { schemes }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn endpoint(host: &str, port: u16, username: &str, secret: &str) -> DeviceEndpoint {
        DeviceEndpoint::new(host, port, username, SecretString::from(secret.to_owned()))
    }

    #[test]
    fn tls_follows_the_port() {
        assert!(endpoint("10.0.0.1", API_TLS_PORT, "api", "x").uses_tls());
        assert!(!endpoint("10.0.0.1", API_PORT, "api", "x").uses_tls());
        assert!(!endpoint("10.0.0.1", 9000, "api", "x").uses_tls());
    }

    #[tokio::test]
    async fn open_rejects_incomplete_endpoints() {
        let cases = [
            endpoint("", API_PORT, "api", "x"),
            endpoint("10.0.0.1", 0, "api", "x"),
            endpoint("10.0.0.1", API_PORT, "", "x"),
            endpoint("10.0.0.1", API_PORT, "api", ""),
        ];
        for ep in cases {
            let err = Channel::open_default(ep).await.unwrap_err();
            assert!(matches!(err, Error::MissingField { .. }), "{err}");
        }
    }
}
