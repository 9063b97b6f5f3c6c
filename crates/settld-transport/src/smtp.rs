use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
    pub timeout_ms: u64,
    pub use_starttls: bool,
}

impl SmtpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            from_address: String::new(),
            timeout_ms: 10_000,
            use_starttls: true,
        }
    }
}

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("smtp connect failed: {0}")]
    Connect(String),
    #[error("smtp io error: {0}")]
    Io(String),
    #[error("smtp timed out after {0}ms")]
    Timeout(u64),
    #[error("smtp server rejected command, code {code}: {text}")]
    Rejected { code: u32, text: String },
    #[error("smtp protocol error: {0}")]
    Protocol(String),
}

type Result<T> = std::result::Result<T, SmtpError>;

enum Stream {
    Plain(TcpStream),
    Tls(tokio_rustls::client::TlsStream<TcpStream>),
}

/// A line-oriented ESMTP client speaking EHLO / STARTTLS / AUTH PLAIN / MAIL-RCPT-DATA.
///
/// Every command round-trip is wrapped in `timeout_ms`; a timed out command leaves the
/// connection in an unspecified state and the caller should drop the client.
pub struct SmtpClient {
    config: SmtpConfig,
    reader: Option<BufReader<Stream>>,
}

impl tokio::io::AsyncRead for Stream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Stream::Tls(s) => std::pin::Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl tokio::io::AsyncWrite for Stream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Stream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Stream::Tls(s) => std::pin::Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Stream::Tls(s) => std::pin::Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Stream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Stream::Tls(s) => std::pin::Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Parsed multiline SMTP reply: the final line's three-digit code plus every text line.
struct Reply {
    code: u32,
    lines: Vec<String>,
}

impl Reply {
    fn text(&self) -> String {
        self.lines.join(" ")
    }

    fn is_ok(&self) -> bool {
        self.code < 400
    }
}

impl SmtpClient {
    pub async fn connect(config: SmtpConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let budget = Duration::from_millis(config.timeout_ms);
        let tcp = timeout(budget, TcpStream::connect(&addr))
            .await
            .map_err(|_| SmtpError::Timeout(config.timeout_ms))?
            .map_err(|e| SmtpError::Connect(e.to_string()))?;
        let mut client = Self {
            config,
            reader: Some(BufReader::new(Stream::Plain(tcp))),
        };
        client.read_reply().await?;
        Ok(client)
    }

    async fn read_reply(&mut self) -> Result<Reply> {
        let budget = Duration::from_millis(self.config.timeout_ms);
        let reader = self.reader.as_mut().ok_or_else(|| {
            SmtpError::Protocol("connection already closed".to_string())
        })?;
        let mut lines = Vec::new();
        let mut code = 0u32;
        loop {
            let mut line = String::new();
            let n = timeout(budget, reader.read_line(&mut line))
                .await
                .map_err(|_| SmtpError::Timeout(self.config.timeout_ms))?
                .map_err(|e| SmtpError::Io(e.to_string()))?;
            if n == 0 {
                return Err(SmtpError::Io("connection closed by peer".to_string()));
            }
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if line.len() < 4 {
                return Err(SmtpError::Protocol(format!("malformed reply line: {line}")));
            }
            code = line[0..3]
                .parse()
                .map_err(|_| SmtpError::Protocol(format!("non-numeric reply code: {line}")))?;
            let sep = line.as_bytes()[3];
            lines.push(line[4..].to_string());
            if sep == b' ' {
                break;
            }
            if sep != b'-' {
                return Err(SmtpError::Protocol(format!("malformed reply separator: {line}")));
            }
        }
        Ok(Reply { code, lines })
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let budget = Duration::from_millis(self.config.timeout_ms);
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| SmtpError::Protocol("connection already closed".to_string()))?;
        let out = format!("{line}\r\n");
        timeout(budget, reader.get_mut().write_all(out.as_bytes()))
            .await
            .map_err(|_| SmtpError::Timeout(self.config.timeout_ms))?
            .map_err(|e| SmtpError::Io(e.to_string()))?;
        Ok(())
    }

    async fn command(&mut self, line: &str) -> Result<Reply> {
        self.write_line(line).await?;
        let reply = self.read_reply().await?;
        if !reply.is_ok() {
            return Err(SmtpError::Rejected {
                code: reply.code,
                text: reply.text(),
            });
        }
        Ok(reply)
    }

    async fn ehlo(&mut self) -> Result<Vec<String>> {
        let reply = self.command("EHLO settld").await?;
        Ok(reply.lines)
    }

    async fn starttls(&mut self) -> Result<()> {
        self.command("STARTTLS").await?;
        let mut roots = RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls_config));
        let server_name = ServerName::try_from(self.config.host.clone())
            .map_err(|_| SmtpError::Protocol(format!("invalid server name: {}", self.config.host)))?;
        let plain = match self.reader.take() {
            Some(reader) => match reader.into_inner() {
                Stream::Plain(tcp) => tcp,
                Stream::Tls(_) => return Err(SmtpError::Protocol("already upgraded to TLS".to_string())),
            },
            None => return Err(SmtpError::Protocol("connection already closed".to_string())),
        };
        let tls = connector
            .connect(server_name, plain)
            .await
            .map_err(|e| SmtpError::Connect(e.to_string()))?;
        self.reader = Some(BufReader::new(Stream::Tls(tls)));
        Ok(())
    }

    async fn auth_plain(&mut self) -> Result<()> {
        let mut payload = Vec::new();
        payload.push(0u8);
        payload.extend_from_slice(self.config.username.as_bytes());
        payload.push(0u8);
        payload.extend_from_slice(self.config.password.as_bytes());
        let encoded = BASE64.encode(payload);
        self.command(&format!("AUTH PLAIN {encoded}")).await?;
        Ok(())
    }

    fn dot_stuff(body: &str) -> String {
        body.lines()
            .map(|line| if let Some(rest) = line.strip_prefix('.') { format!(".{rest}") } else { line.to_string() })
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    /// Runs the full ESMTP handshake (EHLO, optional STARTTLS + EHLO again, optional AUTH PLAIN)
    /// and sends one message. The connection is closed with QUIT regardless of outcome.
    pub async fn send_message(
        mut self,
        to_addresses: &[String],
        subject: &str,
        body: &str,
    ) -> Result<()> {
        let result = self.send_message_inner(to_addresses, subject, body).await;
        let _ = self.command("QUIT").await;
        result
    }

    async fn send_message_inner(
        &mut self,
        to_addresses: &[String],
        subject: &str,
        body: &str,
    ) -> Result<()> {
        self.ehlo().await?;
        if self.config.use_starttls {
            self.starttls().await?;
            self.ehlo().await?;
        }
        if !self.config.username.is_empty() {
            self.auth_plain().await?;
        }
        self.command(&format!("MAIL FROM:<{}>", self.config.from_address)).await?;
        for to in to_addresses {
            self.command(&format!("RCPT TO:<{to}>")).await?;
        }
        self.command("DATA").await?;
        let headers = format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\n\r\n",
            self.config.from_address,
            to_addresses.join(", "),
            subject,
        );
        let stuffed = Self::dot_stuff(body);
        self.write_line(&format!("{headers}{stuffed}\r\n.")).await?;
        let reply = self.read_reply().await?;
        if !reply.is_ok() {
            return Err(SmtpError::Rejected {
                code: reply.code,
                text: reply.text(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Spins up a minimal in-process SMTP stub (no STARTTLS/AUTH) and exercises the
    /// EHLO -> MAIL -> RCPT -> DATA happy path end to end over a real loopback socket.
    #[tokio::test]
    async fn sends_message_over_plain_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"220 stub.local ESMTP\r\n").await.unwrap();
            let mut buf = vec![0u8; 65536];
            let mut transcript = Vec::new();
            let mut in_data = false;
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                transcript.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&buf[..n]).to_string();
                if in_data {
                    if text.ends_with("\r\n.\r\n") || text == ".\r\n" {
                        sock.write_all(b"250 OK queued\r\n").await.unwrap();
                        in_data = false;
                    }
                    continue;
                }
                let line = text.trim();
                if line.starts_with("EHLO") {
                    sock.write_all(b"250-stub.local\r\n250 PIPELINING\r\n").await.unwrap();
                } else if line.starts_with("MAIL FROM") || line.starts_with("RCPT TO") {
                    sock.write_all(b"250 OK\r\n").await.unwrap();
                } else if line == "DATA" {
                    sock.write_all(b"354 send data\r\n").await.unwrap();
                    in_data = true;
                } else if line == "QUIT" {
                    sock.write_all(b"221 bye\r\n").await.unwrap();
                    break;
                }
            }
            transcript
        });

        let mut config = SmtpConfig::new("127.0.0.1", addr.port());
        config.use_starttls = false;
        config.from_address = "alerts@settld.dev".to_string();
        let client = SmtpClient::connect(config).await.unwrap();
        client
            .send_message(&["ops@example.com".to_string()], "hi", "line one\r\n.line two")
            .await
            .unwrap();

        let transcript = server.await.unwrap();
        let text = String::from_utf8_lossy(&transcript);
        assert!(text.contains("MAIL FROM:<alerts@settld.dev>"));
        assert!(text.contains("RCPT TO:<ops@example.com>"));
        assert!(text.contains("..line two"), "dot-stuffing was not applied: {text}");
    }

    #[test]
    fn dot_stuffing_escapes_leading_dot() {
        let stuffed = SmtpClient::dot_stuff(".hello\nworld\n.");
        assert_eq!(stuffed, "..hello\r\nworld\r\n..");
    }
}
