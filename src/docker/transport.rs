//! HTTP transport to the container engine
//!
//! A deliberately small HTTP/1.1 client over a unix socket, TCP, or
//! TLS connection. The engine's attach endpoint hijacks the connection
//! into a raw frame stream, which rules out off-the-shelf clients; the
//! same hand-parsed connection serves the plain JSON endpoints. One
//! connection per request, `Connection: close`.

use crate::config::{EngineConfig, EngineHost, TlsConfig};
use crate::docker::demux;
use crate::error::{KilnError, KilnResult};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::rustls;
use tracing::{debug, trace};

const IO_CHUNK: usize = 8192;

/// Object-safe byte stream to the engine
pub trait EngineStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> EngineStream for T {}

/// A request body
pub enum RequestBody<'a> {
    Empty,
    Json(String),
    /// Spooled tar file, streamed with its length
    TarFile(&'a mut File),
}

/// How the response body is framed
enum BodyFraming {
    Length(u64),
    Chunked { in_chunk: usize, done: bool },
    Eof,
}

pub struct Transport {
    config: EngineConfig,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl Transport {
    pub fn new(config: EngineConfig) -> KilnResult<Self> {
        let tls = match (&config.host, &config.tls) {
            (EngineHost::Tcp { .. }, Some(tls)) => Some(Arc::new(build_tls_config(tls)?)),
            _ => None,
        };
        Ok(Self { config, tls })
    }

    fn host_header(&self) -> String {
        match &self.config.host {
            EngineHost::Unix(_) => "localhost".to_string(),
            EngineHost::Tcp { host, port } => format!("{host}:{port}"),
        }
    }

    async fn connect(&self) -> KilnResult<Box<dyn EngineStream>> {
        match &self.config.host {
            EngineHost::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(|e| {
                    KilnError::io(format!("connecting to {}", path.display()), e)
                })?;
                Ok(Box::new(stream))
            }
            EngineHost::Tcp { host, port } => {
                let tcp = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| KilnError::io(format!("connecting to {host}:{port}"), e))?;
                match &self.tls {
                    None => Ok(Box::new(tcp)),
                    Some(config) => {
                        let connector = tokio_rustls::TlsConnector::from(config.clone());
                        let name = rustls::pki_types::ServerName::try_from(host.clone())
                            .map_err(|_| KilnError::Tls(format!("invalid server name {host}")))?;
                        let stream = connector
                            .connect(name, tcp)
                            .await
                            .map_err(|e| KilnError::Tls(e.to_string()))?;
                        Ok(Box::new(stream))
                    }
                }
            }
        }
    }

    /// Issue one request and parse the response head
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        body: RequestBody<'_>,
    ) -> KilnResult<Response> {
        let stream = self.connect().await?;
        let mut conn = BufReader::new(stream);
        debug!("{method} {path}");

        let mut head = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}\r\n",
            self.host_header()
        );
        match &body {
            RequestBody::Empty => head.push_str("Content-Length: 0\r\n"),
            RequestBody::Json(json) => {
                head.push_str("Content-Type: application/json\r\n");
                head.push_str(&format!("Content-Length: {}\r\n", json.len()));
            }
            RequestBody::TarFile(file) => {
                let len = file
                    .metadata()
                    .map_err(|e| KilnError::io("sizing tar body", e))?
                    .len();
                head.push_str("Content-Type: application/x-tar\r\n");
                head.push_str(&format!("Content-Length: {len}\r\n"));
            }
        }
        head.push_str("Connection: close\r\n\r\n");

        conn.write_all(head.as_bytes())
            .await
            .map_err(|e| KilnError::io("writing request", e))?;

        match body {
            RequestBody::Empty => {}
            RequestBody::Json(json) => {
                conn.write_all(json.as_bytes())
                    .await
                    .map_err(|e| KilnError::io("writing request body", e))?;
            }
            RequestBody::TarFile(file) => {
                file.seek(SeekFrom::Start(0))
                    .map_err(|e| KilnError::io("rewinding tar body", e))?;
                let mut buf = [0u8; IO_CHUNK];
                loop {
                    let n = file
                        .read(&mut buf)
                        .map_err(|e| KilnError::io("reading tar body", e))?;
                    if n == 0 {
                        break;
                    }
                    conn.write_all(&buf[..n])
                        .await
                        .map_err(|e| KilnError::io("writing tar body", e))?;
                }
            }
        }
        conn.flush()
            .await
            .map_err(|e| KilnError::io("flushing request", e))?;

        Response::read_head(conn).await
    }
}

pub struct Response {
    pub status: u16,
    headers: Vec<(String, String)>,
    conn: BufReader<Box<dyn EngineStream>>,
    framing: BodyFraming,
}

impl Response {
    async fn read_head(mut conn: BufReader<Box<dyn EngineStream>>) -> KilnResult<Self> {
        let mut status_line = String::new();
        conn.read_line(&mut status_line)
            .await
            .map_err(|e| KilnError::io("reading status line", e))?;
        if status_line.is_empty() {
            return Err(KilnError::InvalidResponse(
                "connection closed before status line".to_string(),
            ));
        }
        let status: u16 = status_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| KilnError::InvalidResponse(status_line.trim().to_string()))?;
        trace!("status: {status}");

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            conn.read_line(&mut line)
                .await
                .map_err(|e| KilnError::io("reading headers", e))?;
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        let framing = if headers
            .iter()
            .any(|(k, v)| k == "transfer-encoding" && v.to_ascii_lowercase().contains("chunked"))
        {
            BodyFraming::Chunked {
                in_chunk: 0,
                done: false,
            }
        } else if let Some(len) = headers
            .iter()
            .find(|(k, _)| k == "content-length")
            .and_then(|(_, v)| v.parse::<u64>().ok())
        {
            BodyFraming::Length(len)
        } else {
            BodyFraming::Eof
        };

        Ok(Self {
            status,
            headers,
            conn,
            framing,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
    }

    fn is_chunked(&self) -> bool {
        matches!(self.framing, BodyFraming::Chunked { .. })
    }

    /// Read the next piece of the body into `buf`; `Ok(0)` is a clean
    /// end of body.
    async fn next_piece(&mut self, buf: &mut [u8]) -> KilnResult<usize> {
        match &mut self.framing {
            BodyFraming::Length(remaining) => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let want = buf.len().min(*remaining as usize);
                let n = self
                    .conn
                    .read(&mut buf[..want])
                    .await
                    .map_err(|e| KilnError::io("reading body", e))?;
                if n == 0 {
                    return Err(KilnError::ShortRead);
                }
                *remaining -= n as u64;
                Ok(n)
            }
            BodyFraming::Chunked { in_chunk, done } => {
                if *done {
                    return Ok(0);
                }
                if *in_chunk == 0 {
                    let size = demux::read_chunk_size(&mut self.conn).await?;
                    if size == 0 {
                        *done = true;
                        return Ok(0);
                    }
                    *in_chunk = size;
                }
                let want = buf.len().min(*in_chunk);
                let n = self
                    .conn
                    .read(&mut buf[..want])
                    .await
                    .map_err(|e| KilnError::io("reading body", e))?;
                if n == 0 {
                    return Err(KilnError::ShortRead);
                }
                *in_chunk -= n;
                if *in_chunk == 0 {
                    demux::consume_chunk_crlf(&mut self.conn).await?;
                }
                Ok(n)
            }
            BodyFraming::Eof => self
                .conn
                .read(buf)
                .await
                .map_err(|e| KilnError::io("reading body", e)),
        }
    }

    /// Collect the entire body as a string (small JSON responses)
    pub async fn body_string(mut self) -> KilnResult<String> {
        let mut out = Vec::new();
        let mut buf = [0u8; IO_CHUNK];
        loop {
            let n = self.next_piece(&mut buf).await?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out)
            .map_err(|_| KilnError::InvalidResponse("non-utf8 response body".to_string()))
    }

    /// Drive raw body chunks into a push consumer
    pub async fn stream_body(
        mut self,
        mut consume: impl FnMut(&[u8]) -> KilnResult<()>,
    ) -> KilnResult<()> {
        let mut buf = [0u8; IO_CHUNK];
        loop {
            let n = self.next_piece(&mut buf).await?;
            if n == 0 {
                break;
            }
            consume(&buf[..n])?;
        }
        Ok(())
    }

    /// Spool the body into an unlinked temp file and rewind it
    pub async fn body_to_file(mut self) -> KilnResult<File> {
        let mut file = tempfile::tempfile().map_err(|e| KilnError::io("creating spool file", e))?;
        let mut buf = [0u8; IO_CHUNK];
        loop {
            let n = self.next_piece(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n])
                .map_err(|e| KilnError::io("spooling body", e))?;
        }
        file.seek(SeekFrom::Start(0))
            .map_err(|e| KilnError::io("rewinding spool file", e))?;
        Ok(file)
    }

    /// Hand the attach stream to the frame demuxer, honoring the
    /// transfer framing the engine chose
    pub async fn demux_into(
        mut self,
        stdout: &mut dyn Write,
        stderr: &mut dyn Write,
    ) -> KilnResult<()> {
        if self.is_chunked() {
            demux::demux_chunked(&mut self.conn, stdout, stderr).await
        } else {
            demux::demux(&mut self.conn, stdout, stderr).await
        }
    }
}

fn read_pem_certs(path: &std::path::Path) -> KilnResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| KilnError::io(format!("opening {}", path.display()), e))?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| KilnError::Tls(format!("reading {}: {e}", path.display())))
}

fn build_tls_config(tls: &TlsConfig) -> KilnResult<rustls::ClientConfig> {
    let builder = rustls::ClientConfig::builder();

    let builder = if tls.verify {
        let ca = tls.ca_file.as_ref().ok_or_else(|| {
            KilnError::Tls("peer verification requires a CA file (--tlscacert)".to_string())
        })?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in read_pem_certs(ca)? {
            roots
                .add(cert)
                .map_err(|e| KilnError::Tls(format!("bad CA certificate: {e}")))?;
        }
        builder.with_root_certificates(roots)
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
    };

    match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => {
            let certs = read_pem_certs(cert)?;
            let key_file = File::open(key)
                .map_err(|e| KilnError::io(format!("opening {}", key.display()), e))?;
            let mut reader = std::io::BufReader::new(key_file);
            let key = rustls_pemfile::private_key(&mut reader)
                .map_err(|e| KilnError::Tls(format!("reading {}: {e}", key.display())))?
                .ok_or_else(|| KilnError::Tls(format!("no private key in {}", key.display())))?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| KilnError::Tls(format!("bad client certificate: {e}")))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(KilnError::Tls(
            "client TLS needs both --tlscert and --tlskey".to_string(),
        )),
    }
}

/// Verifier used when peer verification is disabled
#[derive(Debug)]
struct AcceptAnyCert;

impl rustls::client::danger::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme::*;
        vec![
            RSA_PKCS1_SHA256,
            RSA_PKCS1_SHA384,
            RSA_PKCS1_SHA512,
            RSA_PSS_SHA256,
            RSA_PSS_SHA384,
            RSA_PSS_SHA512,
            ECDSA_NISTP256_SHA256,
            ECDSA_NISTP384_SHA384,
            ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port
    async fn serve_once(response: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4096];
            // drain the request head
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 || buf[..n].windows(4).any(|w| w == b"\r\n\r\n") {
                    break;
                }
            }
            stream.write_all(&response).await.unwrap();
        });
        format!("tcp://{addr}")
    }

    async fn transport_for(host: &str) -> Transport {
        let config = EngineConfig::resolve(Some(host), None).unwrap();
        Transport::new(config).unwrap()
    }

    #[tokio::test]
    async fn parses_status_and_content_length_body() {
        let host = serve_once(
            b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 13\r\n\r\n{\"Id\":\"abc\"}\n"
                .to_vec(),
        )
        .await;
        let transport = transport_for(&host).await;
        let response = transport
            .request("GET", "/images/x/json", RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.header("content-type"), Some("application/json"));
        assert_eq!(response.body_string().await.unwrap(), "{\"Id\":\"abc\"}\n");
    }

    #[tokio::test]
    async fn parses_chunked_body() {
        let host = serve_once(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"
                .to_vec(),
        )
        .await;
        let transport = transport_for(&host).await;
        let response = transport
            .request("GET", "/x", RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(response.body_string().await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn reads_body_to_eof_without_framing_headers() {
        let host = serve_once(b"HTTP/1.1 404 Not Found\r\n\r\nno such image".to_vec()).await;
        let transport = transport_for(&host).await;
        let response = transport
            .request("GET", "/images/missing/json", RequestBody::Empty)
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body_string().await.unwrap(), "no such image");
    }

    #[tokio::test]
    async fn truncated_content_length_body_is_short_read() {
        let host =
            serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\nonly this".to_vec()).await;
        let transport = transport_for(&host).await;
        let response = transport
            .request("GET", "/x", RequestBody::Empty)
            .await
            .unwrap();
        let err = response.body_string().await.unwrap_err();
        assert!(matches!(err, KilnError::ShortRead));
    }

    #[tokio::test]
    async fn garbage_status_line_is_invalid_response() {
        let host = serve_once(b"NOT HTTP AT ALL\r\n\r\n".to_vec()).await;
        let transport = transport_for(&host).await;
        let Err(err) = transport
            .request("GET", "/x", RequestBody::Empty)
            .await
        else {
            panic!("expected request to fail")
        };
        assert!(matches!(err, KilnError::InvalidResponse(_)));
    }
}
