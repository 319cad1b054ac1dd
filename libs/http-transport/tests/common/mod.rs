//! Hand-rolled servers for scenarios httpmock cannot play: TLS with a
//! generated certificate, connections closed before any response, counted
//! keep-alive connections and bodies that stall halfway.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rustls::ServerConfig;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter("http_transport=debug")
        .with_test_writer()
        .try_init()
        .ok();
}

/// Read one request head, discarding the content.
async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut head = Vec::new();
    let mut buf = [0_u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        head.extend_from_slice(&buf[..n]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

async fn respond<S: AsyncWrite + Unpin>(stream: &mut S, status: &str, body: &str) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Server certificate material plus the anchor a client has to trust.
pub struct TestCertificate {
    /// Trust anchor, PEM
    pub pem: String,
    /// Trust anchor, DER
    pub der: CertificateDer<'static>,
    /// Chain the server presents
    chain: Vec<CertificateDer<'static>>,
    key: Vec<u8>,
}

impl TestCertificate {
    /// Self-signed certificate for `localhost`.
    pub fn localhost() -> Self {
        let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        Self {
            pem: ck.cert.pem(),
            der: ck.cert.der().clone(),
            chain: vec![ck.cert.der().clone()],
            key: ck.key_pair.serialize_der(),
        }
    }

    /// Leaf for `host` that expired in 2001, signed by a CA that is still
    /// valid. The anchor fields hold the CA.
    pub fn expired_from_ca(host: &str) -> Self {
        let ca_key = rcgen::KeyPair::generate().unwrap();
        let mut ca_params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
        ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        ca_params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "transport scenario ca");
        let ca = ca_params.self_signed(&ca_key).unwrap();

        let leaf_key = rcgen::KeyPair::generate().unwrap();
        let mut leaf_params = rcgen::CertificateParams::new(vec![host.to_owned()]).unwrap();
        leaf_params.not_before = rcgen::date_time_ymd(2000, 1, 1);
        leaf_params.not_after = rcgen::date_time_ymd(2001, 1, 1);
        let leaf = leaf_params.signed_by(&leaf_key, &ca, &ca_key).unwrap();

        Self {
            pem: ca.pem(),
            der: ca.der().clone(),
            chain: vec![leaf.der().clone()],
            key: leaf_key.serialize_der(),
        }
    }

    /// Write the trust anchor as a PEM truststore into `dir`.
    pub fn write_pem(&self, dir: &std::path::Path) -> String {
        let path = dir.join("trust.pem");
        std::fs::write(&path, &self.pem).unwrap();
        path.to_string_lossy().into_owned()
    }
}

/// HTTPS server answering every request with `200 OK` and `body`.
pub async fn tls_server(cert: &TestCertificate, body: &'static str) -> SocketAddr {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(
            cert.chain.clone(),
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(cert.key.clone())),
        )
        .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                // handshake failures are expected when the client rejects the certificate
                if let Ok(mut tls) = acceptor.accept(tcp).await
                    && read_head(&mut tls).await.is_ok()
                {
                    respond(&mut tls, "200 OK", body).await.ok();
                }
            });
        }
    });
    addr
}

/// Plain HTTP server that closes the first `drops` connections after reading
/// the request head, then answers `200 OK` with `body`.
pub struct FlakyServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl FlakyServer {
    pub async fn start(drops: usize, body: &'static str) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    if read_head(&mut tcp).await.is_err() {
                        return;
                    }
                    if n >= drops {
                        respond(&mut tcp, "200 OK", body).await.ok();
                    }
                    // below the drop count the socket closes without a response
                });
            }
        });
        Self { addr, accepted }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Connections accepted so far, one per attempt.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Plain HTTP/1.1 server keeping connections alive across requests.
///
/// Every request is answered `200 OK` with `body`. With `close_when_idle`
/// the server silently closes each connection after its first response.
pub struct KeepAliveServer {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
}

impl KeepAliveServer {
    pub async fn start(body: &'static str) -> Self {
        Self::spawn(body, false).await
    }

    pub async fn closing_when_idle(body: &'static str) -> Self {
        Self::spawn(body, true).await
    }

    async fn spawn(body: &'static str, close_when_idle: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();

        tokio::spawn(async move {
            while let Ok((mut tcp, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\n\r\n{body}",
                        body.len()
                    );
                    loop {
                        match read_head(&mut tcp).await {
                            Ok(head) if !head.is_empty() => {}
                            _ => return,
                        }
                        if tcp.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                        if close_when_idle {
                            tcp.shutdown().await.ok();
                            return;
                        }
                    }
                });
            }
        });
        Self { addr, accepted }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

/// Plain HTTP server that announces `content-length: 10`, sends two bytes and
/// then keeps the connection open without sending more.
pub async fn stalling_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                if read_head(&mut tcp).await.is_err() {
                    return;
                }
                let head = "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: 10\r\n\r\nab";
                if tcp.write_all(head.as_bytes()).await.is_ok() {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
            });
        }
    });
    addr
}
