//! Module E — the Connect-IP client.
//!
//! Establishes a MASQUE Connect-IP tunnel: HTTP/3 first (quiche + quiche::h3
//! over a noize-wrapped UDP socket), falling back to HTTP/2 (the `h2` crate
//! over `tokio-rustls`) on any attempt-1 failure. Both attempts issue the
//! same extended CONNECT carrying `:protocol: cf-connect-ip` and exchange
//! RFC 9297 capsules once the tunnel is up.

use super::capsule::{self, Capsule, CAPSULE_TYPE_DATAGRAM};
use super::noize_udp::NoizeUdpSocket;
use crate::config::MasqueParams;
use crate::error::ConnectError;
use crate::telemetry::{CAPSULES_READ, CAPSULES_WRITTEN};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

const DATAGRAM_CHANNEL_CAPACITY: usize = 100;
const QUIC_INITIAL_PACKET_SIZE: usize = 1242;
const QUIC_KEEPALIVE: Duration = Duration::from_secs(30);

/// Inputs the Connect-IP client needs to dial a tunnel (spec §4.E).
#[derive(Debug, Clone)]
pub struct ConnectIpConfig {
    pub endpoint: SocketAddr,
    pub sni: String,
    pub uri_template: String,
    pub target_host: String,
    pub target_port: u16,
    pub client_cert_der: Vec<u8>,
    pub client_key_der: Vec<u8>,
    pub pinned_pubkey_sha256: Option<[u8; 32]>,
    pub skip_pinning: bool,
    pub resolve_connect_host: bool,
    pub uri_host: String,
}

/// Tunnel addresses assigned by the peer (spec §3, "MASQUE session").
/// Carried for completeness; the core forwarding path only needs the
/// DATAGRAM capsule channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignedAddresses {
    pub v4: Option<Ipv4Addr>,
    pub v6: Option<Ipv6Addr>,
}

/// Expands the Connect-IP URI template with `{target_host}`/`{target_port}`,
/// bracketing IPv6 literals (spec §4.E).
pub fn expand_uri_template(template: &str, target_host: &str, target_port: u16) -> String {
    let host = if target_host.contains(':') && !target_host.starts_with('[') {
        format!("[{target_host}]")
    } else {
        target_host.to_string()
    };
    template
        .replace("{target_host}", &host)
        .replace("{target_port}", &target_port.to_string())
}

/// A live Connect-IP tunnel: a duplex channel of raw IP packets, backed by
/// whichever transport attempt succeeded.
pub struct ConnectIpSession {
    incoming: AsyncMutex<mpsc::Receiver<Vec<u8>>>,
    writer: Box<dyn PacketWriter>,
    assigned: AssignedAddresses,
    closed: Arc<AtomicBool>,
}

#[async_trait::async_trait]
trait PacketWriter: Send + Sync {
    async fn write_packet(&self, pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError>;
    async fn close(&self);
}

impl ConnectIpSession {
    /// Reads the next decoded DATAGRAM payload, or `None` once the read
    /// side has hit EOF and the channel has drained.
    pub async fn read_packet(&self) -> Option<Vec<u8>> {
        self.incoming.lock().await.recv().await
    }

    /// Writes a raw IP packet as a single DATAGRAM capsule. The far side
    /// may piggyback a single ICMP reply, which callers MUST forward
    /// upstream (spec §4.E).
    pub async fn write_packet(&self, pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
        self.writer.write_packet(pkt).await
    }

    pub fn assigned_addresses(&self) -> &AssignedAddresses {
        &self.assigned
    }

    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.writer.close().await;
        }
    }
}

/// Drives the HTTP/3 attempt, falling back to HTTP/2 on any failure.
pub struct ConnectIpClient {
    config: ConnectIpConfig,
    noize_params: MasqueParams,
}

impl ConnectIpClient {
    pub fn new(config: ConnectIpConfig, noize_params: MasqueParams) -> Self {
        ConnectIpClient { config, noize_params }
    }

    pub async fn connect(&self) -> Result<ConnectIpSession, ConnectError> {
        match self.connect_h3().await {
            Ok(session) => Ok(session),
            Err(e) => {
                log::warn!("masque attempt 1 (h3) failed, falling back to h2: {e}");
                self.probe_reachability().await;
                self.connect_h2().await
            }
        }
    }

    async fn probe_reachability(&self) {
        let host_target = format!("{}:443", self.config.uri_host);
        for attempt in 0..3 {
            if TcpStream::connect(&host_target).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(200 * (attempt + 1))).await;
        }
        // fall through to probing the configured endpoint directly
        let _ = TcpStream::connect(self.config.endpoint).await;
    }

    async fn connect_h3(&self) -> Result<ConnectIpSession, ConnectError> {
        let bind_addr: SocketAddr = match self.config.endpoint {
            SocketAddr::V4(_) => "0.0.0.0:0".parse().unwrap(),
            SocketAddr::V6(_) => "[::]:0".parse().unwrap(),
        };
        let udp = UdpSocket::bind(bind_addr).await?;
        udp.connect(self.config.endpoint).await?;
        let noize = Arc::new(NoizeUdpSocket::new(udp, self.noize_params.clone()));

        let mut quiche_cfg = self.build_quiche_config()?;
        let scid = quiche::ConnectionId::from_ref(&[0; quiche::MAX_CONN_ID_LEN]);
        let local = self.config.endpoint; // placeholder local addr for the QUIC layer
        let mut conn = quiche::connect(
            Some(&self.config.sni),
            &scid,
            local,
            self.config.endpoint,
            &mut quiche_cfg,
        )?;

        if let Ok(path) = std::env::var("TLS_KEYLOG") {
            if let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&path) {
                conn.set_keylog(Box::new(file));
            }
        }

        self.drive_until(&noize, &mut conn, |conn| conn.is_established()).await?;
        self.verify_peer_cert(conn.peer_cert())?;

        let h3_config = quiche::h3::Config::new()?;
        let mut h3_conn = quiche::h3::Connection::with_transport(&mut conn, &h3_config)?;

        let path = expand_uri_template(
            &self.config.uri_template,
            &self.config.target_host,
            self.config.target_port,
        );
        let req = vec![
            quiche::h3::Header::new(b":method", b"CONNECT"),
            quiche::h3::Header::new(b":protocol", b"cf-connect-ip"),
            quiche::h3::Header::new(b":scheme", b"https"),
            quiche::h3::Header::new(b":authority", self.config.sni.as_bytes()),
            quiche::h3::Header::new(b":path", path.as_bytes()),
            quiche::h3::Header::new(b"capsule-protocol", b"?1"),
            quiche::h3::Header::new(b"user-agent", b""),
        ];
        let stream_id = h3_conn.send_request(&mut conn, &req, false)?;

        let status = self
            .drive_until_response(&noize, &mut conn, &mut h3_conn, stream_id)
            .await?;
        if status != 200 {
            return Err(ConnectError::ConnectStatus(status));
        }

        let (tx, rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let pump_conn = Arc::new(AsyncMutex::new((conn, h3_conn)));
        spawn_h3_pump(Arc::clone(&noize), Arc::clone(&pump_conn), stream_id, tx, Arc::clone(&closed));

        Ok(ConnectIpSession {
            incoming: AsyncMutex::new(rx),
            writer: Box::new(H3Writer {
                conn: pump_conn,
                stream_id,
                noize,
            }),
            assigned: AssignedAddresses::default(),
            closed,
        })
    }

    fn build_quiche_config(&self) -> Result<quiche::Config, ConnectError> {
        let mut cfg = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
        cfg.set_application_protos(&[b"h3"])?;
        cfg.set_max_idle_timeout(QUIC_KEEPALIVE.as_millis() as u64);
        cfg.set_max_recv_udp_payload_size(QUIC_INITIAL_PACKET_SIZE);
        cfg.set_max_send_udp_payload_size(QUIC_INITIAL_PACKET_SIZE);
        cfg.enable_dgram(true, 1000, 1000);
        cfg.set_initial_max_data(10_000_000);
        cfg.set_initial_max_stream_data_bidi_local(1_000_000);
        cfg.set_initial_max_stream_data_bidi_remote(1_000_000);
        cfg.set_initial_max_streams_bidi(100);
        // Pinning is verified manually against the peer certificate after
        // the handshake; quiche's own verification is disabled whenever a
        // pin is configured (or the operator explicitly skips pinning).
        if self.config.pinned_pubkey_sha256.is_some() && !self.config.skip_pinning {
            cfg.verify_peer(false);
        } else if self.config.skip_pinning {
            cfg.verify_peer(false);
        }
        if std::env::var_os("TLS_KEYLOG").is_some() {
            cfg.log_keys();
        }
        Ok(cfg)
    }

    fn verify_peer_cert(&self, peer_cert_der: Option<&[u8]>) -> Result<(), ConnectError> {
        let Some(pinned) = self.config.pinned_pubkey_sha256 else {
            return Ok(());
        };
        if self.config.skip_pinning {
            return Ok(());
        }
        let der = peer_cert_der.ok_or_else(|| {
            ConnectError::CryptoKeyParse("no peer certificate presented".to_string())
        })?;
        check_pubkey_pin(der, &pinned)
    }

    async fn drive_until<F>(
        &self,
        noize: &NoizeUdpSocket,
        conn: &mut quiche::Connection,
        done: F,
    ) -> Result<(), ConnectError>
    where
        F: Fn(&quiche::Connection) -> bool,
    {
        let mut buf = [0u8; 65535];
        let mut out = [0u8; QUIC_INITIAL_PACKET_SIZE];
        loop {
            flush_egress(noize, conn, &mut out).await?;
            if done(conn) {
                return Ok(());
            }
            if conn.is_closed() {
                return Err(ConnectError::HandshakeFailed(
                    "quic connection closed during handshake".to_string(),
                ));
            }
            let timeout = conn.timeout().unwrap_or(Duration::from_secs(5));
            match tokio::time::timeout(timeout, noize.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    let recv_info = quiche::RecvInfo {
                        from,
                        to: self.config.endpoint,
                    };
                    let _ = conn.recv(&mut buf[..n], recv_info);
                }
                Ok(Err(e)) => return Err(ConnectError::Io(e)),
                Err(_) => conn.on_timeout(),
            }
        }
    }

    async fn drive_until_response(
        &self,
        noize: &NoizeUdpSocket,
        conn: &mut quiche::Connection,
        h3_conn: &mut quiche::h3::Connection,
        stream_id: u64,
    ) -> Result<u16, ConnectError> {
        let mut buf = [0u8; 65535];
        let mut out = [0u8; QUIC_INITIAL_PACKET_SIZE];
        loop {
            flush_egress(noize, conn, &mut out).await?;

            loop {
                match h3_conn.poll(conn) {
                    Ok((id, quiche::h3::Event::Headers { list, .. })) if id == stream_id => {
                        for h in &list {
                            if h.name() == b":status" {
                                let status: u16 = std::str::from_utf8(h.value())
                                    .ok()
                                    .and_then(|s| s.parse().ok())
                                    .unwrap_or(0);
                                if status == 200 {
                                    noize.disable_obfuscation();
                                }
                                return Ok(status);
                            }
                        }
                    }
                    Ok(_) => continue,
                    Err(quiche::h3::Error::Done) => break,
                    Err(e) => return Err(ConnectError::H3(e)),
                }
            }

            if conn.is_closed() {
                return Err(ConnectError::HandshakeFailed(
                    "connection closed before CONNECT response".to_string(),
                ));
            }
            let timeout = conn.timeout().unwrap_or(Duration::from_secs(5));
            match tokio::time::timeout(timeout, noize.recv_from(&mut buf)).await {
                Ok(Ok((n, from))) => {
                    let recv_info = quiche::RecvInfo {
                        from,
                        to: self.config.endpoint,
                    };
                    let _ = conn.recv(&mut buf[..n], recv_info);
                }
                Ok(Err(e)) => return Err(ConnectError::Io(e)),
                Err(_) => conn.on_timeout(),
            }
        }
    }

    async fn connect_h2(&self) -> Result<ConnectIpSession, ConnectError> {
        let candidates = self.h2_candidate_addrs().await;
        let mut last_err = None;
        for addr in candidates {
            match self.try_h2_candidate(addr).await {
                Ok(session) => return Ok(session),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(ConnectError::InternalBug(
            "no h2 candidate addresses available".to_string(),
        )))
    }

    async fn h2_candidate_addrs(&self) -> Vec<SocketAddr> {
        let mut out = Vec::new();
        out.push(self.config.endpoint);
        if self.config.resolve_connect_host {
            if let Ok(mut addrs) =
                tokio::net::lookup_host((self.config.uri_host.as_str(), 443)).await
            {
                out.extend(std::iter::from_fn(|| addrs.next()));
            }
        }
        out
    }

    async fn try_h2_candidate(&self, addr: SocketAddr) -> Result<ConnectIpSession, ConnectError> {
        let tcp = TcpStream::connect(addr).await?;
        let tls_config = self.build_rustls_config()?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(tls_config));
        let server_name = rustls::pki_types::ServerName::try_from(self.config.sni.clone())
            .map_err(|e| ConnectError::CryptoKeyParse(e.to_string()))?;
        let tls_stream = connector.connect(server_name, tcp).await?;

        let (mut send_request, connection) = h2::client::handshake(tls_stream)
            .await
            .map_err(ConnectError::H2)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                log::debug!("h2 connection driver exited: {e}");
            }
        });

        let path = expand_uri_template(
            &self.config.uri_template,
            &self.config.target_host,
            self.config.target_port,
        );
        let mut req = http::Request::builder()
            .method(http::Method::CONNECT)
            .uri(path)
            .header("capsule-protocol", "?1")
            .header("user-agent", "")
            .body(())
            .map_err(|e| ConnectError::InternalBug(e.to_string()))?;
        req.extensions_mut()
            .insert(h2::ext::Protocol::from("cf-connect-ip"));

        let (response_fut, mut send_stream) = send_request
            .send_request(req, false)
            .map_err(ConnectError::H2)?;
        let response = response_fut.await.map_err(ConnectError::H2)?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(ConnectError::ConnectStatus(status));
        }

        let (tx, rx) = mpsc::channel(DATAGRAM_CHANNEL_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));
        let recv_stream = Arc::new(AsyncMutex::new(response.into_body()));
        spawn_h2_pump(Arc::clone(&recv_stream), tx, Arc::clone(&closed));

        send_stream.reserve_capacity(1);

        Ok(ConnectIpSession {
            incoming: AsyncMutex::new(rx),
            writer: Box::new(H2Writer {
                send_stream: AsyncMutex::new(send_stream),
            }),
            assigned: AssignedAddresses::default(),
            closed,
        })
    }

    fn build_rustls_config(&self) -> Result<rustls::ClientConfig, ConnectError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let builder = rustls::ClientConfig::builder().with_root_certificates(roots.clone());

        let mut config = if let (false, Some(pin)) =
            (self.config.skip_pinning, self.config.pinned_pubkey_sha256)
        {
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedVerifier { pin }))
                .with_no_client_auth()
        } else {
            builder.with_no_client_auth()
        };
        config.alpn_protocols = vec![b"h2".to_vec()];
        if let Ok(path) = std::env::var("TLS_KEYLOG") {
            config.key_log = Arc::new(FileKeyLog {
                path: std::path::PathBuf::from(path),
            });
        }
        Ok(config)
    }
}

/// Writes TLS secrets to the path named by `TLS_KEYLOG`, NSS key-log format
/// (spec §6.3).
struct FileKeyLog {
    path: std::path::PathBuf,
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        use std::io::Write;
        let Ok(mut f) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        else {
            return;
        };
        let _ = writeln!(
            f,
            "{label} {} {}",
            hex_encode(client_random),
            hex_encode(secret)
        );
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug)]
struct PinnedVerifier {
    pin: [u8; 32],
}

impl rustls::client::danger::ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        check_pubkey_pin(end_entity.as_ref(), &self.pin)
            .map(|_| rustls::client::danger::ServerCertVerified::assertion())
            .map_err(|_| rustls::Error::General("pinned public key mismatch".to_string()))
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
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

/// Parses the leaf certificate and compares its ECDSA public key's SHA-256
/// fingerprint against `pinned` (spec §4.E TLS section, §6.3 `PEER_PUBKEY_FP`).
fn check_pubkey_pin(der: &[u8], pinned: &[u8; 32]) -> Result<(), ConnectError> {
    use sha2::{Digest, Sha256};
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| ConnectError::CryptoKeyParse(e.to_string()))?;
    let spki = cert.public_key();
    if spki.algorithm.algorithm != x509_parser::oid_registry::OID_KEY_TYPE_EC_PUBLIC_KEY {
        return Err(ConnectError::CryptoKeyParse(
            "peer certificate key is not ECDSA".to_string(),
        ));
    }
    let digest = Sha256::digest(spki.subject_public_key.as_ref());
    if digest.as_slice() == pinned {
        Ok(())
    } else {
        Err(ConnectError::TlsPinMismatch)
    }
}

async fn flush_egress(
    noize: &NoizeUdpSocket,
    conn: &mut quiche::Connection,
    out: &mut [u8],
) -> Result<(), ConnectError> {
    loop {
        match conn.send(out) {
            Ok((len, send_info)) => {
                noize.send_to(&out[..len], send_info.to).await?;
            }
            Err(quiche::Error::Done) => return Ok(()),
            Err(e) => return Err(ConnectError::Quiche(e)),
        }
    }
}

fn spawn_h3_pump(
    noize: Arc<NoizeUdpSocket>,
    conn: Arc<AsyncMutex<(quiche::Connection, quiche::h3::Connection)>>,
    stream_id: u64,
    tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        let mut out = [0u8; QUIC_INITIAL_PACKET_SIZE];
        while !closed.load(Ordering::SeqCst) {
            let mut guard = conn.lock().await;
            let (quic_conn, h3_conn) = &mut *guard;
            loop {
                match quic_conn.send(&mut out) {
                    Ok((len, send_info)) => {
                        if noize.send_to(&out[..len], send_info.to).await.is_err() {
                            return;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(_) => return,
                }
            }
            loop {
                match h3_conn.poll(quic_conn) {
                    Ok((id, quiche::h3::Event::Data)) if id == stream_id => {
                        let mut chunk = vec![0u8; 4096];
                        loop {
                            match h3_conn.recv_body(quic_conn, id, &mut chunk) {
                                Ok(n) => decode_and_forward_capsules(&chunk[..n], &tx).await,
                                Err(quiche::h3::Error::Done) => break,
                                Err(_) => break,
                            }
                        }
                    }
                    Ok((id, quiche::h3::Event::Finished)) if id == stream_id => {
                        drop(guard);
                        return;
                    }
                    Ok(_) => continue,
                    Err(quiche::h3::Error::Done) => break,
                    Err(_) => return,
                }
            }
            drop(guard);
            let timeout = Duration::from_millis(50);
            let mut scratch = [0u8; 65535];
            if let Ok(Ok((n, from))) = tokio::time::timeout(timeout, noize.recv_from(&mut scratch)).await {
                let mut guard = conn.lock().await;
                let recv_info = quiche::RecvInfo { from, to: from };
                let _ = guard.0.recv(&mut scratch[..n], recv_info);
            }
        }
    });
}

async fn decode_and_forward_capsules(mut data: &[u8], tx: &mpsc::Sender<Vec<u8>>) {
    while !data.is_empty() {
        match capsule::decode(data) {
            Ok((cap, consumed)) => {
                CAPSULES_READ.inc();
                if cap.capsule_type == CAPSULE_TYPE_DATAGRAM {
                    // drop-newest-on-full: never block the read loop on a
                    // stalled consumer.
                    let _ = tx.try_send(cap.payload);
                }
                data = &data[consumed..];
            }
            Err(_) => break,
        }
    }
}

fn spawn_h2_pump(
    body: Arc<AsyncMutex<h2::RecvStream>>,
    tx: mpsc::Sender<Vec<u8>>,
    closed: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        let mut pending = Vec::new();
        loop {
            if closed.load(Ordering::SeqCst) {
                return;
            }
            let mut body = body.lock().await;
            match body.data().await {
                Some(Ok(chunk)) => {
                    let _ = body.flow_control().release_capacity(chunk.len());
                    drop(body);
                    pending.extend_from_slice(&chunk);
                    let mut offset = 0;
                    while offset < pending.len() {
                        match capsule::decode(&pending[offset..]) {
                            Ok((cap, consumed)) => {
                                CAPSULES_READ.inc();
                                if cap.capsule_type == CAPSULE_TYPE_DATAGRAM {
                                    let _ = tx.try_send(cap.payload);
                                }
                                offset += consumed;
                            }
                            Err(_) => break,
                        }
                    }
                    pending.drain(..offset);
                }
                Some(Err(_)) | None => return,
            }
        }
    });
}

struct H3Writer {
    conn: Arc<AsyncMutex<(quiche::Connection, quiche::h3::Connection)>>,
    stream_id: u64,
    noize: Arc<NoizeUdpSocket>,
}

#[async_trait::async_trait]
impl PacketWriter for H3Writer {
    async fn write_packet(&self, pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
        let encoded = capsule::encode(CAPSULE_TYPE_DATAGRAM, pkt)?;
        let mut guard = self.conn.lock().await;
        let (quic_conn, h3_conn) = &mut *guard;
        h3_conn
            .send_body(quic_conn, self.stream_id, &encoded, false)
            .map_err(ConnectError::H3)?;
        CAPSULES_WRITTEN.inc();
        let mut out = [0u8; QUIC_INITIAL_PACKET_SIZE];
        loop {
            match quic_conn.send(&mut out) {
                Ok((len, send_info)) => {
                    self.noize.send_to(&out[..len], send_info.to).await?;
                }
                Err(quiche::Error::Done) => break,
                Err(e) => return Err(ConnectError::Quiche(e)),
            }
        }
        // ICMP piggyback is delivered as its own DATAGRAM capsule on the
        // read side, not inline with the write; callers drain it via
        // `ConnectIpSession::read_packet`.
        Ok(None)
    }

    async fn close(&self) {
        let mut guard = self.conn.lock().await;
        let _ = guard.0.close(true, 0x00, b"closing");
    }
}

struct H2Writer {
    send_stream: AsyncMutex<h2::SendStream<bytes::Bytes>>,
}

#[async_trait::async_trait]
impl PacketWriter for H2Writer {
    async fn write_packet(&self, pkt: &[u8]) -> Result<Option<Vec<u8>>, ConnectError> {
        let encoded = capsule::encode(CAPSULE_TYPE_DATAGRAM, pkt)?;
        let mut stream = self.send_stream.lock().await;
        stream
            .send_data(bytes::Bytes::from(encoded), false)
            .map_err(ConnectError::H2)?;
        CAPSULES_WRITTEN.inc();
        Ok(None)
    }

    async fn close(&self) {
        let mut stream = self.send_stream.lock().await;
        let _ = stream.send_data(bytes::Bytes::new(), true);
    }
}

impl From<capsule::CapsuleError> for ConnectError {
    fn from(e: capsule::CapsuleError) -> Self {
        ConnectError::InternalBug(format!("capsule encode/decode: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_template_bracketing_for_ipv6() {
        let out = expand_uri_template("/ip/{target_host}/{target_port}", "2606:4700::1", 443);
        assert_eq!(out, "/ip/[2606:4700::1]/443");
    }

    #[test]
    fn uri_template_leaves_ipv4_unbracketed() {
        let out = expand_uri_template("/ip/{target_host}/{target_port}", "10.0.0.1", 443);
        assert_eq!(out, "/ip/10.0.0.1/443");
    }

    fn self_signed_ecdsa_der() -> Vec<u8> {
        let cert = rcgen::generate_simple_self_signed(vec!["example.com".to_string()])
            .expect("self-signed cert generation");
        cert.cert.der().as_ref().to_vec()
    }

    #[test]
    fn pubkey_pin_matches_the_leaf_certificate() {
        use sha2::{Digest, Sha256};
        let der = self_signed_ecdsa_der();
        let (_, parsed) = x509_parser::parse_x509_certificate(&der).unwrap();
        let spki = parsed.public_key();
        let mut pin = [0u8; 32];
        pin.copy_from_slice(&Sha256::digest(spki.subject_public_key.as_ref()));

        assert!(check_pubkey_pin(&der, &pin).is_ok());
    }

    #[test]
    fn pubkey_pin_rejects_a_mismatched_fingerprint() {
        let der = self_signed_ecdsa_der();
        let wrong_pin = [0xAB; 32];
        let err = check_pubkey_pin(&der, &wrong_pin).unwrap_err();
        assert!(matches!(err, ConnectError::TlsPinMismatch));
    }
}
