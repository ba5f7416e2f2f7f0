use core::{
    net::{IpAddr, SocketAddr},
    time::Duration,
};
use std::{collections::HashMap, env, time::Instant};

use anyhow::{anyhow, Error};
use bytes::Bytes;
use http::{uri::Scheme, Request, Response, Uri};
use http_body_util::Empty;
use hyper::{
    body::Incoming,
    client::conn::http1::{self, SendRequest},
};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    time,
};
use tokio_native_tls::TlsConnector;

use self::io::TokioIo;
use crate::cfg::Config;

mod io;

/// Upper bound on establishing a connection, TLS handshake included.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upper bound on waiting for response headers after a request is sent.
const HEADER_TIMEOUT: Duration = Duration::from_secs(10);
/// Idle connections older than this are dropped instead of being reused.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection establishment, shared by all workers.
///
/// Holds the immutable transport settings: proxy endpoints taken from the
/// process environment, forced host:port resolution and a TLS connector
/// with certificate verification disabled, so self-signed and otherwise
/// noncompliant endpoints still serve traffic.
pub struct HttpClient {
    keep_alive: bool,
    resolve: HashMap<String, IpAddr>,
    proxy: ProxySettings,
    tls: TlsConnector,
}

impl HttpClient {
    pub fn new(cfg: &Config) -> Result<Self, Error> {
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()?;

        if !cfg.resolve.is_empty() {
            log::info!("forced resolution enabled: {:?}", cfg.resolve);
        }

        let m = Self {
            keep_alive: cfg.keep_alive,
            resolve: cfg.resolve.clone(),
            proxy: ProxySettings::from_env(),
            tls: TlsConnector::from(tls),
        };

        Ok(m)
    }

    /// Whether finished connections may be reused.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Opens a connection to the target and performs the HTTP/1 handshake.
    ///
    /// The connection driver is spawned onto the current thread's local
    /// task set, so this must be called from within one.
    pub async fn connect(&self, target: &Target) -> Result<Connection, Error> {
        match time::timeout(CONNECT_TIMEOUT, self.do_connect(target)).await {
            Ok(v) => v,
            Err(..) => Err(anyhow!("connection to {}:{} timed out", target.host, target.port)),
        }
    }

    async fn do_connect(&self, target: &Target) -> Result<Connection, Error> {
        match self.proxy.lookup(target) {
            Some(proxy) => self.connect_via_proxy(target, proxy).await,
            None => self.connect_direct(target).await,
        }
    }

    async fn connect_direct(&self, target: &Target) -> Result<Connection, Error> {
        let stream = self.dial(&target.host, target.port).await?;

        let sender = match target.scheme {
            TargetScheme::Http => handshake(stream).await?,
            TargetScheme::Https => handshake(self.tls_wrap(&target.host, stream).await?).await?,
        };

        Ok(Connection::new(sender, false))
    }

    async fn connect_via_proxy(&self, target: &Target, proxy: &ProxyEndpoint) -> Result<Connection, Error> {
        let stream = self.dial(&proxy.host, proxy.port).await?;

        match target.scheme {
            // Plain HTTP traverses the proxy in absolute form.
            TargetScheme::Http => Ok(Connection::new(handshake(stream).await?, true)),
            // TLS is tunneled: CONNECT first, then handshake inside.
            TargetScheme::Https => {
                let stream = establish_tunnel(stream, &target.host, target.port).await?;
                let sender = handshake(self.tls_wrap(&target.host, stream).await?).await?;

                Ok(Connection::new(sender, false))
            }
        }
    }

    /// Opens a TCP connection, honoring forced resolution overrides for
    /// whatever address is being dialed.
    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream, Error> {
        let stream = match resolve_override(&self.resolve, host, port) {
            Some(addr) => TcpStream::connect(addr).await?,
            None => TcpStream::connect((host, port)).await?,
        };

        Ok(stream)
    }

    async fn tls_wrap(&self, host: &str, stream: TcpStream) -> Result<tokio_native_tls::TlsStream<TcpStream>, Error> {
        let stream = self.tls.connect(host, stream).await?;

        Ok(stream)
    }
}

/// A single established HTTP/1 connection.
pub struct Connection {
    sender: SendRequest<Empty<Bytes>>,
    /// Requests must carry the absolute URL, as a plain-HTTP proxy expects.
    absolute_form: bool,
    last_used: Instant,
}

impl Connection {
    fn new(sender: SendRequest<Empty<Bytes>>, absolute_form: bool) -> Self {
        Self {
            sender,
            absolute_form,
            last_used: Instant::now(),
        }
    }

    #[inline]
    pub fn absolute_form(&self) -> bool {
        self.absolute_form
    }

    /// Whether this connection can carry another request.
    #[inline]
    pub fn is_reusable(&self) -> bool {
        self.sender.is_ready() && self.last_used.elapsed() < IDLE_TIMEOUT
    }

    /// Sends a request, waiting at most [`HEADER_TIMEOUT`] for the response
    /// headers. The body transfer itself is unbounded.
    pub async fn send(&mut self, req: Request<Empty<Bytes>>) -> Result<Response<Incoming>, Error> {
        let resp = match time::timeout(HEADER_TIMEOUT, self.sender.send_request(req)).await {
            Ok(v) => v?,
            Err(..) => return Err(anyhow!("no response headers within {HEADER_TIMEOUT:?}")),
        };
        self.last_used = Instant::now();

        Ok(resp)
    }
}

/// Scheme, host and port extracted from a target URL.
///
/// The host is stored without IPv6 brackets so it can be dialed and matched
/// against resolve overrides directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub scheme: TargetScheme,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetScheme {
    Http,
    Https,
}

impl Target {
    pub fn from_uri(uri: &Uri) -> Result<Self, Error> {
        let scheme = match uri.scheme() {
            Some(v) if *v == Scheme::HTTP => TargetScheme::Http,
            Some(v) if *v == Scheme::HTTPS => TargetScheme::Https,
            _ => return Err(anyhow!("unsupported scheme in '{uri}'")),
        };
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("missing host in '{uri}'"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = uri.port_u16().unwrap_or(match scheme {
            TargetScheme::Http => 80,
            TargetScheme::Https => 443,
        });

        let m = Self { scheme, host, port };

        Ok(m)
    }
}

/// Returns the substitute address for an exact "host:port" match.
///
/// Only the host part is replaced, the original port is kept; no wildcard
/// or suffix matching is attempted.
fn resolve_override(overrides: &HashMap<String, IpAddr>, host: &str, port: u16) -> Option<SocketAddr> {
    let ip = overrides.get(&format!("{host}:{port}"))?;

    Some(SocketAddr::new(*ip, port))
}

/// Performs the HTTP/1 handshake and spawns the connection driver onto the
/// current thread's local task set.
async fn handshake<T>(stream: T) -> Result<SendRequest<Empty<Bytes>>, Error>
where
    T: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::task::spawn_local(async move {
        if let Err(err) = conn.await {
            log::debug!("connection terminated: {err}");
        }
    });

    Ok(sender)
}

/// Issues a CONNECT request and waits for the proxy to open the tunnel.
async fn establish_tunnel(mut stream: TcpStream, host: &str, port: u16) -> Result<TcpStream, Error> {
    let req = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n");
    stream.write_all(req.as_bytes()).await?;

    let mut buf = [0u8; 8192];
    let mut read = 0;
    loop {
        if read == buf.len() {
            return Err(anyhow!("proxy response exceeds {} bytes", buf.len()));
        }
        let n = stream.read(&mut buf[read..]).await?;
        if n == 0 {
            return Err(anyhow!("proxy closed the connection during CONNECT"));
        }
        read += n;

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut resp = httparse::Response::new(&mut headers);
        if resp.parse(&buf[..read])?.is_complete() {
            return match resp.code {
                Some(200) => Ok(stream),
                code => Err(anyhow!("proxy refused CONNECT: {code:?}")),
            };
        }
    }
}

/// Proxy endpoints taken from the process environment, selected by target
/// scheme the way curl reads them: HTTP_PROXY and HTTPS_PROXY (upper- or
/// lowercase), with NO_PROXY listing hosts that connect directly.
#[derive(Debug, Default)]
struct ProxySettings {
    http: Option<ProxyEndpoint>,
    https: Option<ProxyEndpoint>,
    no_proxy: Vec<String>,
}

#[derive(Debug)]
struct ProxyEndpoint {
    host: String,
    port: u16,
}

impl ProxySettings {
    fn from_env() -> Self {
        Self::new(env_var("HTTP_PROXY"), env_var("HTTPS_PROXY"), env_var("NO_PROXY"))
    }

    fn new(http: Option<String>, https: Option<String>, no_proxy: Option<String>) -> Self {
        let no_proxy = no_proxy
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|v| !v.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            http: http.as_deref().and_then(parse_proxy),
            https: https.as_deref().and_then(parse_proxy),
            no_proxy,
        }
    }

    fn lookup(&self, target: &Target) -> Option<&ProxyEndpoint> {
        if self.excluded(&target.host) {
            return None;
        }

        match target.scheme {
            TargetScheme::Http => self.http.as_ref(),
            TargetScheme::Https => self.https.as_ref(),
        }
    }

    /// Whether NO_PROXY excludes the host: "*" excludes everything, other
    /// entries match the exact host or any subdomain of it.
    fn excluded(&self, host: &str) -> bool {
        self.no_proxy.iter().any(|v| {
            v == "*"
                || host == v
                || host
                    .strip_suffix(v.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.') || v.starts_with('.'))
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    env::var(name)
        .or_else(|_| env::var(name.to_lowercase()))
        .ok()
        .filter(|v| !v.is_empty())
}

/// Parses a proxy address: "http://host:port", "host:port" or "http://host"
/// (the port defaults to 80). Anything else is ignored.
fn parse_proxy(v: &str) -> Option<ProxyEndpoint> {
    let uri: Uri = v.parse().ok()?;
    let host = uri.host()?.to_string();
    let port = uri.port_u16().unwrap_or(80);

    Some(ProxyEndpoint { host, port })
}
