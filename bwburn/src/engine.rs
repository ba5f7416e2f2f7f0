use core::{
    num::NonZero,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};
use std::{collections::HashMap, sync::Arc, thread};

use anyhow::Error;
use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Uri};
use http_body_util::{BodyExt, Empty};
use tokio::task::LocalSet;

use crate::{
    cfg::Config,
    client::{Connection, HttpClient, Target},
    stat::TrafficStat,
    ua, UrlFeed,
};

/// The perpetual download engine.
///
/// A fixed pool of workers cycles the URL list until the stop flag is
/// cleared. Workers are spread over however many threads make sense for
/// the configured concurrency, each thread driving its share of workers on
/// a local task set.
pub struct Engine {
    cfg: Arc<Config>,
    client: Arc<HttpClient>,
    stat: Arc<TrafficStat>,
    is_running: Arc<AtomicBool>,
}

impl Engine {
    pub fn new(cfg: Arc<Config>, client: Arc<HttpClient>, stat: Arc<TrafficStat>, is_running: Arc<AtomicBool>) -> Self {
        Self {
            cfg,
            client,
            stat,
            is_running,
        }
    }

    /// Spawns the worker threads and blocks until every worker has observed
    /// the cleared stop flag.
    pub fn run(self) -> Result<(), Error> {
        let num_workers = self.cfg.concurrency.get();
        let num_threads = num_workers.min(
            thread::available_parallelism()
                .unwrap_or(NonZero::<usize>::MIN)
                .get(),
        );
        let feed = Arc::new(UrlFeed::new(self.cfg.urls.clone()));

        // Spread the workers over the threads, earlier threads taking one
        // extra when the split is uneven.
        let mut counts = vec![0; num_threads];
        for idx in 0..num_workers {
            counts[idx % num_threads] += 1;
        }

        let mut threads = Vec::with_capacity(num_threads);
        for (idx, count) in counts.into_iter().enumerate() {
            let cfg = self.cfg.clone();
            let client = self.client.clone();
            let stat = self.stat.clone();
            let feed = feed.clone();
            let is_running = self.is_running.clone();

            let thread = thread::Builder::new()
                .name(format!("bwburn:{idx:02}"))
                .spawn(move || run_workers(count, cfg, client, stat, feed, is_running))?;

            threads.push(thread);
        }

        for thread in threads {
            thread.join().expect("no self join")?;
        }

        Ok(())
    }
}

/// Runs `count` download workers on a current-thread runtime.
fn run_workers(
    count: usize,
    cfg: Arc<Config>,
    client: Arc<HttpClient>,
    stat: Arc<TrafficStat>,
    feed: Arc<UrlFeed>,
    is_running: Arc<AtomicBool>,
) -> Result<(), Error> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()?;

    let local = LocalSet::new();
    for _ in 0..count {
        let worker = Worker::new(
            cfg.clone(),
            client.clone(),
            stat.clone(),
            feed.clone(),
            is_running.clone(),
        );

        local.spawn_local(worker.run());
    }

    runtime.block_on(local);

    Ok(())
}

/// A single download worker.
///
/// Repeats forever: claim the next URL, perform one full GET cycle and
/// account every body chunk. Any failure is logged and the worker simply
/// moves on; the cyclic feed brings the URL back on its next turn.
struct Worker {
    cfg: Arc<Config>,
    client: Arc<HttpClient>,
    stat: Arc<TrafficStat>,
    feed: Arc<UrlFeed>,
    is_running: Arc<AtomicBool>,
    /// Cached connections, one per target, reused only with keep-alive.
    conns: HashMap<Target, Connection>,
}

impl Worker {
    fn new(
        cfg: Arc<Config>,
        client: Arc<HttpClient>,
        stat: Arc<TrafficStat>,
        feed: Arc<UrlFeed>,
        is_running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cfg,
            client,
            stat,
            feed,
            is_running,
            conns: HashMap::new(),
        }
    }

    async fn run(mut self) {
        while self.is_running.load(Ordering::Relaxed) {
            let url = self.feed.next().clone();
            self.fetch(&url).await;
        }
    }

    /// One full request/response cycle against the given URL.
    async fn fetch(&mut self, url: &Uri) {
        let target = match Target::from_uri(url) {
            Ok(v) => v,
            Err(err) => {
                log::error!("invalid target '{url}': {err}");
                return;
            }
        };

        let mut conn = match self.checkout(&target).await {
            Ok(v) => v,
            Err(err) => {
                log::error!("failed to connect to {}:{}: {err}", target.host, target.port);
                return;
            }
        };

        let req = match self.build_request(url, conn.absolute_form()) {
            Ok(v) => v,
            Err(err) => {
                log::error!("failed to build request for '{url}': {err}");
                return;
            }
        };

        let resp = match conn.send(req).await {
            Ok(v) => v,
            Err(err) => {
                log::error!("request to '{url}' failed: {err}");
                return;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            log::warn!("non-2xx response: {status} from '{url}'");
        }

        // The body is drained to the end whatever the status: accounting
        // and connection reuse both need the full read.
        let mut body = resp.into_body();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        self.stat.on_recv(data.len() as u64);
                    }
                }
                Err(err) => {
                    log::error!("failed to read body from '{url}': {err}");
                    return;
                }
            }
        }

        self.checkin(target, conn);
    }

    /// Takes the cached connection for the target or opens a new one.
    async fn checkout(&mut self, target: &Target) -> Result<Connection, Error> {
        if let Some(conn) = self.conns.remove(target) {
            if conn.is_reusable() {
                return Ok(conn);
            }
        }

        self.client.connect(target).await
    }

    fn checkin(&mut self, target: Target, conn: Connection) {
        if self.client.keep_alive() && conn.is_reusable() {
            self.conns.insert(target, conn);
        }
    }

    fn build_request(&self, url: &Uri, absolute_form: bool) -> Result<Request<Empty<Bytes>>, Error> {
        let uri = if absolute_form { url.clone() } else { origin_form(url)? };

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(header::HOST, host_header(url))
            .body(Empty::new())?;

        let headers = req.headers_mut();
        match &self.cfg.user_agent {
            Some(v) => headers.insert(header::USER_AGENT, v.clone()),
            None => headers.insert(header::USER_AGENT, HeaderValue::from_static(ua::random())),
        };
        // Configured headers overwrite anything set so far.
        for (name, value) in &self.cfg.headers {
            headers.insert(name, value.clone());
        }

        Ok(req)
    }
}

/// Strips a URL down to its path and query, the request form sent on a
/// direct connection.
fn origin_form(url: &Uri) -> Result<Uri, Error> {
    let pq = url
        .path_and_query()
        .map(|v| v.as_str())
        .filter(|v| !v.is_empty())
        .unwrap_or("/");

    Ok(Uri::from_str(pq)?)
}

/// The Host header for the given URL: "host" or "host:port", IPv6 literals
/// bracketed.
fn host_header(url: &Uri) -> String {
    let host = url.host().unwrap_or_default();
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };

    match url.port_u16() {
        Some(port) => format!("{host}:{port}"),
        None => host,
    }
}

#[cfg(test)]
mod test {
    use core::{
        net::{IpAddr, Ipv4Addr, SocketAddr},
        sync::atomic::AtomicUsize,
        time::Duration,
    };
    use std::{
        io::{Read as _, Write as _},
        net::TcpListener,
        sync::mpsc,
        time::Instant,
    };

    use http::HeaderMap;

    use super::*;

    struct TestServer {
        addr: SocketAddr,
        reqs: mpsc::Receiver<String>,
        accepted: Arc<AtomicUsize>,
    }

    /// Serves the given response for every request, one handler thread per
    /// connection. Request heads are captured for assertions.
    fn serve(status: &'static str, body: Vec<u8>, keep_alive: bool) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        let accepted = Arc::new(AtomicUsize::new(0));

        let count = accepted.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { break };
                count.fetch_add(1, Ordering::SeqCst);

                let tx = tx.clone();
                let body = body.clone();
                thread::spawn(move || loop {
                    let mut head = Vec::new();
                    let mut byte = [0u8; 1];
                    loop {
                        match stream.read(&mut byte) {
                            Ok(0) | Err(..) => return,
                            Ok(..) => head.push(byte[0]),
                        }
                        if head.ends_with(b"\r\n\r\n") {
                            break;
                        }
                    }
                    let _ = tx.send(String::from_utf8_lossy(&head).into_owned());

                    let connection = if keep_alive { "keep-alive" } else { "close" };
                    let head = format!(
                        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: {connection}\r\n\r\n",
                        body.len()
                    );
                    if stream.write_all(head.as_bytes()).is_err() || stream.write_all(&body).is_err() {
                        return;
                    }
                    if !keep_alive {
                        return;
                    }
                });
            }
        });

        TestServer { addr, reqs: rx, accepted }
    }

    fn test_config(urls: Vec<Uri>) -> Config {
        Config {
            concurrency: NonZero::new(1).unwrap(),
            timeout: None,
            keep_alive: false,
            user_agent: None,
            headers: HeaderMap::new(),
            resolve: HashMap::new(),
            urls,
        }
    }

    /// Runs the engine until the condition holds (or 10s pass), then stops
    /// it via the shared flag and returns the final byte count.
    fn run_until<F>(cfg: Config, cond: F) -> u64
    where
        F: Fn(u64) -> bool,
    {
        let cfg = Arc::new(cfg);
        let stat = Arc::new(TrafficStat::default());
        let is_running = Arc::new(AtomicBool::new(true));
        let client = Arc::new(HttpClient::new(&cfg).unwrap());
        let engine = Engine::new(cfg, client, stat.clone(), is_running.clone());

        let handle = thread::spawn(move || engine.run());

        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond(stat.bytes_rx()) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        // The engine must still be alive: nothing stops it but the flag.
        assert!(!handle.is_finished());

        is_running.store(false, Ordering::SeqCst);
        handle.join().unwrap().unwrap();

        stat.bytes_rx()
    }

    #[test]
    fn test_downloads_and_counts_full_bodies() {
        let body = vec![b'x'; 64 * 1024];
        let len = body.len() as u64;
        let server = serve("200 OK", body, false);

        let url: Uri = format!("http://{}/payload", server.addr).parse().unwrap();
        let total = run_until(test_config(vec![url]), |n| n >= len);

        assert!(total >= len);
        // Every claimed URL was read to the end, never partially.
        assert_eq!(total % len, 0);
    }

    #[test]
    fn test_non_2xx_body_is_read_and_counted() {
        let body = vec![b'e'; 1024 * 1024];
        let len = body.len() as u64;
        let server = serve("500 Internal Server Error", body, false);

        let url: Uri = format!("http://{}/broken", server.addr).parse().unwrap();
        // Waiting for more than one body proves the worker kept going after
        // the failed status.
        let total = run_until(test_config(vec![url]), |n| n >= 2 * len);

        assert!(total >= 2 * len);
        assert_eq!(total % len, 0);
    }

    #[test]
    fn test_resolve_override_reaches_unresolvable_host() {
        let body = vec![b'r'; 16 * 1024];
        let len = body.len() as u64;
        let server = serve("200 OK", body, false);

        // The host cannot resolve through DNS; only the override connects.
        let url: Uri = format!("http://bwburn-probe.invalid:{}/", server.addr.port()).parse().unwrap();
        let mut cfg = test_config(vec![url]);
        cfg.resolve.insert(
            format!("bwburn-probe.invalid:{}", server.addr.port()),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
        );

        let total = run_until(cfg, |n| n >= len);

        assert!(total >= len);
    }

    #[test]
    fn test_header_precedence() {
        let body = vec![b'h'; 1024];
        let len = body.len() as u64;
        let server = serve("200 OK", body, false);

        let url: Uri = format!("http://{}/", server.addr).parse().unwrap();
        let mut cfg = test_config(vec![url]);
        cfg.user_agent = Some(HeaderValue::from_static("bwburn-fixed/1"));
        cfg.headers
            .insert("user-agent", HeaderValue::from_static("override-wins"));
        cfg.headers.insert("x-probe", HeaderValue::from_static("42"));

        run_until(cfg, |n| n >= len);

        let head = server.reqs.recv_timeout(Duration::from_secs(1)).unwrap();
        // The configured custom header overwrites the fixed User-Agent
        // instead of duplicating it.
        assert_eq!(head.matches("user-agent:").count(), 1);
        assert!(head.contains("user-agent: override-wins"));
        assert!(head.contains("x-probe: 42"));
    }

    #[test]
    fn test_user_agent_randomized_when_unset() {
        let body = vec![b'u'; 1024];
        let len = body.len() as u64;
        let server = serve("200 OK", body, false);

        let url: Uri = format!("http://{}/", server.addr).parse().unwrap();
        run_until(test_config(vec![url]), |n| n >= len);

        let head = server.reqs.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(head.matches("user-agent:").count(), 1);
        assert!(head.contains("user-agent: Mozilla/5.0"));
    }

    #[test]
    fn test_keep_alive_reuses_the_connection() {
        let body = vec![b'k'; 8 * 1024];
        let len = body.len() as u64;
        let server = serve("200 OK", body, true);

        let url: Uri = format!("http://{}/", server.addr).parse().unwrap();
        let mut cfg = test_config(vec![url]);
        cfg.keep_alive = true;

        let total = run_until(cfg, |n| n >= 3 * len);

        assert!(total >= 3 * len);
        assert_eq!(server.accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_no_keep_alive_reconnects_every_request() {
        let body = vec![b'c'; 8 * 1024];
        let len = body.len() as u64;
        let server = serve("200 OK", body, true);

        let url: Uri = format!("http://{}/", server.addr).parse().unwrap();
        let total = run_until(test_config(vec![url]), |n| n >= 3 * len);

        assert!(total >= 3 * len);
        assert!(server.accepted.load(Ordering::SeqCst) >= 3);
    }

    #[test]
    fn test_origin_form() {
        let url: Uri = "http://example.org/a/b?x=1".parse().unwrap();
        assert_eq!(origin_form(&url).unwrap().to_string(), "/a/b?x=1");

        let url: Uri = "http://example.org".parse().unwrap();
        assert_eq!(origin_form(&url).unwrap().to_string(), "/");
    }

    #[test]
    fn test_host_header() {
        assert_eq!(host_header(&"http://example.org/".parse().unwrap()), "example.org");
        assert_eq!(
            host_header(&"http://example.org:8080/".parse().unwrap()),
            "example.org:8080"
        );
        assert_eq!(
            host_header(&"http://[2001:db8::1]:8080/".parse().unwrap()),
            "[2001:db8::1]:8080"
        );
    }
}
