use core::{error::Error, net::IpAddr, num::NonZero, str::FromStr, time::Duration};
use std::{collections::HashMap, fs, path::Path};

use http::{uri::Scheme, HeaderMap, HeaderName, HeaderValue, Uri};

use crate::cmd::Cmd;

/// Immutable run parameters, assembled once at startup.
///
/// Shared by reference across all workers and the lifecycle manager; never
/// mutated after construction.
#[derive(Debug)]
pub struct Config {
    /// Number of download workers.
    pub concurrency: NonZero<usize>,
    /// Time to run before stopping on its own, if bounded.
    pub timeout: Option<Duration>,
    /// Reuse connections between requests.
    pub keep_alive: bool,
    /// Fixed User-Agent header. A random one is chosen per request when
    /// absent.
    pub user_agent: Option<HeaderValue>,
    /// Headers applied to every request, overwriting same-named ones.
    pub headers: HeaderMap,
    /// Forced "host:port" to IP mappings, bypassing name resolution for
    /// exact matches.
    pub resolve: HashMap<String, IpAddr>,
    /// Download targets, requested endlessly in declared order.
    pub urls: Vec<Uri>,
}

impl TryFrom<Cmd> for Config {
    type Error = Box<dyn Error>;

    /// Malformed entries of any kind abort the conversion: this front-end
    /// fails fast instead of skipping bad headers, resolve rules or URLs.
    fn try_from(v: Cmd) -> Result<Self, Self::Error> {
        let Cmd {
            urls,
            concurrency,
            timeout,
            keep_alive,
            user_agent,
            headers,
            resolve,
            file,
            ..
        } = v;

        let urls = if urls.is_empty() {
            match &file {
                Some(path) => load_urls(path)?,
                None => Vec::new(),
            }
        } else {
            urls
        };
        if urls.is_empty() {
            return Err("at least one URL is required".into());
        }
        let urls = urls.iter().map(|v| parse_url(v)).collect::<Result<Vec<Uri>, _>>()?;

        let user_agent = match user_agent {
            Some(v) => Some(HeaderValue::from_str(&v).map_err(|err| format!("invalid user agent: {err}"))?),
            None => None,
        };

        let mut header_map = HeaderMap::new();
        for header in &headers {
            let (name, value) = parse_header(header)?;
            header_map.insert(name, value);
        }

        let mut resolve_map = HashMap::new();
        for rule in &resolve {
            let (key, ip) = parse_resolve(rule)?;
            resolve_map.insert(key, ip);
        }

        let m = Self {
            concurrency,
            timeout: match timeout {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
            keep_alive,
            user_agent,
            headers: header_map,
            resolve: resolve_map,
            urls,
        };

        Ok(m)
    }
}

/// Loads a newline-delimited URL list from the given path.
fn load_urls(path: &Path) -> Result<Vec<String>, Box<dyn Error>> {
    let data = fs::read_to_string(path).map_err(|err| format!("failed to read '{}': {err}", path.display()))?;

    Ok(filter_urls(&data))
}

/// Drops blank lines and '#' comments, trimming surrounding whitespace.
fn filter_urls(data: &str) -> Vec<String> {
    data.lines()
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.starts_with('#'))
        .map(str::to_owned)
        .collect()
}

fn parse_url(v: &str) -> Result<Uri, Box<dyn Error>> {
    let uri: Uri = v.parse().map_err(|err| format!("invalid URL '{v}': {err}"))?;

    match uri.scheme() {
        Some(scheme) if *scheme == Scheme::HTTP || *scheme == Scheme::HTTPS => {}
        _ => return Err(format!("invalid URL '{v}': only http and https are supported").into()),
    }
    if uri.host().is_none() {
        return Err(format!("invalid URL '{v}': missing host").into());
    }

    Ok(uri)
}

/// Parses a "Key: Value" header override.
fn parse_header(v: &str) -> Result<(HeaderName, HeaderValue), Box<dyn Error>> {
    let (name, value) = v
        .split_once(':')
        .ok_or_else(|| format!("invalid header '{v}': expected 'Key: Value'"))?;

    let name = HeaderName::from_str(name.trim()).map_err(|err| format!("invalid header '{v}': {err}"))?;
    let value = HeaderValue::from_str(value.trim()).map_err(|err| format!("invalid header '{v}': {err}"))?;

    Ok((name, value))
}

/// Parses a "host:port:ip" or "host::ip" resolve rule.
///
/// An empty port defaults to 80. The IP segment may itself contain colons
/// for IPv6 literals, which is why the rule is split at most twice.
fn parse_resolve(v: &str) -> Result<(String, IpAddr), Box<dyn Error>> {
    let mut parts = v.splitn(3, ':');
    let (host, port, ip) = match (parts.next(), parts.next(), parts.next()) {
        (Some(host), Some(port), Some(ip)) => (host, port, ip),
        _ => return Err(format!("invalid resolve rule '{v}': expected 'host:port:ip' or 'host::ip'").into()),
    };

    if host.is_empty() {
        return Err(format!("invalid resolve rule '{v}': empty host").into());
    }
    let port: u16 = match port {
        "" => 80,
        port => port.parse().map_err(|err| format!("invalid resolve rule '{v}': bad port: {err}"))?,
    };
    let ip: IpAddr = ip.parse().map_err(|err| format!("invalid resolve rule '{v}': bad IP: {err}"))?;

    Ok((format!("{host}:{port}"), ip))
}
