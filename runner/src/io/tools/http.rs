//! Network tools: `http_get` and `download_file`.
//!
//! Destinations are checked before connecting and again on every redirect.
//! Requests bypass system proxies so the address we vet is the address we
//! connect to.

use std::fs::{self, OpenOptions};
use std::io::{self, Read};
use std::net::{IpAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

use reqwest::blocking::{Client, Response};
use reqwest::redirect;
use tracing::{debug, instrument};
use url::{Host, Url};

use super::files::{check_size, prepare_target};
use super::{ToolContext, ToolError, ToolHandler, required};
use crate::core::catalog::ToolName;
use crate::core::text::truncate_utf8;
use crate::core::types::Step;

const MAX_REDIRECTS: usize = 5;

pub struct HttpGet;
pub struct DownloadFile;

impl ToolHandler for HttpGet {
    fn name(&self) -> ToolName {
        ToolName::HttpGet
    }

    #[instrument(skip_all, fields(tool = "http_get"))]
    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let url = check_url(required(step, "url")?, ctx.limits.block_internal_ips)?;
        let response = fetch(ctx, url)?;
        let limit = ctx.limits.file_bytes;
        let mut body = Vec::new();
        response
            .take(limit + 1)
            .read_to_end(&mut body)
            .map_err(|err| ToolError::io("read response body", err))?;
        let overflow = body.len() as u64 > limit;
        body.truncate(limit as usize);
        let text = String::from_utf8_lossy(&body);
        let limit = limit as usize;
        let marker = format!("\n...[truncated at {limit} bytes]");
        if overflow && marker.len() < limit {
            let head = truncate_utf8(&text, limit - marker.len());
            return Ok(format!("{head}{marker}"));
        }
        Ok(truncate_utf8(&text, limit).to_string())
    }
}

impl ToolHandler for DownloadFile {
    fn name(&self) -> ToolName {
        ToolName::DownloadFile
    }

    #[instrument(skip_all, fields(tool = "download_file"))]
    fn run(&self, step: &Step, ctx: &ToolContext) -> Result<String, ToolError> {
        let url = check_url(required(step, "url")?, ctx.limits.block_internal_ips)?;
        let input = required(step, "path")?;
        let limit = ctx.limits.download_bytes;
        ctx.guard.safe_path(input)?;

        let response = fetch(ctx, url)?;
        if let Some(advertised) = response.content_length() {
            check_size("advertised download", advertised, limit)?;
        }

        ctx.ensure_active()?;
        let target = prepare_target(ctx, input)?;
        let mut options = OpenOptions::new();
        options.write(true).create(true);
        let (mut file, path) = ctx.guard.open_verified(input, &options).map_err(ToolError::from)?;
        let written = file
            .set_len(0)
            .and_then(|()| io::copy(&mut response.take(limit + 1), &mut file))
            .map_err(|err| ToolError::io(format!("write {}", path.display()), err))
            .and_then(|written| check_size("download", written, limit).map(|()| written))
            .and_then(|_| {
                let on_disk = fs::metadata(&path)
                    .map_err(|err| ToolError::io(format!("stat {}", path.display()), err))?
                    .len();
                check_size("downloaded file", on_disk, limit).map(|()| on_disk)
            })
            .and_then(|bytes| ctx.ensure_active().map(|()| bytes));
        drop(file);

        match written {
            Ok(bytes) => Ok(format!(
                "downloaded {bytes} bytes to {}",
                ctx.guard.display(&target)
            )),
            Err(err) => {
                remove_partial(&path);
                Err(err)
            }
        }
    }
}

fn remove_partial(path: &Path) {
    if let Err(err) = fs::remove_file(path)
        && err.kind() != io::ErrorKind::NotFound
    {
        debug!(path = %path.display(), err = %err, "could not remove partial download");
    }
}

fn fetch(ctx: &ToolContext, url: Url) -> Result<Response, ToolError> {
    let client = build_client(ctx.limits.network_timeout, ctx.limits.block_internal_ips)?;
    let response = client
        .get(url.clone())
        .send()
        .map_err(|err| ToolError::Failed(format!("GET {url}: {err}")))?;
    let status = response.status();
    if !status.is_success() {
        return Err(ToolError::Failed(format!("GET {url}: HTTP {status}")));
    }
    Ok(response)
}

fn build_client(timeout: Duration, block_internal: bool) -> Result<Client, ToolError> {
    let policy = redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error(format!("more than {MAX_REDIRECTS} redirects"));
        }
        match check_url(attempt.url().as_str(), block_internal) {
            Ok(_) => attempt.follow(),
            Err(err) => attempt.error(err.to_string()),
        }
    });
    Client::builder()
        .timeout(timeout)
        .redirect(policy)
        .no_proxy()
        .build()
        .map_err(|err| ToolError::Failed(format!("build http client: {err}")))
}

/// Parse `raw` and refuse non-http schemes and, when `block_internal` is set,
/// hosts that are or resolve to internal addresses.
pub(crate) fn check_url(raw: &str, block_internal: bool) -> Result<Url, ToolError> {
    let url = Url::parse(raw.trim()).map_err(|err| ToolError::InvalidParam {
        name: "url",
        reason: format!("{raw:?}: {err}"),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ToolError::Blocked(format!(
            "scheme '{}' is not allowed, use http or https",
            url.scheme()
        )));
    }
    let host = url.host().ok_or_else(|| ToolError::InvalidParam {
        name: "url",
        reason: format!("{raw:?} has no host"),
    })?;
    if !block_internal {
        return Ok(url);
    }

    let addresses: Vec<IpAddr> = match host {
        Host::Ipv4(ip) => vec![IpAddr::V4(ip)],
        Host::Ipv6(ip) => vec![IpAddr::V6(ip)],
        Host::Domain(domain) => {
            let lowered = domain.to_ascii_lowercase();
            if lowered == "localhost" || lowered.ends_with(".localhost") {
                return Err(ToolError::Blocked(format!("{domain} is an internal host")));
            }
            let port = url.port_or_known_default().unwrap_or(80);
            (lowered.as_str(), port)
                .to_socket_addrs()
                .map_err(|err| ToolError::Failed(format!("resolve {domain}: {err}")))?
                .map(|addr| addr.ip())
                .collect()
        }
    };
    if let Some(ip) = addresses.iter().find(|ip| is_internal_ip(**ip)) {
        return Err(ToolError::Blocked(format!(
            "{} resolves to internal address {ip}",
            url.host_str().unwrap_or_default()
        )));
    }
    Ok(url)
}

pub(crate) fn is_internal_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, ..] = v4.octets();
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
                // Carrier-grade NAT (100.64.0.0/10)
                || (a == 100 && (b & 0xc0) == 64)
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                // Unique-local (fc00::/7)
                || (first & 0xfe00) == 0xfc00
                // Link-local (fe80::/10)
                || (first & 0xffc0) == 0xfe80
                || v6.to_ipv4_mapped().is_some_and(|v4| is_internal_ip(IpAddr::V4(v4)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Param;
    use crate::io::sandbox::PathGuard;
    use crate::io::tools::ToolLimits;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::thread;

    fn step(tool: &str, params: &[(&str, &str)]) -> Step {
        Step {
            tool: tool.to_string(),
            reasoning: "test".to_string(),
            parameters: params
                .iter()
                .map(|(name, value)| Param {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
        }
    }

    fn ctx(limits: ToolLimits) -> (tempfile::TempDir, ToolContext) {
        let temp = tempfile::tempdir().expect("tempdir");
        let guard = PathGuard::new(temp.path()).expect("guard");
        (temp, ToolContext::new(guard, limits))
    }

    /// Serve one HTTP response on localhost and return its base URL.
    fn serve_once(body: Vec<u8>, advertise_length: bool) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut reader = BufReader::new(stream.try_clone().expect("clone"));
            let mut line = String::new();
            while reader.read_line(&mut line).expect("read") > 0 && line != "\r\n" {
                line.clear();
            }
            let mut stream = stream;
            let mut head = String::from("HTTP/1.1 200 OK\r\nConnection: close\r\n");
            if advertise_length {
                head.push_str(&format!("Content-Length: {}\r\n", body.len()));
            }
            head.push_str("\r\n");
            let _ = stream.write_all(head.as_bytes());
            let _ = stream.write_all(&body);
        });
        format!("http://{addr}/file")
    }

    fn open_network() -> ToolLimits {
        ToolLimits {
            block_internal_ips: false,
            download_bytes: 64,
            file_bytes: 48,
            ..ToolLimits::default()
        }
    }

    #[test]
    fn internal_addresses_are_recognized() {
        for ip in ["127.0.0.1", "10.1.2.3", "192.168.0.1", "172.16.5.4", "169.254.1.1", "100.64.0.1", "::1", "fd00::1", "fe80::1", "::ffff:10.0.0.1"] {
            assert!(is_internal_ip(ip.parse().expect("ip")), "{ip}");
        }
        for ip in ["93.184.216.34", "2606:4700::1111", "100.128.0.1"] {
            assert!(!is_internal_ip(ip.parse().expect("ip")), "{ip}");
        }
    }

    #[test]
    fn check_url_blocks_internal_and_non_http() {
        assert!(matches!(check_url("http://127.0.0.1:8080/", true), Err(ToolError::Blocked(_))));
        assert!(matches!(check_url("http://localhost/", true), Err(ToolError::Blocked(_))));
        assert!(matches!(check_url("http://[::1]/", true), Err(ToolError::Blocked(_))));
        assert!(matches!(check_url("file:///etc/passwd", false), Err(ToolError::Blocked(_))));
        assert!(matches!(check_url("not a url", false), Err(ToolError::InvalidParam { .. })));
        assert!(check_url("http://127.0.0.1:8080/", false).is_ok());
    }

    #[test]
    fn http_get_refuses_loopback_when_blocking() {
        let (_temp, ctx) = ctx(ToolLimits::default());
        let err = HttpGet
            .run(&step("http_get", &[("url", "http://127.0.0.1:9/")]), &ctx)
            .expect_err("blocked");
        assert!(matches!(err, ToolError::Blocked(_)));
    }

    #[test]
    fn http_get_truncates_body() {
        let url = serve_once(b"0123456789".repeat(10), true);
        let (_temp, ctx) = ctx(open_network());
        let output = HttpGet
            .run(&step("http_get", &[("url", &url)]), &ctx)
            .expect("fetch");
        assert!(output.len() <= 48, "{} bytes", output.len());
        assert!(output.starts_with("012345678901234567890\n"));
        assert!(output.ends_with("[truncated at 48 bytes]"));
    }

    #[test]
    fn download_within_cap_is_written() {
        let url = serve_once(vec![b'a'; 64], true);
        let (temp, ctx) = ctx(open_network());
        let output = DownloadFile
            .run(&step("download_file", &[("url", &url), ("path", "data/a.bin")]), &ctx)
            .expect("download");
        assert_eq!(output, "downloaded 64 bytes to data/a.bin");
        assert_eq!(fs::read(temp.path().join("data/a.bin")).expect("read").len(), 64);
    }

    #[test]
    fn escaping_download_sends_no_request() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.set_nonblocking(true).expect("nonblocking");
        let url = format!("http://{}/x.bin", listener.local_addr().expect("addr"));
        let (_temp, ctx) = ctx(open_network());
        let err = DownloadFile
            .run(&step("download_file", &[("url", &url), ("path", "../x.bin")]), &ctx)
            .expect_err("escape");
        assert!(matches!(err, ToolError::Escape(_)));
        assert!(listener.accept().is_err(), "no connection expected");
    }

    #[test]
    fn download_over_advertised_cap_is_refused() {
        let url = serve_once(vec![b'a'; 65], true);
        let (temp, ctx) = ctx(open_network());
        let err = DownloadFile
            .run(&step("download_file", &[("url", &url), ("path", "big.bin")]), &ctx)
            .expect_err("too big");
        assert!(matches!(err, ToolError::SizeLimit { what: "advertised download", .. }));
        assert!(!temp.path().join("big.bin").exists());
    }

    #[test]
    fn download_over_streamed_cap_removes_partial_file() {
        let url = serve_once(vec![b'a'; 100], false);
        let (temp, ctx) = ctx(open_network());
        let err = DownloadFile
            .run(&step("download_file", &[("url", &url), ("path", "big.bin")]), &ctx)
            .expect_err("too big");
        assert!(matches!(err, ToolError::SizeLimit { what: "download", .. }));
        assert!(!temp.path().join("big.bin").exists());
    }
}
