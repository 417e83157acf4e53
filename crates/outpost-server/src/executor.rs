//! The `http` action handler.
//!
//! Takes a fanned-out [`RequestSpec`], builds the outbound request, dials
//! through the source-IP router and DNS cache, executes with a total
//! deadline, and feeds the counters. Transport failures are returned to the
//! worker; HTTP error statuses are a successful transport and only show up
//! in the status buckets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{CONTENT_TYPE, HOST, USER_AGENT};
use http::{Method, Request};
use http_body_util::{BodyExt, Full, Limited};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use url::Url;

use outpost_metrics::{Counter, HostCounters, Registry};
use outpost_net::{Dialer, IpRouter, NetError};
use outpost_pool::Pool;

use crate::request::RequestSpec;

/// Total per-request deadline: handshake, request and response body read.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Response bodies are read up to this cap; larger responses fail the job.
const MAX_RESPONSE_BODY: usize = 256 * 1024;
/// How much of a 4xx response body makes it into the log.
const LOG_BODY_LIMIT: usize = 3000;
/// Sweep cadence for the per-host counter TTL.
const HOST_METRIC_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

const DEFAULT_USER_AGENT: &str = "outpost (https://github.com/outpost-proxy/outpost)";

enum TransportError {
    DialTimeout,
    Timeout,
    Other(anyhow::Error),
}

impl TransportError {
    fn is_timeout(&self) -> bool {
        matches!(self, TransportError::DialTimeout | TransportError::Timeout)
    }

    fn label(&self) -> String {
        match self {
            TransportError::DialTimeout => "dial timeout".to_string(),
            TransportError::Timeout => "timeout".to_string(),
            TransportError::Other(err) => format!("error: {err}"),
        }
    }
}

fn other(err: impl Into<anyhow::Error>) -> TransportError {
    TransportError::Other(err.into())
}

struct JobMetrics {
    requests_out: Arc<Counter>,
    s1xx: Arc<Counter>,
    s2xx: Arc<Counter>,
    s3xx: Arc<Counter>,
    s4xx: Arc<Counter>,
    s5xx: Arc<Counter>,
    timeouts: Arc<Counter>,
    errors: Arc<Counter>,
    timeouts_by_host: Arc<HostCounters>,
    errors_by_host: Arc<HostCounters>,
}

impl JobMetrics {
    fn new(registry: &Arc<Registry>) -> Self {
        Self {
            requests_out: registry.counter("http_requests"),
            s1xx: registry.counter(r#"http_status{code="1xx"}"#),
            s2xx: registry.counter(r#"http_status{code="2xx"}"#),
            s3xx: registry.counter(r#"http_status{code="3xx"}"#),
            s4xx: registry.counter(r#"http_status{code="4xx"}"#),
            s5xx: registry.counter(r#"http_status{code="5xx"}"#),
            timeouts: registry.counter("http_timeouts"),
            errors: registry.counter("http_error"),
            timeouts_by_host: HostCounters::new(registry.clone(), "http_timeouts_by_host"),
            errors_by_host: HostCounters::new(registry.clone(), "http_errors_by_host"),
        }
    }

    fn status_bucket(&self, code: u16) -> Option<&Arc<Counter>> {
        match code {
            500.. => Some(&self.s5xx),
            400.. => Some(&self.s4xx),
            300.. => Some(&self.s3xx),
            200.. => Some(&self.s2xx),
            100.. => Some(&self.s1xx),
            _ => None,
        }
    }
}

/// Executes `http` jobs from the pool.
pub struct HttpExecutor {
    dialer: Dialer,
    tls: TlsConnector,
    log_4xx_responses: bool,
    request_timeout: Duration,
    metrics: JobMetrics,
}

impl HttpExecutor {
    pub fn new(router: Arc<IpRouter>, registry: &Arc<Registry>, log_4xx_responses: bool) -> Arc<Self> {
        Self::with_request_timeout(router, registry, log_4xx_responses, REQUEST_TIMEOUT)
    }

    fn with_request_timeout(
        router: Arc<IpRouter>,
        registry: &Arc<Registry>,
        log_4xx_responses: bool,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Arc::new(Self {
            dialer: Dialer::new(router),
            tls: TlsConnector::from(Arc::new(tls)),
            log_4xx_responses,
            request_timeout,
            metrics: JobMetrics::new(registry),
        })
    }

    /// Registers this executor on the pool under the `http` action.
    pub fn register(self: &Arc<Self>, pool: &mut Pool) {
        let executor = self.clone();
        pool.register("http", move |job: RequestSpec| {
            let executor = executor.clone();
            async move { executor.execute(job).await }
        });
    }

    /// Starts the background expiry of idle per-host counters.
    pub fn spawn_metric_sweepers(&self) {
        self.metrics
            .timeouts_by_host
            .clone()
            .spawn_sweeper(HOST_METRIC_SWEEP_INTERVAL);
        self.metrics
            .errors_by_host
            .clone()
            .spawn_sweeper(HOST_METRIC_SWEEP_INTERVAL);
    }

    /// Runs one job to completion. `Ok` for any HTTP status; `Err` only on
    /// transport failure.
    pub async fn execute(&self, mut job: RequestSpec) -> anyhow::Result<()> {
        let start = Instant::now();

        if (job.method == "GET" || job.method == "HEAD")
            && job.parameters.as_ref().is_some_and(|p| !p.is_empty())
        {
            merge_query_parameters(&mut job)?;
        }

        let outcome = self.attempt(&job).await;
        self.finish(&job, start.elapsed(), outcome)
    }

    async fn attempt(&self, job: &RequestSpec) -> Result<(u16, Bytes), TransportError> {
        let url = Url::parse(&job.url).map_err(other)?;
        let scheme = url.scheme();
        if scheme != "http" && scheme != "https" {
            return Err(other(anyhow::anyhow!("unsupported url scheme '{scheme}'")));
        }
        let host = url
            .host_str()
            .ok_or_else(|| other(anyhow::anyhow!("url has no host")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| other(anyhow::anyhow!("url has no port")))?;
        let host_port = format!("{host}:{port}");
        let request = build_request(job, &url)?;
        let head = job.method == "HEAD";

        match tokio::time::timeout(
            self.request_timeout,
            self.perform(&host_port, &host, scheme == "https", request, head),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn perform(
        &self,
        host_port: &str,
        host: &str,
        tls: bool,
        request: Request<Full<Bytes>>,
        head: bool,
    ) -> Result<(u16, Bytes), TransportError> {
        let stream = self.dialer.dial(host_port).await.map_err(|err| match err {
            NetError::DialTimeout => TransportError::DialTimeout,
            err => other(err),
        })?;

        if tls {
            let name = rustls::pki_types::ServerName::try_from(host.to_string()).map_err(other)?;
            let stream = self.tls.connect(name, stream).await.map_err(other)?;
            self.request_over(TokioIo::new(stream), request, head).await
        } else {
            self.request_over(TokioIo::new(stream), request, head).await
        }
    }

    async fn request_over<I>(
        &self,
        io: I,
        request: Request<Full<Bytes>>,
        head: bool,
    ) -> Result<(u16, Bytes), TransportError>
    where
        I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
    {
        let (mut sender, conn) = http1::handshake(io).await.map_err(other)?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                tracing::debug!("outbound connection error: {err}");
            }
        });

        let response = sender.send_request(request).await.map_err(other)?;
        let status = response.status().as_u16();
        if head {
            return Ok((status, Bytes::new()));
        }
        let body = Limited::new(response.into_body(), MAX_RESPONSE_BODY)
            .collect()
            .await
            .map_err(|err| TransportError::Other(anyhow::anyhow!("{err}")))?
            .to_bytes();
        Ok((status, body))
    }

    fn finish(
        &self,
        job: &RequestSpec,
        elapsed: Duration,
        outcome: Result<(u16, Bytes), TransportError>,
    ) -> anyhow::Result<()> {
        let host = Url::parse(&job.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        let result = match outcome {
            Ok((code, body)) => {
                if self.log_4xx_responses && code >= 400 && !body.is_empty() {
                    let shown = &body[..body.len().min(LOG_BODY_LIMIT)];
                    tracing::info!(
                        "http: {:?} {} {} {} {}, response:\n{}",
                        elapsed,
                        job.method,
                        job.url,
                        code,
                        body.len(),
                        String::from_utf8_lossy(shown)
                    );
                } else {
                    tracing::info!(
                        "http: {:?} {} {} {} {}",
                        elapsed,
                        job.method,
                        job.url,
                        code,
                        body.len()
                    );
                }
                if job.host_metrics && code >= 400 {
                    if let Some(host) = &host {
                        self.metrics.errors_by_host.inc(host);
                    }
                }
                if let Some(bucket) = self.metrics.status_bucket(code) {
                    bucket.inc();
                }
                Ok(())
            }
            Err(err) => {
                let label = err.label();
                tracing::warn!("http: {:?} {} {} {}", elapsed, job.method, job.url, label);
                if err.is_timeout() {
                    self.metrics.timeouts.inc();
                } else {
                    self.metrics.errors.inc();
                }
                if job.host_metrics {
                    if let Some(host) = &host {
                        if err.is_timeout() {
                            self.metrics.timeouts_by_host.inc(host);
                        } else {
                            self.metrics.errors_by_host.inc(host);
                        }
                    }
                }
                Err(anyhow::anyhow!(label))
            }
        };
        self.metrics.requests_out.inc();
        result
    }
}

/// Folds `parameters` into the URL query for GET/HEAD requests. A
/// parameter replaces an existing query key; untouched keys survive.
fn merge_query_parameters(job: &mut RequestSpec) -> anyhow::Result<()> {
    let Some(params) = job.parameters.take() else {
        return Ok(());
    };
    let mut url = Url::parse(&job.url)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .into_owned()
        .filter(|(key, _)| !params.contains_key(key))
        .collect();
    let mut added: Vec<(String, String)> = params.into_iter().collect();
    added.sort();
    {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        pairs.extend_pairs(kept.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        pairs.extend_pairs(added.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }
    job.url = url.to_string();
    Ok(())
}

fn build_request(job: &RequestSpec, url: &Url) -> Result<Request<Full<Bytes>>, TransportError> {
    let method = Method::from_bytes(job.method.as_bytes()).map_err(other)?;

    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }

    let mut host_value = url.host_str().unwrap_or_default().to_string();
    if let Some(port) = url.port() {
        host_value = format!("{host_value}:{port}");
    }

    let mut builder = Request::builder()
        .method(method)
        .uri(path)
        .header(HOST, host_value);

    let mut have_user_agent = false;
    let mut have_content_type = false;
    if let Some(headers) = &job.headers {
        for (name, value) in headers {
            have_user_agent |= name.eq_ignore_ascii_case("user-agent");
            have_content_type |= name.eq_ignore_ascii_case("content-type");
            builder = builder.header(name.as_str(), value.as_str());
        }
    }
    if !have_user_agent {
        builder = builder.header(USER_AGENT, DEFAULT_USER_AGENT);
    }

    let body = if let Some(raw) = &job.body {
        raw.clone()
    } else if let Some(params) = job.parameters.as_ref().filter(|p| !p.is_empty()) {
        if !have_content_type {
            builder = builder.header(CONTENT_TYPE, "application/x-www-form-urlencoded");
        }
        Bytes::from(form_encode(params))
    } else {
        Bytes::new()
    };

    builder.body(Full::new(body)).map_err(other)
}

/// `key=urlEncode(value)` pairs joined by `&`, keys sorted for stable
/// output.
fn form_encode(params: &HashMap<String, String>) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort();
    let mut out = String::new();
    for (key, value) in sorted {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(key);
        out.push('=');
        out.extend(url::form_urlencoded::byte_serialize(value.as_bytes()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const OK_RESPONSE: &str = "HTTP/1.1 200 OK\r\ncontent-length: 2\r\n\r\nok";

    /// Minimal single-shot HTTP stub: accepts one connection, captures the
    /// raw request text and writes the canned response.
    async fn stub(response: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64 * 1024];
            let mut total = 0;
            loop {
                let n = sock.read(&mut buf[total..]).await.unwrap();
                if n == 0 {
                    return;
                }
                total += n;
                let text = String::from_utf8_lossy(&buf[..total]).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let want = head_end + 4 + content_length(&text[..head_end]);
                    if total >= want {
                        sock.write_all(response.as_bytes()).await.unwrap();
                        sock.shutdown().await.ok();
                        let _ = tx.send(text);
                        return;
                    }
                }
            }
        });
        (target, rx)
    }

    fn content_length(head: &str) -> usize {
        head.lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0)
    }

    fn executor(registry: &Arc<Registry>) -> Arc<HttpExecutor> {
        HttpExecutor::new(Arc::new(IpRouter::default()), registry, false)
    }

    fn job(url: String, method: &str) -> RequestSpec {
        RequestSpec {
            url,
            method: method.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_merges_parameters_into_query() {
        let (target, captured) = stub(OK_RESPONSE).await;
        let registry = Arc::new(Registry::new());

        let mut spec = job(format!("http://{target}/"), "GET");
        spec.parameters = Some([("q".to_string(), "x".to_string())].into());
        executor(&registry).execute(spec).await.unwrap();

        let text = captured.await.unwrap();
        assert!(text.starts_with("GET /?q=x HTTP/1.1"), "got: {text}");
        // Merged parameters must not also become a body.
        assert!(text.ends_with("\r\n\r\n"));

        let rendered = registry.render();
        assert!(rendered.contains("http_requests 1"));
        assert!(rendered.contains(r#"http_status{code="2xx"} 1"#));
    }

    #[tokio::test]
    async fn test_parameters_override_existing_query_keys() {
        let (target, captured) = stub(OK_RESPONSE).await;
        let registry = Arc::new(Registry::new());

        let mut spec = job(format!("http://{target}/p?a=1"), "GET");
        spec.parameters = Some(
            [
                ("a".to_string(), "2".to_string()),
                ("b".to_string(), "3".to_string()),
            ]
            .into(),
        );
        executor(&registry).execute(spec).await.unwrap();

        let text = captured.await.unwrap();
        assert!(text.starts_with("GET /p?a=2&b=3 HTTP/1.1"), "got: {text}");
    }

    #[tokio::test]
    async fn test_post_parameters_become_form_body() {
        let (target, captured) = stub(OK_RESPONSE).await;
        let registry = Arc::new(Registry::new());

        let mut spec = job(format!("http://{target}/submit"), "POST");
        spec.parameters = Some([("a".to_string(), "b c".to_string())].into());
        executor(&registry).execute(spec).await.unwrap();

        let text = captured.await.unwrap().to_ascii_lowercase();
        assert!(text.contains("content-type: application/x-www-form-urlencoded"));
        assert!(text.ends_with("\r\n\r\na=b+c"), "got: {text}");
    }

    #[tokio::test]
    async fn test_raw_body_wins_over_parameters() {
        let (target, captured) = stub(OK_RESPONSE).await;
        let registry = Arc::new(Registry::new());

        let mut spec = job(format!("http://{target}/submit"), "POST");
        spec.body = Some(Bytes::from_static(b"hello"));
        spec.parameters = Some([("ignored".to_string(), "x".to_string())].into());
        executor(&registry).execute(spec).await.unwrap();

        let text = captured.await.unwrap();
        assert!(text.ends_with("\r\n\r\nhello"), "got: {text}");
    }

    #[tokio::test]
    async fn test_head_skips_response_body() {
        let (target, captured) = stub("HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\n").await;
        let registry = Arc::new(Registry::new());

        executor(&registry)
            .execute(job(format!("http://{target}/"), "HEAD"))
            .await
            .unwrap();

        let text = captured.await.unwrap();
        assert!(text.starts_with("HEAD / HTTP/1.1"));
    }

    #[tokio::test]
    async fn test_default_user_agent_applied() {
        let (target, captured) = stub(OK_RESPONSE).await;
        let registry = Arc::new(Registry::new());

        executor(&registry)
            .execute(job(format!("http://{target}/"), "GET"))
            .await
            .unwrap();

        let text = captured.await.unwrap().to_ascii_lowercase();
        assert!(text.contains("user-agent: outpost"));
    }

    #[tokio::test]
    async fn test_error_status_is_transport_success() {
        let (target, _captured) =
            stub("HTTP/1.1 404 Not Found\r\ncontent-length: 9\r\n\r\nnot found").await;
        let registry = Arc::new(Registry::new());

        let mut spec = job(format!("http://{target}/missing"), "GET");
        spec.host_metrics = true;
        executor(&registry).execute(spec).await.unwrap();

        let rendered = registry.render();
        assert!(rendered.contains(r#"http_status{code="4xx"} 1"#));
        assert!(rendered.contains(r#"http_errors_by_host{host="127.0.0.1"} 1"#));
        assert!(rendered.contains("http_timeouts 0"));
    }

    #[tokio::test]
    async fn test_unresponsive_server_is_a_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let registry = Arc::new(Registry::new());
        let executor = HttpExecutor::with_request_timeout(
            Arc::new(IpRouter::default()),
            &registry,
            false,
            Duration::from_millis(100),
        );

        let mut spec = job(format!("http://{target}/"), "GET");
        spec.host_metrics = true;
        let err = executor.execute(spec).await.unwrap_err();
        assert_eq!(err.to_string(), "timeout");

        let rendered = registry.render();
        assert!(rendered.contains("http_timeouts 1"));
        assert!(rendered.contains("http_error 0"));
        assert!(rendered.contains(r#"http_timeouts_by_host{host="127.0.0.1"} 1"#));
        assert!(rendered.contains("http_requests 1"));
    }

    #[tokio::test]
    async fn test_refused_connection_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
        drop(listener);

        let registry = Arc::new(Registry::new());
        let result = executor(&registry)
            .execute(job(format!("http://{target}/"), "GET"))
            .await;
        assert!(result.is_err());

        let rendered = registry.render();
        assert!(rendered.contains("http_error 1"));
        assert!(rendered.contains("http_timeouts 0"));
    }

    #[tokio::test]
    async fn test_unsupported_scheme_is_an_error() {
        let registry = Arc::new(Registry::new());
        let result = executor(&registry)
            .execute(job("ftp://example.com/file".to_string(), "GET"))
            .await;
        assert!(result.is_err());
        assert!(registry.render().contains("http_error 1"));
    }

    #[test]
    fn test_form_encode_sorts_and_escapes() {
        let params: HashMap<String, String> = [
            ("b".to_string(), "x&y".to_string()),
            ("a".to_string(), "1 2".to_string()),
        ]
        .into();
        assert_eq!(form_encode(&params), "a=1+2&b=x%26y");
    }
}
