use std::{
    error::Error as StdError,
    io::Read as _,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use anyhow::Context as _;
use base64::Engine as _;
use bytes::Bytes;
use chrono::Local;
use flate2::read::GzDecoder;
use http_body_util::{BodyExt as _, Full, combinators::BoxBody};
use hyper::{
    Request, Response, StatusCode, Uri,
    body::{Frame, Incoming},
    header::{self, HeaderName, HeaderValue},
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use serde_json::Value;

use crate::{
    config::Config,
    recorder::Recorder,
    recording::{Headers, Recording},
    router::{self, Provider},
};

pub type ProxyBody = BoxBody<Bytes, Box<dyn StdError + Send + Sync>>;
type ProxyHttpsConnector = HttpsConnector<HttpConnector>;
type HttpClient = Client<ProxyHttpsConnector, ProxyBody>;

const TRUNCATION_SENTINEL_PREFIX: &str = "…[truncated, ";

/// Provider-aware reverse proxy. Forwards requests unchanged, streams the
/// response back chunk by chunk, and tees the bytes into a bounded capture
/// that becomes a Recording once the upstream reaches EOF.
pub struct Proxy {
    upstreams: ProviderUpstreams,
    client: HttpClient,
    recorder: Arc<Recorder>,
    capture_cap: usize,
}

struct ProviderUpstreams {
    claude: Uri,
    openai: Uri,
    gemini: Uri,
}

impl ProviderUpstreams {
    fn from_config(config: &Config) -> anyhow::Result<Self> {
        let parse = |name: &str, raw: &str| -> anyhow::Result<Uri> {
            raw.parse()
                .with_context(|| format!("parse providers.{name}.upstream_url `{raw}`"))
        };
        Ok(Self {
            claude: parse("claude", &config.providers.claude.upstream_url)?,
            openai: parse("openai", &config.providers.openai.upstream_url)?,
            gemini: parse("gemini", &config.providers.gemini.upstream_url)?,
        })
    }

    fn for_provider(&self, provider: Provider) -> Option<&Uri> {
        match provider {
            Provider::Claude => Some(&self.claude),
            Provider::Openai => Some(&self.openai),
            Provider::Gemini => Some(&self.gemini),
            Provider::Unknown => None,
        }
    }
}

impl Proxy {
    pub fn new(config: &Config, recorder: Arc<Recorder>) -> anyhow::Result<Self> {
        Ok(Self {
            upstreams: ProviderUpstreams::from_config(config)?,
            client: build_upstream_client()?,
            recorder,
            capture_cap: config.recording.max_capture_bytes,
        })
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        let provider = router::identify_provider(req.uri().path());
        let Some(upstream_base) = self.upstreams.for_provider(provider) else {
            tracing::debug!(path = %req.uri().path(), "no provider matches path");
            return simple_response(StatusCode::NOT_FOUND, "unknown provider path");
        };

        let started_at = Local::now();
        let (mut parts, body) = req.into_parts();
        let path = parts.uri.path().to_owned();
        let query = parts.uri.query().unwrap_or("").to_owned();

        let request_span = tracing::info_span!(
            "proxy.request",
            provider = %provider,
            method = %parts.method,
            path = %path,
        );
        let _request_span_guard = request_span.enter();

        let mut rec = Recording::new(provider, parts.method.as_str(), &path, &query, started_at);
        rec.request.headers = headers_to_map(&parts.headers);
        let request_is_json = is_json_content_type(&parts.headers);

        strip_hop_by_hop_headers(&mut parts.headers);

        let upstream_uri = match upstream_uri_for(upstream_base, &parts.uri) {
            Ok(uri) => uri,
            Err(err) => {
                tracing::debug!("failed to build upstream uri: {err}");
                return simple_response(StatusCode::BAD_GATEWAY, "failed to build upstream request");
            }
        };
        if let Some(host) = host_header_for(&upstream_uri) {
            parts.headers.insert(header::HOST, host);
        }
        parts.uri = upstream_uri;

        let request_capture = Arc::new(Mutex::new(CaptureBuffer::new(self.capture_cap)));
        let upstream_req = Request::from_parts(
            parts,
            TeeBody::request(body, Arc::clone(&request_capture)).boxed(),
        );

        let upstream_res = match self.client.request(upstream_req).await {
            Ok(res) => res,
            Err(err) => {
                tracing::warn!(id = %rec.id, "upstream request failed: {err}");
                rec.error = format!("upstream request failed: {err}");
                rec.response.status = 0;
                rec.request.body =
                    request_body_value(&snapshot_capture(&request_capture), request_is_json);
                rec.finish_timing(Local::now());
                self.recorder.record(rec);
                return simple_response(StatusCode::BAD_GATEWAY, "upstream request failed");
            }
        };

        let (mut res_parts, res_body) = upstream_res.into_parts();
        strip_hop_by_hop_headers(&mut res_parts.headers);

        rec.response.status = res_parts.status.as_u16();
        rec.response.headers = headers_to_map(&res_parts.headers);
        rec.response.streaming =
            content_type_starts_with(&res_parts.headers, "text/event-stream");

        let finish = RecordingFinish {
            recording: rec,
            request_capture,
            request_is_json,
            response_is_json: is_json_content_type(&res_parts.headers),
            response_gzip: content_encoding_is_gzip(&res_parts.headers),
            chunked: !res_parts.headers.contains_key(header::CONTENT_LENGTH),
            recorder: Arc::clone(&self.recorder),
        };

        let response_capture = Arc::new(Mutex::new(CaptureBuffer::new(self.capture_cap)));
        let tee = TeeBody::response(res_body, response_capture, finish);
        Response::from_parts(res_parts, tee.boxed())
    }
}

/// Bounded capture of a body stream. The total byte count keeps growing
/// after the cap is hit; only the buffered prefix stops.
#[derive(Debug, Default, Clone)]
pub(crate) struct CaptureBuffer {
    buf: Vec<u8>,
    total: u64,
    cap: usize,
    truncated: bool,
}

impl CaptureBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            total: 0,
            cap,
            truncated: false,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        if self.truncated {
            return;
        }

        let remaining = self.cap.saturating_sub(self.buf.len());
        if chunk.len() <= remaining {
            self.buf.extend_from_slice(chunk);
        } else {
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.truncated = true;
        }
    }

    fn omitted(&self) -> u64 {
        self.total - self.buf.len() as u64
    }
}

fn snapshot_capture(capture: &Arc<Mutex<CaptureBuffer>>) -> CaptureBuffer {
    let mut guard = capture.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    std::mem::take(&mut *guard)
}

/// Everything needed to turn the finished captures into a Recording and
/// hand it to the recorder. Consumed exactly once, at response EOF (or
/// while draining after a client disconnect).
struct RecordingFinish {
    recording: Recording,
    request_capture: Arc<Mutex<CaptureBuffer>>,
    request_is_json: bool,
    response_is_json: bool,
    response_gzip: bool,
    chunked: bool,
    recorder: Arc<Recorder>,
}

impl RecordingFinish {
    fn complete(self, response_capture: &Arc<Mutex<CaptureBuffer>>, error: Option<String>) {
        let mut rec = self.recording;
        if let Some(error) = error {
            rec.error = error;
        }

        let request = snapshot_capture(&self.request_capture);
        rec.request.body = request_body_value(&request, self.request_is_json);

        let response = snapshot_capture(response_capture);
        rec.response_size = response.total;
        if !rec.response.streaming && self.chunked && looks_like_sse(&response.buf) {
            rec.response.streaming = true;
        }
        rec.response.body = response_body_value(
            &response,
            rec.response.streaming,
            self.response_is_json,
            self.response_gzip,
        );

        rec.finish_timing(Local::now());
        self.recorder.record(rec);
    }
}

/// Body adapter that forwards every frame verbatim while copying data frames
/// into a shared capture buffer. The response-side variant composes and
/// enqueues the Recording when the upstream reaches EOF; if the client goes
/// away first, `Drop` keeps draining the upstream so the capture still
/// completes.
struct TeeBody {
    inner: Option<Incoming>,
    capture: Arc<Mutex<CaptureBuffer>>,
    finish: Option<RecordingFinish>,
}

impl TeeBody {
    fn request(inner: Incoming, capture: Arc<Mutex<CaptureBuffer>>) -> Self {
        Self {
            inner: Some(inner),
            capture,
            finish: None,
        }
    }

    fn response(
        inner: Incoming,
        capture: Arc<Mutex<CaptureBuffer>>,
        finish: RecordingFinish,
    ) -> Self {
        Self {
            inner: Some(inner),
            capture,
            finish: Some(finish),
        }
    }
}

impl hyper::body::Body for TeeBody {
    type Data = Bytes;
    type Error = Box<dyn StdError + Send + Sync>;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match Pin::new(inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .extend(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(Some(Err(err))) => {
                this.inner = None;
                if let Some(finish) = this.finish.take() {
                    finish.complete(
                        &this.capture,
                        Some(format!("upstream body read failed: {err}")),
                    );
                }
                Poll::Ready(Some(Err(Box::new(err))))
            }
            Poll::Ready(None) => {
                this.inner = None;
                if let Some(finish) = this.finish.take() {
                    finish.complete(&this.capture, None);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner
            .as_ref()
            .map(hyper::body::Body::is_end_stream)
            .unwrap_or(true)
    }

    fn size_hint(&self) -> hyper::body::SizeHint {
        self.inner
            .as_ref()
            .map(hyper::body::Body::size_hint)
            .unwrap_or_else(|| hyper::body::SizeHint::with_exact(0))
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        let Some(finish) = self.finish.take() else {
            return;
        };
        let capture = Arc::clone(&self.capture);

        let Some(inner) = self.inner.take() else {
            finish.complete(&capture, None);
            return;
        };

        // The client went away mid-stream. Keep draining the upstream to EOF
        // so the capture matches what the provider actually sent.
        tokio::spawn(drain_upstream(inner, capture, finish));
    }
}

async fn drain_upstream(
    mut inner: Incoming,
    capture: Arc<Mutex<CaptureBuffer>>,
    finish: RecordingFinish,
) {
    loop {
        match inner.frame().await {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    capture
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .extend(data);
                }
            }
            Some(Err(err)) => {
                finish.complete(&capture, Some(format!("upstream body read failed: {err}")));
                return;
            }
            None => break,
        }
    }
    finish.complete(&capture, None);
}

fn request_body_value(capture: &CaptureBuffer, is_json: bool) -> Option<Value> {
    if capture.total == 0 {
        return None;
    }

    if is_json && !capture.truncated {
        if let Ok(value) = serde_json::from_slice(&capture.buf) {
            return Some(value);
        }
    }

    Some(Value::String(
        String::from_utf8_lossy(&capture.buf).into_owned(),
    ))
}

fn response_body_value(
    capture: &CaptureBuffer,
    streaming: bool,
    is_json: bool,
    gzip: bool,
) -> Option<Value> {
    if capture.total == 0 {
        return None;
    }

    if streaming {
        return Some(Value::String(capture_text(capture)));
    }

    if gzip && !capture.truncated {
        let mut decompressed = Vec::new();
        let decoded = GzDecoder::new(capture.buf.as_slice())
            .read_to_end(&mut decompressed)
            .is_ok();
        if decoded {
            if let Ok(value) = serde_json::from_slice(&decompressed) {
                return Some(value);
            }
        }
        // Decompress or parse failure: keep the compressed bytes recoverable.
        let encoded = base64::engine::general_purpose::STANDARD.encode(&capture.buf);
        return Some(Value::String(format!("base64:{encoded}")));
    }

    if is_json && !capture.truncated {
        if let Ok(value) = serde_json::from_slice(&capture.buf) {
            return Some(value);
        }
    }

    Some(Value::String(capture_text(capture)))
}

fn capture_text(capture: &CaptureBuffer) -> String {
    let mut text = String::from_utf8_lossy(&capture.buf).into_owned();
    if capture.truncated {
        text.push_str(&format!(
            "{TRUNCATION_SENTINEL_PREFIX}{} bytes omitted]",
            capture.omitted()
        ));
    }
    text
}

/// SSE framing sniff for chunked responses that never declared an SSE
/// content type: any of the first few lines starts with a field prefix.
fn looks_like_sse(body: &[u8]) -> bool {
    let head = &body[..body.len().min(1024)];
    let text = String::from_utf8_lossy(head);
    text.lines()
        .take(8)
        .any(|line| line.starts_with("data: ") || line.starts_with("event: "))
}

fn headers_to_map(headers: &hyper::HeaderMap) -> Headers {
    let mut map = Headers::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_owned())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn header_value_starts_with(
    headers: &hyper::HeaderMap,
    name: HeaderName,
    prefix: &str,
) -> bool {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        })
}

fn content_type_starts_with(headers: &hyper::HeaderMap, prefix: &str) -> bool {
    header_value_starts_with(headers, header::CONTENT_TYPE, prefix)
}

fn is_json_content_type(headers: &hyper::HeaderMap) -> bool {
    content_type_starts_with(headers, "application/json")
}

fn content_encoding_is_gzip(headers: &hyper::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("gzip"))
        })
}

/// Connection-scoped headers that must never cross the proxy, plus whatever
/// the Connection header itself nominates.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn strip_hop_by_hop_headers(headers: &mut hyper::HeaderMap) {
    let nominated: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();

    for name in nominated {
        headers.remove(name);
    }
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(*name);
    }
}

/// Re-targets the client's request URI at a provider upstream: the path and
/// query pass through untouched, only scheme and authority change.
fn upstream_uri_for(base: &Uri, original: &Uri) -> anyhow::Result<Uri> {
    let path_and_query = original
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Uri::builder();
    if let Some(scheme) = base.scheme() {
        builder = builder.scheme(scheme.clone());
    }
    if let Some(authority) = base.authority() {
        builder = builder.authority(authority.clone());
    }
    builder
        .path_and_query(path_and_query)
        .build()
        .with_context(|| format!("retarget {path_and_query} at upstream {base}"))
}

fn host_header_for(uri: &Uri) -> Option<HeaderValue> {
    HeaderValue::from_str(uri.authority()?.as_str()).ok()
}

/// Pooled HTTPS client shared by every proxied request. A process-wide
/// rustls crypto provider must exist before the first connector is built;
/// any caller's successful install satisfies that.
fn build_upstream_client() -> anyhow::Result<HttpClient> {
    if rustls::crypto::CryptoProvider::get_default().is_none() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            anyhow::bail!("no rustls crypto provider available for upstream TLS");
        }
    }

    let connector = HttpsConnectorBuilder::new()
        .with_native_roots()
        .context("load system root certificates for provider upstreams")?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .build();
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}

pub fn boxed_full(body: impl Into<Bytes>) -> ProxyBody {
    Full::new(body.into())
        .map_err(|never| -> Box<dyn StdError + Send + Sync> { match never {} })
        .boxed()
}

pub fn simple_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(boxed_full(Bytes::from(message.to_owned())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use hyper::header::{HeaderMap, HeaderValue};
    use serde_json::Value;

    use super::{
        CaptureBuffer, content_encoding_is_gzip, content_type_starts_with, headers_to_map,
        host_header_for, is_json_content_type, looks_like_sse, request_body_value,
        response_body_value, strip_hop_by_hop_headers, upstream_uri_for,
    };

    fn capture_of(bytes: &[u8], cap: usize) -> CaptureBuffer {
        let mut capture = CaptureBuffer::new(cap);
        capture.extend(bytes);
        capture
    }

    #[test]
    fn capture_buffer_truncates_at_cap_but_counts_everything() {
        let mut capture = CaptureBuffer::new(8);
        capture.extend(b"01234");
        capture.extend(b"56789");
        assert_eq!(capture.total, 10);
        assert_eq!(&capture.buf[..], b"01234567");
        assert!(capture.truncated);
        assert_eq!(capture.omitted(), 2);
    }

    #[test]
    fn truncated_stream_body_carries_sentinel_suffix() {
        let capture = capture_of(b"data: hello data: world", 11);
        let value = response_body_value(&capture, true, false, false).unwrap();
        let text = value.as_str().unwrap();
        assert!(text.starts_with("data: hello"));
        assert!(text.contains("…[truncated, 12 bytes omitted]"));
    }

    #[test]
    fn json_response_bodies_parse_into_values() {
        let capture = capture_of(br#"{"ok":true,"n":3}"#, 1024);
        let value = response_body_value(&capture, false, true, false).unwrap();
        assert_eq!(value["ok"], Value::Bool(true));

        // Invalid JSON falls back to the raw string.
        let capture = capture_of(b"{nope", 1024);
        let value = response_body_value(&capture, false, true, false).unwrap();
        assert_eq!(value.as_str(), Some("{nope"));
    }

    #[test]
    fn gzip_json_response_is_decompressed() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"compressed":true}"#).unwrap();
        let compressed = encoder.finish().unwrap();

        let capture = capture_of(&compressed, 1024);
        let value = response_body_value(&capture, false, true, true).unwrap();
        assert_eq!(value["compressed"], Value::Bool(true));
    }

    #[test]
    fn undecodable_gzip_becomes_base64_sentinel() {
        let capture = capture_of(b"\x1f\x8b definitely not gzip", 1024);
        let value = response_body_value(&capture, false, true, true).unwrap();
        let text = value.as_str().unwrap();
        assert!(text.starts_with("base64:"));

        use base64::Engine as _;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(text.strip_prefix("base64:").unwrap())
            .unwrap();
        assert_eq!(&decoded[..], b"\x1f\x8b definitely not gzip");
    }

    #[test]
    fn empty_bodies_record_as_none() {
        let capture = CaptureBuffer::new(16);
        assert!(response_body_value(&capture, false, true, false).is_none());
        assert!(request_body_value(&capture, true).is_none());
    }

    #[test]
    fn request_json_bodies_parse_and_raw_bodies_stay_strings() {
        let capture = capture_of(br#"{"model":"gpt-4"}"#, 1024);
        let value = request_body_value(&capture, true).unwrap();
        assert_eq!(value["model"].as_str(), Some("gpt-4"));

        let capture = capture_of(b"plain text", 1024);
        let value = request_body_value(&capture, false).unwrap();
        assert_eq!(value.as_str(), Some("plain text"));
    }

    #[test]
    fn sse_framing_is_sniffed_from_body_prefix() {
        assert!(looks_like_sse(b"data: {\"x\":1}\n\n"));
        assert!(looks_like_sse(b"event: message_start\ndata: {}\n"));
        assert!(!looks_like_sse(b"{\"regular\":\"json\"}"));
        assert!(!looks_like_sse(b""));
    }

    #[test]
    fn hop_by_hop_headers_are_stripped_including_connection_listed() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("close, x-hop"));
        headers.insert("x-hop", HeaderValue::from_static("secret"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("x-end", HeaderValue::from_static("kept"));

        strip_hop_by_hop_headers(&mut headers);

        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-hop").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("transfer-encoding").is_none());
        assert_eq!(headers.get("x-end").unwrap(), "kept");
    }

    #[test]
    fn upstream_uri_keeps_path_and_query_but_retargets_authority() {
        let base: hyper::Uri = "https://api.anthropic.com".parse().unwrap();
        let original: hyper::Uri = "http://proxy.local/v1/messages?beta=true".parse().unwrap();
        let upstream = upstream_uri_for(&base, &original).unwrap();
        assert_eq!(
            upstream.to_string(),
            "https://api.anthropic.com/v1/messages?beta=true"
        );

        let bare: hyper::Uri = "/v1/models".parse().unwrap();
        let upstream = upstream_uri_for(&base, &bare).unwrap();
        assert_eq!(upstream.to_string(), "https://api.anthropic.com/v1/models");
    }

    #[test]
    fn host_header_comes_from_the_upstream_authority() {
        let upstream: hyper::Uri = "https://api.openai.com/v1/models".parse().unwrap();
        assert_eq!(
            host_header_for(&upstream).unwrap().to_str().unwrap(),
            "api.openai.com"
        );

        let relative: hyper::Uri = "/v1/models".parse().unwrap();
        assert!(host_header_for(&relative).is_none());
    }

    #[test]
    fn content_type_checks_are_case_insensitive() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("Text/Event-Stream; charset=utf-8"),
        );
        assert!(content_type_starts_with(&headers, "text/event-stream"));
        assert!(!is_json_content_type(&headers));

        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        assert!(is_json_content_type(&headers));

        let mut headers = HeaderMap::new();
        headers.insert("content-encoding", HeaderValue::from_static("GZIP"));
        assert!(content_encoding_is_gzip(&headers));
    }

    #[test]
    fn header_capture_groups_repeated_names_in_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-first", HeaderValue::from_static("1"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let map = headers_to_map(&headers);
        assert_eq!(map["x-first"], vec!["1".to_owned()]);
        assert_eq!(map["x-multi"], vec!["a".to_owned(), "b".to_owned()]);
    }
}
