use std::{
    fs::{self, File},
    io::{BufRead as _, BufReader, Read as _},
    path::{Path, PathBuf},
    sync::Arc,
};

use base64::Engine as _;
use chrono::{DateTime, Local, NaiveDate, TimeZone as _};
use flate2::read::GzDecoder;
use hyper::{Request, Response, StatusCode, Uri, body::Incoming, header};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::{
    grouping::{self, ListGroupsOptions, SessionGroup},
    index::{RecordingIndex, is_recording_file_name},
    proxy::{ProxyBody, boxed_full, simple_response},
    recording::{Headers, Recording},
    router::Provider,
    sse,
};

const DEFAULT_PAGE: usize = 1;
const DEFAULT_LIMIT: usize = 50;
const REDACTION_PLACEHOLDER: &str = "[REDACTED]";
const SENSITIVE_HEADER_SUBSTRINGS: &[&str] =
    &["authorization", "x-api-key", "api-key", "cookie", "set-cookie"];

pub struct ApiState {
    pub recordings_path: PathBuf,
    pub index: Arc<RecordingIndex>,
    pub groups: Option<Arc<grouping::Manager>>,
}

#[derive(Debug, Serialize)]
struct RecordingListResponse {
    recordings: Vec<RecordingSummary>,
    total: usize,
    page: usize,
    limit: usize,
    #[serde(rename = "hasMore")]
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct RecordingSummary {
    id: String,
    timestamp: DateTime<Local>,
    provider: Provider,
    method: String,
    path: String,
    status: u16,
    duration: i64,
    #[serde(rename = "responseSize")]
    response_size: u64,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
}

impl From<&Recording> for RecordingSummary {
    fn from(rec: &Recording) -> Self {
        Self {
            id: rec.id.clone(),
            timestamp: rec.timestamp,
            provider: rec.provider,
            method: rec.request.method.clone(),
            path: rec.request.path.clone(),
            status: rec.response.status,
            duration: rec.timing.duration_ms,
            response_size: rec.response_size,
            error: rec.error.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ParseResponse {
    text: String,
    metadata: serde_json::Map<String, Value>,
    #[serde(rename = "eventCounts")]
    event_counts: IndexMap<String, usize>,
}

#[derive(Debug, Serialize)]
struct SessionGroupListResponse {
    groups: Vec<SessionGroup>,
    total: usize,
    page: usize,
    limit: usize,
    #[serde(rename = "hasMore")]
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct SessionGroupDetailResponse {
    group: SessionGroup,
    recordings: Vec<RecordingSummary>,
}

pub async fn handle(req: Request<Incoming>, state: Arc<ApiState>) -> Response<ProxyBody> {
    if req.method() != hyper::Method::GET {
        return simple_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    let path = req.uri().path().to_owned();
    let uri = req.uri().clone();

    if path == "/api/recordings" {
        return list_recordings(&state, &uri).await;
    }
    if let Some(rest) = path.strip_prefix("/api/recordings/") {
        if let Some(id) = rest.strip_suffix("/parse") {
            if id.is_empty() {
                return simple_response(StatusCode::BAD_REQUEST, "recording id required");
            }
            return parse_recording(&state, id).await;
        }
        if rest.is_empty() || rest.contains('/') {
            return simple_response(StatusCode::NOT_FOUND, "not found");
        }
        return get_recording(&state, rest).await;
    }
    if path == "/api/groups/sessions" {
        return list_session_groups(&state, &uri);
    }
    if let Some(trace_id) = path.strip_prefix("/api/groups/sessions/") {
        if trace_id.is_empty() {
            return simple_response(StatusCode::BAD_REQUEST, "trace id required");
        }
        return get_session_group(&state, trace_id).await;
    }

    simple_response(StatusCode::NOT_FOUND, "not found")
}

async fn list_recordings(state: &ApiState, uri: &Uri) -> Response<ProxyBody> {
    let params = query_params(uri);
    let page = parse_positive(param(&params, "page"), DEFAULT_PAGE);
    let limit = parse_positive(param(&params, "limit"), DEFAULT_LIMIT);
    let provider = param(&params, "provider").map(str::to_owned);
    let from = param(&params, "from").and_then(parse_date);
    let to = param(&params, "to").and_then(parse_date);
    let search = param(&params, "search").unwrap_or("").trim().to_owned();

    let recordings_path = state.recordings_path.clone();
    let read = tokio::task::spawn_blocking(move || {
        read_all_recordings(&recordings_path, from, to)
    })
    .await;

    let recordings = match read {
        Ok(Ok(recordings)) => recordings,
        Ok(Err(err)) => {
            tracing::error!("failed to read recordings: {err}");
            return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read recordings");
        }
        Err(err) => {
            tracing::error!("recordings read task failed: {err}");
            return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read recordings");
        }
    };

    let mut filtered: Vec<Recording> = recordings
        .into_iter()
        .filter(|rec| matches_filters(rec, provider.as_deref(), &search))
        .collect();
    filtered.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let total = filtered.len();
    let mut start = (page - 1) * limit;
    if start >= total {
        start = 0;
    }
    let end = (start + limit).min(total);
    let has_more = end < total;

    let summaries: Vec<RecordingSummary> =
        filtered[start..end].iter().map(RecordingSummary::from).collect();

    json_response(
        StatusCode::OK,
        &RecordingListResponse {
            recordings: summaries,
            total,
            page,
            limit,
            has_more,
        },
    )
}

async fn get_recording(state: &ApiState, id: &str) -> Response<ProxyBody> {
    match read_recording_by_prefix(state, id).await {
        Ok(Some(rec)) => {
            let mut redacted = redact_recording(rec);
            decompress_response_body(&mut redacted);
            json_response(StatusCode::OK, &redacted)
        }
        Ok(None) => simple_response(StatusCode::NOT_FOUND, "recording not found"),
        Err(err) => {
            tracing::error!(id = %id, "failed to read recording: {err}");
            simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read recording")
        }
    }
}

async fn parse_recording(state: &ApiState, id: &str) -> Response<ProxyBody> {
    let rec = match read_recording_by_prefix(state, id).await {
        Ok(Some(rec)) => rec,
        Ok(None) => return simple_response(StatusCode::NOT_FOUND, "recording not found"),
        Err(err) => {
            tracing::error!(id = %id, "failed to read recording: {err}");
            return simple_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to read recording");
        }
    };

    let Some(parse) = sse::parser_for(rec.provider) else {
        return simple_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "no stream parser for provider",
        );
    };

    let body = match &rec.response.body {
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };

    match parse(&body) {
        Ok(parsed) => {
            let mut event_counts: IndexMap<String, usize> = IndexMap::new();
            for event in &parsed.events {
                *event_counts.entry(event.event_type.clone()).or_default() += 1;
            }
            json_response(
                StatusCode::OK,
                &ParseResponse {
                    text: parsed.text,
                    metadata: parsed.metadata,
                    event_counts,
                },
            )
        }
        Err(err) => simple_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("failed to parse stream: {err}"),
        ),
    }
}

fn list_session_groups(state: &ApiState, uri: &Uri) -> Response<ProxyBody> {
    let Some(groups) = state.groups.as_ref() else {
        return simple_response(StatusCode::NOT_IMPLEMENTED, "grouping is not enabled");
    };

    let params = query_params(uri);
    let page = parse_positive(param(&params, "page"), DEFAULT_PAGE);
    let limit = parse_positive(param(&params, "limit"), DEFAULT_LIMIT);

    let opts = ListGroupsOptions {
        page,
        limit,
        from_date: param(&params, "from").and_then(parse_date).and_then(local_day_start),
        to_date: param(&params, "to").and_then(parse_date).and_then(local_day_start),
        provider: param(&params, "provider").and_then(parse_provider),
        has_errors: param(&params, "has_errors").map(|value| value == "true"),
    };

    let (listed, total) = groups.list_session_groups(&opts);
    json_response(
        StatusCode::OK,
        &SessionGroupListResponse {
            groups: listed,
            total,
            page,
            limit,
            has_more: page * limit < total,
        },
    )
}

async fn get_session_group(state: &ApiState, trace_id: &str) -> Response<ProxyBody> {
    let Some(groups) = state.groups.as_ref() else {
        return simple_response(StatusCode::NOT_IMPLEMENTED, "grouping is not enabled");
    };

    let Some(group) = groups.get_session_group(trace_id) else {
        return simple_response(StatusCode::NOT_FOUND, "session group not found");
    };

    let index = Arc::clone(&state.index);
    let recording_ids = group.recording_ids.clone();
    let summaries = tokio::task::spawn_blocking(move || {
        let mut summaries = Vec::with_capacity(recording_ids.len());
        for id in &recording_ids {
            match index.read_recording(id) {
                Ok(Some(rec)) => summaries.push(RecordingSummary::from(&rec)),
                Ok(None) => tracing::error!(id = %id, "grouped recording missing from index"),
                Err(err) => tracing::error!(id = %id, "failed to read recording: {err}"),
            }
        }
        summaries
    })
    .await
    .unwrap_or_default();

    json_response(
        StatusCode::OK,
        &SessionGroupDetailResponse {
            group,
            recordings: summaries,
        },
    )
}

async fn read_recording_by_prefix(
    state: &ApiState,
    id: &str,
) -> anyhow::Result<Option<Recording>> {
    let index = Arc::clone(&state.index);
    let id = id.to_owned();
    tokio::task::spawn_blocking(move || index.read_recording(&id))
        .await
        .map_err(|err| anyhow::anyhow!("join read recording task: {err}"))?
}

/// Scans every daily file whose filename date falls in the range. This path
/// deliberately avoids the offset index so it works when the index is gone.
fn read_all_recordings(
    path: &Path,
    from: Option<NaiveDate>,
    to: Option<NaiveDate>,
) -> anyhow::Result<Vec<Recording>> {
    let dir = match fs::read_dir(path) {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(anyhow::anyhow!(
                "read recordings directory {}: {err}",
                path.display()
            ));
        }
    };

    let mut recordings = Vec::new();
    for entry in dir {
        let Ok(entry) = entry else { continue };
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_recording_file_name(&name) {
            continue;
        }
        let Some(file_date) = date_from_file_name(&name) else {
            continue;
        };
        if from.is_some_and(|from| file_date < from) {
            continue;
        }
        if to.is_some_and(|to| file_date > to) {
            continue;
        }

        match read_recordings_from_file(&path.join(&name)) {
            Ok(file_recordings) => recordings.extend(file_recordings),
            Err(err) => tracing::error!(file = %name, "failed to read recordings file: {err}"),
        }
    }

    Ok(recordings)
}

fn read_recordings_from_file(path: &Path) -> anyhow::Result<Vec<Recording>> {
    let file =
        File::open(path).map_err(|err| anyhow::anyhow!("open {}: {err}", path.display()))?;
    let mut reader = BufReader::new(file);

    let mut recordings = Vec::new();
    let mut line = Vec::new();
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .map_err(|err| anyhow::anyhow!("read {}: {err}", path.display()))?;
        if read == 0 {
            break;
        }
        let content = match line.last() {
            Some(b'\n') => &line[..line.len() - 1],
            _ => &line[..],
        };
        if content.is_empty() {
            continue;
        }

        match serde_json::from_slice::<Recording>(content) {
            Ok(rec) => recordings.push(rec),
            Err(err) => tracing::error!("failed to parse recording: {err}"),
        }
    }

    Ok(recordings)
}

fn date_from_file_name(name: &str) -> Option<NaiveDate> {
    let date = name
        .strip_prefix("recordings-")?
        .strip_suffix(".jsonl")?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn matches_filters(rec: &Recording, provider: Option<&str>, search: &str) -> bool {
    if let Some(provider) = provider {
        if !provider.is_empty() && !rec.provider.as_str().eq_ignore_ascii_case(provider) {
            return false;
        }
    }

    if !search.is_empty() {
        let needle = search.to_lowercase();
        let matches = rec.id.to_lowercase().contains(&needle)
            || rec.request.path.to_lowercase().contains(&needle)
            || rec.error.to_lowercase().contains(&needle);
        if !matches {
            return false;
        }
    }

    true
}

/// Replaces sensitive header values and a top-level `api_key` body field
/// before a recording leaves the API.
fn redact_recording(mut rec: Recording) -> Recording {
    rec.request.headers = redact_headers(rec.request.headers);
    rec.response.headers = redact_headers(rec.response.headers);

    if let Some(Value::Object(body)) = rec.request.body.as_mut() {
        if body.contains_key("api_key") {
            body.insert("api_key".to_owned(), REDACTION_PLACEHOLDER.into());
        }
    }

    rec
}

fn redact_headers(headers: Headers) -> Headers {
    headers
        .into_iter()
        .map(|(name, values)| {
            if is_sensitive_header(&name) {
                (name, vec![REDACTION_PLACEHOLDER.to_owned()])
            } else {
                (name, values)
            }
        })
        .collect()
}

fn is_sensitive_header(name: &str) -> bool {
    let name = name.to_lowercase();
    SENSITIVE_HEADER_SUBSTRINGS
        .iter()
        .any(|sensitive| name.contains(sensitive))
}

/// Reverses the proxy's `base64:<gzip>` capture sentinel so API consumers
/// see the payload the provider actually sent.
fn decompress_response_body(rec: &mut Recording) {
    let Some(Value::String(body)) = rec.response.body.as_ref() else {
        return;
    };
    let Some(encoded) = body.strip_prefix("base64:") else {
        return;
    };

    let Ok(compressed) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return;
    };
    let mut decompressed = Vec::new();
    if GzDecoder::new(compressed.as_slice())
        .read_to_end(&mut decompressed)
        .is_err()
    {
        return;
    }

    rec.response.body = Some(match serde_json::from_slice(&decompressed) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(&decompressed).into_owned()),
    });
}

fn query_params(uri: &Uri) -> Vec<(String, String)> {
    uri.query()
        .map(|query| {
            query
                .split('&')
                .filter(|pair| !pair.is_empty())
                .map(|pair| match pair.split_once('=') {
                    Some((name, value)) => (name.to_owned(), value.to_owned()),
                    None => (pair.to_owned(), String::new()),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.as_str())
}

fn parse_positive(raw: Option<&str>, default: usize) -> usize {
    match raw.and_then(|raw| raw.parse::<usize>().ok()) {
        Some(value) if value >= 1 => value,
        _ => default,
    }
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn local_day_start(date: NaiveDate) -> Option<DateTime<Local>> {
    date.and_hms_opt(0, 0, 0)
        .and_then(|datetime| Local.from_local_datetime(&datetime).earliest())
}

fn parse_provider(raw: &str) -> Option<Provider> {
    raw.parse::<Provider>()
        .ok()
        .filter(|provider| *provider != Provider::Unknown)
}

fn json_response<T: Serialize>(status: StatusCode, payload: &T) -> Response<ProxyBody> {
    let body = match serde_json::to_vec(payload) {
        Ok(body) => body,
        Err(err) => {
            tracing::error!("failed to encode response: {err}");
            return simple_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode response",
            );
        }
    };

    let mut response = Response::new(boxed_full(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use base64::Engine as _;
    use chrono::Local;
    use serde_json::{Value, json};

    use super::{
        date_from_file_name, decompress_response_body, is_sensitive_header, matches_filters,
        parse_positive, redact_recording,
    };
    use crate::{recording::Recording, router::Provider};

    fn sample_recording() -> Recording {
        let mut rec = Recording::new(Provider::Claude, "POST", "/v1/messages", "", Local::now());
        rec.response.status = 200;
        rec
    }

    #[test]
    fn sensitive_headers_match_by_substring_case_insensitive() {
        assert!(is_sensitive_header("Authorization"));
        assert!(is_sensitive_header("X-Api-Key"));
        assert!(is_sensitive_header("anthropic-api-key"));
        assert!(is_sensitive_header("Cookie"));
        assert!(is_sensitive_header("Set-Cookie"));
        assert!(!is_sensitive_header("content-type"));
        assert!(!is_sensitive_header("x-request-id"));
    }

    #[test]
    fn redaction_masks_headers_and_api_key_body_field() {
        let mut rec = sample_recording();
        rec.request.headers.insert(
            "authorization".to_owned(),
            vec!["Bearer sk-ant-secret".to_owned()],
        );
        rec.request
            .headers
            .insert("content-type".to_owned(), vec!["application/json".to_owned()]);
        rec.response
            .headers
            .insert("set-cookie".to_owned(), vec!["session=abc".to_owned()]);
        rec.request.body = Some(json!({"api_key": "secret", "model": "claude"}));

        let redacted = redact_recording(rec);
        assert_eq!(redacted.request.headers["authorization"], vec!["[REDACTED]"]);
        assert_eq!(
            redacted.request.headers["content-type"],
            vec!["application/json"]
        );
        assert_eq!(redacted.response.headers["set-cookie"], vec!["[REDACTED]"]);
        let body = redacted.request.body.unwrap();
        assert_eq!(body["api_key"].as_str(), Some("[REDACTED]"));
        assert_eq!(body["model"].as_str(), Some("claude"));
    }

    #[test]
    fn base64_gzip_bodies_decompress_on_read() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(br#"{"restored":true}"#).unwrap();
        let compressed = encoder.finish().unwrap();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&compressed);

        let mut rec = sample_recording();
        rec.response.body = Some(Value::String(format!("base64:{encoded}")));

        decompress_response_body(&mut rec);
        assert_eq!(rec.response.body.unwrap()["restored"], Value::Bool(true));
    }

    #[test]
    fn invalid_base64_body_is_left_untouched() {
        let mut rec = sample_recording();
        rec.response.body = Some(Value::String("base64:!!!not-base64!!!".to_owned()));
        decompress_response_body(&mut rec);
        assert_eq!(
            rec.response.body.unwrap().as_str(),
            Some("base64:!!!not-base64!!!")
        );
    }

    #[test]
    fn search_matches_id_path_and_error() {
        let mut rec = sample_recording();
        rec.error = "Upstream Timeout".to_owned();

        assert!(matches_filters(&rec, None, ""));
        assert!(matches_filters(&rec, None, "messages"));
        assert!(matches_filters(&rec, None, "timeout"));
        assert!(matches_filters(&rec, None, &rec.id[..8]));
        assert!(!matches_filters(&rec, None, "no-such-thing"));

        assert!(matches_filters(&rec, Some("claude"), ""));
        assert!(matches_filters(&rec, Some("CLAUDE"), ""));
        assert!(!matches_filters(&rec, Some("openai"), ""));
    }

    #[test]
    fn file_name_dates_parse_only_for_recording_files() {
        assert_eq!(
            date_from_file_name("recordings-2025-03-01.jsonl"),
            chrono::NaiveDate::from_ymd_opt(2025, 3, 1)
        );
        assert_eq!(date_from_file_name("recordings-garbage.jsonl"), None);
        assert_eq!(date_from_file_name("other-2025-03-01.jsonl"), None);
    }

    #[test]
    fn pagination_params_fall_back_to_defaults() {
        assert_eq!(parse_positive(Some("3"), 1), 3);
        assert_eq!(parse_positive(Some("0"), 1), 1);
        assert_eq!(parse_positive(Some("-2"), 50), 50);
        assert_eq!(parse_positive(Some("abc"), 50), 50);
        assert_eq!(parse_positive(None, 50), 50);
    }
}
