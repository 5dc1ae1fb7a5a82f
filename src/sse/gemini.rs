use anyhow::Context as _;
use serde_json::{Map, Value, json};

use super::{Event, ParsedStream, data_payload};

/// Parses Gemini's unframed SSE format: `data: {...}` lines carrying
/// `candidates` and `usageMetadata` objects.
pub(super) fn parse(body: &str) -> anyhow::Result<ParsedStream> {
    let mut parsed = ParsedStream::new("gemini");

    for line in body.lines() {
        let line = line.trim();
        if let Some(payload) = data_payload(line) {
            process_chunk(payload, &mut parsed)?;
        }
    }

    Ok(parsed)
}

fn process_chunk(data_json: &str, parsed: &mut ParsedStream) -> anyhow::Result<()> {
    let chunk: Map<String, Value> =
        serde_json::from_str(data_json).context("parse streaming chunk")?;

    if let Some(model_version) = chunk.get("modelVersion").and_then(Value::as_str) {
        parsed
            .metadata
            .insert("model".to_owned(), model_version.into());
    }
    if let Some(response_id) = chunk.get("responseId").and_then(Value::as_str) {
        parsed
            .metadata
            .insert("response_id".to_owned(), response_id.into());
    }

    if let Some(candidate) = chunk
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(Value::as_object)
    {
        if let Some(finish_reason) = candidate.get("finishReason").and_then(Value::as_str) {
            parsed
                .metadata
                .insert("finish_reason".to_owned(), finish_reason.into());
        }
        if let Some(safety_ratings) = candidate.get("safetyRatings") {
            parsed
                .metadata
                .insert("safety_ratings".to_owned(), safety_ratings.clone());
        }
        if let Some(grounding) = candidate.get("groundingMetadata") {
            parsed
                .metadata
                .insert("grounding_metadata".to_owned(), grounding.clone());
        }

        if let Some(content) = candidate.get("content").and_then(Value::as_object) {
            if let Some(role) = content.get("role").and_then(Value::as_str) {
                if !parsed.metadata.contains_key("role") {
                    parsed.metadata.insert("role".to_owned(), role.into());
                }
            }

            if let Some(parts) = content.get("parts").and_then(Value::as_array) {
                for part in parts {
                    if let Some(text) = part.get("text").and_then(Value::as_str) {
                        parsed.text.push_str(text);
                    }
                    if let Some(function_call) =
                        part.get("functionCall").and_then(Value::as_object)
                    {
                        collect_function_call(function_call, parsed);
                    }
                }
            }
        }
    }

    if let Some(usage) = chunk.get("usageMetadata").and_then(Value::as_object) {
        let token_fields = [
            ("promptTokenCount", "prompt_tokens"),
            ("candidatesTokenCount", "completion_tokens"),
            ("totalTokenCount", "total_tokens"),
            ("cachedContentTokenCount", "cached_content_tokens"),
        ];
        for (wire_key, metadata_key) in token_fields {
            if let Some(count) = usage.get(wire_key).and_then(Value::as_i64) {
                parsed.metadata.insert(metadata_key.to_owned(), count.into());
            }
        }
    }

    parsed.events.push(Event {
        event_type: "chunk".to_owned(),
        data: chunk,
    });

    Ok(())
}

fn collect_function_call(function_call: &Map<String, Value>, parsed: &mut ParsedStream) {
    let mut call = Map::new();
    if let Some(name) = function_call.get("name").and_then(Value::as_str) {
        call.insert("name".to_owned(), name.into());
    }
    if let Some(args) = function_call.get("args") {
        call.insert("args".to_owned(), args.clone());
    }

    let calls = parsed
        .metadata
        .entry("function_calls".to_owned())
        .or_insert_with(|| json!([]));
    if let Value::Array(calls) = calls {
        calls.push(Value::Object(call));
    }
}

#[cfg(test)]
mod tests {
    use super::parse;

    const RECORDED_STREAM: &str = r#"data: {"candidates":[{"content":{"parts":[{"text":"The sky"}],"role":"model"},"index":0}],"usageMetadata":{"promptTokenCount":5},"modelVersion":"gemini-2.5-flash-lite","responseId":"abc123"}

data: {"candidates":[{"content":{"parts":[{"text":" is blue"}],"role":"model"},"index":0}],"modelVersion":"gemini-2.5-flash-lite","responseId":"abc123"}

data: {"candidates":[{"content":{"parts":[{"text":"."}],"role":"model"},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":4,"totalTokenCount":9},"modelVersion":"gemini-2.5-flash-lite","responseId":"abc123"}
"#;

    #[test]
    fn reconstructs_text_and_metadata_from_recorded_stream() {
        let parsed = parse(RECORDED_STREAM).unwrap();

        assert_eq!(parsed.provider, "gemini");
        assert_eq!(parsed.text, "The sky is blue.");
        assert_eq!(
            parsed.metadata["model"].as_str(),
            Some("gemini-2.5-flash-lite")
        );
        assert_eq!(parsed.metadata["response_id"].as_str(), Some("abc123"));
        assert_eq!(parsed.metadata["role"].as_str(), Some("model"));
        assert_eq!(parsed.metadata["finish_reason"].as_str(), Some("STOP"));
        assert_eq!(parsed.metadata["prompt_tokens"].as_i64(), Some(5));
        assert_eq!(parsed.metadata["completion_tokens"].as_i64(), Some(4));
        assert_eq!(parsed.metadata["total_tokens"].as_i64(), Some(9));
        assert_eq!(parsed.events.len(), 3);
    }

    #[test]
    fn function_calls_are_collected_in_order() {
        let body = r#"data: {"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"city":"Aarhus"}}},{"functionCall":{"name":"get_time","args":{}}}],"role":"model"},"index":0}]}
"#;

        let parsed = parse(body).unwrap();
        let calls = parsed.metadata["function_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["name"].as_str(), Some("get_weather"));
        assert_eq!(calls[0]["args"]["city"].as_str(), Some("Aarhus"));
        assert_eq!(calls[1]["name"].as_str(), Some("get_time"));
    }

    #[test]
    fn cached_content_tokens_are_reported_when_present() {
        let body = r#"data: {"usageMetadata":{"promptTokenCount":100,"cachedContentTokenCount":80}}
"#;
        let parsed = parse(body).unwrap();
        assert_eq!(parsed.metadata["cached_content_tokens"].as_i64(), Some(80));
    }

    #[test]
    fn malformed_chunk_is_an_error() {
        assert!(parse("data: {broken\n").is_err());
    }
}
