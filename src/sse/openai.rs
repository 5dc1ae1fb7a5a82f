use anyhow::Context as _;
use serde_json::{Map, Value, json};

use super::{Event, ParsedStream, data_payload};

const DONE_MARKER: &str = "[DONE]";

/// Parses OpenAI's unframed SSE format: every event is a `data: {...}` line,
/// terminated by `data: [DONE]`.
pub(super) fn parse(body: &str) -> anyhow::Result<ParsedStream> {
    let mut parsed = ParsedStream::new("openai");

    for line in body.lines() {
        let line = line.trim();
        let Some(payload) = data_payload(line) else {
            continue;
        };

        if payload == DONE_MARKER {
            let mut data = Map::new();
            data.insert("marker".to_owned(), DONE_MARKER.into());
            parsed.events.push(Event {
                event_type: "done".to_owned(),
                data,
            });
            continue;
        }

        process_chunk(payload, &mut parsed)?;
    }

    Ok(parsed)
}

fn process_chunk(data_json: &str, parsed: &mut ParsedStream) -> anyhow::Result<()> {
    let chunk: Map<String, Value> =
        serde_json::from_str(data_json).context("parse streaming chunk")?;

    // id/model/created come from the first chunk only.
    if parsed.events.is_empty() {
        if let Some(id) = chunk.get("id").and_then(Value::as_str) {
            parsed.metadata.insert("id".to_owned(), id.into());
        }
        if let Some(model) = chunk.get("model").and_then(Value::as_str) {
            parsed.metadata.insert("model".to_owned(), model.into());
        }
        if let Some(created) = chunk.get("created").and_then(Value::as_i64) {
            parsed.metadata.insert("created".to_owned(), created.into());
        }
    }

    if let Some(choice) = chunk
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(Value::as_object)
    {
        if let Some(delta) = choice.get("delta").and_then(Value::as_object) {
            if let Some(content) = delta.get("content").and_then(Value::as_str) {
                parsed.text.push_str(content);
            }
            if let Some(role) = delta.get("role").and_then(Value::as_str) {
                parsed.metadata.insert("role".to_owned(), role.into());
            }
            if let Some(tool_calls) = delta.get("tool_calls").and_then(Value::as_array) {
                merge_tool_calls(tool_calls, parsed);
            }
        }

        if let Some(finish_reason) = choice.get("finish_reason").and_then(Value::as_str) {
            parsed
                .metadata
                .insert("finish_reason".to_owned(), finish_reason.into());
        }
        if let Some(index) = choice.get("index").and_then(Value::as_i64) {
            parsed.metadata.insert("choice_index".to_owned(), index.into());
        }
    }

    if let Some(usage) = chunk.get("usage").and_then(Value::as_object) {
        for key in ["prompt_tokens", "completion_tokens", "total_tokens"] {
            if let Some(count) = usage.get(key).and_then(Value::as_i64) {
                parsed.metadata.insert(key.to_owned(), count.into());
            }
        }
    }

    parsed.events.push(Event {
        event_type: "chunk".to_owned(),
        data: chunk,
    });

    Ok(())
}

/// Tool calls stream as per-index fragments; merge each fragment into the
/// accumulated call at its index, concatenating the argument string.
fn merge_tool_calls(tool_calls: &[Value], parsed: &mut ParsedStream) {
    let existing = parsed
        .metadata
        .entry("tool_calls".to_owned())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(calls) = existing else {
        return;
    };

    for fragment in tool_calls {
        let Some(fragment) = fragment.as_object() else {
            continue;
        };
        let Some(index) = fragment.get("index").and_then(Value::as_u64) else {
            continue;
        };
        let index = index as usize;

        while calls.len() <= index {
            calls.push(json!({}));
        }
        let Some(call) = calls[index].as_object_mut() else {
            continue;
        };

        if let Some(id) = fragment.get("id").and_then(Value::as_str) {
            call.insert("id".to_owned(), id.into());
        }
        if let Some(call_type) = fragment.get("type").and_then(Value::as_str) {
            call.insert("type".to_owned(), call_type.into());
        }
        if let Some(function) = fragment.get("function").and_then(Value::as_object) {
            let entry = call
                .entry("function".to_owned())
                .or_insert_with(|| json!({}));
            let Some(function_data) = entry.as_object_mut() else {
                continue;
            };

            if let Some(name) = function.get("name").and_then(Value::as_str) {
                function_data.insert("name".to_owned(), name.into());
            }
            if let Some(arguments) = function.get("arguments").and_then(Value::as_str) {
                match function_data.get_mut("arguments") {
                    Some(Value::String(existing)) => existing.push_str(arguments),
                    _ => {
                        function_data.insert("arguments".to_owned(), arguments.into());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse;

    const RECORDED_STREAM: &str = r#"data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{"role":"assistant","content":""},"finish_reason":null}]}

data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{"content":"Hello"},"finish_reason":null}]}

data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{"content":" world"},"finish_reason":null}]}

data: {"id":"chatcmpl-123","object":"chat.completion.chunk","created":1694268190,"model":"gpt-4","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}

data: [DONE]
"#;

    #[test]
    fn reconstructs_text_and_metadata_from_recorded_stream() {
        let parsed = parse(RECORDED_STREAM).unwrap();

        assert_eq!(parsed.provider, "openai");
        assert_eq!(parsed.text, "Hello world");
        assert_eq!(parsed.metadata["id"].as_str(), Some("chatcmpl-123"));
        assert_eq!(parsed.metadata["model"].as_str(), Some("gpt-4"));
        assert_eq!(parsed.metadata["created"].as_i64(), Some(1694268190));
        assert_eq!(parsed.metadata["role"].as_str(), Some("assistant"));
        assert_eq!(parsed.metadata["finish_reason"].as_str(), Some("stop"));

        let last = parsed.events.last().unwrap();
        assert_eq!(last.event_type, "done");
        assert_eq!(last.data["marker"].as_str(), Some("[DONE]"));
        let done_events = parsed
            .events
            .iter()
            .filter(|event| event.event_type == "done")
            .count();
        assert_eq!(done_events, 1);
    }

    #[test]
    fn text_equals_concatenated_delta_content() {
        let parsed = parse(RECORDED_STREAM).unwrap();
        let concatenated: String = parsed
            .events
            .iter()
            .filter(|event| event.event_type == "chunk")
            .filter_map(|event| {
                event.data["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(str::to_owned)
            })
            .collect();
        assert_eq!(parsed.text, concatenated);
    }

    #[test]
    fn tool_call_fragments_merge_by_index() {
        let body = r#"data: {"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_weather","arguments":"{\"ci"}}]},"finish_reason":null}]}

data: {"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"ty\":\"Oslo\"}"}}]},"finish_reason":null}]}
"#;

        let parsed = parse(body).unwrap();
        let calls = parsed.metadata["tool_calls"].as_array().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0]["id"].as_str(), Some("call_1"));
        assert_eq!(calls[0]["function"]["name"].as_str(), Some("get_weather"));
        assert_eq!(
            calls[0]["function"]["arguments"].as_str(),
            Some("{\"city\":\"Oslo\"}")
        );
    }

    #[test]
    fn usage_tokens_land_in_metadata() {
        let body = r#"data: {"id":"c","choices":[],"usage":{"prompt_tokens":12,"completion_tokens":7,"total_tokens":19}}
"#;
        let parsed = parse(body).unwrap();
        assert_eq!(parsed.metadata["prompt_tokens"].as_i64(), Some(12));
        assert_eq!(parsed.metadata["completion_tokens"].as_i64(), Some(7));
        assert_eq!(parsed.metadata["total_tokens"].as_i64(), Some(19));
    }

    #[test]
    fn malformed_chunk_is_an_error() {
        assert!(parse("data: {not json}\n").is_err());
    }
}
