use anyhow::Context as _;
use serde_json::{Map, Value};

use super::{Event, ParsedStream, data_payload};

/// Parses Claude's framed SSE format: `event: <type>` followed by one or
/// more `data:` lines, flushed by a blank line or the next `event:` line.
pub(super) fn parse(body: &str) -> anyhow::Result<ParsedStream> {
    let mut parsed = ParsedStream::new("claude");

    let mut current_event_type = String::new();
    let mut current_data = String::new();

    for line in body.lines() {
        let line = line.trim();

        if let Some(event_type) = line.strip_prefix("event: ") {
            if !current_event_type.is_empty() && !current_data.is_empty() {
                process_event(&current_event_type, &current_data, &mut parsed)?;
                current_data.clear();
            }
            current_event_type = event_type.to_owned();
        } else if let Some(payload) = data_payload(line) {
            if !current_data.is_empty() {
                current_data.push('\n');
            }
            current_data.push_str(payload);
        } else if line.is_empty() && !current_event_type.is_empty() && !current_data.is_empty() {
            process_event(&current_event_type, &current_data, &mut parsed)?;
            current_event_type.clear();
            current_data.clear();
        }
    }

    if !current_event_type.is_empty() && !current_data.is_empty() {
        process_event(&current_event_type, &current_data, &mut parsed)?;
    }

    Ok(parsed)
}

fn process_event(
    event_type: &str,
    data_json: &str,
    parsed: &mut ParsedStream,
) -> anyhow::Result<()> {
    // Ping payloads are not always JSON; everything else must be an object.
    let data: Map<String, Value> = match serde_json::from_str(data_json) {
        Ok(Value::Object(data)) => data,
        _ if event_type == "ping" => return Ok(()),
        Ok(other) => anyhow::bail!("event {event_type} payload is not a JSON object: {other}"),
        Err(err) => {
            return Err(err).with_context(|| format!("parse event {event_type} payload"));
        }
    };

    match event_type {
        "message_start" => extract_message_start_metadata(&data, parsed),
        "content_block_delta" => extract_delta(&data, parsed),
        "message_delta" => extract_message_delta_metadata(&data, parsed),
        _ => {}
    }

    parsed.events.push(Event {
        event_type: event_type.to_owned(),
        data,
    });

    Ok(())
}

fn extract_message_start_metadata(data: &Map<String, Value>, parsed: &mut ParsedStream) {
    let Some(message) = data.get("message").and_then(Value::as_object) else {
        return;
    };

    if let Some(model) = message.get("model").and_then(Value::as_str) {
        parsed.metadata.insert("model".to_owned(), model.into());
    }
    if let Some(id) = message.get("id").and_then(Value::as_str) {
        parsed.metadata.insert("message_id".to_owned(), id.into());
    }
    if let Some(usage) = message.get("usage").and_then(Value::as_object) {
        for key in [
            "input_tokens",
            "cache_creation_input_tokens",
            "cache_read_input_tokens",
        ] {
            if let Some(value) = usage.get(key) {
                parsed.metadata.insert(key.to_owned(), value.clone());
            }
        }
    }
}

fn extract_delta(data: &Map<String, Value>, parsed: &mut ParsedStream) {
    let Some(delta) = data.get("delta").and_then(Value::as_object) else {
        return;
    };

    match delta.get("type").and_then(Value::as_str) {
        Some("text_delta") => {
            if let Some(text) = delta.get("text").and_then(Value::as_str) {
                parsed.text.push_str(text);
            }
        }
        Some("thinking_delta") => {
            if let Some(thinking) = delta.get("thinking").and_then(Value::as_str) {
                append_string_metadata(parsed, "thinking", thinking);
            }
        }
        Some("input_json_delta") => {
            if let Some(partial_json) = delta.get("partial_json").and_then(Value::as_str) {
                append_string_metadata(parsed, "tool_input", partial_json);
            }
        }
        _ => {}
    }
}

fn extract_message_delta_metadata(data: &Map<String, Value>, parsed: &mut ParsedStream) {
    if let Some(stop_reason) = data
        .get("delta")
        .and_then(Value::as_object)
        .and_then(|delta| delta.get("stop_reason"))
        .and_then(Value::as_str)
    {
        parsed
            .metadata
            .insert("stop_reason".to_owned(), stop_reason.into());
    }

    if let Some(output_tokens) = data
        .get("usage")
        .and_then(Value::as_object)
        .and_then(|usage| usage.get("output_tokens"))
    {
        parsed
            .metadata
            .insert("output_tokens".to_owned(), output_tokens.clone());
    }
}

fn append_string_metadata(parsed: &mut ParsedStream, key: &str, fragment: &str) {
    match parsed.metadata.get_mut(key) {
        Some(Value::String(existing)) => existing.push_str(fragment),
        _ => {
            parsed.metadata.insert(key.to_owned(), fragment.into());
        }
    }
}
