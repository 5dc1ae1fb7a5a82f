use serde_json::{Map, Value};

use crate::router::Provider;

mod claude;
mod gemini;
mod openai;

/// A recorded SSE stream reduced to its logical content: the event
/// inventory, the reconstructed text, and provider-specific metadata.
#[derive(Debug, Clone, Default)]
pub struct ParsedStream {
    pub provider: &'static str,
    pub events: Vec<Event>,
    pub text: String,
    pub metadata: Map<String, Value>,
}

impl ParsedStream {
    fn new(provider: &'static str) -> Self {
        Self {
            provider,
            events: Vec::new(),
            text: String::new(),
            metadata: Map::new(),
        }
    }
}

/// One wire event: its type tag and the parsed JSON payload.
#[derive(Debug, Clone)]
pub struct Event {
    pub event_type: String,
    pub data: Map<String, Value>,
}

pub type ParseFn = fn(&str) -> anyhow::Result<ParsedStream>;

/// Parser factory keyed on the provider. Parsers are pure functions: same
/// input, same output, no side effects.
pub fn parser_for(provider: Provider) -> Option<ParseFn> {
    match provider {
        Provider::Claude => Some(claude::parse),
        Provider::Openai => Some(openai::parse),
        Provider::Gemini => Some(gemini::parse),
        Provider::Unknown => None,
    }
}

/// Strips the `data: ` field prefix from an SSE line.
fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data: ")
}
