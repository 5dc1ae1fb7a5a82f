use serde::{Deserialize, Serialize};

const GEMINI_VERSIONS: &[&str] = &["v1", "v1beta", "v1alpha"];
const GEMINI_RESOURCES: &[&str] = &["files", "cachedContents", "corpora", "tunedModels", "batches"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Claude,
    Openai,
    Gemini,
    #[serde(other)]
    Unknown,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Openai => "openai",
            Provider::Gemini => "gemini",
            Provider::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "claude" => Ok(Provider::Claude),
            "openai" => Ok(Provider::Openai),
            "gemini" => Ok(Provider::Gemini),
            "unknown" => Ok(Provider::Unknown),
            other => Err(anyhow::anyhow!(
                "unknown provider `{other}`; expected claude, openai, or gemini"
            )),
        }
    }
}

/// Classifies a request path as one of the upstream providers.
///
/// Gemini is checked first because its `models/<id>:<op>` shape overlaps the
/// OpenAI `/v1/models/...` prefix; the colon is the discriminator.
pub fn identify_provider(path: &str) -> Provider {
    let path = strip_query(path);

    if is_gemini_path(path) {
        return Provider::Gemini;
    }

    if path == "/v1/messages" || path.starts_with("/v1/messages/") || path == "/v1/complete" {
        return Provider::Claude;
    }

    if path.starts_with("/v1/chat/completions")
        || path.starts_with("/v1/completions")
        || path.starts_with("/v1/embeddings")
        || path == "/v1/models"
        || path.starts_with("/v1/models/")
        || path.starts_with("/v1/responses")
    {
        return Provider::Openai;
    }

    Provider::Unknown
}

/// Recognizes the Gemini REST surface:
/// `/{v1,v1beta,v1alpha}/models/...:<op>`, the non-model resources under the
/// same versions, and the `/upload/{v}/files` endpoints.
pub fn is_gemini_path(path: &str) -> bool {
    let path = strip_query(path);
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };

    let mut segments = rest.split('/');
    let Some(first) = segments.next() else {
        return false;
    };

    if first == "upload" {
        let Some(version) = segments.next() else {
            return false;
        };
        if !GEMINI_VERSIONS.contains(&version) {
            return false;
        }
        return segments.next() == Some("files");
    }

    if !GEMINI_VERSIONS.contains(&first) {
        return false;
    }

    let Some(resource) = segments.next() else {
        return false;
    };

    if resource == "models" {
        // Model operations always carry a colon (`:generateContent`); a bare
        // model id is OpenAI territory.
        return segments.any(|segment| segment.contains(':'));
    }

    // `models:batchPredict` style operations attach the colon directly to
    // the resource segment.
    if let Some(operation) = resource.strip_prefix("models") {
        return operation.starts_with(':');
    }

    GEMINI_RESOURCES.contains(&resource)
}

fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}
