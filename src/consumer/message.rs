//! Wire shapes exchanged with the queue and the classifier.

use crate::error::ClassifierError;
use serde::{Deserialize, Serialize};

/// MIME type assumed for inline image data that does not declare one.
pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// A request to moderate one piece of media, as published on the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    pub tags: Vec<String>,
    /// Raw image bytes; base64 on the wire. Older producers send the key `image`.
    #[serde(
        default,
        alias = "image",
        with = "base64_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub image_data: Option<Vec<u8>>,
}

impl ModerationRequest {
    pub fn new(name: impl Into<String>, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            name: name.into(),
            media_url: None,
            mime_type: None,
            tags: tags.into_iter().map(Into::into).collect(),
            image_data: None,
        }
    }

    /// Text handed to the classifier alongside the media: the name, then the
    /// tags separated by spaces, each on its own line.
    pub fn prompt_context(&self) -> String {
        format!("{}\n{}\n", self.name, self.tags.join(" "))
    }

    /// Declared MIME type, or `image/jpeg`.
    pub fn image_mime(&self) -> &str {
        self.mime_type.as_deref().unwrap_or(DEFAULT_IMAGE_MIME)
    }
}

/// The classifier's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationVerdict {
    pub safe: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub caption: String,
}

impl ModerationVerdict {
    /// Parse a JSON reply produced by a model.
    ///
    /// Models often wrap JSON in a fenced code block; the fence is stripped
    /// before parsing.
    pub fn from_json(text: &str) -> Result<Self, ClassifierError> {
        serde_json::from_str(strip_code_fence(text))
            .map_err(|e| ClassifierError::MalformedResponse(e.to_string()))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.strip_prefix("json").unwrap_or(rest);
    body.strip_suffix("```").unwrap_or(body).trim()
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        match Option::<String>::deserialize(d)? {
            Some(text) => {
                STANDARD.decode(text.as_bytes()).map(Some).map_err(serde::de::Error::custom)
            }
            None => Ok(None),
        }
    }
}
