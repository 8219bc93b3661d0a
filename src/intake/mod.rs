//! Inbound request model, multipart decoding and upload validation.

pub mod multipart;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};

use crate::extract::media;
use crate::{RelayError, Result};

pub const DEFAULT_MAX_FILE_BYTES: usize = 25 * 1024 * 1024;
pub const DEFAULT_MAX_TOTAL_BYTES: usize = 50 * 1024 * 1024;
const BODY_OVERHEAD_BYTES: usize = 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeLimits {
    pub max_file_bytes: usize,
    pub max_total_bytes: usize,
    /// Raw body cap; defaults to `max_total_bytes` plus room for form fields.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_body_bytes: Option<usize>,
}

impl Default for IntakeLimits {
    fn default() -> Self {
        Self {
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_body_bytes: None,
        }
    }
}

impl IntakeLimits {
    pub fn body_limit(&self) -> usize {
        self.max_body_bytes
            .unwrap_or_else(|| self.max_total_bytes.saturating_add(BODY_OVERHEAD_BYTES))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    #[default]
    General,
    Daily,
    Coding,
}

impl TaskType {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "daily" => Self::Daily,
            "coding" => Self::Coding,
            _ => Self::General,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sender: String,
}

impl HistoryEntry {
    pub fn is_user(&self) -> bool {
        self.sender.eq_ignore_ascii_case("user")
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(value) => value,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

#[derive(Clone, Debug)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub data: Bytes,
}

impl Attachment {
    pub fn new(name: impl Into<String>, media_type: &str, data: Bytes) -> Self {
        Self {
            name: name.into(),
            media_type: media::normalize(media_type),
            data,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

#[derive(Clone, Debug, Default)]
pub struct IncomingRequest {
    pub input: String,
    pub task_type: TaskType,
    pub context: Option<String>,
    pub history: Vec<HistoryEntry>,
    pub attachments: Vec<Attachment>,
    pub context_file_urls: Vec<String>,
}

impl IncomingRequest {
    pub fn from_multipart(content_type: &str, body: &Bytes) -> Result<Self> {
        let parts = multipart::parse_form(content_type, body).map_err(RelayError::validation)?;

        let mut input: Option<String> = None;
        let mut request = Self::default();

        for part in parts {
            if part.is_file() || part.field == "files" {
                let name = part
                    .file_name
                    .clone()
                    .filter(|name| !name.trim().is_empty())
                    .unwrap_or_else(|| format!("file-{}", request.attachments.len() + 1));
                let media_type = part.content_type.as_deref().unwrap_or(media::OCTET_STREAM);
                request
                    .attachments
                    .push(Attachment::new(name, media_type, part.data));
                continue;
            }

            match part.field.as_str() {
                "input" => input = Some(part.text()),
                "taskType" => request.task_type = TaskType::parse(&part.text()),
                "context" => {
                    let context = part.text();
                    if !context.trim().is_empty() {
                        request.context = Some(context);
                    }
                }
                "history" => request.history = parse_json_field(&part.text(), "history")?,
                "contextFileUrls" => {
                    let urls: Vec<String> = parse_json_field(&part.text(), "contextFileUrls")?;
                    request.context_file_urls = urls
                        .into_iter()
                        .map(|url| url.trim().to_string())
                        .filter(|url| !url.is_empty())
                        .collect();
                }
                _ => {}
            }
        }

        request.input = input.ok_or_else(|| RelayError::validation("missing input field"))?;
        Ok(request)
    }

    /// Checks per-file size, then media types, then the aggregate size.
    pub fn validate(&self, limits: &IntakeLimits) -> Result<()> {
        for attachment in &self.attachments {
            if attachment.size() > limits.max_file_bytes {
                return Err(RelayError::FileTooLarge {
                    name: attachment.name.clone(),
                    size: attachment.size(),
                    limit: limits.max_file_bytes,
                });
            }
        }

        for attachment in &self.attachments {
            if !media::is_supported(&attachment.media_type) {
                return Err(RelayError::UnsupportedMediaType {
                    name: attachment.name.clone(),
                    media_type: attachment.media_type.clone(),
                });
            }
        }

        let total = self
            .attachments
            .iter()
            .fold(0usize, |acc, attachment| acc.saturating_add(attachment.size()));
        if total > limits.max_total_bytes {
            return Err(RelayError::AggregateTooLarge {
                total,
                limit: limits.max_total_bytes,
            });
        }

        Ok(())
    }
}

fn parse_json_field<T>(raw: &str, field: &str) -> Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw)
        .map_err(|err| RelayError::validation(format!("{field} must be a JSON array: {err}")))
}
