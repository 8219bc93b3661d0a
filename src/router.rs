//! Model selection.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::intake::TaskType;

pub const CODING_KEYWORDS: &[&str] = &[
    "code",
    "coding",
    "python",
    "javascript",
    "typescript",
    "java",
    "rust",
    "golang",
    "debug",
    "debugging",
    "bug",
    "function",
    "react",
    "sql",
    "api",
    "algorithm",
    "compile",
    "compiler",
    "error",
    "exception",
    "script",
    "html",
    "css",
    "regex",
    "program",
    "programming",
    "stacktrace",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Vision,
    General,
    Code,
}

impl ModelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vision => "vision",
            Self::General => "general",
            Self::Code => "code",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    pub general: String,
    pub code: String,
    pub vision: String,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            general: "gpt-4o-mini".to_string(),
            code: "gpt-4o".to_string(),
            vision: "gpt-4o".to_string(),
        }
    }
}

impl ModelsConfig {
    pub fn resolve(&self, kind: ModelKind) -> &str {
        match kind {
            ModelKind::Vision => &self.vision,
            ModelKind::General => &self.general,
            ModelKind::Code => &self.code,
        }
    }
}

fn coding_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        let pattern = format!(r"(?i)\b(?:{})\b", CODING_KEYWORDS.join("|"));
        Regex::new(&pattern).expect("coding keyword regex is valid")
    })
}

pub fn mentions_code(text: &str) -> bool {
    coding_regex().is_match(text)
}

/// Images win, then an explicit task type, then a keyword scan of `text`.
pub fn route(has_image: bool, task_type: TaskType, text: &str) -> ModelKind {
    if has_image {
        return ModelKind::Vision;
    }
    match task_type {
        TaskType::Daily => ModelKind::General,
        TaskType::Coding => ModelKind::Code,
        TaskType::General if mentions_code(text) => ModelKind::Code,
        TaskType::General => ModelKind::General,
    }
}
