//! From a validated request to an upstream payload.

use std::sync::Arc;

use tracing::{debug, info};

use crate::budget::{self, BudgetConfig};
use crate::extract::{self, AssembledContent, ExtractContext, ExtractorRegistry};
use crate::intake::IncomingRequest;
use crate::proxy::{self, UpstreamRequest};
use crate::router::{self, ModelKind, ModelsConfig};
use crate::storage::ObjectStore;

#[derive(Debug)]
pub struct PreparedRequest {
    pub payload: UpstreamRequest,
    pub model_kind: ModelKind,
    pub model: String,
    pub assembled: AssembledContent,
    pub documents_truncated: bool,
    pub text_truncated: bool,
}

#[derive(Clone)]
pub struct Pipeline {
    registry: Arc<ExtractorRegistry>,
    extract: ExtractContext,
    budgets: BudgetConfig,
    models: ModelsConfig,
    persona: String,
}

impl Pipeline {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            registry: Arc::new(ExtractorRegistry::with_defaults()),
            extract: ExtractContext::new(store, extract::ExtractionConfig::default()),
            budgets: BudgetConfig::default(),
            models: ModelsConfig::default(),
            persona: proxy::DEFAULT_PERSONA.to_string(),
        }
    }

    pub fn with_registry(mut self, registry: ExtractorRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_extract_context(mut self, extract: ExtractContext) -> Self {
        self.extract = extract;
        self
    }

    pub fn with_budgets(mut self, budgets: BudgetConfig) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn with_models(mut self, models: ModelsConfig) -> Self {
        self.models = models;
        self
    }

    pub fn with_persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = persona.into();
        self
    }

    /// Extracts all sources, applies the document and total budgets, picks a
    /// model and builds the payload.
    pub async fn prepare(&self, request: &IncomingRequest) -> PreparedRequest {
        let outcomes = extract::extract_all(
            &self.registry,
            &self.extract,
            &request.context_file_urls,
            &request.attachments,
        )
        .await;
        let sources = outcomes.len();
        let mut assembled = extract::fold(outcomes, self.budgets.file_tokens);

        let documents = budget::truncate(&assembled.text, self.budgets.documents_tokens);
        let documents_truncated = documents.truncated;
        assembled.text = documents.content;

        let combined = if assembled.text.is_empty() {
            request.input.clone()
        } else {
            format!("{}\n\n{}", assembled.text, request.input)
        };
        let total = budget::truncate(&combined, self.budgets.total_tokens);
        if documents_truncated || total.truncated {
            debug!(
                documents_truncated,
                text_truncated = total.truncated,
                "assembled text truncated"
            );
        }

        // System notes carry error text; keep it out of the keyword scan.
        let routed_text = assembled
            .notes
            .iter()
            .fold(total.content.clone(), |text, note| text.replace(note.as_str(), ""));
        let model_kind = router::route(assembled.has_image, request.task_type, &routed_text);
        let model = self.models.resolve(model_kind).to_string();
        let system_prompt = request.context.as_deref().unwrap_or(&self.persona);
        let payload = proxy::build_payload(
            &model,
            system_prompt,
            &request.history,
            &total.content,
            &assembled.images,
        );

        info!(
            sources,
            images = assembled.images.len(),
            notes = assembled.notes.len(),
            estimated_tokens = budget::estimate_tokens(&total.content),
            model = %model,
            kind = model_kind.as_str(),
            "request prepared"
        );

        PreparedRequest {
            payload,
            model_kind,
            model,
            assembled,
            documents_truncated,
            text_truncated: total.truncated,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::media;
    use crate::intake::{Attachment, HistoryEntry, TaskType};
    use crate::proxy::{ContentPart, MessageContent};
    use crate::storage::MemoryObjectStore;
    use bytes::Bytes;

    fn pipeline() -> Pipeline {
        Pipeline::new(Arc::new(MemoryObjectStore::new())).with_models(ModelsConfig {
            general: "general-model".to_string(),
            code: "code-model".to_string(),
            vision: "vision-model".to_string(),
        })
    }

    fn user_text(prepared: &PreparedRequest) -> String {
        match &prepared.payload.messages.last().unwrap().content {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => match &parts[0] {
                ContentPart::Text { text } => text.clone(),
                other => panic!("unexpected part: {other:?}"),
            },
        }
    }

    #[tokio::test]
    async fn plain_question_goes_to_general_model() {
        let request = IncomingRequest {
            input: "What is the capital of France?".to_string(),
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(prepared.model_kind, ModelKind::General);
        assert_eq!(prepared.payload.model, "general-model");
        assert_eq!(user_text(&prepared), "What is the capital of France?");
        assert_eq!(
            prepared.payload.messages[0].content,
            MessageContent::Text(proxy::DEFAULT_PERSONA.to_string())
        );
    }

    #[tokio::test]
    async fn documents_precede_the_question_and_context_sets_system_prompt() {
        let request = IncomingRequest {
            input: "Summarize".to_string(),
            context: Some("Be brief.".to_string()),
            history: vec![HistoryEntry {
                id: "1".to_string(),
                text: "earlier".to_string(),
                sender: "user".to_string(),
            }],
            attachments: vec![Attachment::new(
                "notes.txt",
                media::PLAIN,
                Bytes::from_static(b"line one"),
            )],
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(
            user_text(&prepared),
            "--- Content of notes.txt ---\nline one\n--- End of notes.txt ---\n\nSummarize"
        );
        assert_eq!(
            prepared.payload.messages[0].content,
            MessageContent::Text("Be brief.".to_string())
        );
        assert_eq!(prepared.payload.messages.len(), 3);
    }

    #[tokio::test]
    async fn image_upload_routes_to_vision() {
        let request = IncomingRequest {
            input: String::new(),
            task_type: TaskType::Coding,
            attachments: vec![Attachment::new(
                "shot.png",
                "image/png",
                Bytes::from_static(b"png"),
            )],
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(prepared.model_kind, ModelKind::Vision);
        assert_eq!(prepared.model, "vision-model");
        assert_eq!(user_text(&prepared), proxy::DEFAULT_IMAGE_PROMPT);
    }

    #[tokio::test]
    async fn malformed_pdf_still_produces_a_payload() {
        let request = IncomingRequest {
            input: "read this".to_string(),
            attachments: vec![Attachment::new(
                "broken.pdf",
                media::PDF,
                Bytes::from_static(b"definitely not a pdf"),
            )],
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(user_text(&prepared), "read this");
        assert!(prepared.assembled.notes.is_empty());
    }

    #[tokio::test]
    async fn code_in_an_attachment_routes_to_code_model() {
        let request = IncomingRequest {
            input: "summarize this".to_string(),
            attachments: vec![Attachment::new(
                "notes.txt",
                media::PLAIN,
                Bytes::from_static(b"please debug this python function"),
            )],
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(prepared.model_kind, ModelKind::Code);
        assert_eq!(prepared.payload.model, "code-model");
    }

    #[tokio::test]
    async fn failure_notes_do_not_trigger_code_routing() {
        let request = IncomingRequest {
            input: "what is in this file".to_string(),
            context_file_urls: vec!["http://127.0.0.1:1/files/notes.md".to_string()],
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(prepared.assembled.notes.len(), 1);
        assert!(user_text(&prepared).contains("[System note: could not load context file"));
        assert_eq!(prepared.model_kind, ModelKind::General);
    }

    #[tokio::test]
    async fn daily_task_ignores_code_in_documents() {
        let request = IncomingRequest {
            input: "summarize this".to_string(),
            task_type: TaskType::Daily,
            attachments: vec![Attachment::new(
                "notes.txt",
                media::PLAIN,
                Bytes::from_static(b"please debug this python function"),
            )],
            ..IncomingRequest::default()
        };
        let prepared = pipeline().prepare(&request).await;
        assert_eq!(prepared.model_kind, ModelKind::General);
    }

    #[tokio::test]
    async fn total_budget_caps_final_text() {
        let big = "word ".repeat(10_000);
        let request = IncomingRequest {
            input: "go".to_string(),
            attachments: vec![Attachment::new(
                "big.txt",
                media::PLAIN,
                Bytes::from(big.into_bytes()),
            )],
            ..IncomingRequest::default()
        };
        let prepared = pipeline()
            .with_budgets(BudgetConfig {
                file_tokens: 5_000,
                documents_tokens: 2_000,
                total_tokens: 1_000,
            })
            .prepare(&request)
            .await;
        assert!(prepared.documents_truncated);
        assert!(prepared.text_truncated);
        assert!(budget::estimate_tokens(&user_text(&prepared)) <= 1_000);
    }
}
