use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;
use warden_core::domain::intent::{Intent, IntentId, IntentType};

use crate::model::{ModelClient, ModelError, ModelRequest};

pub const PROMPT_TEMPLATE_VERSION: &str = "intent-v3";

/// Structured payload the model is prompted to emit. Anything that fails to
/// parse into this shape is treated as a model failure and handled by the
/// rule-based fallback.
#[derive(Debug, Deserialize)]
struct ModelIntentPayload {
    intent_type: String,
    #[serde(default)]
    operations: Vec<String>,
    #[serde(default)]
    entities: BTreeMap<String, String>,
    confidence: f64,
    #[serde(default)]
    response: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefinerPath {
    Model,
    Fallback,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RefinerOutput {
    pub intent: Intent,
    pub path: RefinerPath,
    pub model_version: Option<String>,
}

/// An availability failure is its own outcome, never an intent: a request
/// hitting an open breaker or a timed-out backend must be told to retry,
/// not handed a degraded classification as if it were a healthy one.
#[derive(Clone, Debug, PartialEq)]
pub enum RefinerResult {
    Refined(RefinerOutput),
    Unavailable { reason: String },
}

/// Turns redacted text into a structured [`Intent`]. The model is a
/// classifier here, nothing more: its output is parsed, clamped, and checked
/// against the confidence threshold. A rule-based classifier stands in when
/// the model emits garbage or a connection attempt fails; an open breaker or
/// a timeout surfaces as [`RefinerResult::Unavailable`] instead.
pub struct IntentRefiner {
    model: Arc<dyn ModelClient>,
    confidence_threshold: f64,
}

impl IntentRefiner {
    pub fn new(model: Arc<dyn ModelClient>, confidence_threshold: f64) -> Self {
        Self { model, confidence_threshold }
    }

    pub async fn refine(&self, redacted_text: &str) -> RefinerResult {
        let request = ModelRequest {
            prompt: build_prompt(redacted_text),
            template_version: PROMPT_TEMPLATE_VERSION.to_string(),
        };

        match self.model.complete(&request).await {
            Ok(response) => match serde_json::from_str::<ModelIntentPayload>(&response.text) {
                Ok(payload) => RefinerResult::Refined(RefinerOutput {
                    intent: self.from_payload(payload, redacted_text),
                    path: RefinerPath::Model,
                    model_version: Some(response.model_version),
                }),
                Err(error) => {
                    warn!(
                        event_name = "refiner_unparseable_model_output",
                        error = %error,
                        "falling back to rule-based classification"
                    );
                    self.fallback(redacted_text)
                }
            },
            Err(error @ (ModelError::Timeout(_) | ModelError::Unavailable(_))) => {
                warn!(
                    event_name = "refiner_model_unavailable",
                    error = %error,
                    "inference backend unavailable; request must be retried"
                );
                RefinerResult::Unavailable { reason: error.to_string() }
            }
            Err(error) => {
                warn!(
                    event_name = "refiner_model_unreachable",
                    error = %error,
                    "falling back to rule-based classification"
                );
                self.fallback(redacted_text)
            }
        }
    }

    fn fallback(&self, redacted_text: &str) -> RefinerResult {
        RefinerResult::Refined(RefinerOutput {
            intent: self.finish(classify_by_rules(redacted_text), redacted_text),
            path: RefinerPath::Fallback,
            model_version: None,
        })
    }

    fn from_payload(&self, payload: ModelIntentPayload, redacted_text: &str) -> Intent {
        let draft = IntentDraft {
            intent_type: parse_intent_type(&payload.intent_type),
            operations: payload.operations,
            entities: payload.entities,
            confidence: payload.confidence.clamp(0.0, 1.0),
            response: payload.response,
        };
        self.finish(draft, redacted_text)
    }

    fn finish(&self, draft: IntentDraft, redacted_text: &str) -> Intent {
        let below_threshold = draft.confidence < self.confidence_threshold;
        let needs_clarification = below_threshold
            || (draft.intent_type == IntentType::Action && draft.operations.is_empty());

        Intent {
            id: IntentId(Uuid::new_v4().to_string()),
            intent_type: draft.intent_type,
            entities: draft.entities,
            // A low-confidence intent never carries operations forward.
            requested_operations: if needs_clarification {
                Vec::new()
            } else {
                draft.operations
            },
            confidence: draft.confidence,
            clarification_needed: needs_clarification,
            clarification_question: needs_clarification
                .then(|| clarification_question(draft.intent_type)),
            response: draft.response,
            source_text_redacted: redacted_text.to_string(),
            created_at: Utc::now(),
        }
    }
}

struct IntentDraft {
    intent_type: IntentType,
    operations: Vec<String>,
    entities: BTreeMap<String, String>,
    confidence: f64,
    response: Option<String>,
}

fn build_prompt(redacted_text: &str) -> String {
    format!(
        "Classify the business request below into JSON with fields intent_type \
         (informational|action|cancellation|capability_inquiry|unknown), operations \
         (allowlisted tool ids), entities (string map), confidence (0..1), and an \
         optional response.\n\nRequest: {redacted_text}"
    )
}

fn parse_intent_type(raw: &str) -> IntentType {
    match raw.trim().to_lowercase().as_str() {
        "informational" => IntentType::Informational,
        "action" => IntentType::Action,
        "cancellation" => IntentType::Cancellation,
        "capability_inquiry" => IntentType::CapabilityInquiry,
        _ => IntentType::Unknown,
    }
}

fn clarification_question(intent_type: IntentType) -> String {
    match intent_type {
        IntentType::Action => {
            "Which record should this apply to, and what exactly should change?".to_string()
        }
        _ => "Could you rephrase what you would like me to do?".to_string(),
    }
}

/// Deterministic keyword classifier used when the model is unavailable. It
/// is deliberately less capable than the model path; anything it cannot
/// place lands in `Unknown` with low confidence.
fn classify_by_rules(text: &str) -> IntentDraft {
    let normalized = text.to_lowercase();
    let entities = extract_entities(&normalized);

    if normalized.contains("cancel") || normalized.contains("never mind") {
        return IntentDraft {
            intent_type: IntentType::Cancellation,
            operations: Vec::new(),
            entities,
            confidence: 0.85,
            response: None,
        };
    }

    if normalized.contains("what can you do")
        || normalized.contains("capabilities")
        || normalized.contains("are you able to")
    {
        return IntentDraft {
            intent_type: IntentType::CapabilityInquiry,
            operations: Vec::new(),
            entities,
            confidence: 0.8,
            response: None,
        };
    }

    let mut operations = Vec::new();
    if normalized.contains("purge") || normalized.contains("delete") {
        operations.push("records.purge".to_string());
    }
    if normalized.contains("adjust")
        || normalized.contains("quantity")
        || normalized.contains("inventory")
    {
        operations.push("inventory.adjust".to_string());
    }
    if normalized.contains("update")
        || normalized.contains("close")
        || normalized.contains("archive")
        || normalized.contains("reopen")
    {
        operations.push("records.update".to_string());
    }
    if operations.is_empty()
        && (normalized.contains("look up")
            || normalized.contains("lookup")
            || normalized.contains("find")
            || normalized.contains("show")
            || normalized.contains("status of"))
    {
        operations.push("records.lookup".to_string());
    }

    if !operations.is_empty() {
        return IntentDraft {
            intent_type: IntentType::Action,
            operations,
            entities,
            confidence: 0.7,
            response: None,
        };
    }

    if normalized.starts_with("what")
        || normalized.starts_with("how")
        || normalized.contains("report")
    {
        return IntentDraft {
            intent_type: IntentType::Informational,
            operations: Vec::new(),
            entities,
            confidence: 0.65,
            response: None,
        };
    }

    IntentDraft {
        intent_type: IntentType::Unknown,
        operations: Vec::new(),
        entities,
        confidence: 0.3,
        response: None,
    }
}

fn extract_entities(normalized: &str) -> BTreeMap<String, String> {
    let mut entities = BTreeMap::new();

    for token in normalized.split_whitespace() {
        let token = token.trim_matches(|ch: char| !ch.is_ascii_alphanumeric() && ch != '-');
        if token.len() > 2
            && token.starts_with("r-")
            && token[2..].chars().all(|ch| ch.is_ascii_digit())
        {
            entities.insert("record_id".to_string(), token.to_string());
        }
        if matches!(token, "open" | "closed" | "archived") {
            entities.insert("status".to_string(), token.to_string());
        }
        if let Some(stripped) = token.strip_prefix('+').or_else(|| token.strip_prefix('-')) {
            if !stripped.is_empty() && stripped.chars().all(|ch| ch.is_ascii_digit()) {
                entities.insert("delta".to_string(), token.to_string());
            }
        }
    }

    entities
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use warden_core::domain::intent::IntentType;

    use super::{IntentRefiner, RefinerOutput, RefinerPath, RefinerResult};
    use crate::model::{ModelClient, ModelError, ModelRequest, ModelResponse};

    struct CannedModel {
        reply: Option<String>,
    }

    #[async_trait]
    impl ModelClient for CannedModel {
        async fn complete(
            &self,
            _request: &ModelRequest,
        ) -> Result<ModelResponse, ModelError> {
            match &self.reply {
                Some(text) => Ok(ModelResponse {
                    text: text.clone(),
                    model_id: "test-model".to_string(),
                    model_version: "test-model-1".to_string(),
                }),
                None => Err(ModelError::Connection("refused".to_string())),
            }
        }
    }

    struct DownModel {
        error: ModelError,
    }

    #[async_trait]
    impl ModelClient for DownModel {
        async fn complete(
            &self,
            _request: &ModelRequest,
        ) -> Result<ModelResponse, ModelError> {
            Err(self.error.clone())
        }
    }

    fn refiner(reply: Option<&str>) -> IntentRefiner {
        IntentRefiner::new(
            Arc::new(CannedModel { reply: reply.map(str::to_string) }),
            0.6,
        )
    }

    fn refined(result: RefinerResult) -> RefinerOutput {
        match result {
            RefinerResult::Refined(output) => output,
            other => panic!("expected a refined intent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn parses_structured_model_output() {
        let refiner = refiner(Some(
            r#"{"intent_type":"action","operations":["records.update"],
                "entities":{"record_id":"r-7","status":"closed"},"confidence":0.92}"#,
        ));

        let output = refined(refiner.refine("close record r-7").await);

        assert_eq!(output.path, RefinerPath::Model);
        assert_eq!(output.intent.intent_type, IntentType::Action);
        assert_eq!(output.intent.requested_operations, vec!["records.update".to_string()]);
        assert_eq!(output.intent.entities.get("record_id").map(String::as_str), Some("r-7"));
        assert!(!output.intent.clarification_needed);
        assert_eq!(output.intent.source_text_redacted, "close record r-7");
    }

    #[tokio::test]
    async fn low_confidence_asks_for_clarification_and_drops_operations() {
        let refiner = refiner(Some(
            r#"{"intent_type":"action","operations":["records.purge"],"confidence":0.4}"#,
        ));

        let output = refined(refiner.refine("do the thing from before").await);

        assert!(output.intent.clarification_needed);
        assert!(output.intent.requested_operations.is_empty());
        assert!(output.intent.clarification_question.is_some());
    }

    #[tokio::test]
    async fn unreachable_model_falls_back_to_rules() {
        let refiner = refiner(None);

        let output = refined(refiner.refine("look up record r-42").await);

        assert_eq!(output.path, RefinerPath::Fallback);
        assert_eq!(output.intent.intent_type, IntentType::Action);
        assert_eq!(output.intent.requested_operations, vec!["records.lookup".to_string()]);
        assert_eq!(
            output.intent.entities.get("record_id").map(String::as_str),
            Some("r-42")
        );
    }

    #[tokio::test]
    async fn garbage_model_output_falls_back_to_rules() {
        let refiner = refiner(Some("sure! here is a poem about records"));

        let output = refined(refiner.refine("adjust inventory for r-7 by -3").await);

        assert_eq!(output.path, RefinerPath::Fallback);
        assert_eq!(
            output.intent.requested_operations,
            vec!["inventory.adjust".to_string()]
        );
        assert_eq!(output.intent.entities.get("delta").map(String::as_str), Some("-3"));
    }

    #[tokio::test]
    async fn unclassifiable_text_is_unknown_with_clarification() {
        let refiner = refiner(None);

        let output = refined(refiner.refine("banana banana banana").await);

        assert_eq!(output.intent.intent_type, IntentType::Unknown);
        assert!(output.intent.clarification_needed);
    }

    #[tokio::test]
    async fn open_breaker_surfaces_unavailable_not_an_intent() {
        let refiner = IntentRefiner::new(
            Arc::new(DownModel {
                error: ModelError::Unavailable("circuit breaker is open".to_string()),
            }),
            0.6,
        );

        let result = refiner.refine("purge record r-9").await;

        let RefinerResult::Unavailable { reason } = result else {
            panic!("expected unavailable, got {result:?}");
        };
        assert!(reason.contains("circuit breaker is open"));
    }

    #[tokio::test]
    async fn model_timeout_surfaces_unavailable() {
        let refiner = IntentRefiner::new(
            Arc::new(DownModel { error: ModelError::Timeout(Duration::from_secs(5)) }),
            0.6,
        );

        let result = refiner.refine("look up record r-42").await;

        assert!(matches!(result, RefinerResult::Unavailable { .. }));
    }

    #[tokio::test]
    async fn cancel_keyword_classifies_confidently_without_the_model() {
        let refiner = refiner(None);

        let output = refined(refiner.refine("cancel that request").await);

        assert_eq!(output.intent.intent_type, IntentType::Cancellation);
        assert!(output.intent.confidence > 0.8);
        assert!(output.intent.requested_operations.is_empty());
        assert!(!output.intent.clarification_needed);
    }

    #[tokio::test]
    async fn confidence_is_clamped_into_unit_range() {
        let refiner = refiner(Some(
            r#"{"intent_type":"informational","confidence":7.5}"#,
        ));

        let output = refined(refiner.refine("what is on hand").await);

        assert!(output.intent.confidence <= 1.0);
    }
}
