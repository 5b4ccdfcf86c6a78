use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use opsdesk_core::config::{LlmConfig, LlmProvider};
use opsdesk_core::domain::classification::{
    Classification, ClassificationSource, Intent, Sentiment,
};
use opsdesk_core::text;

use crate::llm::{LlmClient, OpenAiCompatibleClient, RetryConfig, RetryingLlmClient};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ClassifierError {
    #[error("classifier unavailable: {0}")]
    Unavailable(String),
    #[error("classifier timed out after {0}ms")]
    Timeout(u64),
    #[error("classifier returned an unusable answer: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &'static str;

    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

const REFUND_PHRASES: &[&str] =
    &["refund", "money back", "reimburse", "return it", "send it back", "send back"];
const INQUIRY_PHRASES: &[&str] = &[
    "where is",
    "status",
    "delivered",
    "tracking",
    "track my",
    "arrive",
    "when will",
    "shipped",
];
const NEGATIVE_WORDS: &[&str] = &[
    "angry",
    "awful",
    "furious",
    "hate",
    "horrible",
    "ridiculous",
    "scam",
    "sick",
    "terrible",
    "unacceptable",
    "useless",
    "worst",
];
const NEGATIVE_PHRASES: &[&str] = &["aren't a good", "not a good", "fed up"];
const POSITIVE_WORDS: &[&str] =
    &["appreciate", "awesome", "great", "happy", "love", "thank", "thanks"];

/// Deterministic keyword classifier, used when no model provider is
/// configured.
#[derive(Clone, Copy, Debug, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub fn classify_text(&self, input: &str) -> Classification {
        let normalized = text::normalize(input);
        let tokens = text::tokenize(input);
        Classification::model(
            detect_intent(&normalized),
            detect_sentiment(input, &normalized, &tokens),
        )
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    fn name(&self) -> &'static str {
        "keyword"
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        Ok(self.classify_text(text))
    }
}

fn detect_intent(normalized: &str) -> Intent {
    if REFUND_PHRASES.iter().any(|phrase| normalized.contains(phrase)) {
        Intent::Refund
    } else if INQUIRY_PHRASES.iter().any(|phrase| normalized.contains(phrase)) {
        Intent::Inquiry
    } else {
        Intent::General
    }
}

fn detect_sentiment(raw: &str, normalized: &str, tokens: &[String]) -> Sentiment {
    let negative_word = tokens.iter().any(|token| NEGATIVE_WORDS.contains(&token.as_str()));
    let negative_phrase = NEGATIVE_PHRASES.iter().any(|phrase| normalized.contains(phrase));
    if negative_word || negative_phrase || shouted_words(raw) >= 3 {
        return Sentiment::Negative;
    }

    if tokens.iter().any(|token| POSITIVE_WORDS.contains(&token.as_str())) {
        return Sentiment::Positive;
    }

    Sentiment::Neutral
}

fn shouted_words(raw: &str) -> usize {
    raw.split(|character: char| !character.is_alphabetic())
        .filter(|word| word.chars().count() >= 3 && word.chars().all(char::is_uppercase))
        .count()
}

/// Returns one fixed answer for every input. Selected in place of the real
/// classifier when the hallucination toggle applies to a run.
#[derive(Clone, Copy, Debug)]
pub struct FixedClassifier {
    intent: Intent,
    sentiment: Sentiment,
}

impl FixedClassifier {
    pub fn new(intent: Intent, sentiment: Sentiment) -> Self {
        Self { intent, sentiment }
    }
}

impl Default for FixedClassifier {
    fn default() -> Self {
        Self::new(Intent::Refund, Sentiment::Positive)
    }
}

#[async_trait]
impl Classifier for FixedClassifier {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn classify(&self, _text: &str) -> Result<Classification, ClassifierError> {
        Ok(Classification {
            intent: self.intent,
            sentiment: self.sentiment,
            source: ClassificationSource::Substituted,
        })
    }
}

pub struct LlmClassifier<C> {
    client: C,
}

#[derive(Deserialize)]
struct LabelAnswer {
    intent: String,
    sentiment: String,
}

impl<C: LlmClient> LlmClassifier<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }

    fn prompt(text: &str) -> String {
        format!(
            "You triage customer service messages.\n\
             Classify the intent as exactly one of: refund, inquiry, general.\n\
             Classify the sentiment as exactly one of: negative, neutral, positive.\n\
             Answer with a single JSON object and nothing else, for example \
             {{\"intent\": \"refund\", \"sentiment\": \"neutral\"}}.\n\n\
             Message: {text}"
        )
    }
}

/// Extracts the label pair from a model answer. Tolerates prose or code
/// fences around the JSON object; unknown labels are an error.
pub fn parse_labels(answer: &str) -> Result<Classification, ClassifierError> {
    let start = answer.find('{');
    let end = answer.rfind('}');
    let (Some(start), Some(end)) = (start, end) else {
        return Err(ClassifierError::InvalidResponse("no JSON object in answer".to_string()));
    };
    if end < start {
        return Err(ClassifierError::InvalidResponse("no JSON object in answer".to_string()));
    }

    let labels: LabelAnswer = serde_json::from_str(&answer[start..=end])
        .map_err(|error| ClassifierError::InvalidResponse(error.to_string()))?;

    let intent = Intent::parse(&labels.intent).ok_or_else(|| {
        ClassifierError::InvalidResponse(format!("unknown intent label `{}`", labels.intent))
    })?;
    let sentiment = Sentiment::parse(&labels.sentiment).ok_or_else(|| {
        ClassifierError::InvalidResponse(format!("unknown sentiment label `{}`", labels.sentiment))
    })?;

    Ok(Classification::model(intent, sentiment))
}

#[async_trait]
impl<C: LlmClient> Classifier for LlmClassifier<C> {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let answer = self
            .client
            .complete(&Self::prompt(text))
            .await
            .map_err(|error| ClassifierError::Unavailable(format!("{error:#}")))?;

        let classification = parse_labels(&answer)?;
        tracing::debug!(
            event_name = "classifier.llm.answered",
            model = self.client.model_name(),
            intent = classification.intent.as_str(),
            sentiment = classification.sentiment.as_str(),
            "llm classification parsed"
        );
        Ok(classification)
    }
}

/// Builds the configured classifier. The offline provider needs no network
/// access and is the default.
pub fn classifier_from_config(config: &LlmConfig) -> Result<Arc<dyn Classifier>> {
    match config.provider {
        LlmProvider::Offline => Ok(Arc::new(KeywordClassifier)),
        LlmProvider::OpenAi | LlmProvider::Ollama => {
            let client = OpenAiCompatibleClient::from_config(config)?;
            let retry = RetryConfig { max_retries: config.max_retries, ..RetryConfig::default() };
            Ok(Arc::new(LlmClassifier::new(RetryingLlmClient::new(client, retry))))
        }
    }
}
