use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Refund,
    Inquiry,
    General,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refund => "refund",
            Self::Inquiry => "inquiry",
            Self::General => "general",
        }
    }

    /// Accepts the canonical labels plus the longer forms language models
    /// tend to answer with.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "refund" | "refund_request" => Some(Self::Refund),
            "inquiry" | "enquiry" | "order_inquiry" => Some(Self::Inquiry),
            "general" => Some(Self::General),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Negative,
    Neutral,
    Positive,
}

impl Sentiment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Negative => "negative",
            Self::Neutral => "neutral",
            Self::Positive => "positive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "negative" => Some(Self::Negative),
            "neutral" => Some(Self::Neutral),
            "positive" => Some(Self::Positive),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassificationSource {
    /// The configured classifier produced the labels.
    Model,
    /// A fixed classification was swapped in for fault injection.
    Substituted,
    /// The classifier failed or answered with unknown labels.
    Fallback,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub intent: Intent,
    pub sentiment: Sentiment,
    pub source: ClassificationSource,
}

impl Classification {
    pub fn model(intent: Intent, sentiment: Sentiment) -> Self {
        Self { intent, sentiment, source: ClassificationSource::Model }
    }

    pub fn fallback() -> Self {
        Self {
            intent: Intent::General,
            sentiment: Sentiment::Neutral,
            source: ClassificationSource::Fallback,
        }
    }
}
