use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::customer::UserId;
use crate::domain::order::OrderId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RefundRequestId(pub String);

impl std::fmt::Display for RefundRequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Submitted,
    UnderReview,
    Approved,
    Denied,
    Completed,
}

impl RefundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::UnderReview => "under_review",
            Self::Approved => "approved",
            Self::Denied => "denied",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "submitted" => Some(Self::Submitted),
            "under_review" => Some(Self::UnderReview),
            "approved" => Some(Self::Approved),
            "denied" => Some(Self::Denied),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    /// Money has been (or will be) returned for this request.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Approved | Self::Completed)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Submitted | Self::UnderReview)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequest {
    pub request_id: RefundRequestId,
    pub user_id: UserId,
    pub order_id: OrderId,
    pub status: RefundStatus,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub reason: String,
}
