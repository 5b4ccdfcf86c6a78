use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::customer::UserId;
use crate::domain::policy::Region;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(pub String);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingStatus {
    Processing,
    Shipped,
    InTransit,
    Delivered,
    Returned,
}

impl ShippingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Returned => "returned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "processing" => Some(Self::Processing),
            "shipped" => Some(Self::Shipped),
            "in_transit" => Some(Self::InTransit),
            "delivered" => Some(Self::Delivered),
            "returned" => Some(Self::Returned),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub product: String,
    pub category: String,
    pub purchase_date: DateTime<Utc>,
    pub shipping_status: ShippingStatus,
    pub amount: Decimal,
    pub currency: String,
    pub shipping_country: String,
}

impl Order {
    pub fn region(&self) -> Region {
        Region::from_country(&self.shipping_country)
    }

    /// Whole days elapsed between purchase and `as_of`. Never negative.
    pub fn days_since_purchase(&self, as_of: DateTime<Utc>) -> i64 {
        (as_of - self.purchase_date).num_days().max(0)
    }
}
