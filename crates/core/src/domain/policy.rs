use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyId(pub String);

impl std::fmt::Display for PolicyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    Us,
    Eu,
}

impl Region {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Us => "US",
            Self::Eu => "EU",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "US" => Some(Self::Us),
            "EU" => Some(Self::Eu),
            _ => None,
        }
    }

    /// Orders shipped to the United States fall under US policy; every other
    /// destination is governed by the EU policy.
    pub fn from_country(country: &str) -> Self {
        match country.trim().to_ascii_uppercase().as_str() {
            "US" | "USA" | "UNITED STATES" | "UNITED STATES OF AMERICA" => Self::Us,
            _ => Self::Eu,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub title: String,
    pub text: String,
    pub region: Region,
    pub version: String,
    pub effective_from: DateTime<Utc>,
    pub effective_until: Option<DateTime<Utc>>,
    /// Zero means the policy does not allow returns at all.
    pub refund_window_days: u32,
    pub excluded_categories: Vec<String>,
}

impl Policy {
    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.effective_from <= at && self.effective_until.map_or(true, |until| at < until)
    }

    pub fn allows_returns(&self) -> bool {
        self.refund_window_days > 0
    }

    pub fn excludes_category(&self, category: &str) -> bool {
        let category = category.trim();
        self.excluded_categories.iter().any(|excluded| excluded.eq_ignore_ascii_case(category))
    }
}

/// A search hit: the policy plus the relevance score the store assigned it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoredPolicy {
    pub policy: Policy,
    pub relevance: f32,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone, Utc};

    use super::{Policy, PolicyId, Region};

    fn policy(until: Option<i64>) -> Policy {
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).single().expect("valid date");
        Policy {
            id: PolicyId("pol-eu-v24".to_string()),
            title: "EU returns".to_string(),
            text: "Returns accepted within 14 days".to_string(),
            region: Region::Eu,
            version: "v24.1".to_string(),
            effective_from: from,
            effective_until: until.map(|days| from + Duration::days(days)),
            refund_window_days: 14,
            excluded_categories: vec!["custom_built".to_string()],
        }
    }

    #[test]
    fn open_ended_policy_is_active_from_its_start() {
        let policy = policy(None);
        assert!(policy.is_active_at(policy.effective_from));
        assert!(!policy.is_active_at(policy.effective_from - Duration::seconds(1)));
    }

    #[test]
    fn effective_until_is_exclusive() {
        let policy = policy(Some(30));
        let until = policy.effective_until.expect("bounded policy");
        assert!(policy.is_active_at(until - Duration::seconds(1)));
        assert!(!policy.is_active_at(until));
    }

    #[test]
    fn region_is_derived_from_shipping_country() {
        assert_eq!(Region::from_country("usa"), Region::Us);
        assert_eq!(Region::from_country("United States"), Region::Us);
        assert_eq!(Region::from_country("DE"), Region::Eu);
        assert_eq!(Region::parse("eu"), Some(Region::Eu));
    }

    #[test]
    fn excluded_categories_match_case_insensitively() {
        let policy = policy(None);
        assert!(policy.excludes_category("Custom_Built"));
        assert!(!policy.excludes_category("electronics"));
    }
}
