use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use opsdesk_core::domain::classification::Sentiment;
use opsdesk_core::domain::customer::UserId;
use opsdesk_core::domain::order::{Order, OrderId, ShippingStatus};
use opsdesk_core::domain::policy::{Policy, PolicyId, Region};
use opsdesk_core::domain::refund::{RefundRequest, RefundRequestId, RefundStatus};
use opsdesk_core::domain::ticket::{SupportTicket, TicketId, TicketStatus};

use crate::repositories::{
    InMemoryPolicyStore, InMemoryRecordsStore, RecordsRepository, RepositoryError,
};

/// A canned customer request the operator runner can replay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Scenario {
    pub index: usize,
    pub name: &'static str,
    pub user_id: &'static str,
    pub query: &'static str,
}

pub const SCENARIOS: &[Scenario] = &[
    Scenario {
        index: 0,
        name: "refund_bluetooth_earbuds",
        user_id: "user_001",
        query: "I need a refund for my bluetooth electronics purchase, I don't like the product",
    },
    Scenario {
        index: 1,
        name: "refund_tablet_angry",
        user_id: "user_002",
        query: "I'm SICK OF ORDERING EVERYTHING and RETURNING EVERYTHING. Y'all aren't a good company. refund my tablet",
    },
    Scenario {
        index: 2,
        name: "refund_gaming_mouse",
        user_id: "user_003",
        query: "The scroll wheel on my gaming mouse stopped working after a week, I want a refund",
    },
    Scenario {
        index: 3,
        name: "refund_air_purifier",
        user_id: "user_004",
        query: "I changed my mind about the air purifier, can I get my money back?",
    },
    Scenario {
        index: 4,
        name: "refund_coffee_maker",
        user_id: "user_005",
        query: "Please refund the engraved coffee maker, it is not what I expected",
    },
    Scenario {
        index: 5,
        name: "refund_speakers",
        user_id: "user_006",
        query: "I would like a refund for the speakers I bought last month",
    },
    Scenario {
        index: 6,
        name: "enquire_status_of_order",
        user_id: "user_007",
        query: "Was my costume delivered?",
    },
];

pub fn scenario(index: usize) -> Option<&'static Scenario> {
    SCENARIOS.get(index)
}

pub fn scenario_by_name(name: &str) -> Option<&'static Scenario> {
    let name = name.trim();
    SCENARIOS.iter().find(|scenario| scenario.name.eq_ignore_ascii_case(name))
}

/// Deterministic policies and customer records. Dates are relative to the
/// reference instant so eligibility outcomes do not drift with wall-clock time.
#[derive(Clone, Debug, PartialEq)]
pub struct SeedDataset {
    pub reference: DateTime<Utc>,
    pub policies: Vec<Policy>,
    pub orders: Vec<Order>,
    pub refund_requests: Vec<RefundRequest>,
    pub tickets: Vec<SupportTicket>,
}

impl SeedDataset {
    pub fn build(reference: DateTime<Utc>) -> Self {
        Self {
            reference,
            policies: seed_policies(reference),
            orders: seed_orders(reference),
            refund_requests: seed_refund_requests(reference),
            tickets: seed_tickets(reference),
        }
    }

    pub async fn load_into(
        &self,
        policy_store: &InMemoryPolicyStore,
        records_store: &InMemoryRecordsStore,
    ) -> Result<SeedSummary, RepositoryError> {
        for policy in &self.policies {
            policy_store.insert(policy.clone()).await;
        }
        for order in &self.orders {
            records_store.insert_order(order.clone()).await;
        }
        for request in &self.refund_requests {
            records_store.save_refund_request(request.clone()).await?;
        }
        for ticket in &self.tickets {
            records_store.save_ticket(ticket.clone()).await?;
        }

        Ok(SeedSummary {
            policies: self.policies.len(),
            orders: self.orders.len(),
            refund_requests: self.refund_requests.len(),
            tickets: self.tickets.len(),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct SeedSummary {
    pub policies: usize,
    pub orders: usize,
    pub refund_requests: usize,
    pub tickets: usize,
}

fn seed_policies(now: DateTime<Utc>) -> Vec<Policy> {
    vec![
        Policy {
            id: PolicyId("pol-us-v24.1".to_string()),
            title: "US Refund and Return Policy".to_string(),
            text: "A refund for any product purchase is accepted within 30 days of the purchase \
                   date. Return shipping is free for orders shipped within the United States."
                .to_string(),
            region: Region::Us,
            version: "v24.1".to_string(),
            effective_from: now - Duration::days(400),
            effective_until: None,
            refund_window_days: 30,
            excluded_categories: Vec::new(),
        },
        Policy {
            id: PolicyId("pol-eu-v24.1".to_string()),
            title: "EU Refund and Return Policy".to_string(),
            text: "Customers in the EU may withdraw from a purchase and get their money back as a \
                   refund within 14 days of delivery. Custom built products are excluded."
                .to_string(),
            region: Region::Eu,
            version: "v24.1".to_string(),
            effective_from: now - Duration::days(400),
            effective_until: None,
            refund_window_days: 14,
            excluded_categories: vec!["custom_built".to_string()],
        },
        Policy {
            id: PolicyId("pol-eu-v23.2".to_string()),
            title: "EU Refund and Return Policy".to_string(),
            text: "Customers in the EU may request a refund within 10 days of delivery. Custom \
                   built products and opened software are excluded."
                .to_string(),
            region: Region::Eu,
            version: "v23.2".to_string(),
            effective_from: now - Duration::days(800),
            effective_until: Some(now - Duration::days(400)),
            refund_window_days: 10,
            excluded_categories: vec!["custom_built".to_string(), "opened_software".to_string()],
        },
        Policy {
            id: PolicyId("pol-us-v23.0".to_string()),
            title: "US Electronics Final Sale Policy".to_string(),
            text: "All electronics purchases, including bluetooth audio products, are final \
                   sale. No refund or return is possible once the product has shipped."
                .to_string(),
            region: Region::Us,
            version: "v23.0".to_string(),
            effective_from: now - Duration::days(900),
            effective_until: Some(now - Duration::days(400)),
            refund_window_days: 0,
            excluded_categories: Vec::new(),
        },
        Policy {
            id: PolicyId("pol-global-shipping-v24.0".to_string()),
            title: "Shipping and Delivery Policy".to_string(),
            text: "Orders are delivered within 5 to 7 business days. Delivery status and tracking \
                   are available once an order has shipped."
                .to_string(),
            region: Region::Us,
            version: "v24.0".to_string(),
            effective_from: now - Duration::days(400),
            effective_until: None,
            refund_window_days: 30,
            excluded_categories: Vec::new(),
        },
    ]
}

#[allow(clippy::too_many_arguments)]
fn order(
    now: DateTime<Utc>,
    order_id: &str,
    user_id: &str,
    product: &str,
    category: &str,
    days_ago: i64,
    shipping_status: ShippingStatus,
    cents: i64,
    currency: &str,
    country: &str,
) -> Order {
    Order {
        order_id: OrderId(order_id.to_string()),
        user_id: UserId::new(user_id),
        product: product.to_string(),
        category: category.to_string(),
        purchase_date: now - Duration::days(days_ago),
        shipping_status,
        amount: Decimal::new(cents, 2),
        currency: currency.to_string(),
        shipping_country: country.to_string(),
    }
}

fn seed_orders(now: DateTime<Utc>) -> Vec<Order> {
    use ShippingStatus::{Delivered, InTransit, Returned};

    vec![
        order(
            now,
            "ORD-1001",
            "user_001",
            "Bluetooth Earbuds",
            "electronics",
            10,
            Delivered,
            7999,
            "USD",
            "US",
        ),
        order(
            now,
            "ORD-2001",
            "user_002",
            "Android Tablet",
            "electronics",
            20,
            Delivered,
            32900,
            "EUR",
            "DE",
        ),
        order(
            now,
            "ORD-2002",
            "user_002",
            "Tumble Dryer",
            "appliances",
            90,
            Returned,
            54900,
            "EUR",
            "DE",
        ),
        order(
            now,
            "ORD-2003",
            "user_002",
            "Stand Mixer",
            "appliances",
            120,
            Returned,
            24900,
            "EUR",
            "DE",
        ),
        order(
            now,
            "ORD-3001",
            "user_003",
            "Gaming Mouse",
            "electronics",
            8,
            Delivered,
            5999,
            "USD",
            "USA",
        ),
        order(
            now,
            "ORD-4001",
            "user_004",
            "Air Purifier",
            "appliances",
            6,
            Delivered,
            18900,
            "EUR",
            "FR",
        ),
        order(
            now,
            "ORD-5001",
            "user_005",
            "Engraved Coffee Maker",
            "custom_built",
            7,
            Delivered,
            12900,
            "EUR",
            "NL",
        ),
        order(
            now,
            "ORD-7001",
            "user_007",
            "Halloween Costume",
            "apparel",
            3,
            InTransit,
            4599,
            "USD",
            "United States",
        ),
    ]
}

fn seed_refund_requests(now: DateTime<Utc>) -> Vec<RefundRequest> {
    vec![
        RefundRequest {
            request_id: RefundRequestId("REF-2002".to_string()),
            user_id: UserId::new("user_002"),
            order_id: OrderId("ORD-2002".to_string()),
            status: RefundStatus::Completed,
            amount: Decimal::new(54900, 2),
            created_at: now - Duration::days(80),
            reason: "changed my mind".to_string(),
        },
        RefundRequest {
            request_id: RefundRequestId("REF-2003".to_string()),
            user_id: UserId::new("user_002"),
            order_id: OrderId("ORD-2003".to_string()),
            status: RefundStatus::Completed,
            amount: Decimal::new(24900, 2),
            created_at: now - Duration::days(110),
            reason: "too loud".to_string(),
        },
        RefundRequest {
            request_id: RefundRequestId("REF-4001".to_string()),
            user_id: UserId::new("user_004"),
            order_id: OrderId("ORD-4001".to_string()),
            status: RefundStatus::Approved,
            amount: Decimal::new(18900, 2),
            created_at: now - Duration::days(2),
            reason: "no longer needed".to_string(),
        },
    ]
}

fn seed_tickets(now: DateTime<Utc>) -> Vec<SupportTicket> {
    vec![
        SupportTicket {
            ticket_id: TicketId("TCK-3001".to_string()),
            user_id: UserId::new("user_003"),
            order_id: Some(OrderId("ORD-3001".to_string())),
            status: TicketStatus::Open,
            sentiment: Sentiment::Neutral,
            summary: "Mouse scroll wheel skipping".to_string(),
            escalation_level: None,
            created_at: now - Duration::days(2),
            updated_at: now - Duration::days(2),
        },
        SupportTicket {
            ticket_id: TicketId("TCK-2001".to_string()),
            user_id: UserId::new("user_002"),
            order_id: Some(OrderId("ORD-2002".to_string())),
            status: TicketStatus::Resolved,
            sentiment: Sentiment::Negative,
            summary: "Dryer return".to_string(),
            escalation_level: None,
            created_at: now - Duration::days(85),
            updated_at: now - Duration::days(78),
        },
    ]
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use opsdesk_core::domain::customer::UserId;

    use super::{scenario, scenario_by_name, SeedDataset, SCENARIOS};

    #[test]
    fn scenario_indices_match_positions() {
        for (position, scenario) in SCENARIOS.iter().enumerate() {
            assert_eq!(scenario.index, position);
            assert!(UserId::new(scenario.user_id).is_well_formed());
        }
        assert_eq!(scenario(6).map(|s| s.user_id), Some("user_007"));
        assert!(scenario(SCENARIOS.len()).is_none());
    }

    #[test]
    fn scenarios_resolve_by_name() {
        let found = scenario_by_name("REFUND_BLUETOOTH_EARBUDS").expect("known scenario");
        assert_eq!(found.user_id, "user_001");
        assert!(scenario_by_name("refund_yacht").is_none());
    }

    #[test]
    fn seed_contains_active_and_expired_policies() {
        let reference = Utc::now();
        let seed = SeedDataset::build(reference);

        let active = seed.policies.iter().filter(|policy| policy.is_active_at(reference)).count();
        assert!(active >= 2);
        assert!(seed.policies.iter().any(|policy| !policy.is_active_at(reference)));
        assert!(seed
            .policies
            .iter()
            .any(|policy| !policy.is_active_at(reference) && !policy.allows_returns()));
    }

    #[test]
    fn every_seeded_record_references_a_seeded_order() {
        let seed = SeedDataset::build(Utc::now());
        for request in &seed.refund_requests {
            assert!(seed.orders.iter().any(|order| order.order_id == request.order_id));
        }
        for ticket in &seed.tickets {
            if let Some(order_id) = &ticket.order_id {
                assert!(seed.orders.iter().any(|order| &order.order_id == order_id));
            }
        }
    }
}
