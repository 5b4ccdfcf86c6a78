use std::collections::HashSet;

use chrono::{TimeZone, Utc};

use opsdesk_core::domain::customer::UserId;
use opsdesk_core::domain::policy::Region;
use opsdesk_db::{InMemoryPolicyStore, InMemoryRecordsStore, RecordsStore, SeedDataset, SCENARIOS};

type SeedContractTestResult<T = ()> = Result<T, String>;

macro_rules! require {
    ($cond:expr) => {
        if !$cond {
            return Err(format!("assertion failed: `{}`", stringify!($cond)));
        }
    };
    ($cond:expr, $($arg:tt)*) => {
        if !$cond {
            return Err(format!($($arg)*));
        }
    };
}

macro_rules! require_eq {
    ($left:expr, $right:expr) => {
        if $left != $right {
            return Err(format!(
                "assertion failed: `left == right` (`{:?}` != `{:?}`)",
                $left,
                $right
            ));
        }
    };
    ($left:expr, $right:expr, $($arg:tt)*) => {
        if $left != $right {
            return Err(format!($($arg)*));
        }
    };
}

fn dataset() -> SeedDataset {
    let reference = Utc.with_ymd_and_hms(2026, 3, 15, 12, 0, 0).single();
    SeedDataset::build(reference.unwrap_or_else(Utc::now))
}

#[test]
fn seed_ids_are_unique() -> SeedContractTestResult {
    let seed = dataset();

    let policy_ids: HashSet<_> = seed.policies.iter().map(|policy| &policy.id).collect();
    require_eq!(policy_ids.len(), seed.policies.len(), "duplicate policy ids in seed");

    let order_ids: HashSet<_> = seed.orders.iter().map(|order| &order.order_id).collect();
    require_eq!(order_ids.len(), seed.orders.len(), "duplicate order ids in seed");

    let refund_ids: HashSet<_> = seed.refund_requests.iter().map(|r| &r.request_id).collect();
    require_eq!(refund_ids.len(), seed.refund_requests.len(), "duplicate refund ids in seed");

    let ticket_ids: HashSet<_> = seed.tickets.iter().map(|ticket| &ticket.ticket_id).collect();
    require_eq!(ticket_ids.len(), seed.tickets.len(), "duplicate ticket ids in seed");
    Ok(())
}

#[test]
fn refunds_and_tickets_reference_orders_of_the_same_user() -> SeedContractTestResult {
    let seed = dataset();

    for request in &seed.refund_requests {
        let order = seed.orders.iter().find(|order| order.order_id == request.order_id);
        let Some(order) = order else {
            return Err(format!(
                "{} references unknown order {}",
                request.request_id, request.order_id
            ));
        };
        require_eq!(order.user_id, request.user_id, "{} crosses users", request.request_id);
    }

    for ticket in &seed.tickets {
        let Some(order_id) = &ticket.order_id else { continue };
        let owner =
            seed.orders.iter().find(|order| &order.order_id == order_id).map(|o| &o.user_id);
        require!(owner == Some(&ticket.user_id), "{} references a foreign order", ticket.ticket_id);
    }
    Ok(())
}

#[test]
fn every_region_has_a_policy_active_at_the_reference() -> SeedContractTestResult {
    let seed = dataset();
    for region in [Region::Us, Region::Eu] {
        let active = seed
            .policies
            .iter()
            .filter(|policy| policy.region == region && policy.is_active_at(seed.reference))
            .count();
        require!(active >= 1, "no active policy for {region:?}");
    }

    let stale = seed.policies.iter().filter(|policy| !policy.is_active_at(seed.reference)).count();
    require!(stale >= 1, "seed needs at least one expired policy for drift runs");
    Ok(())
}

#[test]
fn scenario_users_match_the_seeded_customers() -> SeedContractTestResult {
    let seed = dataset();
    let customers: HashSet<&UserId> = seed.orders.iter().map(|order| &order.user_id).collect();

    for scenario in SCENARIOS {
        let user = UserId::new(scenario.user_id);
        let has_orders = customers.contains(&user);
        if scenario.name == "refund_speakers" {
            require!(!has_orders, "{} must have no order history", scenario.user_id);
        } else {
            require!(has_orders, "{} has no seeded orders", scenario.user_id);
        }
    }
    Ok(())
}

#[tokio::test]
async fn loading_is_reflected_in_the_stores() -> SeedContractTestResult {
    let seed = dataset();
    let policies = InMemoryPolicyStore::default();
    let records = InMemoryRecordsStore::default();

    let summary = seed.load_into(&policies, &records).await.map_err(|error| error.to_string())?;
    require_eq!(summary.policies, policies.len().await);
    require_eq!(summary.refund_requests, records.refund_request_count().await);
    require_eq!(summary.tickets, records.ticket_count().await);

    let history = records.fetch(&UserId::new("user_002")).await.map_err(|error| error.to_string())?;
    require_eq!(history.orders.len(), 3);
    require_eq!(history.refund_requests.len(), 2);
    Ok(())
}
