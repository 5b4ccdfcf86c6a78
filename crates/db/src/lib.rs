pub mod fixtures;
pub mod repositories;

pub use fixtures::{Scenario, SeedDataset, SCENARIOS};
pub use repositories::{
    InMemoryPolicyStore, InMemoryRecordsStore, PolicyStore, RecordsRepository, RecordsStore,
    RepositoryError, UserHistory,
};
