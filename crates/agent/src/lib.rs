//! Agent pipeline - the staged customer-service decision flow
//!
//! This crate provides the four agents and the orchestrator that runs them:
//! - Retrieves the refund policies relevant to a customer message
//! - Aggregates the customer's orders, refund requests and tickets
//! - Classifies the message and decides which support tools to call
//! - Writes an audit record explaining the whole causal chain
//!
//! # Architecture
//!
//! Every run walks one append-only `RequestContext` through a fixed order:
//! 1. **Policy retrieval** (`policy`, A1) - ranked, date-filtered policies
//! 2. **Records aggregation** (`records`, A3) - newest-first customer history
//! 3. **Action** (`action`, A5) - classification, eligibility, tool calls
//! 4. **Audit** (`audit`, A7) - structured record plus rationale
//!
//! Recoverable failures become flagged placeholders and the run continues.
//! Fatal failures and cancellation stop the run with the partial context.
//!
//! # Key Types
//!
//! - `Orchestrator` - sequences the stages (see `orchestrator` module)
//! - `Classifier` - keyword, LLM-backed, or fixed substitute
//! - `ToolExecutor` - tool dispatch, optionally wrapped in fault injection
//! - `DeskRuntime` - orchestrator over seeded in-memory stores
//!
//! # Safety Principle
//!
//! The LLM only labels the message. It never decides eligibility or which
//! records to write; those are deterministic decisions made in `eligibility`
//! and `action`.

pub mod action;
pub mod audit;
pub mod classifier;
pub mod eligibility;
pub mod llm;
pub mod orchestrator;
pub mod policy;
pub mod records;
pub mod runtime;
pub mod stage;
pub mod tools;

pub use classifier::{Classifier, ClassifierError, FixedClassifier, KeywordClassifier};
pub use orchestrator::{CancellationFlag, Orchestrator, PipelineDeps, RunRequest};
pub use runtime::DeskRuntime;
pub use stage::Agent;
pub use tools::{FaultInjectingExecutor, ToolExecutor, ToolRegistry};
