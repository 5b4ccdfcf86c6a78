pub mod action;
pub mod audit;
pub mod clock;
pub mod config;
pub mod context;
pub mod domain;
pub mod errors;
pub mod pipeline;
pub mod text;
pub mod toggles;

pub use action::{
    ActionOutcome, RefundDecision, Resolution, ToolCall, ToolFailure, ToolName, ToolOutcome,
    ToolReceipt,
};
pub use audit::{AuditRecord, AuditSink, InMemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, FixedClock, SystemClock};
pub use context::{Degradable, PolicySet, RequestContext, UserRecords};
pub use domain::classification::{Classification, ClassificationSource, Intent, Sentiment};
pub use domain::customer::UserId;
pub use domain::order::{Order, OrderId, ShippingStatus};
pub use domain::policy::{Policy, PolicyId, Region, ScoredPolicy};
pub use domain::refund::{RefundRequest, RefundRequestId, RefundStatus};
pub use domain::ticket::{SupportTicket, TicketId, TicketStatus};
pub use errors::{ContextError, FailureKind, StageFailure};
pub use pipeline::{PipelineState, Stage, TerminalFailure, TerminationReason};
pub use toggles::{ErrorRate, FaultToggles, ToggleError, ToggleName};
