//! Command Admission Module
//!
//! Decides, per chat command invocation, whether the command may run. Decisions are
//! based on a per-command tiered policy, a per-(user, command) usage window, and a
//! premium entitlement that expires lazily.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Admission Engine                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐         │
//! │  │ Entitlement │  │ Policy      │  │ Analytics   │         │
//! │  │ Service     │  │ Store       │  │ Sink        │         │
//! │  └─────────────┘  └─────────────┘  └─────────────┘         │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │      Durable Store (SQLite or in-memory)             │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod analytics;
pub mod clock;
pub mod counter;
pub mod decision;
pub mod engine;
pub mod entitlement;
pub mod error;
pub mod policy;
pub mod report;
pub mod timeout;

pub use analytics::{AdmissionEvent, AnalyticsSink, AnalyticsWorker, BackgroundSink, NullSink};
pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{CounterKey, CounterOutcome, UsageCounter, UsageCounterStore};
pub use decision::{Decision, DecisionStatus};
pub use engine::AdmissionEngine;
pub use entitlement::{EntitlementService, EntitlementStore, UserEntitlement};
pub use error::{AdmissionError, StorageError};
pub use policy::{
    CommandPolicy, PolicyStore, ResolvedPolicy, TierLimit, TierRule, MAX_WINDOW_MINUTES,
};
pub use report::{CommandUsage, EventSummary, UsageReport};
pub use timeout::StorageTimeout;
