//! Routing core orchestration: the dependency container, the request flow
//! (gate, select, account), persistence and remediation capabilities, and
//! background task supervision.

pub mod context;
pub mod orchestrator;
pub mod remediation;
pub mod repository;
pub mod tasks;

pub use context::{RouterContext, RouterContextBuilder};
pub use orchestrator::{
    CancellationToken, CompletionSummary, DispatchResult, Orchestrator, RouteOutcome,
    RoutedRequest,
};
pub use remediation::{
    remediate_condition, NoopDispatcher, RecordingDispatcher, RemediationDispatcher,
};
pub use repository::{InMemoryRepository, Repository, RetryBuffer};
pub use tasks::{Shutdown, TaskSupervisor};
