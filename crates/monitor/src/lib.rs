#![forbid(unsafe_code)]

pub mod classifier;
pub mod discovery;
pub mod dispatcher;
pub mod domain;
pub mod engine;
pub mod error;
pub mod forensic;
pub mod introspection;
pub mod queue;
pub mod registry;
pub mod stats;
pub mod walker;

pub use classifier::WriteClassifier;
pub use discovery::discover;
pub use dispatcher::{
    AnalysisDispatcher, DispatchReport, DispatcherHandle, DispatcherState, StopReason,
};
pub use domain::{ClassificationToken, Gfn, Pa, TargetDescriptor, Va};
pub use engine::{Monitor, RunReport, ShutdownHandle};
pub use error::Error;
pub use forensic::{CheckError, CheckOutcome, CommandCheck, ForensicCheck, NoopCheck};
pub use introspection::{
    Connector, ImageConnector, IntrospectionError, Introspector, MemoryGuest,
};
pub use queue::EventQueue;
pub use registry::{Reconciliation, RegisterError, Watchpoint, WatchpointRegistry};
pub use stats::Statistics;
pub use walker::{KernelListWalker, ListSpec, WalkAbort};
