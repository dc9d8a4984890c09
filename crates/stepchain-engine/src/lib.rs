pub mod continuation;
pub mod controller;
pub mod deferred;
pub mod dispatch;
pub mod executor;
pub mod lifecycle;
pub mod sequential;

pub use controller::{StepController, StepOutcome};
pub use deferred::{AfterResponse, DeferredAction, DeferredTrigger};
pub use dispatch::HttpDispatcher;
pub use executor::SimulatedExecutor;
pub use lifecycle::RunLifecycle;
pub use sequential::SequentialRunner;
