/// Builder wiring the coordinator's components together.
pub mod builder;
/// Cancellation signal shared by the coordinator loops and executors.
pub mod signal;
/// The coordinator façade and its background loops.
pub mod supervisor;

pub use builder::CoordinatorBuilder;
pub use signal::CancelSignal;
pub use supervisor::Coordinator;
