pub mod consumer;
pub mod evaluator;
pub mod investigator;
pub mod watchdog;

pub use consumer::{ConsumerRegistry, InvestigationConsumer};
pub use investigator::Investigator;
pub use watchdog::StaleWatchdog;
