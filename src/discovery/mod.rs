// ============================================================================
// Discovery Scheduling
// ============================================================================
//
// DiscoveryScheduler keeps one reusable DiscoveryRunner per service and
// drives it from three sources: the initial synchronous pass, the recurring
// poll, and pushed events. Everything goes through the TaskCoordinator, so a
// service never has two passes in flight.
//
//   tick / event ─> TaskCoordinator (key = service id) ─> DiscoveryRunner
//                                                           │
//                         open session ─> root identity ─> crawl graph
//                                                           │
//                                            DiscoveryGraphMapper (tx)
//
// ============================================================================

pub mod deep;
pub mod runner;
pub mod scheduler;

pub use deep::{DeepDiscoveryTrigger, DeepTriggerReport};
pub use runner::{DiscoveryRunner, PassState, RunnerContext};
pub use scheduler::{DiscoveryScheduler, Scheduled};
