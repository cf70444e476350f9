// ============================================================================
// Graph Mapping
// ============================================================================
//
// Turns a fetched resource graph into persisted entities and links:
//
//   ResourceGraph ─> EntityMultiMapper ─> EntityLinker ─> DiscoveryFinalizer
//                    (resolve + map + GC)  (edge diff)     (per service type)
//
// DiscoveryGraphMapper runs the three steps in one retried transaction.
//
// ============================================================================

pub mod finalizer;
pub mod graph_mapper;
pub mod linker;
pub mod mapper;
pub mod multi;

pub use finalizer::{DeepDiscoveryCompletion, DiscoveryFinalizer, FinalizerRegistry};
pub use graph_mapper::{DiscoveryGraphMapper, MappingSummary};
pub use linker::{EntityLinker, LinkChanges};
pub use mapper::{EntityMapper, MapperRegistry, PropertyMapper, parse_status};
pub use multi::{EntityMultiMapper, EntityRemovalListener, MultiMapOutcome};
