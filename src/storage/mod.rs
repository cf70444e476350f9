pub mod memory;
pub mod table;
pub mod tx;

pub use memory::{EntityStore, StoreState};
pub use table::{Versioned, VersionedTable};
pub use tx::StoreTx;
