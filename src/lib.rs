pub mod dotconfig;
pub mod env;
pub mod errors;
pub mod eval;
pub mod expr;
pub mod graph;
pub mod parser;
pub mod public_interface;
pub mod reader;
pub mod symbol;
pub mod tri;

pub use public_interface::Kconfig;
pub use symbol::{ChangeEvent, ChangeKind, EntryKind, SymbolId, ValueType};
pub use tri::Tristate;

pub type KbraiseResult<T> = anyhow::Result<T>;
