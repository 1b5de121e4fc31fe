pub mod adapter;
pub mod builtin;
pub mod controller;
pub mod emitter;
pub mod expr;
pub mod graph;
pub mod pool;
pub mod run_log;
pub mod scheduler;
pub mod store;

pub use adapter::{NodeExecutor, NodeRegistry};
pub use controller::RunController;
pub use emitter::RunEmitter;
pub use expr::{Expr, VarRef};
pub use graph::{
    EdgeDefinition, Graph, GraphCatalog, GraphDefinition, InputBinding, JoinMode, NodeDefinition,
};
pub use pool::{Scope, VariablePool};
pub use run_log::RunLogger;
pub use store::{MemoryRunStore, SqliteRunStore};
