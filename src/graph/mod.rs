/*!
Flow graphs: the editable form of a sequence.

- `model.rs`    -> `FlowGraph` arena (nodes, edges, editing operations)
- `compiler.rs` -> `compile` / `compile_with`, graph → `CompiledSequence`

Persistence lives in `crate::project`.
*/

pub mod compiler;
pub mod model;

pub use compiler::{CompileError, CompileOptions, UnreachablePolicy, compile, compile_with};
pub use model::{Edge, EdgeId, FlowGraph, FlowNode, GraphError, NodeId, Position};
