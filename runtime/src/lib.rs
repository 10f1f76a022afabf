//! The shared value model: tagged `Value`s, heap `Obj`ects behind a
//! mark-sweep `Heap`, the open-addressed `Table` they're keyed with, and the
//! `Chunk` bytecode container both `compiler` and `vm` build and walk.

pub mod chunk;
pub mod gc;
pub mod object;
pub mod table;
pub mod value;

pub use chunk::{Chunk, OpCode};
pub use gc::{GcRoots, Heap};
pub use object::{
    ObjArray, ObjBoundMethod, ObjClass, ObjClosure, ObjFunction, ObjInstance, ObjKind, ObjRef,
    ObjString, ObjUpvalue, UpvalueState,
};
pub use table::Table;
pub use value::Value;
