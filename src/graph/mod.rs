//! Workflow graph engine.
//!
//! A node/edge state machine executed one step at a time against a shared
//! [`Context`](crate::context::Context), with conditional edges, loops,
//! and checkpoint/resume. Every delegate that needs multi-step reasoning
//! builds on this engine.

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod node;

pub use checkpoint::{Checkpoint, CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use engine::{WorkflowGraph, TASK_ID_KEY};
pub use error::GraphError;
pub use node::{Edge, EdgePredicate, Node, NodeHandler, NodeKind, PassthroughHandler, SyncHandler};
