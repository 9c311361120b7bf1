//! Graph definition and compilation (§4.B).
//!
//! The main entry point is [`GraphBuilder`], a fluent builder that compiles
//! into an executable [`App`](crate::app::App). See [`builder`] for examples.

mod builder;
mod compilation;
pub mod edges;
mod iteration;
#[cfg(feature = "petgraph-compat")]
mod petgraph_compat;

pub use builder::GraphBuilder;
pub use compilation::GraphCompileError;
pub use edges::{ConditionalEdge, RouterFn};
pub use iteration::{EdgesIter, NodesIter};

#[cfg(feature = "petgraph-compat")]
pub use petgraph_compat::{is_cyclic, NodeIndexMap, PetgraphConversion, StepDiGraph};
