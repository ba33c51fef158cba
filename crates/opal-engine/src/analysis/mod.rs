//! Control-flow graph and data-flow framework
//!
//! The framework exists for program analyses over callables. Only the
//! correctness pass (definite assignment) is wired into the pipeline;
//! emitted code never depends on analysis results.

pub mod bitset;
pub mod cfg;
pub mod dataflow;
pub mod definite_assignment;

pub use bitset::BitSet;
pub use cfg::{Cfg, CfgNode, ENTRY, EXIT};
pub use dataflow::{solve, DataFlowAnalysis};
pub use definite_assignment::check_definite_assignment;
