//! Analysis pipeline: stage execution, prompts, output parsing and the
//! resume planner that drives them.

mod executor;
pub mod parser;
mod planner;
pub mod prompts;

pub use executor::*;
pub use planner::*;
