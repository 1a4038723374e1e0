//! Test support for shoal pools: job builders and a scripted worker program.

mod job;
mod program;

pub use job::{TestAction, TestJob};
pub use program::{JobStart, ScriptLog, ScriptedProgram};
