//! Research-experiment launcher.
//!
//! Takes one idea from a pregenerated idea list, decides whether the experiment
//! should be implemented in Python or C++, prepares a per-run copy of the prompt
//! templates (rewriting them for C++ when needed), and then sequences the
//! external experiment runner, plot aggregation, writeup and review before
//! reclaiming leftover processes.
//!
//! - **[`core`]**: Pure, deterministic logic (language rules, artifact selection,
//!   retry accounting, idea rendering). No I/O.
//! - **[`io`]**: Side-effecting operations (template store, configuration,
//!   delegate commands, process table).
//!
//! Orchestration modules ([`detect`], [`adapt`], [`pipeline`]) combine the two
//! into the phases driven by the `scientist` binary.

pub mod adapt;
pub mod core;
pub mod detect;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod pipeline;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
