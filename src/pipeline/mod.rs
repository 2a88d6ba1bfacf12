//! Process pipelines: `cmd1 | cmd2 | cmd3` as a single unit.
//!
//! Build [`Command`]s, hand them to [`Pipeline::create`],
//! [`Pipeline::pipe_output`] or [`output`], then drive the result with
//! `start`/`wait`/`run` and stop it with `kill`/`cancel`/`terminate`.

mod builder;
mod capture;
mod command;
mod controller;
mod error;
mod exit;
mod logger;
mod options;
mod pipe;
mod signal;
mod stage;

pub use capture::*;
pub use command::{Command, CommandSpec, InputSource, OutputSink};
pub use controller::{output, LifecycleState, Output, Pipeline, PipelineHandle};
pub use error::*;
pub use exit::*;
pub use logger::*;
pub use options::*;
pub use signal::*;
