//! procpipe - shell-style pipelines of OS processes.

pub mod config;
pub mod display;
pub mod pipeline;

pub use pipeline::{
    output, Command, ExitReport, LifecycleState, Output, Pipeline, PipelineError,
    PipelineHandle, PipelineOptions, INTERRUPT_EXIT_CODE,
};
