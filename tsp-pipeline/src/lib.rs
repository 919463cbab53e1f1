//! Execution core of the TSP transport stream processor.
//!
//! A chain of stages - one input, any number of processors, one output -
//! shares a page-locked circular packet buffer. Each stage owns a sliding
//! window of buffer slots and runs on its own thread; ownership of slots
//! moves strictly in ring direction (input to processors to output and
//! back to input) through the [`WindowLedger`]. Plugins never see the
//! buffer as a whole: the executors hand them exactly the slots their
//! stage currently owns.
//!
//! ```text
//! ┌───────┐    ┌───────────┐    ┌───────────┐    ┌────────┐
//! │ input │───▶│ processor │───▶│ processor │───▶│ output │
//! └───┬───┘    └───────────┘    └───────────┘    └───┬────┘
//!     ▲                 (window transfer)            │
//!     └──────────────── free slots ◀─────────────────┘
//! ```
//!
//! [`TsProcessor`] is the supervisor: it allocates the buffer, builds the
//! stages from a [`tsp_plugin::PluginRegistry`], preloads the initial
//! window, runs the executor threads to completion and reports the most
//! severe outcome.

mod args;
mod bitrate;
mod control;
mod error;
mod executor;
mod input;
mod ledger;
mod output;
mod pipeline;
mod processor;

pub use args::{ControlOptions, FinalWait, PluginSpec, TspOptions, DEFAULT_BUFFER_SIZE};
pub use bitrate::BitrateSource;
pub use error::{PipelineError, Result};
pub use ledger::{StageKind, TerminationKind, Window, WindowLedger};
pub use pipeline::{PipelineSummary, TsProcessor};
