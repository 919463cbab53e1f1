//! Chain supervisor.
//!
//! [`TsProcessor`] owns the lifecycle of one processing chain: resolve
//! the tuning regime, allocate the resident buffer, instantiate and start
//! the plugins, preload the initial window, run one executor thread per
//! stage, wait for them, and tear everything down in reverse order.

use std::sync::atomic::AtomicU8;
use std::sync::Arc;

use tracing::{debug, info};
use tsp_core::PacketRing;
use tsp_plugin::{PluginContext, PluginRegistry, Report, SessionState};

use crate::args::TspOptions;
use crate::control::ControlServer;
use crate::error::{PipelineError, Result};
use crate::executor::{ExecutorOutcome, PluginCell};
use crate::input::InputExecutor;
use crate::ledger::{StageKind, WindowLedger};
use crate::output::OutputExecutor;
use crate::processor::ProcessorExecutor;

/// Outcome of a completed chain.
#[derive(Debug, Clone)]
pub struct PipelineSummary {
    /// Packets received from the input plugin (stuffing excluded).
    pub input_packets: u64,
    /// Packets handed to the output plugin.
    pub output_packets: u64,
    /// Which tuning regime was selected.
    pub realtime: bool,
    /// Whether the buffer could be locked against paging.
    pub buffer_locked: bool,
}

/// The transport stream processor supervisor.
pub struct TsProcessor {
    options: TspOptions,
}

impl TsProcessor {
    /// Create a processor for the given chain options.
    pub fn new(options: TspOptions) -> Self {
        Self { options }
    }

    /// Run the chain to completion.
    ///
    /// Blocks until every stage has terminated. Returns the summary on
    /// a clean run (natural end of input, unilateral or joint
    /// termination), an error when any stage aborted.
    pub fn run(&self, registry: &mut PluginRegistry) -> Result<PipelineSummary> {
        let mut options = self.options.clone();
        options.validate()?;

        let session = SessionState::new(options.ignore_joint_termination);

        // Instantiate the plugins in chain order. Contexts carry the
        // stage-scoped report prefix.
        let stage_count = options.processors.len() + 2;
        let log_level = options.log_level;
        let stage_report = |name: &str, index: usize| {
            let prefix = if options.log_plugin_index {
                format!("{name}[{index}]")
            } else {
                name.to_string()
            };
            Report::new(prefix, Arc::new(AtomicU8::new(log_level as u8)))
        };

        let input_ctx = PluginContext::new(
            stage_report(&options.input.name, 0),
            Arc::clone(&session),
        );
        let mut stage_reports = vec![input_ctx.report().clone()];
        let input_factory = registry.input_factory(&options.input.name)?;
        let input_plugin = input_factory(input_ctx.clone(), &options.input.args)?;
        let mut input_cell = PluginCell::new(
            input_plugin,
            input_factory,
            options.input.args.clone(),
            input_ctx,
        );

        let mut processor_cells = Vec::with_capacity(options.processors.len());
        for (i, spec) in options.processors.iter().enumerate() {
            let ctx = PluginContext::new(
                stage_report(&spec.name, i + 1),
                Arc::clone(&session),
            );
            stage_reports.push(ctx.report().clone());
            let factory = registry.processor_factory(&spec.name)?;
            let plugin = factory(ctx.clone(), &spec.args)?;
            processor_cells.push(PluginCell::new(plugin, factory, spec.args.clone(), ctx));
        }

        let output_ctx = PluginContext::new(
            stage_report(&options.output.name, stage_count - 1),
            Arc::clone(&session),
        );
        stage_reports.push(output_ctx.report().clone());
        let output_factory = registry.output_factory(&options.output.name)?;
        let output_plugin = output_factory(output_ctx.clone(), &options.output.args)?;
        let mut output_cell = PluginCell::new(
            output_plugin,
            output_factory,
            options.output.args.clone(),
            output_ctx,
        );

        // Pick the tuning regime: explicit flag first, then any plugin
        // preferring real time.
        let realtime = options.realtime.unwrap_or_else(|| {
            input_cell.plugin.is_real_time()
                || processor_cells.iter().any(|c| c.plugin.is_real_time())
                || output_cell.plugin.is_real_time()
        });
        options.apply_regime_defaults(realtime);
        debug!(realtime, "tuning regime selected");

        // Start the plugins in chain order; unwind on failure.
        let plugin_err = |stage: usize, name: &str, source: tsp_plugin::PluginError| {
            PipelineError::Plugin {
                stage,
                name: name.to_string(),
                source,
            }
        };
        input_cell
            .plugin
            .start()
            .map_err(|e| plugin_err(0, &options.input.name, e))?;
        let mut started = 1;
        let mut start_error = None;
        for (i, cell) in processor_cells.iter_mut().enumerate() {
            if let Err(e) = cell.plugin.start() {
                start_error = Some(plugin_err(i + 1, &options.processors[i].name, e));
                break;
            }
            started += 1;
        }
        if start_error.is_none() {
            if let Err(e) = output_cell.plugin.start() {
                start_error = Some(plugin_err(stage_count - 1, &options.output.name, e));
            }
        }
        if let Some(error) = start_error {
            let report = Report::standalone("tsp");
            input_cell.stop_plugin(&report);
            for cell in processor_cells.iter_mut().take(started - 1) {
                cell.stop_plugin(&report);
            }
            return Err(error);
        }

        // Allocate the resident buffer and the window ledger.
        let ring = PacketRing::allocate(options.buffer_size)?;
        let buffer_locked = ring.is_locked();
        let mut kinds = vec![StageKind::Input];
        kinds.extend(std::iter::repeat(StageKind::Processor).take(options.processors.len()));
        kinds.push(StageKind::Output);
        let ledger = Arc::new(WindowLedger::new(ring.count(), kinds));
        let view = ring.view();
        let options = Arc::new(options);

        // Build the executors.
        let mut input_exec = InputExecutor::new(
            Arc::clone(&options),
            Arc::clone(&ledger),
            view,
            input_cell,
        );
        let mut processor_execs: Vec<ProcessorExecutor> = processor_cells
            .into_iter()
            .enumerate()
            .map(|(i, cell)| {
                ProcessorExecutor::new(i + 1, Arc::clone(&options), Arc::clone(&ledger), view, cell)
            })
            .collect();
        let mut output_exec = OutputExecutor::new(
            stage_count - 1,
            Arc::clone(&options),
            Arc::clone(&ledger),
            view,
            output_cell,
        );

        // Preload the initial window so every downstream plugin sees a
        // valid bitrate from its first invocation.
        let loaded = input_exec.preload();
        if loaded == 0 {
            input_exec.stop_now();
            for exec in processor_execs.iter_mut() {
                exec.stop_now();
            }
            output_exec.stop_now();
            return Err(plugin_err(
                0,
                &self.options.input.name,
                tsp_plugin::PluginError::Runtime {
                    plugin: self.options.input.name.clone(),
                    message: "no initial packets from input".to_string(),
                },
            ));
        }
        let initial_bitrate = input_exec.initial_bitrate();
        let ring_size = ledger.ring_size();
        ledger.init_stage(0, loaded % ring_size, ring_size - loaded, initial_bitrate);
        ledger.init_stage(1, 0, loaded, initial_bitrate);
        for stage in 2..stage_count {
            ledger.init_stage(stage, loaded % ring_size, 0, initial_bitrate);
        }
        info!(
            packets = loaded,
            bitrate = initial_bitrate,
            locked = buffer_locked,
            slots = ring_size,
            "chain starting"
        );

        // Optional control channel.
        let control = match options.control.clone() {
            Some(control_options) => {
                let mut names = Vec::with_capacity(stage_count);
                names.push(options.input.name.clone());
                names.extend(options.processors.iter().map(|p| p.name.clone()));
                names.push(options.output.name.clone());
                Some(
                    ControlServer::start(
                        control_options,
                        Arc::clone(&ledger),
                        Arc::clone(&session),
                        names,
                        stage_reports,
                    )
                    .map_err(PipelineError::Control)?,
                )
            }
            None => None,
        };

        // One thread per stage.
        let spawn_err = |e: std::io::Error| PipelineError::Thread(e.to_string());
        let input_thread = std::thread::Builder::new()
            .name("tsp-input".to_string())
            .spawn(move || input_exec.run())
            .map_err(spawn_err)?;
        let mut processor_threads = Vec::new();
        for (i, exec) in processor_execs.into_iter().enumerate() {
            processor_threads.push(
                std::thread::Builder::new()
                    .name(format!("tsp-proc-{}", i + 1))
                    .spawn(move || exec.run())
                    .map_err(spawn_err)?,
            );
        }
        let output_thread = std::thread::Builder::new()
            .name("tsp-output".to_string())
            .spawn(move || output_exec.run())
            .map_err(spawn_err)?;

        // Wait for the chain to drain, then tear down in reverse order.
        let mut outcomes: Vec<ExecutorOutcome> = Vec::with_capacity(stage_count);
        let join = |handle: std::thread::JoinHandle<ExecutorOutcome>| {
            handle
                .join()
                .map_err(|_| PipelineError::Thread("executor thread panicked".to_string()))
        };
        outcomes.push(join(input_thread)?);
        for handle in processor_threads {
            outcomes.push(join(handle)?);
        }
        outcomes.push(join(output_thread)?);

        if let Some(control) = control {
            control.shutdown();
        }
        drop(ledger);
        drop(ring);

        let input_packets = outcomes.first().map(|o| o.packets).unwrap_or(0);
        let output_packets = outcomes.last().map(|o| o.packets).unwrap_or(0);
        for outcome in &outcomes {
            if let Some(reason) = &outcome.fatal {
                debug!(stage = outcome.stage, name = %outcome.name, reason = %reason, "stage aborted");
            }
        }
        // Only locally-failing stages carry a fatal reason; stages that
        // merely observed a neighbor stop exit cleanly.
        if let Some(origin) = outcomes.iter().find(|o| o.fatal.is_some()) {
            return Err(PipelineError::Aborted {
                stage: origin.stage,
                name: origin.name.clone(),
            });
        }

        info!(input_packets, output_packets, "chain terminated");
        Ok(PipelineSummary {
            input_packets,
            output_packets,
            realtime,
            buffer_locked,
        })
    }
}
