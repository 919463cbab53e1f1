//! tsp - MPEG transport stream processor.
//!
//! ```text
//! tsp [global-opts] [-I input [opts]] (-P processor [opts])* [-O output [opts]]
//! ```
//!
//! Global options come before the first `-I`/`-P`/`-O` marker; everything
//! after a marker up to the next one belongs to that plugin. The default
//! input and output are `file -` (standard input and output).

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::error;
use tsp_pipeline::{
    ControlOptions, FinalWait, PipelineError, PluginSpec, TsProcessor, TspOptions,
};
use tsp_plugin::{PluginRegistry, Severity};

/// Exit codes, most severe condition wins.
const EXIT_ALLOC: u8 = 3;
const EXIT_USAGE: u8 = 2;
const EXIT_RUNTIME: u8 = 1;

/// Global options of the transport stream processor.
#[derive(Parser, Debug)]
#[command(name = "tsp")]
#[command(version)]
#[command(about = "MPEG transport stream processor: one input, a chain of packet processors, one output")]
#[command(after_help = "PLUGIN CHAIN:\n    \
    -I <name> [options]   the input plugin (default: file -)\n    \
    -P <name> [options]   a packet processor, repeatable, in order\n    \
    -O <name> [options]   the output plugin (default: file -)")]
struct GlobalArgs {
    /// Fix the input bitrate in b/s instead of estimating it
    #[arg(short, long)]
    bitrate: Option<u64>,

    /// Seconds between bitrate adjustments
    #[arg(long, default_value = "5")]
    bitrate_adjust_interval: u64,

    /// Buffer size in MiB (decimal allowed)
    #[arg(long, default_value = "16")]
    buffer_size_mb: f64,

    /// Maximum packets per input receive operation
    #[arg(long)]
    max_input_packets: Option<usize>,

    /// Maximum packets processed before flushing downstream
    #[arg(long)]
    max_flushed_packets: Option<usize>,

    /// Maximum packets per output send operation
    #[arg(long)]
    max_output_packets: Option<usize>,

    /// Packets to preload before starting the chain (default: half the buffer)
    #[arg(long)]
    initial_input_packets: Option<usize>,

    /// Insert <nullpkt> null packets every <inpkt> input packets, as "nullpkt/inpkt"
    #[arg(short = 'a', long, value_name = "NULLPKT/INPKT")]
    add_input_stuffing: Option<String>,

    /// Null packets inserted before the first input packet
    #[arg(long, default_value = "0")]
    add_start_stuffing: usize,

    /// Null packets appended after the last input packet
    #[arg(long, default_value = "0")]
    add_stop_stuffing: usize,

    /// Tuning regime: auto, on or off
    #[arg(short, long, value_name = "auto|on|off", default_value = "auto")]
    realtime: String,

    /// Ignore all joint termination conditions
    #[arg(short, long)]
    ignore_joint_termination: bool,

    /// Milliseconds to wait after the last input packet (0 = forever)
    #[arg(long, value_name = "MILLISECONDS")]
    final_wait: Option<u64>,

    /// Deadline in milliseconds for a single input receive
    #[arg(long, value_name = "MILLISECONDS")]
    receive_timeout: Option<u64>,

    /// TCP port listening for control commands
    #[arg(long)]
    control_port: Option<u16>,

    /// Local interface for the control listener
    #[arg(long, value_name = "ADDRESS")]
    control_local: Option<std::net::IpAddr>,

    /// Remote address allowed to send control commands (repeatable)
    #[arg(long, value_name = "ADDRESS")]
    control_source: Vec<std::net::IpAddr>,

    /// Set the reuse-port option on the control listener
    #[arg(long)]
    control_reuse_port: bool,

    /// Control session read timeout in milliseconds
    #[arg(long, default_value = "5000", value_name = "MILLISECONDS")]
    control_timeout: u64,

    /// Add the stage index to plugin log prefixes
    #[arg(long)]
    log_plugin_index: bool,

    /// More verbose logging (repeat for debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Split the command line into the global section and the plugin chain.
fn split_chain(argv: &[String]) -> (Vec<String>, Vec<(char, PluginSpec)>) {
    let mut globals = Vec::new();
    let mut chain: Vec<(char, PluginSpec)> = Vec::new();

    let mut iter = argv.iter().peekable();
    while let Some(arg) = iter.next() {
        let marker = match arg.as_str() {
            "-I" => Some('I'),
            "-P" => Some('P'),
            "-O" => Some('O'),
            _ => None,
        };
        match marker {
            None => globals.push(arg.clone()),
            Some(marker) => {
                let Some(name) = iter.next() else {
                    globals.push(arg.clone()); // let clap report the error
                    continue;
                };
                let mut spec = PluginSpec::new(name);
                while let Some(next) = iter.peek() {
                    if matches!(next.as_str(), "-I" | "-P" | "-O") {
                        break;
                    }
                    spec.args.push(iter.next().unwrap().clone());
                }
                chain.push((marker, spec));
            }
        }
    }
    (globals, chain)
}

fn build_options(globals: GlobalArgs, chain: Vec<(char, PluginSpec)>) -> anyhow::Result<TspOptions> {
    let mut options = TspOptions {
        fixed_bitrate: globals.bitrate.unwrap_or(0),
        bitrate_adjust_interval: Duration::from_secs(globals.bitrate_adjust_interval),
        buffer_size: (globals.buffer_size_mb * 1024.0 * 1024.0) as usize,
        max_input_packets: globals.max_input_packets.unwrap_or(0),
        max_flushed_packets: globals.max_flushed_packets.unwrap_or(0),
        max_output_packets: globals.max_output_packets.unwrap_or(0),
        initial_input_packets: globals.initial_input_packets.unwrap_or(0),
        instuff_start: globals.add_start_stuffing,
        instuff_stop: globals.add_stop_stuffing,
        ignore_joint_termination: globals.ignore_joint_termination,
        log_plugin_index: globals.log_plugin_index,
        log_level: match globals.verbose {
            0 => Severity::Info,
            1 => Severity::Verbose,
            _ => Severity::Debug,
        },
        ..Default::default()
    };

    if let Some(spec) = &globals.add_input_stuffing {
        let (nullpkt, inpkt) = spec
            .split_once('/')
            .and_then(|(n, i)| Some((n.parse::<usize>().ok()?, i.parse::<usize>().ok()?)))
            .filter(|(n, i)| *n > 0 && *i > 0)
            .ok_or_else(|| {
                anyhow::anyhow!("invalid --add-input-stuffing '{spec}', use \"nullpkt/inpkt\"")
            })?;
        options.instuff_nullpkt = nullpkt;
        options.instuff_inpkt = inpkt;
    }

    options.realtime = match globals.realtime.as_str() {
        "auto" => None,
        "on" | "yes" | "true" => Some(true),
        "off" | "no" | "false" => Some(false),
        other => anyhow::bail!("invalid --realtime '{other}', use auto, on or off"),
    };

    options.final_wait = match globals.final_wait {
        None => FinalWait::NoWait,
        Some(0) => FinalWait::Forever,
        Some(ms) => FinalWait::Timeout(Duration::from_millis(ms)),
    };
    options.receive_timeout = globals.receive_timeout.map(Duration::from_millis);

    if let Some(port) = globals.control_port {
        let mut control = ControlOptions::new(port);
        control.local = globals.control_local;
        control.sources = globals.control_source;
        control.reuse_port = globals.control_reuse_port;
        control.timeout = Duration::from_millis(globals.control_timeout);
        options.control = Some(control);
    }

    let (mut seen_input, mut seen_output) = (false, false);
    for (marker, spec) in chain {
        match marker {
            'I' => {
                if seen_input {
                    anyhow::bail!("at most one -I is allowed");
                }
                seen_input = true;
                options.input = spec;
            }
            'O' => {
                if seen_output {
                    anyhow::bail!("at most one -O is allowed");
                }
                seen_output = true;
                options.output = spec;
            }
            _ => options.processors.push(spec),
        }
    }
    Ok(options)
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();
    let (globals, chain) = split_chain(&argv);

    let globals = match GlobalArgs::try_parse_from(std::iter::once("tsp".to_string()).chain(globals)) {
        Ok(globals) => globals,
        Err(e) => {
            // clap handles --help/--version through this path too.
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(EXIT_USAGE)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let level = match globals.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let options = match build_options(globals, chain) {
        Ok(options) => options,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_USAGE);
        }
    };

    let mut registry = PluginRegistry::with_builtins();
    match TsProcessor::new(options).run(&mut registry) {
        Ok(summary) => {
            tracing::debug!(
                input = summary.input_packets,
                output = summary.output_packets,
                realtime = summary.realtime,
                "done"
            );
            ExitCode::SUCCESS
        }
        Err(e @ (PipelineError::Config(_) | PipelineError::Load(_))) => {
            error!("{e}");
            ExitCode::from(EXIT_USAGE)
        }
        Err(e @ PipelineError::Core(_)) => {
            error!("{e}");
            ExitCode::from(EXIT_ALLOC)
        }
        Err(e) => {
            error!("{e}");
            ExitCode::from(EXIT_RUNTIME)
        }
    }
}
