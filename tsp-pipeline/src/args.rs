//! Chain options and tuning regimes.
//!
//! Two sets of batching defaults exist: *offline* (large batches, favor
//! throughput) and *real-time* (small batches, favor latency). The regime
//! is picked by the supervisor: an explicit `realtime` setting wins,
//! otherwise any plugin preferring real time selects the real-time set.

use std::net::IpAddr;
use std::time::Duration;

use tsp_plugin::Severity;

use crate::error::{PipelineError, Result};

/// Default ring size in bytes (16 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Smallest accepted ring size: room for 100 packets.
pub const MIN_BUFFER_SIZE: usize = 100 * tsp_core::TS_PACKET_SIZE;

/// Packets processed before a bitrate retry while it is still unknown.
pub const INIT_BITRATE_PACKET_INTERVAL: u64 = 1_000;

const DEF_BITRATE_ADJUST: Duration = Duration::from_secs(5);
const DEF_MAX_FLUSH_PKT_OFFLINE: usize = 10_000;
const DEF_MAX_FLUSH_PKT_REALTIME: usize = 1_000;
const DEF_MAX_INPUT_PKT_REALTIME: usize = 1_000;
const DEF_CONTROL_TIMEOUT: Duration = Duration::from_millis(5_000);

/// One plugin position on the command line: its name and its own
/// argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    /// Plugin name, resolved through the registry.
    pub name: String,
    /// Arguments handed to the plugin's option parser.
    pub args: Vec<String>,
}

impl PluginSpec {
    /// A plugin reference with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
        }
    }

    /// A plugin reference with arguments.
    pub fn with_args<S: Into<String>>(name: impl Into<String>, args: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Behavior after the last input packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FinalWait {
    /// Propagate end of input immediately.
    #[default]
    NoWait,
    /// Wait forever; downstream must drain on its own.
    Forever,
    /// Wait this long before propagating end of input.
    Timeout(Duration),
}

/// Control channel configuration.
#[derive(Debug, Clone)]
pub struct ControlOptions {
    /// TCP port the listener binds to.
    pub port: u16,
    /// Local interface to bind (default: all interfaces).
    pub local: Option<IpAddr>,
    /// Remote addresses allowed to connect (default: loopback only).
    pub sources: Vec<IpAddr>,
    /// Set the reuse-port socket option.
    pub reuse_port: bool,
    /// Per-session command read timeout.
    pub timeout: Duration,
}

impl ControlOptions {
    /// Loopback-only control channel on the given port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            local: None,
            sources: Vec::new(),
            reuse_port: false,
            timeout: DEF_CONTROL_TIMEOUT,
        }
    }
}

/// Options of one processing chain.
#[derive(Debug, Clone)]
pub struct TspOptions {
    /// Fixed input bitrate in b/s; 0 means estimate it.
    pub fixed_bitrate: u64,
    /// Interval between bitrate re-publications.
    pub bitrate_adjust_interval: Duration,
    /// Ring size in bytes.
    pub buffer_size: usize,
    /// Cap on packets per input receive; 0 means fill the window.
    pub max_input_packets: usize,
    /// Cap on packets processed before a flush; 0 picks the regime
    /// default.
    pub max_flushed_packets: usize,
    /// Cap on packets per output send; 0 means send the full run.
    pub max_output_packets: usize,
    /// Packets preloaded before the first downstream wake-up; 0 means
    /// half the ring.
    pub initial_input_packets: usize,
    /// Interleaved stuffing: null packets per input packet group.
    pub instuff_nullpkt: usize,
    /// Interleaved stuffing: input packet group size; 0 disables.
    pub instuff_inpkt: usize,
    /// Null packets inserted before the first input packet.
    pub instuff_start: usize,
    /// Null packets appended after the last input packet.
    pub instuff_stop: usize,
    /// Tuning regime: `Some(true)` real-time, `Some(false)` offline,
    /// `None` auto-detect from the plugins.
    pub realtime: Option<bool>,
    /// Disable the joint-termination quorum.
    pub ignore_joint_termination: bool,
    /// Behavior after the last input packet.
    pub final_wait: FinalWait,
    /// Deadline for a single input receive call.
    pub receive_timeout: Option<Duration>,
    /// Control channel, when enabled.
    pub control: Option<ControlOptions>,
    /// Add the stage index to log prefixes.
    pub log_plugin_index: bool,
    /// Initial maximum severity of the stage report sinks.
    pub log_level: Severity,
    /// The input stage.
    pub input: PluginSpec,
    /// The processor stages, in chain order.
    pub processors: Vec<PluginSpec>,
    /// The output stage.
    pub output: PluginSpec,
}

impl Default for TspOptions {
    fn default() -> Self {
        Self {
            fixed_bitrate: 0,
            bitrate_adjust_interval: DEF_BITRATE_ADJUST,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_input_packets: 0,
            max_flushed_packets: 0,
            max_output_packets: 0,
            initial_input_packets: 0,
            instuff_nullpkt: 0,
            instuff_inpkt: 0,
            instuff_start: 0,
            instuff_stop: 0,
            realtime: None,
            ignore_joint_termination: false,
            final_wait: FinalWait::NoWait,
            receive_timeout: None,
            control: None,
            log_plugin_index: false,
            log_level: Severity::Info,
            input: PluginSpec::new("file"),
            processors: Vec::new(),
            output: PluginSpec::new("file"),
        }
    }
}

impl TspOptions {
    /// Check cross-option consistency.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < MIN_BUFFER_SIZE {
            return Err(PipelineError::Config(format!(
                "buffer size {} below minimum {}",
                self.buffer_size, MIN_BUFFER_SIZE
            )));
        }
        if (self.instuff_nullpkt == 0) != (self.instuff_inpkt == 0) {
            return Err(PipelineError::Config(
                "add-input-stuffing needs both nullpkt and inpkt non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Fill regime-dependent defaults for options left at zero.
    pub fn apply_regime_defaults(&mut self, realtime: bool) {
        if self.max_flushed_packets == 0 {
            self.max_flushed_packets = if realtime {
                DEF_MAX_FLUSH_PKT_REALTIME
            } else {
                DEF_MAX_FLUSH_PKT_OFFLINE
            };
        }
        if self.max_input_packets == 0 && realtime {
            self.max_input_packets = DEF_MAX_INPUT_PKT_REALTIME;
        }
    }
}
