//! Plugin capability traits and type definitions.

use serde::{Deserialize, Serialize};
use tsp_core::{LabelSet, PacketMetadata, TsPacket};

use crate::context::PluginContext;
use crate::error::Result;

/// The capability a plugin provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    /// Produces packets into the chain.
    Input,
    /// Transforms packets in place.
    Processor,
    /// Consumes packets out of the chain.
    Output,
}

impl std::fmt::Display for PluginKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginKind::Input => write!(f, "input"),
            PluginKind::Processor => write!(f, "processor"),
            PluginKind::Output => write!(f, "output"),
        }
    }
}

/// Verdict returned by a processor plugin for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketStatus {
    /// Pass the packet downstream, unchanged or mutated in place.
    Ok,
    /// Replace the packet with a null packet.
    Null,
    /// Drop the packet (its sync byte is zeroed).
    Drop,
    /// Flush buffered packets and present this packet again later.
    Stall,
    /// End of processing, terminate the chain downstream.
    End,
    /// Fatal error, abort the chain.
    Abort,
}

/// Behavior shared by all plugin kinds.
///
/// Option parsing happens in the factory, once, at construction; `start`
/// and `stop` bracket the processing session.
pub trait Plugin: Send {
    /// Start the plugin session. Called once before any packet.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Stop the plugin session. Called once after the last packet.
    fn stop(&mut self) -> Result<()> {
        Ok(())
    }

    /// The bitrate this plugin knows about, in bits/second.
    ///
    /// Inputs report the device bitrate, processors their output bitrate
    /// after a `bitrate_changed` hint. `None` means unknown.
    fn bitrate(&self) -> Option<u64> {
        None
    }

    /// Whether this plugin prefers the real-time tuning regime.
    fn is_real_time(&self) -> bool {
        false
    }
}

/// A plugin producing packets into the chain.
pub trait InputPlugin: Plugin {
    /// Fill up to `packets.len()` slots and return how many were written.
    ///
    /// Returning 0 declares end of stream. Metadata slots may be stamped
    /// with input timestamps; untouched slots are stamped by the core.
    fn receive(&mut self, packets: &mut [TsPacket], metadata: &mut [PacketMetadata]) -> Result<usize>;

    /// Abort a blocking `receive` from another thread, if supported.
    ///
    /// Returns false when the plugin cannot interrupt its input.
    fn abort_receive(&mut self) -> bool {
        false
    }
}

/// A plugin transforming packets in place.
pub trait ProcessorPlugin: Plugin {
    /// Process one packet and return a verdict.
    ///
    /// The plugin is never invoked for dropped slots, nor for packets
    /// excluded by [`ProcessorPlugin::only_label`].
    fn process(&mut self, packet: &mut TsPacket, metadata: &mut PacketMetadata) -> PacketStatus;

    /// Restrict invocations to packets carrying one of these labels.
    ///
    /// An empty set (the default) processes every packet.
    fn only_label(&self) -> LabelSet {
        LabelSet::EMPTY
    }
}

/// A plugin consuming packets out of the chain.
pub trait OutputPlugin: Plugin {
    /// Emit the given packets. Dropped slots are filtered out by the
    /// executor before this is called.
    fn send(&mut self, packets: &[TsPacket], metadata: &[PacketMetadata]) -> Result<()>;
}

/// Factory signature for input plugins.
pub type InputFactory = fn(PluginContext, &[String]) -> Result<Box<dyn InputPlugin>>;

/// Factory signature for processor plugins.
pub type ProcessorFactory = fn(PluginContext, &[String]) -> Result<Box<dyn ProcessorPlugin>>;

/// Factory signature for output plugins.
pub type OutputFactory = fn(PluginContext, &[String]) -> Result<Box<dyn OutputPlugin>>;
