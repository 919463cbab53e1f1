//! PID and label based packet filter.
//!
//! ```text
//! filter [--pid <pid>]... [--negate] [--drop | --null]
//!        [--set-label <0..31>]... [--only-label <0..31>]...
//! ```
//!
//! Packets matching the PID set (all packets when the set is empty, the
//! complement with `--negate`) are dropped, nullified, or passed with the
//! given labels added. `--only-label` restricts which packets are
//! presented to the filter at all; the core bypasses the rest.

use std::collections::HashSet;

use tsp_core::{LabelSet, PacketMetadata, TsPacket};

use crate::api::{PacketStatus, Plugin, ProcessorPlugin};
use crate::context::PluginContext;
use crate::error::{PluginError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Pass,
    Drop,
    Null,
}

/// The `filter` processor plugin.
pub struct Filter {
    context: PluginContext,
    pids: HashSet<u16>,
    negate: bool,
    action: Action,
    set_labels: LabelSet,
    only_labels: LabelSet,
    matched: u64,
}

fn options_err(message: impl Into<String>) -> PluginError {
    PluginError::Options {
        plugin: "filter".to_string(),
        message: message.into(),
    }
}

fn parse_int(value: &str) -> Option<u64> {
    if let Some(hex) = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

/// Factory for the `filter` processor plugin.
pub fn new(context: PluginContext, args: &[String]) -> Result<Box<dyn ProcessorPlugin>> {
    let mut pids = HashSet::new();
    let mut negate = false;
    let mut action = Action::Pass;
    let mut set_labels = LabelSet::EMPTY;
    let mut only_labels = LabelSet::EMPTY;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--pid" => {
                let value = iter.next().ok_or_else(|| options_err("--pid needs a value"))?;
                let pid = parse_int(value)
                    .filter(|v| *v <= 0x1FFF)
                    .ok_or_else(|| options_err(format!("invalid PID '{value}'")))?;
                pids.insert(pid as u16);
            }
            "--negate" => negate = true,
            "--drop" => action = Action::Drop,
            "--null" => action = Action::Null,
            "--set-label" => {
                let value = iter.next().ok_or_else(|| options_err("--set-label needs a value"))?;
                let label = parse_int(value)
                    .filter(|v| *v <= 31)
                    .ok_or_else(|| options_err(format!("invalid label '{value}'")))?;
                set_labels.insert(label as usize);
            }
            "--only-label" => {
                let value = iter.next().ok_or_else(|| options_err("--only-label needs a value"))?;
                let label = parse_int(value)
                    .filter(|v| *v <= 31)
                    .ok_or_else(|| options_err(format!("invalid label '{value}'")))?;
                only_labels.insert(label as usize);
            }
            other => return Err(options_err(format!("unknown option '{other}'"))),
        }
    }

    Ok(Box::new(Filter {
        context,
        pids,
        negate,
        action,
        set_labels,
        only_labels,
        matched: 0,
    }))
}

impl Plugin for Filter {
    fn stop(&mut self) -> Result<()> {
        self.context
            .report()
            .verbose(&format!("{} packets matched", self.matched));
        Ok(())
    }
}

impl ProcessorPlugin for Filter {
    fn process(&mut self, packet: &mut TsPacket, metadata: &mut PacketMetadata) -> PacketStatus {
        let matches = if self.pids.is_empty() {
            true
        } else {
            self.pids.contains(&packet.pid()) != self.negate
        };
        if !matches {
            return PacketStatus::Ok;
        }
        self.matched += 1;
        metadata.labels_mut().union_with(self.set_labels);
        match self.action {
            Action::Pass => PacketStatus::Ok,
            Action::Drop => PacketStatus::Drop,
            Action::Null => PacketStatus::Null,
        }
    }

    fn only_label(&self) -> LabelSet {
        self.only_labels
    }
}
