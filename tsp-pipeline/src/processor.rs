//! Processor stage executor.
//!
//! Walks the stage's window in admission order, presenting each packet to
//! the plugin unless the slot is dropped, the stage is suspended, or an
//! `only-label` restriction excludes it. Applies the plugin verdict,
//! flushes downstream on the configured cadence, and handles bitrate
//! changes, stalls and termination.

use std::sync::Arc;

use tsp_core::{RingView, TsPacket};
use tsp_plugin::{PacketStatus, ProcessorPlugin, Report};

use crate::args::TspOptions;
use crate::executor::{ExecutorOutcome, PluginCell};
use crate::ledger::WindowLedger;

/// Why a processing chunk ended before exhausting its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkEnd {
    /// All packets of the chunk were consumed.
    Exhausted,
    /// Flush now and keep going (hint, new bitrate, or batch cap).
    Flush,
    /// The current packet was not consumed; re-present it later.
    Stall,
    /// The plugin ended the stream (or the joint quorum completed).
    End,
    /// The plugin failed fatally.
    Abort,
}

pub(crate) struct ProcessorExecutor {
    stage: usize,
    options: Arc<TspOptions>,
    ledger: Arc<WindowLedger>,
    ring: RingView,
    cell: PluginCell<dyn ProcessorPlugin>,
    passed: u64,
    dropped: u64,
    nullified: u64,
    bypassed: u64,
    plugin_packets: u64,
}

impl ProcessorExecutor {
    pub fn new(
        stage: usize,
        options: Arc<TspOptions>,
        ledger: Arc<WindowLedger>,
        ring: RingView,
        cell: PluginCell<dyn ProcessorPlugin>,
    ) -> Self {
        Self {
            stage,
            options,
            ledger,
            ring,
            cell,
            passed: 0,
            dropped: 0,
            nullified: 0,
            bypassed: 0,
            plugin_packets: 0,
        }
    }

    /// Stop the plugin during a failed startup, before any thread ran.
    pub fn stop_now(&mut self) {
        let report = self.cell.context.report().clone();
        self.cell.stop_plugin(&report);
    }

    /// The thread body of a processor stage.
    pub fn run(mut self) -> ExecutorOutcome {
        let report = self.cell.context.report().clone();
        report.debug("packet processing thread started");

        let mut only = self.cell.plugin.only_label();
        let mut output_bitrate: u64 = 0;
        let mut bitrate_never_modified = true;
        let mut min_request = 1usize;
        let mut fatal: Option<String> = None;

        'outer: loop {
            let win = self.ledger.request_read_window(self.stage, min_request, None);
            min_request = 1;

            if let Some(request) = self.ledger.take_restart(self.stage) {
                if self.cell.handle_restart(request, &report) {
                    only = self.cell.plugin.only_label();
                } else {
                    fatal = Some("plugin restart failed".to_string());
                    self.ledger
                        .release(self.stage, 0, output_bitrate, true, true, false);
                    break;
                }
            }

            // While the plugin never overrode the bitrate, the input
            // bitrate is copied through.
            if bitrate_never_modified {
                output_bitrate = win.bitrate;
            }

            // The successor gave up: tell the predecessor and exit. The
            // originating stage decides whether this run is an error.
            if win.aborted && !win.input_end {
                self.ledger
                    .release(self.stage, 0, output_bitrate, true, true, false);
                break;
            }

            // Nothing left and nothing will come: propagate and exit.
            if win.len == 0 && win.input_end {
                self.ledger
                    .release(self.stage, 0, output_bitrate, true, false, false);
                break;
            }
            if win.len == 0 {
                // Woken without work (restart or spurious), wait again.
                continue;
            }

            // Walk the window in chunks; each chunk's slices are dropped
            // before its slots are released downstream.
            let mut offset = 0usize;
            let window_len = win.len;
            while offset < window_len {
                let (consumed, end) = self.process_chunk(
                    win.first + offset,
                    window_len - offset,
                    win.suspended,
                    only,
                    &mut output_bitrate,
                    &mut bitrate_never_modified,
                    win.ending,
                    &report,
                );
                offset += consumed;

                match end {
                    ChunkEnd::End | ChunkEnd::Abort => {
                        if end == ChunkEnd::Abort {
                            fatal = Some("plugin aborted".to_string());
                        }
                        // Everything consumed goes downstream with end of
                        // input; the abort flag stops the predecessor.
                        self.ledger
                            .release(self.stage, consumed, output_bitrate, true, true, false);
                        break 'outer;
                    }
                    ChunkEnd::Stall => {
                        let cont = self.ledger.release(
                            self.stage,
                            consumed,
                            output_bitrate,
                            false,
                            false,
                            true,
                        );
                        if !cont {
                            break 'outer;
                        }
                        // Sleep until more packets than we hold arrive
                        // (or end of input), then re-present the same
                        // packet.
                        min_request = (win.available - offset) + 1;
                        continue 'outer;
                    }
                    ChunkEnd::Flush | ChunkEnd::Exhausted => {
                        let last = offset == window_len;
                        let cont = self.ledger.release(
                            self.stage,
                            consumed,
                            output_bitrate,
                            last && win.input_end,
                            false,
                            end == ChunkEnd::Flush,
                        );
                        if !cont {
                            break 'outer;
                        }
                    }
                }
            }

            if win.input_end {
                break;
            }
        }

        report.debug("stopping the plugin");
        self.cell.stop_plugin(&report);
        report.debug(&format!(
            "packet processing thread {} after {} packets, {} passed, {} dropped, {} nullified, {} bypassed",
            if fatal.is_some() { "aborted" } else { "terminated" },
            self.plugin_packets,
            self.passed,
            self.dropped,
            self.nullified,
            self.bypassed,
        ));

        ExecutorOutcome {
            stage: self.stage,
            name: self.options.processors[self.stage - 1].name.clone(),
            fatal,
            packets: self.plugin_packets,
        }
    }

    /// Process packets starting at `first` until the chunk ends.
    ///
    /// Returns the number of consumed packets and why the chunk ended.
    #[allow(clippy::too_many_arguments)]
    fn process_chunk(
        &mut self,
        first: usize,
        len: usize,
        suspended: bool,
        only: tsp_core::LabelSet,
        output_bitrate: &mut u64,
        bitrate_never_modified: &mut bool,
        at_input_end: bool,
        report: &Report,
    ) -> (usize, ChunkEnd) {
        let ring = self.ring;
        // SAFETY: [first, first + len) is inside this stage's window and
        // the slices are dropped before any of it is released.
        let (packets, metas) = unsafe { ring.window(first, len) };

        let max_flush = self.options.max_flushed_packets;
        let mut consumed = 0usize;

        while consumed < len {
            let idx = consumed;

            if packets[idx].is_dropped()
                || suspended
                || (!only.is_empty() && !metas[idx].labels().intersects(only))
            {
                // Never present dropped or excluded packets to the plugin.
                self.bypassed += 1;
                consumed += 1;
                if max_flush > 0 && consumed >= max_flush {
                    return (consumed, ChunkEnd::Flush);
                }
                continue;
            }

            metas[idx].set_flush(false);
            metas[idx].set_bitrate_changed(false);
            let was_null = packets[idx].is_null();

            let mut status = self.cell.plugin.process(&mut packets[idx], &mut metas[idx]);
            self.plugin_packets += 1;

            // A stall with nothing left to come would never resolve:
            // drain instead.
            if status == PacketStatus::Stall && at_input_end {
                status = PacketStatus::Ok;
            }

            match status {
                PacketStatus::Ok => {
                    self.passed += 1;
                    consumed += 1;
                }
                PacketStatus::Null => {
                    packets[idx] = TsPacket::null();
                    consumed += 1;
                }
                PacketStatus::Drop => {
                    packets[idx].mark_dropped();
                    self.dropped += 1;
                    consumed += 1;
                }
                PacketStatus::Stall => {
                    return (consumed, ChunkEnd::Stall);
                }
                PacketStatus::End => {
                    report.debug("plugin requests termination");
                    return (consumed, ChunkEnd::End);
                }
                PacketStatus::Abort => {
                    report.error("plugin requests abort");
                    return (consumed, ChunkEnd::Abort);
                }
            }

            // The plugin may nullify by verdict or by rewriting the PID.
            if !was_null && !packets[idx].is_dropped() && packets[idx].is_null() {
                metas[idx].set_nullified(true);
                self.nullified += 1;
            }

            let mut got_new_bitrate = false;
            if metas[idx].bitrate_changed() {
                if let Some(bitrate) = self.cell.plugin.bitrate().filter(|b| *b > 0) {
                    *bitrate_never_modified = false;
                    got_new_bitrate = bitrate != *output_bitrate;
                    *output_bitrate = bitrate;
                }
            }

            // The stage whose plugin completes the joint quorum ends the
            // chain, current packet included.
            if self.cell.context.session().joint_complete() {
                report.debug("joint termination quorum reached");
                return (consumed, ChunkEnd::End);
            }

            if metas[idx].flush() || got_new_bitrate || (max_flush > 0 && consumed >= max_flush) {
                return (consumed, ChunkEnd::Flush);
            }
        }

        (consumed, ChunkEnd::Exhausted)
    }
}
