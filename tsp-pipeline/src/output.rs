//! Output stage executor.
//!
//! Consumes the tail of the chain: sends contiguous runs of non-dropped
//! packets to the output plugin, honoring the per-send cap, then releases
//! the slots back to the input stage as free space.

use std::sync::Arc;

use tsp_core::RingView;
use tsp_plugin::{OutputPlugin, Report};

use crate::args::TspOptions;
use crate::executor::{ExecutorOutcome, PluginCell};
use crate::ledger::WindowLedger;

pub(crate) struct OutputExecutor {
    stage: usize,
    options: Arc<TspOptions>,
    ledger: Arc<WindowLedger>,
    ring: RingView,
    cell: PluginCell<dyn OutputPlugin>,
    sent: u64,
    skipped: u64,
}

impl OutputExecutor {
    pub fn new(
        stage: usize,
        options: Arc<TspOptions>,
        ledger: Arc<WindowLedger>,
        ring: RingView,
        cell: PluginCell<dyn OutputPlugin>,
    ) -> Self {
        Self {
            stage,
            options,
            ledger,
            ring,
            cell,
            sent: 0,
            skipped: 0,
        }
    }

    /// Stop the plugin during a failed startup, before any thread ran.
    pub fn stop_now(&mut self) {
        let report = self.cell.context.report().clone();
        self.cell.stop_plugin(&report);
    }

    /// Send the non-dropped packets of one contiguous window.
    fn send_window(&mut self, first: usize, len: usize, report: &Report) -> bool {
        let ring = self.ring;
        // SAFETY: [first, first + len) is inside this stage's window.
        let (packets, metas) = unsafe { ring.window(first, len) };
        let max_send = self.options.max_output_packets;

        let mut i = 0;
        while i < len {
            if packets[i].is_dropped() {
                self.skipped += 1;
                i += 1;
                continue;
            }
            let mut j = i;
            while j < len && !packets[j].is_dropped() && (max_send == 0 || j - i < max_send) {
                j += 1;
            }
            if let Err(e) = self.cell.plugin.send(&packets[i..j], &metas[i..j]) {
                report.error(&format!("output error: {e}"));
                return false;
            }
            self.sent += (j - i) as u64;
            i = j;
        }
        true
    }

    /// The thread body of the output stage.
    pub fn run(mut self) -> ExecutorOutcome {
        let report = self.cell.context.report().clone();
        report.debug("output thread started");

        let mut fatal: Option<String> = None;

        loop {
            let win = self.ledger.request_read_window(self.stage, 1, None);

            if let Some(request) = self.ledger.take_restart(self.stage) {
                if !self.cell.handle_restart(request, &report) {
                    fatal = Some("output plugin restart failed".to_string());
                    self.ledger.release(self.stage, 0, win.bitrate, false, true, false);
                    break;
                }
            }

            if win.len == 0 && win.input_end {
                self.ledger
                    .release(self.stage, 0, win.bitrate, true, false, false);
                break;
            }
            if win.len == 0 {
                continue;
            }

            if !self.send_window(win.first, win.len, &report) {
                fatal = Some("output plugin failed".to_string());
                self.ledger
                    .release(self.stage, win.len, win.bitrate, false, true, false);
                break;
            }

            self.ledger
                .release(self.stage, win.len, win.bitrate, win.input_end, false, false);
            if win.input_end {
                break;
            }
        }

        report.debug("stopping the output plugin");
        self.cell.stop_plugin(&report);
        report.debug(&format!(
            "output thread {} after {} packets sent, {} dropped slots skipped",
            if fatal.is_some() { "aborted" } else { "terminated" },
            self.sent,
            self.skipped,
        ));

        ExecutorOutcome {
            stage: self.stage,
            name: self.options.output.name.clone(),
            fatal,
            packets: self.sent,
        }
    }
}
