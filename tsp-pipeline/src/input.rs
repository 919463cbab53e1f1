//! Input stage executor.
//!
//! The input executor claims free slots from the ledger, fills them from
//! the input plugin - interleaving synthetic stuffing as configured -
//! stamps input timestamps, keeps the declared bitrate current, and
//! releases the packets to the first downstream stage.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;
use tsp_core::{RingView, TimeSource, TsPacket};
use tsp_plugin::{InputPlugin, Report};

use crate::args::{FinalWait, TspOptions, INIT_BITRATE_PACKET_INTERVAL};
use crate::bitrate::BitrateSource;
use crate::executor::{ExecutorOutcome, PluginCell};
use crate::ledger::WindowLedger;

pub(crate) struct InputExecutor {
    options: Arc<TspOptions>,
    ledger: Arc<WindowLedger>,
    ring: RingView,
    cell: PluginCell<dyn InputPlugin>,
    source: BitrateSource,
    start_time: Instant,
    sync_lost: bool,
    plugin_completed: bool,
    receive_timed_out: bool,
    instuff_start_remain: usize,
    instuff_stop_remain: usize,
    instuff_nullpkt_remain: usize,
    instuff_inpkt_remain: usize,
    current_bitrate: u64,
    plugin_packets: u64,
    total_packets: u64,
}

impl InputExecutor {
    pub fn new(
        options: Arc<TspOptions>,
        ledger: Arc<WindowLedger>,
        ring: RingView,
        cell: PluginCell<dyn InputPlugin>,
    ) -> Self {
        let instuff = (options.instuff_inpkt > 0)
            .then(|| (options.instuff_nullpkt as u64, options.instuff_inpkt as u64));
        let source = BitrateSource::new(options.fixed_bitrate, instuff);
        Self {
            instuff_start_remain: options.instuff_start,
            instuff_stop_remain: options.instuff_stop,
            instuff_nullpkt_remain: 0,
            instuff_inpkt_remain: 0,
            options,
            ledger,
            ring,
            cell,
            source,
            start_time: Instant::now(),
            sync_lost: false,
            plugin_completed: false,
            receive_timed_out: false,
            current_bitrate: 0,
            plugin_packets: 0,
            total_packets: 0,
        }
    }

    fn report(&self) -> Report {
        self.cell.context.report().clone()
    }

    /// Monotonic core timestamp in PCR units (27 MHz).
    fn now_pcr(&self) -> u64 {
        (self.start_time.elapsed().as_nanos() * 27 / 1_000) as u64
    }

    /// Synchronously load the initial window before the threads start.
    ///
    /// Fills up to `initial_input_packets` slots (default: half the ring)
    /// from slot 0, seeds the bitrate estimate, and returns the number of
    /// packets loaded.
    pub fn preload(&mut self) -> usize {
        let ring_size = self.ledger.ring_size();
        let init = if self.options.initial_input_packets == 0 {
            ring_size / 2
        } else {
            self.options.initial_input_packets.min(ring_size)
        };
        let loaded = self.receive_and_stuff(0, init);
        debug!(packets = loaded, "initial buffer load");

        let bitrate = self.source.current(self.cell.plugin.bitrate());
        if bitrate > 0 {
            self.current_bitrate = bitrate;
            self.cell.context.session().publish_bitrate(bitrate);
            self.report().verbose(&format!("initial input bitrate is {bitrate} b/s"));
        } else {
            self.report().verbose("unknown initial input bitrate");
        }
        loaded
    }

    /// The bitrate propagated with the preloaded packets.
    pub fn initial_bitrate(&self) -> u64 {
        self.current_bitrate
    }

    /// Stop the plugin during a failed startup, before any thread ran.
    pub fn stop_now(&mut self) {
        let report = self.report();
        self.cell.stop_plugin(&report);
    }

    /// Fill `max` slots with null packets, marked as input stuffing.
    fn fill_nulls(&mut self, first: usize, max: usize) -> usize {
        let ring = self.ring;
        // SAFETY: [first, first + max) is inside this stage's window.
        let (packets, metadata) = unsafe { ring.window(first, max) };
        for (pkt, meta) in packets.iter_mut().zip(metadata.iter_mut()) {
            *pkt = TsPacket::null();
            meta.reset();
            meta.set_input_stuffing(true);
            self.source.feed(pkt);
        }
        self.total_packets += max as u64;
        max
    }

    /// Call the plugin once and validate what it produced.
    fn receive_and_validate(&mut self, first: usize, max: usize) -> usize {
        if self.sync_lost || max == 0 {
            return 0;
        }

        let ring = self.ring;
        // SAFETY: [first, first + max) is inside this stage's window.
        let (packets, metadata) = unsafe { ring.window(first, max) };
        for meta in metadata.iter_mut() {
            meta.reset();
        }

        let before = Instant::now();
        let mut count = match self.cell.plugin.receive(packets, metadata) {
            Ok(count) => count.min(max),
            Err(e) => {
                self.report().error(&format!("input error: {e}"));
                0
            }
        };
        if count == 0 {
            self.plugin_completed = true;
        }
        if let Some(timeout) = self.options.receive_timeout {
            if before.elapsed() > timeout {
                self.report().error("receive timeout, aborting input");
                if !self.cell.plugin.abort_receive() {
                    self.report()
                        .warning("input plugin does not support receive abort");
                }
                self.receive_timed_out = true;
            }
        }

        // Stamp the whole batch from the core clock when the plugin did
        // not. Only the first packet is probed: plugins stamp all or none.
        if count > 0 && !metadata[0].has_input_time() {
            let now = self.now_pcr();
            for meta in metadata[..count].iter_mut() {
                meta.set_input_time(now, TimeSource::Core);
            }
        }

        // Validate the sync byte on every returned packet.
        for n in 0..count {
            if packets[n].has_valid_sync() {
                self.plugin_packets += 1;
                self.source.feed(&packets[n]);
            } else {
                self.report().error(&format!(
                    "synchronization lost after {} packets, got 0x{:02X} instead of 0x47",
                    self.plugin_packets,
                    packets[n].bytes()[0]
                ));
                count = n;
                self.sync_lost = true;
                self.plugin_completed = true;
                break;
            }
        }

        self.total_packets += count as u64;
        count
    }

    /// Receive packets with start and interleaved stuffing applied.
    fn receive_and_stuff(&mut self, mut first: usize, max: usize) -> usize {
        let mut done = 0;
        let mut remain = max;

        // Initial stuffing, before anything from the plugin.
        if self.instuff_start_remain > 0 && remain > 0 {
            let n = self.fill_nulls(first, self.instuff_start_remain.min(remain));
            self.instuff_start_remain -= n;
            first += n;
            remain -= n;
            done += n;
        }

        if self.options.instuff_inpkt == 0 {
            if remain > 0 {
                done += self.receive_and_validate(first, remain);
            }
            return done;
        }

        // Alternate groups of null packets and plugin packets, carrying
        // the group remainders across calls.
        while remain > 0 {
            let n = self.fill_nulls(first, self.instuff_nullpkt_remain.min(remain));
            self.instuff_nullpkt_remain -= n;
            first += n;
            remain -= n;
            done += n;
            if remain == 0 {
                break;
            }

            if self.instuff_nullpkt_remain == 0 && self.instuff_inpkt_remain == 0 {
                self.instuff_inpkt_remain = self.options.instuff_inpkt;
            }

            let wanted = remain.min(self.instuff_inpkt_remain);
            let got = self.receive_and_validate(first, wanted);
            first += got;
            remain -= got;
            done += got;
            self.instuff_inpkt_remain -= got;

            if self.instuff_nullpkt_remain == 0 && self.instuff_inpkt_remain == 0 {
                self.instuff_nullpkt_remain = self.options.instuff_nullpkt;
            }

            // The plugin returned less than asked: stop for this batch.
            if got < wanted {
                break;
            }
        }
        done
    }

    /// Release packets downstream, honoring the final-wait policy at end
    /// of input.
    fn pass_input_packets(&mut self, mut count: usize, input_end: bool) {
        if input_end && self.options.final_wait != FinalWait::NoWait {
            if count > 0 {
                self.ledger
                    .release(0, count, self.current_bitrate, false, false, false);
                count = 0;
            }
            debug!("final wait after end of input");
            let deadline = match self.options.final_wait {
                FinalWait::Timeout(d) => Some(Instant::now() + d),
                _ => None,
            };
            loop {
                if self.ledger.stop_requested() || self.cell.context.aborting() {
                    break;
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        break;
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
        // The "previous" stage is the output one: never propagate abort.
        self.ledger
            .release(0, count, self.current_bitrate, input_end, false, false);
    }

    /// The thread body of the input stage.
    pub fn run(mut self) -> ExecutorOutcome {
        let report = self.report();
        report.debug("input thread started");

        let mut last_adjust = Instant::now();
        let mut bitrate_due_packets = INIT_BITRATE_PACKET_INTERVAL;
        let mut fatal: Option<String> = None;

        loop {
            // Wait for free slots; a full ring is a transient condition.
            let win = self.ledger.request_write_window(0, 1, None);

            if let Some(request) = self.ledger.take_restart(0) {
                if !self.cell.handle_restart(request, &report) {
                    fatal = Some("input plugin restart failed".to_string());
                    self.pass_input_packets(0, true);
                    break;
                }
            }

            // If the downstream gave up, our packets are useless. Do not
            // even append trailing stuffing. Whether this run counts as
            // an error is decided by the stage that originated the stop.
            if win.aborted {
                break;
            }

            if self.ledger.stop_requested() || self.cell.context.session().joint_complete() {
                self.plugin_completed = true;
            }

            let mut max = win.len;
            if self.options.max_input_packets > 0 {
                max = max.min(self.options.max_input_packets);
            }

            let mut read = 0;
            if !self.plugin_completed {
                read = self.receive_and_stuff(win.first, max);
            }

            if self.receive_timed_out {
                self.pass_input_packets(read, true);
                fatal = Some("receive timeout".to_string());
                break;
            }

            // Trailing stuffing after the plugin completed.
            if self.plugin_completed && self.instuff_stop_remain > 0 && read < max {
                let n = self.fill_nulls(win.first + read, self.instuff_stop_remain.min(max - read));
                read += n;
                self.instuff_stop_remain -= n;
            }

            let input_end = self.plugin_completed && self.instuff_stop_remain == 0;

            // Periodic bitrate adjustment: packet-counted while unknown,
            // time-based once known.
            if !self.source.is_fixed()
                && ((self.current_bitrate == 0 && self.plugin_packets >= bitrate_due_packets)
                    || last_adjust.elapsed() >= self.options.bitrate_adjust_interval)
            {
                if self.current_bitrate == 0 {
                    while bitrate_due_packets <= self.plugin_packets {
                        bitrate_due_packets += INIT_BITRATE_PACKET_INTERVAL;
                    }
                }
                last_adjust = Instant::now();
                let bitrate = self.source.current(self.cell.plugin.bitrate());
                if bitrate > 0 {
                    self.current_bitrate = bitrate;
                    self.cell.context.session().publish_bitrate(bitrate);
                    report.debug(&format!("input bitrate is {bitrate} b/s"));
                }
            }

            self.pass_input_packets(read, input_end);

            if input_end {
                break;
            }
        }

        report.debug("stopping the input plugin");
        self.cell.stop_plugin(&report);
        report.debug(&format!(
            "input thread {} after {} packets",
            if fatal.is_some() { "aborted" } else { "terminated" },
            self.total_packets
        ));

        ExecutorOutcome {
            stage: 0,
            name: self.options.input.name.clone(),
            fatal,
            packets: self.plugin_packets,
        }
    }
}
