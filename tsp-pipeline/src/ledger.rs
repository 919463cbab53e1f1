//! Window ledger: per-stage sliding-window accounting over the ring.
//!
//! Every slot of the ring belongs to exactly one stage at any instant.
//! A stage's window is `(first, count)` in modular indexing; releasing
//! `n` slots advances the window and appends the slots to the successor's
//! tail. All accounting runs under one global mutex - each operation only
//! touches a few integers - with one condition variable per stage to
//! avoid thundering herds.
//!
//! Invariants (checked in debug builds on every release):
//! - the sum of all `count` equals the ring size;
//! - for consecutive stages, `first + count ≡ next.first (mod ring)`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// Kind of a stage, by position in the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Input,
    Processor,
    Output,
}

/// Which terminal flag to propagate from a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationKind {
    /// No more packets will follow: set on the successor.
    EndOfInput,
    /// The stage failed: set on itself, waking the predecessor.
    Abort,
}

/// A contiguous run of slots returned to an executor.
#[derive(Debug, Clone, Copy, Default)]
pub struct Window {
    /// Index of the first slot.
    pub first: usize,
    /// Contiguous length; never spans the modular wrap point.
    pub len: usize,
    /// Total slots in the stage's window, including any wrapped part.
    pub available: usize,
    /// Bitrate propagated by the predecessor, b/s (0 = unknown).
    pub bitrate: u64,
    /// These are the last packets: nothing follows once drained.
    pub input_end: bool,
    /// End of input reached the stage, even if a wrapped remainder of
    /// its window is still pending.
    pub ending: bool,
    /// The successor gave up; the caller should stop producing.
    pub aborted: bool,
    /// The wait timed out before any work arrived.
    pub timeout: bool,
    /// The stage is suspended by the control channel.
    pub suspended: bool,
}

/// A pending plugin restart, picked up by the stage's executor.
pub struct RestartRequest {
    /// New plugin arguments, or `None` to restart with the current ones.
    pub args: Option<Vec<String>>,
    completion: std::sync::Arc<RestartCompletion>,
}

impl RestartRequest {
    /// Report the restart outcome back to the requesting thread.
    pub fn complete(self, result: std::result::Result<(), String>) {
        let mut slot = self.completion.state.lock();
        *slot = Some(result);
        self.completion.cv.notify_all();
    }
}

/// Completion rendezvous for a restart request.
pub struct RestartCompletion {
    state: Mutex<Option<std::result::Result<(), String>>>,
    cv: Condvar,
}

impl RestartCompletion {
    /// Wait for the executor to perform the restart.
    pub fn wait(&self, timeout: Duration) -> Option<std::result::Result<(), String>> {
        let mut slot = self.state.lock();
        if slot.is_none() {
            self.cv.wait_for(&mut slot, timeout);
        }
        slot.take()
    }
}

struct StageState {
    first: usize,
    count: usize,
    input_end: bool,
    aborted: bool,
    suspended: bool,
    bitrate: u64,
    restart: Option<RestartRequest>,
}

/// Snapshot of one stage for the control channel.
#[derive(Debug, Clone)]
pub struct StageSnapshot {
    pub kind: StageKind,
    pub window: usize,
    pub suspended: bool,
    pub aborted: bool,
}

/// The window accounting shared by all stages of one chain.
pub struct WindowLedger {
    ring_size: usize,
    kinds: Vec<StageKind>,
    stages: Mutex<Vec<StageState>>,
    to_do: Vec<Condvar>,
    stop_requested: AtomicBool,
}

impl WindowLedger {
    /// Create the ledger for `kinds.len()` stages over `ring_size` slots.
    /// The input stage initially owns the whole ring.
    pub fn new(ring_size: usize, kinds: Vec<StageKind>) -> Self {
        assert!(kinds.len() >= 2, "a chain needs at least input and output");
        assert_eq!(kinds[0], StageKind::Input);
        assert_eq!(*kinds.last().unwrap(), StageKind::Output);
        let stages = kinds
            .iter()
            .enumerate()
            .map(|(i, _)| StageState {
                first: 0,
                count: if i == 0 { ring_size } else { 0 },
                input_end: false,
                aborted: false,
                suspended: false,
                bitrate: 0,
                restart: None,
            })
            .collect();
        let to_do = kinds.iter().map(|_| Condvar::new()).collect();
        Self {
            ring_size,
            kinds,
            stages: Mutex::new(stages),
            to_do,
            stop_requested: AtomicBool::new(false),
        }
    }

    /// Number of stages in the chain.
    pub fn stage_count(&self) -> usize {
        self.kinds.len()
    }

    /// Number of slots in the ring.
    pub fn ring_size(&self) -> usize {
        self.ring_size
    }

    /// Kind of a stage.
    pub fn kind(&self, stage: usize) -> StageKind {
        self.kinds[stage]
    }

    fn next(&self, stage: usize) -> usize {
        (stage + 1) % self.kinds.len()
    }

    fn prev(&self, stage: usize) -> usize {
        (stage + self.kinds.len() - 1) % self.kinds.len()
    }

    /// Set a stage's window and propagated bitrate before the executor
    /// threads start. Used by the supervisor after the initial preload.
    pub fn init_stage(&self, stage: usize, first: usize, count: usize, bitrate: u64) {
        let mut stages = self.stages.lock();
        stages[stage].first = first % self.ring_size;
        stages[stage].count = count;
        stages[stage].bitrate = bitrate;
    }

    /// Wait until the stage owns at least `min` slots, then return the
    /// contiguous prefix of its window.
    ///
    /// Returns early (possibly with an empty window) on end of input, on
    /// abort of the successor, on a pending restart, or on `timeout`.
    /// `min` is clamped to the ring size.
    pub fn request_read_window(&self, stage: usize, min: usize, timeout: Option<Duration>) -> Window {
        let min = min.clamp(1, self.ring_size);
        let next = self.next(stage);
        let mut stages = self.stages.lock();

        let mut timed_out = false;
        while stages[stage].count < min
            && !stages[stage].input_end
            && !stages[next].aborted
            && stages[stage].restart.is_none()
            && !timed_out
        {
            match timeout {
                Some(t) => {
                    timed_out = self.to_do[stage].wait_for(&mut stages, t).timed_out();
                }
                None => self.to_do[stage].wait(&mut stages),
            }
        }

        let s = &stages[stage];
        let len = if timed_out {
            0
        } else {
            s.count.min(self.ring_size - s.first)
        };
        Window {
            first: s.first,
            len,
            available: s.count,
            bitrate: s.bitrate,
            // Only the final contiguous run carries end-of-input.
            input_end: s.input_end && len == s.count,
            ending: s.input_end,
            aborted: self.kinds[stage] != StageKind::Output && stages[next].aborted,
            timeout: timed_out,
            suspended: s.suspended,
        }
    }

    /// Input-stage variant of [`request_read_window`]: claim free slots
    /// to write fresh packets into.
    ///
    /// [`request_read_window`]: WindowLedger::request_read_window
    pub fn request_write_window(&self, stage: usize, min: usize, timeout: Option<Duration>) -> Window {
        debug_assert_eq!(self.kinds[stage], StageKind::Input);
        self.request_read_window(stage, min, timeout)
    }

    /// Release the first `n` slots of the stage's window to the
    /// successor, propagating the bitrate and terminal flags.
    ///
    /// The successor is woken when slots were transferred, on end of
    /// input, or when `flush` asks for it. An abort - the caller's or one
    /// observed on the successor - marks this stage aborted and wakes the
    /// predecessor. Returns false when the caller should stop.
    pub fn release(
        &self,
        stage: usize,
        n: usize,
        bitrate: u64,
        input_end: bool,
        aborted: bool,
        flush: bool,
    ) -> bool {
        let next = self.next(stage);
        let prev = self.prev(stage);
        let mut stages = self.stages.lock();

        assert!(n <= stages[stage].count, "releasing more slots than owned");
        stages[stage].first = (stages[stage].first + n) % self.ring_size;
        stages[stage].count -= n;
        stages[next].count += n;
        stages[next].bitrate = bitrate;
        stages[next].input_end |= input_end;

        if n > 0 || input_end || flush {
            self.to_do[next].notify_all();
        }

        // Reflect the successor's abort back, except from output to
        // input: no packets flow across that edge.
        let mut aborted = aborted;
        if self.kinds[stage] != StageKind::Output {
            aborted = aborted || stages[next].aborted;
        }
        if aborted {
            stages[stage].aborted = true;
            self.to_do[prev].notify_all();
        }

        #[cfg(debug_assertions)]
        self.check_invariants(&stages);

        !input_end && !aborted
    }

    /// Propagate a terminal flag from a stage without moving slots.
    pub fn propagate_termination(&self, stage: usize, kind: TerminationKind) {
        let mut stages = self.stages.lock();
        match kind {
            TerminationKind::EndOfInput => {
                let next = self.next(stage);
                stages[next].input_end = true;
                self.to_do[next].notify_all();
            }
            TerminationKind::Abort => {
                let prev = self.prev(stage);
                stages[stage].aborted = true;
                self.to_do[prev].notify_all();
            }
        }
    }

    /// Ask the chain to stop after the packets currently in flight.
    /// The input executor treats this as end of stream.
    pub fn request_stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        let stages = self.stages.lock();
        for cv in &self.to_do {
            cv.notify_all();
        }
        drop(stages);
    }

    /// Check if an orderly stop was requested.
    pub fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Suspend or resume a processor stage.
    pub fn set_suspended(&self, stage: usize, on: bool) -> std::result::Result<(), String> {
        if stage >= self.kinds.len() {
            return Err(format!("no stage {stage}"));
        }
        if self.kinds[stage] != StageKind::Processor {
            return Err(format!("stage {stage} is not a processor"));
        }
        let mut stages = self.stages.lock();
        stages[stage].suspended = on;
        Ok(())
    }

    /// Post a restart request for a stage's plugin and return the
    /// completion rendezvous.
    pub fn request_restart(&self, stage: usize, args: Option<Vec<String>>) -> std::sync::Arc<RestartCompletion> {
        let completion = std::sync::Arc::new(RestartCompletion {
            state: Mutex::new(None),
            cv: Condvar::new(),
        });
        let mut stages = self.stages.lock();
        if let Some(previous) = stages[stage].restart.take() {
            previous.complete(Err("superseded by a newer restart".to_string()));
        }
        stages[stage].restart = Some(RestartRequest {
            args,
            completion: std::sync::Arc::clone(&completion),
        });
        self.to_do[stage].notify_all();
        completion
    }

    /// Take the pending restart request for a stage, if any.
    pub fn take_restart(&self, stage: usize) -> Option<RestartRequest> {
        self.stages.lock()[stage].restart.take()
    }

    /// Per-stage state for the control channel.
    pub fn snapshot(&self) -> Vec<StageSnapshot> {
        let stages = self.stages.lock();
        stages
            .iter()
            .zip(&self.kinds)
            .map(|(s, kind)| StageSnapshot {
                kind: *kind,
                window: s.count,
                suspended: s.suspended,
                aborted: s.aborted,
            })
            .collect()
    }

    #[cfg(debug_assertions)]
    fn check_invariants(&self, stages: &[StageState]) {
        let total: usize = stages.iter().map(|s| s.count).sum();
        debug_assert_eq!(total, self.ring_size, "window partition broken");
        for i in 0..stages.len() {
            let next = (i + 1) % stages.len();
            debug_assert_eq!(
                (stages[i].first + stages[i].count) % self.ring_size,
                stages[next].first,
                "window contiguity broken between stages {i} and {next}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn three_stage_ledger(ring: usize) -> WindowLedger {
        WindowLedger::new(
            ring,
            vec![StageKind::Input, StageKind::Processor, StageKind::Output],
        )
    }

    #[test]
    fn test_input_owns_ring_initially() {
        let ledger = three_stage_ledger(100);
        let win = ledger.request_write_window(0, 1, None);
        assert_eq!(win.first, 0);
        assert_eq!(win.len, 100);
        assert_eq!(win.available, 100);
    }

    #[test]
    fn test_release_transfers_ownership() {
        let ledger = three_stage_ledger(100);
        assert!(ledger.release(0, 30, 5_000_000, false, false, false));

        let win = ledger.request_read_window(1, 1, None);
        assert_eq!(win.first, 0);
        assert_eq!(win.len, 30);
        assert_eq!(win.bitrate, 5_000_000);

        let win = ledger.request_write_window(0, 1, None);
        assert_eq!(win.first, 30);
        assert_eq!(win.len, 70);
    }

    #[test]
    fn test_window_clamped_at_wrap() {
        let ledger = three_stage_ledger(100);
        // Move the input window near the end of the ring.
        ledger.release(0, 90, 0, false, false, false);
        ledger.release(1, 90, 0, false, false, false);
        ledger.release(2, 90, 0, false, false, false);
        // Input owns 100 slots again, starting at 90: only 10 contiguous.
        let win = ledger.request_write_window(0, 1, None);
        assert_eq!(win.first, 90);
        assert_eq!(win.len, 10);
        assert_eq!(win.available, 100);
    }

    #[test]
    fn test_input_end_only_on_last_run() {
        let ledger = three_stage_ledger(100);
        ledger.release(0, 90, 0, false, false, false);
        ledger.release(1, 90, 0, false, false, false);
        ledger.release(2, 90, 0, false, false, false);
        // 15 packets land in stage 1 wrapping at slot 100.
        ledger.release(0, 15, 0, true, false, false);
        let win = ledger.request_read_window(1, 1, None);
        assert_eq!(win.len, 10);
        assert!(!win.input_end, "wrapped remainder still pending");
        ledger.release(1, 10, 0, false, false, false);
        let win = ledger.request_read_window(1, 1, None);
        assert_eq!(win.len, 5);
        assert!(win.input_end);
    }

    #[test]
    fn test_timeout_returns_empty() {
        let ledger = three_stage_ledger(100);
        let win = ledger.request_read_window(1, 1, Some(Duration::from_millis(10)));
        assert!(win.timeout);
        assert_eq!(win.len, 0);
    }

    #[test]
    fn test_abort_reflected_to_predecessor() {
        let ledger = three_stage_ledger(100);
        ledger.release(0, 10, 0, false, false, false);
        // Output aborts.
        ledger.propagate_termination(2, TerminationKind::Abort);
        // The processor sees the abort on its successor.
        let win = ledger.request_read_window(1, 1, None);
        assert!(win.aborted);
        // Releasing reflects the abort and reports "stop".
        assert!(!ledger.release(1, win.available, 0, false, false, false));
    }

    #[test]
    fn test_output_never_aborted_by_input() {
        let ledger = three_stage_ledger(100);
        ledger.propagate_termination(0, TerminationKind::Abort);
        ledger.release(0, 5, 0, false, false, false);
        ledger.release(1, 5, 0, false, false, false);
        let win = ledger.request_read_window(2, 1, None);
        assert!(!win.aborted, "output must drain regardless of input abort");
    }

    #[test]
    fn test_cross_thread_handoff() {
        let ledger = Arc::new(three_stage_ledger(1_000));
        let consumer = {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let mut seen = 0usize;
                loop {
                    let win = ledger.request_read_window(1, 1, None);
                    if win.len == 0 && win.input_end {
                        ledger.release(1, 0, 0, true, false, false);
                        break;
                    }
                    seen += win.len;
                    ledger.release(1, win.len, 0, win.input_end, false, false);
                    if win.input_end {
                        break;
                    }
                }
                seen
            })
        };

        let mut sent = 0usize;
        for batch in [400usize, 300, 250, 50] {
            let win = ledger.request_write_window(0, batch, None);
            let n = batch.min(win.len);
            sent += n;
            ledger.release(0, n, 0, sent == 1_000, false, false);
        }
        assert_eq!(consumer.join().unwrap(), 1_000);
    }

    #[test]
    fn test_restart_wakes_waiting_stage() {
        let ledger = Arc::new(three_stage_ledger(100));
        let waiter = {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let win = ledger.request_read_window(1, 1, None);
                assert_eq!(win.len, 0);
                let request = ledger.take_restart(1).expect("restart pending");
                assert!(request.args.is_none());
                request.complete(Ok(()));
            })
        };
        let completion = ledger.request_restart(1, None);
        assert_eq!(completion.wait(Duration::from_secs(5)), Some(Ok(())));
        waiter.join().unwrap();
    }

    #[test]
    fn test_suspend_only_processors() {
        let ledger = three_stage_ledger(100);
        assert!(ledger.set_suspended(1, true).is_ok());
        assert!(ledger.set_suspended(0, true).is_err());
        assert!(ledger.set_suspended(2, true).is_err());
        assert!(ledger.snapshot()[1].suspended);
    }
}
