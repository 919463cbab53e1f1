//! Bitrate source selection for the input stage.
//!
//! The declared bitrate comes from the first available source, in this
//! order: the command-line override, the input plugin, the PCR analyzer,
//! and the DTS analyzer as a last resort. Once DTS analysis has been used
//! it stays in use, so the estimate does not oscillate between clocks.

use tsp_core::{DtsAnalyzer, PcrAnalyzer, TsPacket};

/// Resolves the declared bitrate of the input stage.
pub struct BitrateSource {
    fixed: u64,
    instuff: Option<(u64, u64)>,
    pcr: PcrAnalyzer,
    dts: DtsAnalyzer,
    use_dts: bool,
}

impl BitrateSource {
    /// Create a source with an optional `--bitrate` override and the
    /// `--add-input-stuffing` ratio (nullpkt, inpkt) when active.
    pub fn new(fixed: u64, instuff: Option<(u64, u64)>) -> Self {
        Self {
            fixed,
            instuff: instuff.filter(|(_, inpkt)| *inpkt > 0),
            pcr: PcrAnalyzer::new(),
            dts: DtsAnalyzer::new(),
            use_dts: false,
        }
    }

    /// Account for one packet entering the ring (stuffing included).
    pub fn feed(&mut self, packet: &TsPacket) {
        self.pcr.feed(packet);
        self.dts.feed(packet);
    }

    /// Whether the bitrate is fixed by the command line.
    pub fn is_fixed(&self) -> bool {
        self.fixed > 0
    }

    /// Resolve the current bitrate, in b/s; 0 means still unknown.
    ///
    /// `plugin_bitrate` is the value reported by the input plugin, if
    /// any. Values from the override or the plugin are scaled up by the
    /// input-stuffing ratio, since the nulls inserted by the core inflate
    /// the stream the plugin knows nothing about.
    pub fn current(&mut self, plugin_bitrate: Option<u64>) -> u64 {
        if self.fixed > 0 {
            return self.stuffed(self.fixed);
        }
        if let Some(bitrate) = plugin_bitrate.filter(|b| *b > 0) {
            return self.stuffed(bitrate);
        }
        if !self.use_dts {
            if let Some(bitrate) = self.pcr.bitrate_188() {
                return bitrate;
            }
        }
        // No PCR yet: fall back to DTS and stick with it afterwards.
        self.use_dts = self.use_dts || self.dts.bitrate_valid();
        if self.use_dts {
            self.dts.bitrate_188().unwrap_or(0)
        } else {
            0
        }
    }

    fn stuffed(&self, bitrate: u64) -> u64 {
        match self.instuff {
            Some((nullpkt, inpkt)) => bitrate * (nullpkt + inpkt) / inpkt,
            None => bitrate,
        }
    }
}
