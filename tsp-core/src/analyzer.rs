//! Bitrate estimation from in-stream timing fields.
//!
//! When neither the command line nor the input plugin provides a bitrate,
//! the input stage estimates one from the slope of PCR values (27 MHz), or
//! from DTS values (90 kHz) when no PCR is observed. An estimate becomes
//! valid once at least one PID has accumulated [`MIN_SAMPLES`] timestamps.

use std::collections::HashMap;

use crate::packet::{TsPacket, TS_PACKET_SIZE};

/// Timestamps required on one PID before the estimate is trusted.
const MIN_SAMPLES: usize = 32;

#[derive(Debug, Clone, Copy)]
struct PidSlope {
    first_value: u64,
    first_packet: u64,
    last_value: u64,
    last_packet: u64,
    samples: usize,
}

/// Shared slope estimator: packets per timestamp unit, scaled by a clock
/// frequency into bits per second for 188-byte packets.
#[derive(Debug)]
struct SlopeAnalyzer {
    clock_hz: u64,
    packets: u64,
    pids: HashMap<u16, PidSlope>,
}

impl SlopeAnalyzer {
    fn new(clock_hz: u64) -> Self {
        Self {
            clock_hz,
            packets: 0,
            pids: HashMap::new(),
        }
    }

    fn reset(&mut self) {
        self.packets = 0;
        self.pids.clear();
    }

    fn count_packet(&mut self) {
        self.packets += 1;
    }

    fn feed_value(&mut self, pid: u16, value: u64) {
        let packet = self.packets;
        match self.pids.get_mut(&pid) {
            Some(slope) if value > slope.last_value => {
                slope.last_value = value;
                slope.last_packet = packet;
                slope.samples += 1;
            }
            Some(slope) => {
                // Backward or repeated timestamp: clock wrap or
                // discontinuity, restart this PID's slope.
                *slope = PidSlope {
                    first_value: value,
                    first_packet: packet,
                    last_value: value,
                    last_packet: packet,
                    samples: 1,
                };
            }
            None => {
                self.pids.insert(
                    pid,
                    PidSlope {
                        first_value: value,
                        first_packet: packet,
                        last_value: value,
                        last_packet: packet,
                        samples: 1,
                    },
                );
            }
        }
    }

    fn is_valid(&self) -> bool {
        self.pids.values().any(|s| s.samples >= MIN_SAMPLES)
    }

    fn bitrate_188(&self) -> Option<u64> {
        let mut total: u128 = 0;
        let mut contributors: u128 = 0;
        for slope in self.pids.values() {
            if slope.samples < MIN_SAMPLES || slope.last_value <= slope.first_value {
                continue;
            }
            let pkt_delta = (slope.last_packet - slope.first_packet) as u128;
            let value_delta = (slope.last_value - slope.first_value) as u128;
            total += pkt_delta * (TS_PACKET_SIZE as u128) * 8 * (self.clock_hz as u128) / value_delta;
            contributors += 1;
        }
        if contributors == 0 {
            None
        } else {
            Some((total / contributors) as u64)
        }
    }
}

/// Bitrate estimator over PCR fields (27 MHz clock).
#[derive(Debug)]
pub struct PcrAnalyzer {
    inner: SlopeAnalyzer,
}

impl PcrAnalyzer {
    pub fn new() -> Self {
        Self {
            inner: SlopeAnalyzer::new(27_000_000),
        }
    }

    /// Account for one packet, harvesting its PCR if it carries one.
    pub fn feed(&mut self, packet: &TsPacket) {
        self.inner.count_packet();
        if let Some(pcr) = packet.pcr() {
            self.inner.feed_value(packet.pid(), pcr);
        }
    }

    /// Check if enough PCRs were observed for a trustworthy estimate.
    pub fn bitrate_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// The estimated transport bitrate in bits/second, if valid.
    pub fn bitrate_188(&self) -> Option<u64> {
        self.inner.is_valid().then(|| self.inner.bitrate_188()).flatten()
    }

    /// Discard all accumulated state.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl Default for PcrAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// Bitrate estimator over DTS fields (90 kHz clock), used as a fallback
/// when the stream carries no PCR.
#[derive(Debug)]
pub struct DtsAnalyzer {
    inner: SlopeAnalyzer,
}

impl DtsAnalyzer {
    pub fn new() -> Self {
        Self {
            inner: SlopeAnalyzer::new(90_000),
        }
    }

    /// Account for one packet, harvesting its DTS if it starts a PES
    /// header carrying one.
    pub fn feed(&mut self, packet: &TsPacket) {
        self.inner.count_packet();
        if let Some(dts) = packet.dts() {
            self.inner.feed_value(packet.pid(), dts);
        }
    }

    /// Check if enough DTS were observed for a trustworthy estimate.
    pub fn bitrate_valid(&self) -> bool {
        self.inner.is_valid()
    }

    /// The estimated transport bitrate in bits/second, if valid.
    pub fn bitrate_188(&self) -> Option<u64> {
        self.inner.is_valid().then(|| self.inner.bitrate_188()).flatten()
    }

    /// Discard all accumulated state.
    pub fn reset(&mut self) {
        self.inner.reset();
    }
}

impl Default for DtsAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Pcr, SYNC_BYTE, TS_PACKET_SIZE};

    fn pcr_packet(pid: u16, pcr_27mhz: u64) -> TsPacket {
        let mut data = [0xFFu8; TS_PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = (pid >> 8) as u8 & 0x1F;
        data[2] = (pid & 0xFF) as u8;
        data[3] = 0x30;
        data[4] = 7;
        data[5] = 0x10;
        Pcr::from_27mhz(pcr_27mhz).write(&mut data[6..12]).unwrap();
        TsPacket::from_bytes(data)
    }

    fn plain_packet(pid: u16) -> TsPacket {
        let mut data = [0xFFu8; TS_PACKET_SIZE];
        data[0] = SYNC_BYTE;
        data[1] = (pid >> 8) as u8 & 0x1F;
        data[2] = (pid & 0xFF) as u8;
        data[3] = 0x10;
        TsPacket::from_bytes(data)
    }

    #[test]
    fn test_pcr_bitrate_slope() {
        // 10 packets between PCRs, PCR advancing by the time 10 packets
        // take at 1 Mb/s: 10 * 188 * 8 bits -> 15040 us -> 406_080 ticks.
        let mut analyzer = PcrAnalyzer::new();
        let ticks_per_gap: u64 = 10 * 188 * 8 * 27_000_000 / 1_000_000;
        for i in 0..50u64 {
            analyzer.feed(&pcr_packet(0x100, i * ticks_per_gap));
            for _ in 0..9 {
                analyzer.feed(&plain_packet(0x101));
            }
        }
        assert!(analyzer.bitrate_valid());
        let bitrate = analyzer.bitrate_188().unwrap();
        let error = (bitrate as i64 - 1_000_000i64).abs();
        assert!(error < 20_000, "bitrate {bitrate} too far from 1 Mb/s");
    }

    #[test]
    fn test_pcr_bitrate_needs_samples() {
        let mut analyzer = PcrAnalyzer::new();
        for i in 0..(MIN_SAMPLES as u64 - 1) {
            analyzer.feed(&pcr_packet(0x100, i * 300_000));
        }
        assert!(!analyzer.bitrate_valid());
        assert_eq!(analyzer.bitrate_188(), None);
    }

    #[test]
    fn test_pcr_wrap_restarts_slope() {
        let mut analyzer = PcrAnalyzer::new();
        for i in 0..40u64 {
            analyzer.feed(&pcr_packet(0x100, 1_000_000 + i * 10_000));
        }
        assert!(analyzer.bitrate_valid());
        // A backward PCR restarts the slope; validity is lost.
        analyzer.feed(&pcr_packet(0x100, 5));
        assert!(!analyzer.bitrate_valid());
    }

    #[test]
    fn test_dts_fallback_slope() {
        use crate::packet::encode_pes_time;

        fn dts_packet(pid: u16, dts_90khz: u64) -> TsPacket {
            let mut data = [0xFFu8; TS_PACKET_SIZE];
            data[0] = SYNC_BYTE;
            data[1] = 0x40 | ((pid >> 8) as u8 & 0x1F);
            data[2] = (pid & 0xFF) as u8;
            data[3] = 0x10;
            data[4] = 0x00;
            data[5] = 0x00;
            data[6] = 0x01;
            data[7] = 0xE0;
            data[8] = 0x00;
            data[9] = 0x00;
            data[10] = 0x80;
            data[11] = 0xC0;
            data[12] = 10;
            encode_pes_time(0x3, dts_90khz + 9_000, &mut data[13..18]);
            encode_pes_time(0x1, dts_90khz, &mut data[18..23]);
            TsPacket::from_bytes(data)
        }

        // 20 packets between DTS, spaced for 2 Mb/s.
        let mut analyzer = DtsAnalyzer::new();
        let ticks_per_gap: u64 = 20 * 188 * 8 * 90_000 / 2_000_000;
        for i in 0..40u64 {
            analyzer.feed(&dts_packet(0x100, i * ticks_per_gap));
            for _ in 0..19 {
                analyzer.feed(&plain_packet(0x101));
            }
        }
        assert!(analyzer.bitrate_valid());
        let bitrate = analyzer.bitrate_188().unwrap();
        let error = (bitrate as i64 - 2_000_000i64).abs();
        assert!(error < 40_000, "bitrate {bitrate} too far from 2 Mb/s");
    }
}
