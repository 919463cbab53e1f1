//! End-to-end chains through real files and test plugins.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use tsp_core::{
    LabelSet, PacketMetadata, TsPacket, PID_NULL, SYNC_BYTE, TS_PACKET_SIZE,
};
use tsp_pipeline::{PipelineError, PluginSpec, TsProcessor, TspOptions};
use tsp_plugin::{
    PacketStatus, Plugin, PluginContext, PluginRegistrar, PluginRegistry, ProcessorPlugin,
};

// ===== fixtures =====

fn packet_with_pid(pid: u16, seq: u8) -> TsPacket {
    let mut data = [0xFFu8; TS_PACKET_SIZE];
    data[0] = SYNC_BYTE;
    data[1] = (pid >> 8) as u8 & 0x1F;
    data[2] = (pid & 0xFF) as u8;
    data[3] = 0x10;
    data[4] = seq;
    TsPacket::from_bytes(data)
}

/// 33-bit PES timestamp encoding with marker bits.
fn encode_pes_time(prefix: u8, value: u64, data: &mut [u8]) {
    data[0] = (prefix << 4) | (((value >> 30) as u8 & 0x07) << 1) | 0x01;
    data[1] = (value >> 22) as u8;
    data[2] = (((value >> 15) as u8) << 1) | 0x01;
    data[3] = (value >> 7) as u8;
    data[4] = ((value as u8) << 1) | 0x01;
}

fn packet_with_dts(pid: u16, dts: u64) -> TsPacket {
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
    encode_pes_time(0x3, dts + 9_000, &mut data[13..18]);
    encode_pes_time(0x1, dts, &mut data[18..23]);
    TsPacket::from_bytes(data)
}

fn write_fixture(path: &Path, packets: &[TsPacket]) {
    let mut file = File::create(path).unwrap();
    for pkt in packets {
        file.write_all(pkt.bytes()).unwrap();
    }
}

fn read_packets(path: &Path) -> Vec<TsPacket> {
    let bytes = std::fs::read(path).unwrap();
    assert_eq!(bytes.len() % TS_PACKET_SIZE, 0, "output is not packet aligned");
    bytes
        .chunks(TS_PACKET_SIZE)
        .map(|c| {
            let mut data = [0u8; TS_PACKET_SIZE];
            data.copy_from_slice(c);
            TsPacket::from_bytes(data)
        })
        .collect()
}

fn file_chain(input: &Path, output: &Path) -> TspOptions {
    TspOptions {
        input: PluginSpec::with_args("file", [input.display().to_string()]),
        output: PluginSpec::with_args("file", [output.display().to_string()]),
        ..Default::default()
    }
}

// ===== test plugins =====

/// Opts into joint termination and declares completion after N packets.
struct JointAfter {
    context: PluginContext,
    remaining: u64,
}

fn joint_after_factory(
    context: PluginContext,
    args: &[String],
) -> tsp_plugin::Result<Box<dyn ProcessorPlugin>> {
    let remaining = args
        .first()
        .and_then(|a| a.parse().ok())
        .expect("jt needs a packet count");
    Ok(Box::new(JointAfter { context, remaining }))
}

impl Plugin for JointAfter {
    fn start(&mut self) -> tsp_plugin::Result<()> {
        self.context.use_joint_termination();
        Ok(())
    }
}

impl ProcessorPlugin for JointAfter {
    fn process(&mut self, _pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> PacketStatus {
        if self.remaining > 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                self.context.joint_terminate();
            }
        }
        PacketStatus::Ok
    }
}

/// Returns ABORT after passing N packets.
struct FailAfter {
    remaining: u64,
}

fn fail_after_factory(
    _context: PluginContext,
    args: &[String],
) -> tsp_plugin::Result<Box<dyn ProcessorPlugin>> {
    let remaining = args
        .first()
        .and_then(|a| a.parse().ok())
        .expect("fail needs a packet count");
    Ok(Box::new(FailAfter { remaining }))
}

impl Plugin for FailAfter {}

impl ProcessorPlugin for FailAfter {
    fn process(&mut self, _pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> PacketStatus {
        if self.remaining == 0 {
            return PacketStatus::Abort;
        }
        self.remaining -= 1;
        PacketStatus::Ok
    }
}

/// Stalls on the first presentation of its first packet, then passes.
struct StallOnce {
    stalled: bool,
}

fn stall_once_factory(
    _context: PluginContext,
    _args: &[String],
) -> tsp_plugin::Result<Box<dyn ProcessorPlugin>> {
    Ok(Box::new(StallOnce { stalled: false }))
}

impl Plugin for StallOnce {}

impl ProcessorPlugin for StallOnce {
    fn process(&mut self, _pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> PacketStatus {
        if !self.stalled {
            self.stalled = true;
            PacketStatus::Stall
        } else {
            PacketStatus::Ok
        }
    }
}

static PROBED_BITRATE: AtomicU64 = AtomicU64::new(0);

/// Records the declared bitrate it observes.
struct BitrateProbe {
    context: PluginContext,
}

fn bitrate_probe_factory(
    context: PluginContext,
    _args: &[String],
) -> tsp_plugin::Result<Box<dyn ProcessorPlugin>> {
    Ok(Box::new(BitrateProbe { context }))
}

impl Plugin for BitrateProbe {}

impl ProcessorPlugin for BitrateProbe {
    fn process(&mut self, _pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> PacketStatus {
        let bitrate = self.context.bitrate();
        if bitrate > 0 {
            PROBED_BITRATE.store(bitrate, Ordering::Relaxed);
        }
        PacketStatus::Ok
    }
}

/// Sets a label on every packet of a PID.
struct Tagger {
    pid: u16,
    label: usize,
}

fn tagger_factory(
    _context: PluginContext,
    args: &[String],
) -> tsp_plugin::Result<Box<dyn ProcessorPlugin>> {
    Ok(Box::new(Tagger {
        pid: u16::from_str_radix(args[0].trim_start_matches("0x"), 16).unwrap(),
        label: args[1].parse().unwrap(),
    }))
}

impl Plugin for Tagger {}

impl ProcessorPlugin for Tagger {
    fn process(&mut self, pkt: &mut TsPacket, meta: &mut PacketMetadata) -> PacketStatus {
        if pkt.pid() == self.pid {
            meta.labels_mut().insert(self.label);
        }
        PacketStatus::Ok
    }
}

/// Counts only the packets actually presented to it; restricted by
/// `only_label`.
static LABELED_SEEN: AtomicU64 = AtomicU64::new(0);

struct LabelCounter {
    only: LabelSet,
}

fn label_counter_factory(
    _context: PluginContext,
    args: &[String],
) -> tsp_plugin::Result<Box<dyn ProcessorPlugin>> {
    Ok(Box::new(LabelCounter {
        only: LabelSet::single(args[0].parse().unwrap()),
    }))
}

impl Plugin for LabelCounter {}

impl ProcessorPlugin for LabelCounter {
    fn process(&mut self, _pkt: &mut TsPacket, _meta: &mut PacketMetadata) -> PacketStatus {
        LABELED_SEEN.fetch_add(1, Ordering::Relaxed);
        PacketStatus::Ok
    }

    fn only_label(&self) -> LabelSet {
        self.only
    }
}

fn registry_with_test_plugins() -> PluginRegistry {
    let mut registry = PluginRegistry::with_builtins();
    registry.register_processor("jt", joint_after_factory);
    registry.register_processor("fail", fail_after_factory);
    registry.register_processor("stall-once", stall_once_factory);
    registry.register_processor("bitrate-probe", bitrate_probe_factory);
    registry.register_processor("tag", tagger_factory);
    registry.register_processor("count-labeled", label_counter_factory);
    registry
}

// ===== scenarios =====

#[test]
fn test_offline_copy_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000)
        .map(|i| packet_with_pid(if i % 2 == 0 { 0 } else { 0x100 }, (i % 251) as u8))
        .collect();
    write_fixture(&a, &fixture);

    let summary = TsProcessor::new(file_chain(&a, &b))
        .run(&mut registry_with_test_plugins())
        .unwrap();

    assert_eq!(summary.input_packets, 1_000);
    assert_eq!(summary.output_packets, 1_000);
    let out = std::fs::read(&b).unwrap();
    assert_eq!(out.len(), 188_000);
    assert_eq!(out, std::fs::read(&a).unwrap());
}

#[test]
fn test_input_stuffing_positions() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000).map(|i| packet_with_pid(0x200, (i % 251) as u8)).collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.instuff_nullpkt = 1;
    options.instuff_inpkt = 9;
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    let out = read_packets(&b);
    assert!(
        out.len() == 1_111 || out.len() == 1_112,
        "unexpected output length {}",
        out.len()
    );
    for pos in (9..out.len()).step_by(10) {
        assert!(out[pos].has_valid_sync(), "position {pos} lost sync");
        assert_eq!(out[pos].pid(), PID_NULL, "position {pos} is not stuffing");
    }
    // The original packets keep their relative order.
    let originals: Vec<&TsPacket> = out.iter().filter(|p| p.pid() == 0x200).collect();
    assert_eq!(originals.len(), 1_000);
    for (i, pkt) in originals.iter().enumerate() {
        assert_eq!(pkt.bytes()[4], (i % 251) as u8);
    }
}

#[test]
fn test_stuffing_then_null_drop_roundtrips() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000).map(|i| packet_with_pid(0x200, (i % 251) as u8)).collect();
    write_fixture(&a, &fixture);

    // Injected stuffing followed by a drop-all-nulls filter restores the
    // original stream exactly.
    let mut options = file_chain(&a, &b);
    options.instuff_nullpkt = 1;
    options.instuff_inpkt = 9;
    options.processors = vec![PluginSpec::with_args(
        "filter",
        ["--pid", "0x1FFF", "--drop"],
    )];
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    assert_eq!(std::fs::read(&b).unwrap(), std::fs::read(&a).unwrap());
}

#[test]
fn test_start_and_stop_stuffing() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..50).map(|i| packet_with_pid(0x300, i as u8)).collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.instuff_start = 3;
    options.instuff_stop = 2;
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    let out = read_packets(&b);
    assert_eq!(out.len(), 55);
    assert!(out[..3].iter().all(|p| p.pid() == PID_NULL));
    assert!(out[53..].iter().all(|p| p.pid() == PID_NULL));
    assert_eq!(out[3].pid(), 0x300);
    assert_eq!(out[52].pid(), 0x300);
}

#[test]
fn test_drop_filter_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    // 500 PID-0 and 500 PID-0x100, interleaved.
    let fixture: Vec<TsPacket> = (0..1_000)
        .map(|i| packet_with_pid(if i % 2 == 0 { 0 } else { 0x100 }, (i / 2 % 251) as u8))
        .collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.processors = vec![PluginSpec::with_args(
        "filter",
        ["--pid", "0x100", "--drop"],
    )];
    let summary = TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    let out = read_packets(&b);
    assert_eq!(out.len(), 500);
    assert_eq!(summary.output_packets, 500);
    for (i, pkt) in out.iter().enumerate() {
        assert_eq!(pkt.pid(), 0, "packet {i} has wrong PID");
        assert_eq!(pkt.bytes()[4], (i % 251) as u8, "packet {i} out of order");
    }
}

#[test]
fn test_joint_termination_waits_for_quorum() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000).map(|i| packet_with_pid(0x10, i as u8)).collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.processors = vec![
        PluginSpec::with_args("jt", ["100"]),
        PluginSpec::with_args("jt", ["250"]),
    ];
    let summary = TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    // The chain keeps passing packets until the second opt-in declares.
    assert_eq!(summary.output_packets, 250);
}

#[test]
fn test_joint_termination_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000).map(|i| packet_with_pid(0x10, i as u8)).collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.ignore_joint_termination = true;
    options.processors = vec![
        PluginSpec::with_args("jt", ["100"]),
        PluginSpec::with_args("jt", ["250"]),
    ];
    let summary = TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    // Both conditions are ignored: the chain runs to natural end.
    assert_eq!(summary.output_packets, 1_000);
}

#[test]
fn test_abort_propagates_and_fails() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000).map(|i| packet_with_pid(0x20, i as u8)).collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.processors = vec![PluginSpec::with_args("fail", ["300"])];
    let result = TsProcessor::new(options).run(&mut registry_with_test_plugins());

    match result {
        Err(PipelineError::Aborted { stage, ref name }) => {
            assert_eq!(stage, 1);
            assert_eq!(name, "fail");
        }
        other => panic!("expected abort, got {other:?}"),
    }
    // Exactly the packets passed before the abort reach the output.
    let out = read_packets(&b);
    assert_eq!(out.len(), 300);
}

#[test]
fn test_stall_preserves_stream() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..1_000).map(|i| packet_with_pid(0x30, (i % 251) as u8)).collect();
    write_fixture(&a, &fixture);

    let mut options = file_chain(&a, &b);
    options.processors = vec![PluginSpec::new("stall-once")];
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    // The stalled packet is re-presented, nothing lost or reordered.
    let out = read_packets(&b);
    assert_eq!(out.len(), 1_000);
    for (i, pkt) in out.iter().enumerate() {
        assert_eq!(pkt.bytes()[4], (i % 251) as u8, "packet {i} out of order");
    }
}

#[test]
fn test_dts_bitrate_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    // 500 packets, no PCR; every 10th carries a DTS, spaced for 2 Mb/s.
    let ticks_per_gap: u64 = 10 * 188 * 8 * 90_000 / 2_000_000;
    let fixture: Vec<TsPacket> = (0..500)
        .map(|i| {
            if i % 10 == 0 {
                packet_with_dts(0x100, (i as u64 / 10) * ticks_per_gap)
            } else {
                packet_with_pid(0x101, (i % 251) as u8)
            }
        })
        .collect();
    write_fixture(&a, &fixture);

    PROBED_BITRATE.store(0, Ordering::Relaxed);
    let mut options = file_chain(&a, &b);
    options.processors = vec![PluginSpec::new("bitrate-probe")];
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    let bitrate = PROBED_BITRATE.load(Ordering::Relaxed);
    assert!(bitrate > 0, "no bitrate was declared");
    let error = (bitrate as f64 - 2_000_000.0).abs() / 2_000_000.0;
    assert!(error < 0.02, "bitrate {bitrate} off by more than 2%");
}

#[test]
fn test_only_label_bypasses_plugin() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..600)
        .map(|i| packet_with_pid(if i % 3 == 0 { 0x40 } else { 0x41 }, i as u8))
        .collect();
    write_fixture(&a, &fixture);

    LABELED_SEEN.store(0, Ordering::Relaxed);
    let mut options = file_chain(&a, &b);
    options.processors = vec![
        PluginSpec::with_args("tag", ["0x40", "5"]),
        PluginSpec::with_args("count-labeled", ["5"]),
    ];
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    // Only the tagged third of the stream reaches the counter; the rest
    // flows through without a plugin invocation.
    assert_eq!(LABELED_SEEN.load(Ordering::Relaxed), 200);
    assert_eq!(read_packets(&b).len(), 600);
}

#[test]
fn test_fixed_bitrate_override() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.ts");
    let b = dir.path().join("b.ts");
    let fixture: Vec<TsPacket> = (0..200).map(|i| packet_with_pid(0x50, i as u8)).collect();
    write_fixture(&a, &fixture);

    PROBED_BITRATE.store(0, Ordering::Relaxed);
    let mut options = file_chain(&a, &b);
    options.fixed_bitrate = 12_345_678;
    options.processors = vec![PluginSpec::new("bitrate-probe")];
    TsProcessor::new(options)
        .run(&mut registry_with_test_plugins())
        .unwrap();

    assert_eq!(PROBED_BITRATE.load(Ordering::Relaxed), 12_345_678);
}
