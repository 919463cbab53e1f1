//! Per-packet metadata carried through the processing chain.
//!
//! One [`PacketMetadata`] record travels with each packet slot in a
//! parallel array of the resident buffer. The record is a plain
//! `#[repr(C)]` value so the array can live inside the same page-locked
//! mapping as the packets themselves.

/// Highest usable packet label.
pub const MAX_LABEL: usize = 31;

/// Sentinel for "no input timestamp".
pub const INVALID_TIME: u64 = u64::MAX;

/// A set of packet labels in 0..=31.
///
/// Labels are attached by plugins and preserved across stages until the
/// packet leaves the buffer; filters can be conditioned on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct LabelSet(u32);

impl LabelSet {
    /// The empty set.
    pub const EMPTY: LabelSet = LabelSet(0);

    /// Build a set from a raw 32-bit mask.
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The raw 32-bit mask.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Build a set holding a single label. Labels above 31 are ignored.
    pub fn single(label: usize) -> Self {
        if label > MAX_LABEL {
            Self(0)
        } else {
            Self(1 << label)
        }
    }

    /// Check if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Check if a label is in the set.
    pub fn contains(&self, label: usize) -> bool {
        label <= MAX_LABEL && (self.0 & (1 << label)) != 0
    }

    /// Check if any label of `other` is in the set.
    pub fn intersects(&self, other: LabelSet) -> bool {
        (self.0 & other.0) != 0
    }

    /// Add a label to the set.
    pub fn insert(&mut self, label: usize) {
        if label <= MAX_LABEL {
            self.0 |= 1 << label;
        }
    }

    /// Remove a label from the set.
    pub fn remove(&mut self, label: usize) {
        if label <= MAX_LABEL {
            self.0 &= !(1 << label);
        }
    }

    /// Add all labels of `other`.
    pub fn union_with(&mut self, other: LabelSet) {
        self.0 |= other.0;
    }

    /// Remove all labels.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// Origin of a packet's input timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TimeSource {
    /// No timestamp was assigned.
    #[default]
    None = 0,
    /// The input plugin provided the timestamp.
    Plugin = 1,
    /// The core stamped the packet from its monotonic clock.
    Core = 2,
}

const FLAG_INPUT_STUFFING: u8 = 0x01;
const FLAG_FLUSH: u8 = 0x02;
const FLAG_BITRATE_CHANGED: u8 = 0x04;
const FLAG_NULLIFIED: u8 = 0x08;

/// Metadata record attached to one packet slot.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct PacketMetadata {
    input_time: u64,
    labels: LabelSet,
    flags: u8,
    time_source: TimeSource,
}

impl Default for PacketMetadata {
    fn default() -> Self {
        Self {
            input_time: INVALID_TIME,
            labels: LabelSet::EMPTY,
            flags: 0,
            time_source: TimeSource::None,
        }
    }
}

impl PacketMetadata {
    /// Return the record to its initial empty state.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// The input timestamp in PCR units (27 MHz), if one was assigned.
    pub fn input_time(&self) -> Option<u64> {
        (self.input_time != INVALID_TIME).then_some(self.input_time)
    }

    /// Check if the packet has an input timestamp.
    pub fn has_input_time(&self) -> bool {
        self.input_time != INVALID_TIME
    }

    /// Assign the input timestamp and its origin.
    pub fn set_input_time(&mut self, time: u64, source: TimeSource) {
        self.input_time = time;
        self.time_source = source;
    }

    /// Origin of the input timestamp.
    pub fn time_source(&self) -> TimeSource {
        self.time_source
    }

    /// The packet's label set.
    pub fn labels(&self) -> LabelSet {
        self.labels
    }

    /// Mutable access to the packet's label set.
    pub fn labels_mut(&mut self) -> &mut LabelSet {
        &mut self.labels
    }

    /// Check if the packet was inserted by the core as input stuffing.
    pub fn input_stuffing(&self) -> bool {
        self.flags & FLAG_INPUT_STUFFING != 0
    }

    /// Mark the packet as synthetic input stuffing.
    pub fn set_input_stuffing(&mut self, on: bool) {
        self.set_flag(FLAG_INPUT_STUFFING, on);
    }

    /// Check if the plugin asked for an early flush at this packet.
    pub fn flush(&self) -> bool {
        self.flags & FLAG_FLUSH != 0
    }

    /// Request that buffered packets be passed downstream as soon as
    /// possible, even below the batch threshold.
    pub fn set_flush(&mut self, on: bool) {
        self.set_flag(FLAG_FLUSH, on);
    }

    /// Check if the plugin declared a bitrate change at this packet.
    pub fn bitrate_changed(&self) -> bool {
        self.flags & FLAG_BITRATE_CHANGED != 0
    }

    /// Signal that the stream bitrate changed and should be re-queried.
    pub fn set_bitrate_changed(&mut self, on: bool) {
        self.set_flag(FLAG_BITRATE_CHANGED, on);
    }

    /// Check if a plugin turned this packet into a null packet.
    pub fn nullified(&self) -> bool {
        self.flags & FLAG_NULLIFIED != 0
    }

    /// Record that a plugin turned this packet into a null packet.
    pub fn set_nullified(&mut self, on: bool) {
        self.set_flag(FLAG_NULLIFIED, on);
    }

    fn set_flag(&mut self, flag: u8, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}
