//! Core types for the TSP transport stream processor.
//!
//! This crate provides the data model shared by the whole toolchain:
//!
//! - [`TsPacket`] - a 188-byte MPEG transport stream packet with the
//!   accessors needed by the processing chain (PID, PCR, DTS, drop marker);
//! - [`PacketMetadata`] and [`LabelSet`] - the per-packet sidecar record
//!   carried through the chain alongside each packet;
//! - [`PacketRing`] - the resident (page-locked) circular buffer holding
//!   the packet and metadata arrays;
//! - [`PcrAnalyzer`] / [`DtsAnalyzer`] - bitrate estimation from timing
//!   fields when no authoritative bitrate is available.
//!
//! Synchronization is deliberately absent here: slot ownership and window
//! accounting belong to the pipeline layer.

mod analyzer;
mod error;
mod metadata;
mod packet;
mod ring;

pub use analyzer::{DtsAnalyzer, PcrAnalyzer};
pub use error::{CoreError, Result};
pub use metadata::{LabelSet, PacketMetadata, TimeSource, INVALID_TIME, MAX_LABEL};
pub use packet::{
    Pcr, TsPacket, PID_MAX, PID_NULL, PID_PAT, SYNC_BYTE, TS_PACKET_SIZE,
};
pub use ring::{PacketRing, RingView};
