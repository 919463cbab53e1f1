//! File input and output plugins.
//!
//! `file [path]` reads or writes raw 188-byte packets; `-` or no argument
//! selects the standard input/output stream.

use std::fs::File;
use std::io::{self, Read, Write};

use tsp_core::{PacketMetadata, TsPacket, TS_PACKET_SIZE};

use crate::api::{InputPlugin, OutputPlugin, Plugin};
use crate::context::PluginContext;
use crate::error::{PluginError, Result};

fn parse_path(plugin: &str, args: &[String]) -> Result<String> {
    let mut path: Option<&str> = None;
    for arg in args {
        if arg.starts_with("--") {
            return Err(PluginError::Options {
                plugin: plugin.to_string(),
                message: format!("unknown option '{arg}'"),
            });
        }
        if path.is_some() {
            return Err(PluginError::Options {
                plugin: plugin.to_string(),
                message: "at most one file name is allowed".to_string(),
            });
        }
        path = Some(arg);
    }
    Ok(path.unwrap_or("-").to_string())
}

/// Input plugin reading packets from a file or standard input.
pub struct FileInput {
    context: PluginContext,
    path: String,
    reader: Option<Box<dyn Read + Send>>,
}

/// Factory for the `file` input plugin.
pub fn new_input(context: PluginContext, args: &[String]) -> Result<Box<dyn InputPlugin>> {
    Ok(Box::new(FileInput {
        context,
        path: parse_path("file input", args)?,
        reader: None,
    }))
}

impl Plugin for FileInput {
    fn start(&mut self) -> Result<()> {
        self.reader = Some(if self.path == "-" {
            Box::new(io::stdin())
        } else {
            Box::new(File::open(&self.path)?)
        });
        self.context.report().verbose(&format!("reading from {}", self.path));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.reader = None;
        Ok(())
    }
}

impl InputPlugin for FileInput {
    fn receive(&mut self, packets: &mut [TsPacket], _metadata: &mut [PacketMetadata]) -> Result<usize> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(0);
        };
        let mut count = 0;
        for packet in packets.iter_mut() {
            let buf = packet.bytes_mut();
            let mut filled = 0;
            while filled < TS_PACKET_SIZE {
                let n = reader.read(&mut buf[filled..])?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            if filled < TS_PACKET_SIZE {
                self.context
                    .report()
                    .warning(&format!("truncated trailing packet of {filled} bytes ignored"));
                break;
            }
            count += 1;
        }
        Ok(count)
    }
}

/// Output plugin writing packets to a file or standard output.
pub struct FileOutput {
    context: PluginContext,
    path: String,
    writer: Option<Box<dyn Write + Send>>,
}

/// Factory for the `file` output plugin.
pub fn new_output(context: PluginContext, args: &[String]) -> Result<Box<dyn OutputPlugin>> {
    Ok(Box::new(FileOutput {
        context,
        path: parse_path("file output", args)?,
        writer: None,
    }))
}

impl Plugin for FileOutput {
    fn start(&mut self) -> Result<()> {
        self.writer = Some(if self.path == "-" {
            Box::new(io::stdout())
        } else {
            Box::new(File::create(&self.path)?)
        });
        self.context.report().verbose(&format!("writing to {}", self.path));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        self.writer = None;
        Ok(())
    }
}

impl OutputPlugin for FileOutput {
    fn send(&mut self, packets: &[TsPacket], _metadata: &[PacketMetadata]) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(PluginError::Runtime {
                plugin: "file output".to_string(),
                message: "send before start".to_string(),
            });
        };
        for packet in packets {
            writer.write_all(packet.bytes())?;
        }
        Ok(())
    }
}
