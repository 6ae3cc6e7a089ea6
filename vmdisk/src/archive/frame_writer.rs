//! Zstd writer that caps the input carried by each frame.
//!
//! A regular streaming encoder emits one frame for the whole stream, so a
//! reader has to decompress from the start to reach any offset. Closing a
//! frame every [`MAX_FRAME_INPUT`] bytes bounds the work needed to serve
//! a random read to one frame.

use std::io::{self, Write};

use vmdisk_shared::constants::seekable::MAX_FRAME_INPUT;
use zstd::bulk::Compressor;

/// Buffers input and emits one independent zstd frame per full block.
pub struct FrameWriter<W: Write> {
    compressor: Compressor<'static>,
    pending: Vec<u8>,
    inner: W,
    frames: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W, level: i32) -> io::Result<Self> {
        Ok(Self {
            compressor: Compressor::new(level)?,
            pending: Vec::with_capacity(MAX_FRAME_INPUT),
            inner,
            frames: 0,
        })
    }

    /// Feed uncompressed bytes.
    pub fn write_input(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let room = MAX_FRAME_INPUT - self.pending.len();
            let take = room.min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];

            if self.pending.len() == MAX_FRAME_INPUT {
                self.emit_frame()?;
            }
        }
        Ok(())
    }

    /// Number of frames written so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Flush the last partial frame and hand back the inner writer.
    ///
    /// Empty input still produces one empty frame so the output starts
    /// with the zstd frame magic.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.pending.is_empty() || self.frames == 0 {
            self.emit_frame()?;
        }
        self.inner.flush()?;
        Ok(self.inner)
    }

    fn emit_frame(&mut self) -> io::Result<()> {
        let frame = self.compressor.compress(&self.pending)?;
        self.inner.write_all(&frame)?;
        self.pending.clear();
        self.frames += 1;
        tracing::trace!(frame = self.frames, bytes = frame.len(), "Wrote zstd frame");
        Ok(())
    }
}
