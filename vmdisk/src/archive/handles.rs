//! Owned read/write archive handles with a fixed release order.

/// Pair of archive handles owned by one operation.
///
/// The read side is always released before the write side: writers may
/// sit on top of descriptors or shared state that the reader's teardown
/// must not outlive. The order holds for explicit release, for failure
/// paths and for drop.
pub struct ArchiveHandles<R, W> {
    reader: Option<R>,
    writer: Option<W>,
}

impl<R, W> ArchiveHandles<R, W> {
    pub fn new() -> Self {
        Self {
            reader: None,
            writer: None,
        }
    }

    pub fn set_reader(&mut self, reader: R) {
        self.reader = Some(reader);
    }

    pub fn set_writer(&mut self, writer: W) {
        self.writer = Some(writer);
    }

    pub fn writer_mut(&mut self) -> Option<&mut W> {
        self.writer.as_mut()
    }

    /// Both handles at once, for copy loops.
    pub fn both_mut(&mut self) -> Option<(&mut R, &mut W)> {
        match (self.reader.as_mut(), self.writer.as_mut()) {
            (Some(reader), Some(writer)) => Some((reader, writer)),
            _ => None,
        }
    }

    pub fn has_reader(&self) -> bool {
        self.reader.is_some()
    }

    /// Close the reader, keeping the writer open.
    pub fn close_reader(&mut self) {
        self.reader.take();
    }

    /// Hand the writer to the caller, which finishes it. The reader must
    /// already be closed.
    pub fn take_writer(&mut self) -> Option<W> {
        debug_assert!(self.reader.is_none(), "reader must be released first");
        self.writer.take()
    }

    /// Release everything (reader first).
    pub fn release(&mut self) {
        self.reader.take();
        self.writer.take();
    }
}

impl<R, W> Default for ArchiveHandles<R, W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R, W> Drop for ArchiveHandles<R, W> {
    fn drop(&mut self) {
        self.release();
    }
}
