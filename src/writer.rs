use std::io::{self, Write};

/// Output sink that guarantees a final flush via `finish`.
pub struct OutputWriter<W: Write>(W);

impl<W: Write> OutputWriter<W> {
    pub fn new(writer: W) -> Self {
        OutputWriter(writer)
    }

    pub fn finish(mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> Write for OutputWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}
