use std::{
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard},
};

/// Destination of the diagnostic stream.
pub type Sink = Box<dyn Write + Send>;

pub fn stderr() -> Sink {
    Box::new(io::stderr())
}

/// Clonable in-memory sink, every clone sees the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink(Arc<Mutex<Vec<u8>>>);

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.0.lock() {
            Ok(guard) => guard,
            Err(err) => err.into_inner(),
        }
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer()).into_owned()
    }

    /// Returns and clears everything written so far.
    pub fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.buffer());
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
