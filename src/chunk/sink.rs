//! Random-access storage for chunks being reassembled

use async_trait::async_trait;
use std::io::{self, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeekExt, AsyncWriteExt};

use super::ChunkSessionInformation;

/// Reader over a fully reassembled payload
pub type AssembledData = Box<dyn AsyncRead + Send + Unpin>;

/// Storage a session writes its chunks into
#[async_trait]
pub trait TransferSink: Send {
    /// Write `data` starting at byte `offset`
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Close the sink for writing and read it back from the start.
    ///
    /// Backing storage is released once the returned reader is dropped.
    async fn finish(self: Box<Self>) -> io::Result<AssembledData>;
}

/// Sink backed by an anonymous temporary file
pub struct TempFileSink {
    file: File,
}

impl TempFileSink {
    pub fn create() -> io::Result<Self> {
        // The file is unlinked on creation and disappears with its last handle
        let file = tempfile::tempfile()?;
        Ok(Self {
            file: File::from_std(file),
        })
    }
}

#[async_trait]
impl TransferSink for TempFileSink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(data).await
    }

    async fn finish(self: Box<Self>) -> io::Result<AssembledData> {
        let mut file = self.file;
        file.flush().await?;
        file.seek(SeekFrom::Start(0)).await?;
        Ok(Box::new(file))
    }
}

/// Sink keeping the payload in memory
#[derive(Default)]
pub struct MemorySink {
    data: Vec<u8>,
}

#[async_trait]
impl TransferSink for MemorySink {
    async fn write_at(&mut self, offset: u64, data: &[u8]) -> io::Result<()> {
        let start = usize::try_from(offset)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        let end = start
            .checked_add(data.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "offset out of range"))?;
        if self.data.len() < end {
            self.data
                .try_reserve(end - self.data.len())
                .map_err(|e| io::Error::new(io::ErrorKind::OutOfMemory, e))?;
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> io::Result<AssembledData> {
        Ok(Box::new(io::Cursor::new(self.data)))
    }
}

/// Creates the sink of a new session
pub trait SinkFactory: Send + Sync {
    fn create(&self, info: &ChunkSessionInformation) -> io::Result<Box<dyn TransferSink>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TempFileSinkFactory;

impl SinkFactory for TempFileSinkFactory {
    fn create(&self, _info: &ChunkSessionInformation) -> io::Result<Box<dyn TransferSink>> {
        Ok(Box::new(TempFileSink::create()?))
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MemorySinkFactory;

impl SinkFactory for MemorySinkFactory {
    fn create(&self, _info: &ChunkSessionInformation) -> io::Result<Box<dyn TransferSink>> {
        Ok(Box::new(MemorySink::default()))
    }
}
