//! Streaming archive extraction
//!
//! Extraction runs on a blocking worker and hands entries to the async side
//! through a bounded channel, so at most a handful of decompressed entries
//! are held in memory at once. The consumer sees an [`EntryStream`]:
//!
//! 1. exactly one [`ExtractEvent::Enumerated`] with the entry count,
//! 2. one [`ExtractEvent::Entry`] per file (directories are skipped),
//! 3. an [`ExtractEvent::Progress`] after every batch and once at the end.
//!
//! Dropping the stream stops the worker at its next entry.

mod sevenz;
mod zip;

use bytes::Bytes;
use std::fmt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::{IngestError, Result};

/// Entries buffered between the worker and the consumer.
const CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    SevenZip,
    Zip,
}

impl ArchiveFormat {
    pub const ALL: [Self; 2] = [Self::SevenZip, Self::Zip];

    pub const fn extension(self) -> &'static str {
        match self {
            Self::SevenZip => "7z",
            Self::Zip => "zip",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "7z" => Some(Self::SevenZip),
            "zip" => Some(Self::Zip),
            _ => None,
        }
    }

    /// Format of a named archive.
    ///
    /// Names with an extension are dispatched on it alone; an unknown
    /// extension is rejected. Names without any extension (bare cache
    /// names) are recognised by their signature.
    pub fn detect(name: &str, data: &[u8]) -> Result<Self> {
        let file_name = name.rsplit('/').next().unwrap_or(name);
        match file_name.rsplit_once('.') {
            Some((_, ext)) => Self::from_extension(ext),
            None => Self::from_signature(data),
        }
        .ok_or_else(|| IngestError::UnsupportedFormat {
            archive: name.to_string(),
        })
    }

    fn from_signature(data: &[u8]) -> Option<Self> {
        if data.starts_with(b"7z\xBC\xAF\x27\x1C") {
            Some(Self::SevenZip)
        } else if data.starts_with(b"PK\x03\x04") || data.starts_with(b"PK\x05\x06") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    /// Path inside the archive, as stored
    pub path: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractEvent {
    Enumerated { total: usize },
    Entry(ArchiveEntry),
    Progress { processed: usize, total: usize },
}

/// Lazy, finite, non-restartable sequence of extraction events.
#[derive(Debug)]
pub struct EntryStream {
    rx: mpsc::Receiver<Result<ExtractEvent>>,
    worker: Option<JoinHandle<()>>,
    archive: String,
}

impl EntryStream {
    /// Next event, `None` once the archive is exhausted.
    pub async fn next(&mut self) -> Option<Result<ExtractEvent>> {
        if let Some(event) = self.rx.recv().await {
            return Some(event);
        }

        // Channel closed: surface a worker panic instead of ending silently
        let worker = self.worker.take()?;
        match worker.await {
            Ok(()) => None,
            Err(e) => Some(Err(IngestError::extraction(&self.archive, e))),
        }
    }
}

/// Sender side handed to the format handlers.
pub(crate) struct EventSink {
    tx: mpsc::Sender<Result<ExtractEvent>>,
    batch_size: usize,
    processed: usize,
    total: usize,
}

impl EventSink {
    /// Returns false once the consumer is gone.
    pub(crate) fn enumerated(&mut self, total: usize) -> bool {
        self.total = total;
        self.tx
            .blocking_send(Ok(ExtractEvent::Enumerated { total }))
            .is_ok()
    }

    /// Returns false once the consumer is gone.
    pub(crate) fn entry(&mut self, path: String, data: Vec<u8>) -> bool {
        let entry = ArchiveEntry {
            path,
            data: Bytes::from(data),
        };
        if self.tx.blocking_send(Ok(ExtractEvent::Entry(entry))).is_err() {
            return false;
        }
        self.processed += 1;
        if self.processed % self.batch_size == 0 {
            return self.progress();
        }
        true
    }

    pub(crate) fn progress(&self) -> bool {
        self.tx
            .blocking_send(Ok(ExtractEvent::Progress {
                processed: self.processed,
                total: self.total,
            }))
            .is_ok()
    }

    pub(crate) fn fail(&self, error: IngestError) {
        // Nobody left to tell if the consumer is gone
        let _ = self.tx.blocking_send(Err(error));
    }

    pub(crate) fn finish(&self) {
        if self.processed % self.batch_size != 0 || self.processed == 0 {
            self.progress();
        }
    }
}

/// Start extracting `data` as `format`.
///
/// Must be called from within a tokio runtime.
pub fn extract(archive: &str, format: ArchiveFormat, data: Bytes, batch_size: usize) -> EntryStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let name = archive.to_string();
    let mut sink = EventSink {
        tx,
        batch_size: batch_size.max(1),
        processed: 0,
        total: 0,
    };

    debug!(archive = %name, %format, size = data.len(), "Starting extraction");
    let worker_name = name.clone();
    let worker = tokio::task::spawn_blocking(move || match format {
        ArchiveFormat::Zip => zip::extract_zip(&worker_name, data, &mut sink),
        ArchiveFormat::SevenZip => sevenz::extract_7z(&worker_name, data, &mut sink),
    });

    EntryStream {
        rx,
        worker: Some(worker),
        archive: name,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{build_7z, build_zip};
    use super::*;

    async fn collect(mut stream: EntryStream) -> Result<Vec<ExtractEvent>> {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event?);
        }
        Ok(events)
    }

    #[test]
    fn test_detect_format() {
        assert_eq!(
            ArchiveFormat::detect("hvsc-update-81.7z", b"").unwrap(),
            ArchiveFormat::SevenZip
        );
        assert_eq!(
            ArchiveFormat::detect("archives/HVSC_80-all-of-them.ZIP", b"").unwrap(),
            ArchiveFormat::Zip
        );
        assert!(matches!(
            ArchiveFormat::detect("hvsc-update-81.rar", b"PK\x03\x04"),
            Err(IngestError::UnsupportedFormat { .. })
        ));
        assert_eq!(
            ArchiveFormat::detect("hvsc-update-81", b"PK\x03\x04rest").unwrap(),
            ArchiveFormat::Zip
        );
        assert!(ArchiveFormat::detect("hvsc-update-81", b"junk").is_err());
    }

    #[tokio::test]
    async fn test_zip_event_sequence() {
        let data = build_zip(&[
            ("C64Music/", b""),
            ("C64Music/MUSICIANS/a.sid", b"a"),
            ("C64Music/MUSICIANS/b.sid", b"bb"),
            ("C64Music/MUSICIANS/c.sid", b"ccc"),
        ]);
        let events = collect(extract("t.zip", ArchiveFormat::Zip, Bytes::from(data), 2))
            .await
            .unwrap();

        assert_eq!(events[0], ExtractEvent::Enumerated { total: 3 });
        let entries: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExtractEvent::Entry(entry) => Some(entry.path.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(
            entries,
            vec![
                "C64Music/MUSICIANS/a.sid",
                "C64Music/MUSICIANS/b.sid",
                "C64Music/MUSICIANS/c.sid"
            ]
        );
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExtractEvent::Progress { processed, total } => Some((*processed, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(2, 3), (3, 3)]);
    }

    #[tokio::test]
    async fn test_7z_event_sequence() {
        let data = build_7z(&[
            ("C64Music/MUSICIANS/H/Hubbard_Rob/Commando.sid", b"PSID commando"),
            ("C64Music/DOCUMENTS/Songlengths.md5", b"[Database]\n"),
        ]);
        assert_eq!(
            ArchiveFormat::detect("hvsc-baseline-80", &data).unwrap(),
            ArchiveFormat::SevenZip
        );
        let events = collect(extract("t.7z", ArchiveFormat::SevenZip, Bytes::from(data), 1))
            .await
            .unwrap();

        assert_eq!(events[0], ExtractEvent::Enumerated { total: 2 });
        let mut entries: Vec<(String, Bytes)> = events
            .iter()
            .filter_map(|e| match e {
                ExtractEvent::Entry(entry) => Some((entry.path.clone(), entry.data.clone())),
                _ => None,
            })
            .collect();
        entries.sort();
        assert_eq!(
            entries,
            vec![
                (
                    "C64Music/DOCUMENTS/Songlengths.md5".to_string(),
                    Bytes::from_static(b"[Database]\n")
                ),
                (
                    "C64Music/MUSICIANS/H/Hubbard_Rob/Commando.sid".to_string(),
                    Bytes::from_static(b"PSID commando")
                ),
            ]
        );
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ExtractEvent::Progress { processed, total } => Some((*processed, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn test_corrupt_zip_fails() {
        let stream = extract(
            "bad.zip",
            ArchiveFormat::Zip,
            Bytes::from_static(b"definitely not a zip"),
            50,
        );
        let err = collect(stream).await.unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_7z_fails() {
        let stream = extract(
            "bad.7z",
            ArchiveFormat::SevenZip,
            Bytes::from_static(b"definitely not a 7z"),
            50,
        );
        let err = collect(stream).await.unwrap_err();
        assert!(matches!(err, IngestError::CorruptArchive { .. }));
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_worker() {
        let files: Vec<(String, Vec<u8>)> = (0..100)
            .map(|i| (format!("f{i}.sid"), vec![0u8; 16]))
            .collect();
        let borrowed: Vec<(&str, &[u8])> = files
            .iter()
            .map(|(n, d)| (n.as_str(), d.as_slice()))
            .collect();
        let data = build_zip(&borrowed);

        let mut stream = extract("t.zip", ArchiveFormat::Zip, Bytes::from(data), 50);
        assert!(matches!(
            stream.next().await,
            Some(Ok(ExtractEvent::Enumerated { total: 100 }))
        ));
        let worker = stream.worker.take().unwrap();
        drop(stream);
        worker.await.unwrap();
    }
}
