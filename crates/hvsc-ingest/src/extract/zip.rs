use bytes::Bytes;
use std::io::{Cursor, Read};
use ::zip::ZipArchive;

use super::EventSink;
use crate::error::IngestError;

/// Upper bound on the buffer reserved from a header's declared size.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

fn initial_capacity(declared: u64) -> usize {
    usize::try_from(declared.min(MAX_PREALLOCATION)).unwrap_or(0)
}

pub(super) fn extract_zip(archive_name: &str, data: Bytes, sink: &mut EventSink) {
    let mut archive = match ZipArchive::new(Cursor::new(data)) {
        Ok(archive) => archive,
        Err(e) => return sink.fail(IngestError::corrupt(archive_name, e)),
    };

    let total = archive.file_names().filter(|n| !n.ends_with('/')).count();
    if !sink.enumerated(total) {
        return;
    }

    for index in 0..archive.len() {
        let mut file = match archive.by_index(index) {
            Ok(file) => file,
            Err(e) => return sink.fail(IngestError::corrupt(archive_name, e)),
        };
        if file.is_dir() {
            continue;
        }

        let path = file.name().to_string();
        let mut buf = Vec::with_capacity(initial_capacity(file.size()));
        if let Err(e) = file.read_to_end(&mut buf) {
            return sink.fail(IngestError::corrupt(
                archive_name,
                format!("{path}: {e}"),
            ));
        }
        if !sink.entry(path, buf) {
            return;
        }
    }

    sink.finish();
}
