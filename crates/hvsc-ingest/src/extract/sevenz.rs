use bytes::Bytes;
use sevenz_rust::{Password, SevenZReader};
use std::io::{Cursor, Read};

use super::EventSink;
use crate::error::IngestError;

pub(super) fn extract_7z(archive_name: &str, data: Bytes, sink: &mut EventSink) {
    let len = data.len() as u64;
    let mut reader = match SevenZReader::new(Cursor::new(data), len, Password::empty()) {
        Ok(reader) => reader,
        Err(e) => return sink.fail(IngestError::corrupt(archive_name, e)),
    };

    let total = reader
        .archive()
        .files
        .iter()
        .filter(|entry| !entry.is_directory())
        .count();
    if !sink.enumerated(total) {
        return;
    }

    let mut entry_error = None;
    let mut consumer_gone = false;
    let result = reader.for_each_entries(|entry, rd| {
        if entry.is_directory() {
            return Ok(true);
        }
        let path = entry.name().to_string();
        let mut buf = Vec::new();
        if let Err(e) = rd.read_to_end(&mut buf) {
            entry_error = Some(IngestError::corrupt(archive_name, format!("{path}: {e}")));
            return Ok(false);
        }
        if !sink.entry(path, buf) {
            consumer_gone = true;
            return Ok(false);
        }
        Ok(true)
    });

    if consumer_gone {
        return;
    }
    if let Some(error) = entry_error {
        return sink.fail(error);
    }
    if let Err(e) = result {
        return sink.fail(IngestError::corrupt(archive_name, e));
    }

    sink.finish();
}
