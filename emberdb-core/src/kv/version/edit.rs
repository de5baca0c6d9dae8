//! Manifest edit records

use super::FileMeta;
use crate::types::FileNumber;
use crate::{EmberError, Result};
use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use tracing::warn;

/// Manifest file name inside a family directory
pub const MANIFEST_FILE_NAME: &str = "MANIFEST";

/// One metadata mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EditRecord {
    /// File added to a level
    AddFile { level: usize, file: FileMeta },
    /// File removed from a level
    DeleteFile {
        level: usize,
        file_number: FileNumber,
    },
    /// High-water mark of allocated file numbers
    NextFileNumber(FileNumber),
}

/// An atomic batch of edit records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditLog {
    pub records: Vec<EditRecord>,
}

impl EditLog {
    /// Create an empty edit log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an add-file record
    pub fn add_file(&mut self, level: usize, file: FileMeta) {
        self.records.push(EditRecord::AddFile { level, file });
    }

    /// Append a delete-file record
    pub fn delete_file(&mut self, level: usize, file_number: FileNumber) {
        self.records
            .push(EditRecord::DeleteFile { level, file_number });
    }

    /// Check if the batch carries no record
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Append-only manifest writer
///
/// Each batch is framed as `[len:u32_le | crc32:u32_le | bincode bytes]`; a
/// torn tail is tolerated on recovery by stopping at the first bad frame.
pub struct ManifestWriter {
    file: BufWriter<File>,
}

impl ManifestWriter {
    /// Open the manifest for appending, creating it if missing
    pub fn open(dir: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(MANIFEST_FILE_NAME))?;
        Ok(Self {
            file: BufWriter::new(file),
        })
    }

    /// Replace the manifest with a single checkpoint batch
    ///
    /// The new manifest is written to a temporary file and renamed into
    /// place, so a crash mid-checkpoint keeps the old manifest intact.
    pub fn checkpoint(dir: &Path, edit: &EditLog) -> Result<Self> {
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE_NAME));
        {
            let mut writer = Self {
                file: BufWriter::new(File::create(&tmp)?),
            };
            writer.append(edit)?;
        }
        std::fs::rename(&tmp, dir.join(MANIFEST_FILE_NAME))?;
        Self::open(dir)
    }

    /// Append one batch and sync it to disk
    pub fn append(&mut self, edit: &EditLog) -> Result<()> {
        let payload =
            bincode::serialize(edit).map_err(|e| EmberError::InvalidFormat(e.to_string()))?;
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_u32_le(crc32fast::hash(&payload));
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        Ok(())
    }
}

/// Read every intact batch from the manifest
pub fn read_manifest(dir: &Path) -> Result<Vec<EditLog>> {
    let path = dir.join(MANIFEST_FILE_NAME);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut data = Vec::new();
    File::open(&path)?.read_to_end(&mut data)?;

    let mut edits = Vec::new();
    let mut cursor = std::io::Cursor::new(&data[..]);
    while cursor.remaining() >= 8 {
        let frame_start = cursor.position() as usize;
        let len = cursor.get_u32_le() as usize;
        let crc = cursor.get_u32_le();
        let at = cursor.position() as usize;
        let Some(payload) = data.get(at..at + len) else {
            warn!(path = %path.display(), offset = frame_start, "truncated manifest tail dropped");
            break;
        };
        if crc32fast::hash(payload) != crc {
            warn!(path = %path.display(), offset = frame_start, "corrupt manifest frame, stopping replay");
            break;
        }
        match bincode::deserialize::<EditLog>(payload) {
            Ok(edit) => edits.push(edit),
            Err(e) => {
                warn!(path = %path.display(), offset = frame_start, error = %e, "undecodable manifest frame");
                break;
            }
        }
        cursor.set_position((at + len) as u64);
    }
    Ok(edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let mut writer = ManifestWriter::open(dir.path()).unwrap();

        let mut first = EditLog::new();
        first.add_file(
            0,
            FileMeta {
                file_number: 1,
                min_key: 0,
                max_key: 10,
                size: 100,
            },
        );
        first.records.push(EditRecord::NextFileNumber(2));
        writer.append(&first).unwrap();

        let mut second = EditLog::new();
        second.delete_file(0, 1);
        writer.append(&second).unwrap();

        let edits = read_manifest(dir.path()).unwrap();
        assert_eq!(edits, vec![first, second]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        let mut writer = ManifestWriter::open(dir.path()).unwrap();
        let mut edit = EditLog::new();
        edit.records.push(EditRecord::NextFileNumber(9));
        writer.append(&edit).unwrap();
        drop(writer);

        // simulate a torn append
        let path = dir.path().join(MANIFEST_FILE_NAME);
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[42, 0, 0, 0, 1, 2]);
        std::fs::write(&path, data).unwrap();

        let edits = read_manifest(dir.path()).unwrap();
        assert_eq!(edits, vec![edit]);
    }

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(read_manifest(dir.path()).unwrap().is_empty());
    }
}
