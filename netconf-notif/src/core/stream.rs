//! Persistent event stream log.
//!
//! On-disk layout of `<name>.events`, all integers little-endian:
//!
//! ```text
//! char[8]  "NCSTREAM"          magic
//! u16      0xFF01              format marker, low byte = version
//! u16      name_len            includes the trailing NUL
//! char[]   name, NUL-terminated
//! u16      desc_len            includes the trailing NUL (minimum 1)
//! char[]   description, NUL-terminated
//! u8       replay flag
//! u64      creation time, seconds since epoch
//! ```
//!
//! Event records follow the header back to back, each one
//! `u32 len | u64 timestamp | char[len] payload` where `len` counts the
//! payload's trailing NUL. Records are append-only; the only permitted
//! rewrite is truncating away a partially written record.

use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::error::{NtfError, Result};
use super::rules::RuleStore;

const MAGIC: &[u8; 8] = b"NCSTREAM";
const VERSION_MAGIC: u16 = 0xFF01;
const RECORD_HEADER_LEN: u64 = 12;

/// One event record read back from a stream file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
    /// Event time carried next to the payload, seconds since epoch
    pub timestamp: u64,
    /// Notification document, without the storage NUL
    pub xml: String,
    /// Offset of the record following this one
    pub next_offset: u64,
}

/// A named persistent event log with its allow-rule region.
///
/// Appends and positioned reads serialize on an in-process mutex before
/// taking the OS advisory lock, keeping the file offset coherent between
/// threads and leaving the cross-process locking to `flock`.
pub struct Stream {
    name: String,
    description: String,
    replay: bool,
    created: u64,
    data_offset: u64,
    path: PathBuf,
    file: Mutex<File>,
    rules: Mutex<RuleStore>,
}

fn events_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.events"))
}

fn rules_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.rules"))
}

fn valid_stream_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() < u16::MAX as usize
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

fn encode_header(name: &str, description: &str, replay: bool, created: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAGIC.len() + name.len() + description.len() + 15);
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&VERSION_MAGIC.to_le_bytes());
    buf.extend_from_slice(&((name.len() + 1) as u16).to_le_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.extend_from_slice(&((description.len() + 1) as u16).to_le_bytes());
    buf.extend_from_slice(description.as_bytes());
    buf.push(0);
    buf.push(replay as u8);
    buf.extend_from_slice(&created.to_le_bytes());
    buf
}

fn read_exact_field(file: &mut File, buf: &mut [u8], what: &str) -> Result<()> {
    file.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            NtfError::Corrupt(format!("short read in stream file header ({what})"))
        } else {
            NtfError::StorageIo(e.to_string())
        }
    })
}

fn read_nul_string(file: &mut File, what: &str) -> Result<String> {
    let mut len_buf = [0u8; 2];
    read_exact_field(file, &mut len_buf, what)?;
    let len = u16::from_le_bytes(len_buf) as usize;
    if len == 0 {
        return Err(NtfError::Corrupt(format!("zero-length {what} field")));
    }
    let mut data = vec![0u8; len];
    read_exact_field(file, &mut data, what)?;
    data.pop(); // trailing NUL
    String::from_utf8(data)
        .map_err(|_| NtfError::Corrupt(format!("{what} field is not valid UTF-8")))
}

impl Stream {
    /// Create a new stream file, truncating any previous content, and open
    /// its rule region.
    pub(crate) fn create(dir: &Path, name: &str, description: &str, replay: bool) -> Result<Self> {
        if !valid_stream_name(name) {
            return Err(NtfError::InvalidArgument(format!(
                "invalid stream name {name:?}"
            )));
        }

        let path = events_path(dir, name);
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o666);
        }
        let mut file = opts.open(&path).map_err(|e| {
            NtfError::StorageIo(format!("unable to create stream file {}: {e}", path.display()))
        })?;

        let created = now_secs();
        let header = encode_header(name, description, replay, created);
        if let Err(e) = file.write_all(&header) {
            let _ = file.set_len(0);
            return Err(NtfError::StorageIo(format!(
                "writing stream file header failed: {e}"
            )));
        }
        let data_offset = header.len() as u64;

        let rules = RuleStore::open(&rules_path(dir, name))?;

        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            replay,
            created,
            data_offset,
            path,
            file: Mutex::new(file),
            rules: Mutex::new(rules),
        })
    }

    /// Open an existing stream file and parse its header. Files without the
    /// leading magic are reported as [`NtfError::Corrupt`], which directory
    /// enumeration treats as "not a stream file".
    pub(crate) fn load(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| {
                NtfError::StorageIo(format!("unable to open stream file {}: {e}", path.display()))
            })?;

        let mut magic = [0u8; 8];
        read_exact_field(&mut file, &mut magic, "magic")?;
        if &magic != MAGIC {
            return Err(NtfError::Corrupt(format!(
                "{} is not a stream file",
                path.display()
            )));
        }

        let mut version = [0u8; 2];
        read_exact_field(&mut file, &mut version, "version")?;
        if u16::from_le_bytes(version) != VERSION_MAGIC {
            return Err(NtfError::Corrupt(format!(
                "unsupported stream file version {:#06x}",
                u16::from_le_bytes(version)
            )));
        }

        let name = read_nul_string(&mut file, "name")?;
        let description = read_nul_string(&mut file, "description")?;

        let mut flag = [0u8; 1];
        read_exact_field(&mut file, &mut flag, "replay flag")?;
        let mut created = [0u8; 8];
        read_exact_field(&mut file, &mut created, "creation time")?;

        let data_offset = file.stream_position()?;

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let rules = RuleStore::open(&rules_path(dir, &name))?;

        Ok(Self {
            name,
            description,
            replay: flag[0] != 0,
            created: u64::from_le_bytes(created),
            data_offset,
            path: path.to_path_buf(),
            file: Mutex::new(file),
            rules: Mutex::new(rules),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn replay_enabled(&self) -> bool {
        self.replay
    }

    /// Creation time of the stream, seconds since epoch
    pub fn created_at(&self) -> u64 {
        self.created
    }

    /// Offset of the first event record, right behind the header
    pub fn data_offset(&self) -> u64 {
        self.data_offset
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `event` is admitted by this stream's allow-list
    pub fn event_allowed(&self, event: &str) -> bool {
        self.rules.lock().is_allowed(event)
    }

    /// Add `event` to this stream's allow-list
    pub fn allow_event(&self, event: &str) -> Result<()> {
        self.rules.lock().allow(event)
    }

    /// Append one event record under an exclusive advisory lock. A failed
    /// write truncates the file back to the pre-append end offset so that a
    /// reader never observes a torn record.
    pub fn append_record(&self, xml: &str, timestamp: u64) -> Result<()> {
        if xml.len() as u64 + 1 > u32::MAX as u64 {
            return Err(NtfError::InvalidArgument(
                "event record exceeds the maximum payload length".to_string(),
            ));
        }

        let mut file = self.file.lock();
        file.lock_exclusive()
            .map_err(|e| NtfError::StorageIo(format!("locking stream file failed: {e}")))?;
        let result = Self::append_locked(&mut file, xml, timestamp);
        let _ = FileExt::unlock(&*file);
        result
    }

    fn append_locked(file: &mut File, xml: &str, timestamp: u64) -> Result<()> {
        let end = file.seek(SeekFrom::End(0))?;
        let len = (xml.len() + 1) as u32;

        let write = (|| -> std::io::Result<()> {
            file.write_all(&len.to_le_bytes())?;
            file.write_all(&timestamp.to_le_bytes())?;
            file.write_all(xml.as_bytes())?;
            file.write_all(&[0])
        })();

        if let Err(e) = write {
            // revert the partial record
            let _ = file.set_len(end);
            let _ = file.seek(SeekFrom::Start(end));
            return Err(NtfError::StorageIo(format!(
                "writing event record failed: {e}"
            )));
        }
        Ok(())
    }

    /// Read the record starting at `offset` under a shared advisory lock.
    /// Returns `Ok(None)` once `offset` reaches the end of the file.
    pub fn read_record_at(&self, offset: u64) -> Result<Option<StreamRecord>> {
        let mut file = self.file.lock();
        file.lock_shared()
            .map_err(|e| NtfError::StorageIo(format!("locking stream file failed: {e}")))?;
        let result = Self::read_locked(&mut file, offset);
        let _ = FileExt::unlock(&*file);
        result
    }

    fn read_locked(file: &mut File, offset: u64) -> Result<Option<StreamRecord>> {
        let end = file.seek(SeekFrom::End(0))?;
        if offset >= end {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;

        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        file.read_exact(&mut header).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                NtfError::Corrupt("torn record header".to_string())
            } else {
                NtfError::StorageIo(e.to_string())
            }
        })?;

        let len = u32::from_le_bytes(header[..4].try_into().unwrap());
        let timestamp = u64::from_le_bytes(header[4..].try_into().unwrap());
        if len == 0 {
            return Err(NtfError::Corrupt("empty record payload".to_string()));
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                NtfError::Corrupt("torn record payload".to_string())
            } else {
                NtfError::StorageIo(e.to_string())
            }
        })?;

        while payload.last() == Some(&0) {
            payload.pop();
        }
        let xml = String::from_utf8(payload)
            .map_err(|_| NtfError::Corrupt("record payload is not valid UTF-8".to_string()))?;

        Ok(Some(StreamRecord {
            timestamp,
            xml,
            next_offset: offset + RECORD_HEADER_LEN + len as u64,
        }))
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("name", &self.name)
            .field("replay", &self.replay)
            .field("created", &self.created)
            .field("data_offset", &self.data_offset)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let created = {
            let s = Stream::create(dir.path(), "ops", "operational events", true).unwrap();
            assert_eq!(s.name(), "ops");
            assert_eq!(s.description(), "operational events");
            assert!(s.replay_enabled());
            s.created_at()
        };

        let loaded = Stream::load(&dir.path().join("ops.events")).unwrap();
        assert_eq!(loaded.name(), "ops");
        assert_eq!(loaded.description(), "operational events");
        assert!(loaded.replay_enabled());
        assert_eq!(loaded.created_at(), created);
        assert_eq!(
            loaded.data_offset(),
            encode_header("ops", "operational events", true, created).len() as u64
        );
    }

    #[test]
    fn test_empty_description() {
        let dir = tempfile::tempdir().unwrap();
        Stream::create(dir.path(), "bare", "", false).unwrap();

        let loaded = Stream::load(&dir.path().join("bare.events")).unwrap();
        assert_eq!(loaded.description(), "");
        assert!(!loaded.replay_enabled());
    }

    #[test]
    fn test_load_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.events");
        std::fs::write(&path, b"just some text, long enough to not be short").unwrap();

        assert!(matches!(
            Stream::load(&path),
            Err(NtfError::Corrupt(_))
        ));
    }

    #[test]
    fn test_load_rejects_truncated_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cut.events");
        std::fs::write(&path, &b"NCSTREAM"[..]).unwrap();

        assert!(matches!(
            Stream::load(&path),
            Err(NtfError::Corrupt(_))
        ));
    }

    #[test]
    fn test_invalid_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["", "a/b", ".", "..", "nul\0name"] {
            assert!(matches!(
                Stream::create(dir.path(), name, "", true),
                Err(NtfError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Stream::create(dir.path(), "log", "", true).unwrap();

        stream.append_record("<notification><a/></notification>", 100).unwrap();
        stream.append_record("<notification><b/></notification>", 200).unwrap();

        let first = stream.read_record_at(stream.data_offset()).unwrap().unwrap();
        assert_eq!(first.timestamp, 100);
        assert_eq!(first.xml, "<notification><a/></notification>");
        // u32 len + u64 timestamp + payload + NUL
        assert_eq!(
            first.next_offset,
            stream.data_offset() + 12 + first.xml.len() as u64 + 1
        );

        let second = stream.read_record_at(first.next_offset).unwrap().unwrap();
        assert_eq!(second.timestamp, 200);
        assert_eq!(second.xml, "<notification><b/></notification>");

        assert!(stream.read_record_at(second.next_offset).unwrap().is_none());
    }

    #[test]
    fn test_records_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        {
            let stream = Stream::create(dir.path(), "persist", "d", true).unwrap();
            stream.append_record("<notification><x/></notification>", 42).unwrap();
        }

        let stream = Stream::load(&dir.path().join("persist.events")).unwrap();
        let rec = stream.read_record_at(stream.data_offset()).unwrap().unwrap();
        assert_eq!(rec.timestamp, 42);
        assert!(rec.xml.contains("<x/>"));
    }

    #[test]
    fn test_torn_record_detected() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Stream::create(dir.path(), "torn", "", true).unwrap();
        stream.append_record("<notification><x/></notification>", 1).unwrap();

        // chop the file in the middle of the record payload
        let file = OpenOptions::new()
            .write(true)
            .open(dir.path().join("torn.events"))
            .unwrap();
        file.set_len(stream.data_offset() + 20).unwrap();

        assert!(matches!(
            stream.read_record_at(stream.data_offset()),
            Err(NtfError::Corrupt(_))
        ));
    }

    #[test]
    fn test_rules_attached_to_stream() {
        let dir = tempfile::tempdir().unwrap();
        let stream = Stream::create(dir.path(), "ruled", "", true).unwrap();

        assert!(!stream.event_allowed("custom-event"));
        stream.allow_event("custom-event").unwrap();
        assert!(stream.event_allowed("custom-event"));
        assert!(dir.path().join("ruled.rules").is_file());
    }
}
