use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::str;

use super::error::{NtfError, Result};

/// Size of the shared allow-rule region backing each stream, in bytes.
pub const RULES_REGION_SIZE: usize = 1024 * 1024;

/// Allow-list of event names admitted on a stream.
///
/// Backed by a sparse file of exactly [`RULES_REGION_SIZE`] bytes mapped
/// read-write shared, so that cooperating processes observe the same set.
/// The region holds newline-terminated event names followed by zero
/// padding; the total used bytes never exceed `RULES_REGION_SIZE - 1`.
///
/// Mutations within one process must be serialized by the owning stream's
/// lock. Cross-process additions are not atomic; rule registration is a
/// configuration-time operation.
pub struct RuleStore {
    map: MmapMut,
}

impl RuleStore {
    /// Open the rule region at `path`, creating a zero-filled sparse file
    /// of the fixed size if it does not exist yet.
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o666);
        }
        let file = opts.open(path).map_err(|e| {
            NtfError::StorageIo(format!("unable to open rules file {}: {e}", path.display()))
        })?;

        if file.metadata()?.len() < RULES_REGION_SIZE as u64 {
            file.set_len(RULES_REGION_SIZE as u64)?;
        }

        // Safety: the mapping stays valid for the lifetime of `file`, which
        // this struct owns through the map; concurrent writers are expected
        // and the region is only ever read as bytes.
        let map = unsafe { MmapOptions::new().len(RULES_REGION_SIZE).map_mut(&file) }
            .map_err(|e| {
                NtfError::StorageIo(format!("mmapping rules file {} failed: {e}", path.display()))
            })?;

        Ok(Self { map })
    }

    /// Number of bytes in use, i.e. the offset of the first padding byte.
    pub fn used(&self) -> usize {
        memchr::memchr(0, &self.map).unwrap_or(RULES_REGION_SIZE)
    }

    fn entries(&self) -> impl Iterator<Item = &str> {
        self.map[..self.used()]
            .split(|&b| b == b'\n')
            .filter(|line| !line.is_empty())
            .filter_map(|line| str::from_utf8(line).ok())
    }

    /// Whether `event` matches one of the stored lines exactly.
    pub fn is_allowed(&self, event: &str) -> bool {
        self.entries().any(|entry| entry == event)
    }

    /// Add `event` to the store. Adding an already present name is a no-op.
    pub fn allow(&mut self, event: &str) -> Result<()> {
        if event.is_empty() || event.contains(['\n', '\0']) {
            return Err(NtfError::InvalidArgument(format!(
                "invalid event name {event:?}"
            )));
        }
        if self.is_allowed(event) {
            return Ok(());
        }

        let used = self.used();
        let needed = event.len() + 1;
        if used + needed > RULES_REGION_SIZE - 1 {
            return Err(NtfError::Exhausted(event.to_string()));
        }

        self.map[used..used + event.len()].copy_from_slice(event.as_bytes());
        self.map[used + event.len()] = b'\n';
        Ok(())
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("used", &self.used())
            .field("entries", &self.entries().count())
            .finish()
    }
}
