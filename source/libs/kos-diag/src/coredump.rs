// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Binary core-dump record written on panic
//!
//! Layout (little endian):
//!   magic[8] | version u16 | timestamp_ns u64 | pid u32 | tid u32
//!   | str process_name | str panic_msg | u32 nframes | str frame* | str system_state
//! where `str` is `u32 len | bytes`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Record magic.
pub const CORE_MAGIC: [u8; 8] = *b"KOSCORE\0";
/// Record version.
pub const CORE_VERSION: u16 = 1;

const MAX_STRING: usize = 64 * 1024;
const MAX_FRAMES: u32 = 256;

/// Errors surfaced while encoding, decoding or persisting a core dump.
#[derive(Debug, Error)]
pub enum CoreDumpError {
    /// The record is shorter than its declared contents.
    #[error("core dump truncated")]
    Truncated,
    /// Magic or version mismatch.
    #[error("not a kos core dump")]
    BadMagic,
    /// A declared length exceeds the decoder bounds.
    #[error("core dump field too large")]
    TooLarge,
    /// Embedded text is not UTF-8.
    #[error("core dump text is not utf-8")]
    Utf8,
    /// Host I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Post-mortem record.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoreDump {
    /// Nanoseconds since the Unix epoch.
    pub timestamp_ns: u64,
    /// Host process id.
    pub pid: u32,
    /// Host thread id.
    pub tid: u32,
    /// Process name.
    pub process_name: String,
    /// Panic message.
    pub panic_msg: String,
    /// Symbolic stack frames, innermost first.
    pub stack_frames: Vec<String>,
    /// Rendered [`crate::SystemState`].
    pub system_state: String,
}

impl CoreDump {
    /// Serialises the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);
        out.extend_from_slice(&CORE_MAGIC);
        out.extend_from_slice(&CORE_VERSION.to_le_bytes());
        out.extend_from_slice(&self.timestamp_ns.to_le_bytes());
        out.extend_from_slice(&self.pid.to_le_bytes());
        out.extend_from_slice(&self.tid.to_le_bytes());
        put_str(&mut out, &self.process_name);
        put_str(&mut out, &self.panic_msg);
        let frames = self.stack_frames.len().min(MAX_FRAMES as usize);
        out.extend_from_slice(&(frames as u32).to_le_bytes());
        for frame in self.stack_frames.iter().take(frames) {
            put_str(&mut out, frame);
        }
        put_str(&mut out, &self.system_state);
        out
    }

    /// Parses a record produced by [`CoreDump::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, CoreDumpError> {
        let mut r = Reader { buf, pos: 0 };
        if r.take(8)? != CORE_MAGIC {
            return Err(CoreDumpError::BadMagic);
        }
        if r.u16()? != CORE_VERSION {
            return Err(CoreDumpError::BadMagic);
        }
        let timestamp_ns = r.u64()?;
        let pid = r.u32()?;
        let tid = r.u32()?;
        let process_name = r.string()?;
        let panic_msg = r.string()?;
        let nframes = r.u32()?;
        if nframes > MAX_FRAMES {
            return Err(CoreDumpError::TooLarge);
        }
        let mut stack_frames = Vec::with_capacity(nframes as usize);
        for _ in 0..nframes {
            stack_frames.push(r.string()?);
        }
        let system_state = r.string()?;
        Ok(Self { timestamp_ns, pid, tid, process_name, panic_msg, stack_frames, system_state })
    }

    /// Writes the record to `path`, creating or truncating it, and syncs it.
    pub fn write_to(&self, path: &Path) -> Result<(), CoreDumpError> {
        let mut file: File =
            OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
        file.write_all(&self.encode())?;
        file.sync_all()?;
        Ok(())
    }
}

/// Path of the core dump for `pid` at `unix_ts` under `dir`.
pub fn core_dump_path(dir: &Path, pid: u32, unix_ts: i64) -> PathBuf {
    dir.join(format!("kos_core.{pid}.{unix_ts}"))
}

fn put_str(out: &mut Vec<u8>, s: &str) {
    let bytes = &s.as_bytes()[..s.len().min(MAX_STRING)];
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CoreDumpError> {
        let end = self.pos.checked_add(n).ok_or(CoreDumpError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CoreDumpError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u16(&mut self) -> Result<u16, CoreDumpError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CoreDumpError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CoreDumpError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn string(&mut self) -> Result<String, CoreDumpError> {
        let len = self.u32()? as usize;
        if len > MAX_STRING {
            return Err(CoreDumpError::TooLarge);
        }
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CoreDumpError::Utf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CoreDump {
        CoreDump {
            timestamp_ns: 1_700_000_000_123,
            pid: 42,
            tid: 43,
            process_name: "kosd".into(),
            panic_msg: "scheduler inconsistency".into(),
            stack_frames: vec!["kos_kernel::sched::tick".into(), "main".into()],
            system_state: "pid=42".into(),
        }
    }

    #[test]
    fn decode_reads_back_encoded_record() {
        let dump = sample();
        assert_eq!(CoreDump::decode(&dump.encode()).expect("decode"), dump);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = sample().encode();
        assert!(matches!(
            CoreDump::decode(&bytes[..bytes.len() - 3]),
            Err(CoreDumpError::Truncated)
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(CoreDump::decode(&bytes), Err(CoreDumpError::BadMagic)));
    }

    #[test]
    fn path_embeds_pid_and_timestamp() {
        let p = core_dump_path(Path::new("/tmp"), 7, 1234);
        assert_eq!(p, PathBuf::from("/tmp/kos_core.7.1234"));
    }

    #[test]
    fn write_to_persists_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = core_dump_path(dir.path(), 1, 2);
        sample().write_to(&path).expect("write");
        let bytes = std::fs::read(&path).expect("read");
        assert_eq!(CoreDump::decode(&bytes).expect("decode").pid, 42);
    }
}
