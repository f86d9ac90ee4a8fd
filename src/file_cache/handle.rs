use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::file_cache::{needs_seek, Mode, SeekTo, WriteBuffer};
use crate::{Error, Result};

/// One buffered file handle.
///
/// `offset` is the logical position (buffered writes included);
/// `trusted_offset` is where the OS descriptor actually sits. The two meet
/// on every flush. A soft-closed handle keeps all of this state with
/// `file = None` and reopens at `offset` on the next use.
pub(crate) struct HandleState {
    pub path: PathBuf,
    pub mode: Mode,
    file: Option<File>,
    pub offset: u64,
    pub trusted_offset: u64,
    pub at_eof: bool,
    pub dirty: bool,
    wbuf: Vec<u8>,
    policy: WriteBuffer,
    pub last_used_us: u64,
}

impl HandleState {
    pub fn open(path: PathBuf, mode: Mode, policy: WriteBuffer, now_us: u64) -> Result<Self> {
        let file = open_os(&path, mode)?;
        Ok(Self {
            path,
            mode,
            file: Some(file),
            offset: 0,
            trusted_offset: 0,
            at_eof: false,
            dirty: false,
            wbuf: Vec::new(),
            policy,
            last_used_us: now_us,
        })
    }

    pub fn is_soft_closed(&self) -> bool {
        self.file.is_none()
    }

    /// Reopens a soft-closed handle at the recorded offset. Returns whether
    /// an OS descriptor was (re)obtained.
    pub fn ensure_open(&mut self) -> Result<bool> {
        if self.file.is_some() {
            return Ok(false);
        }
        let mut file = open_os(&self.path, self.mode)?;
        file.seek(SeekFrom::Start(self.offset))?;
        self.trusted_offset = self.offset;
        self.at_eof = false;
        self.file = Some(file);
        Ok(true)
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.mode.write {
            return Err(Error::NotOpenForWriting);
        }
        self.ensure_open()?;
        if !self.at_eof {
            self.physical_seek(SeekTo::Eof)?;
        }
        match self.policy {
            WriteBuffer::Unbuffered => {
                let file = self.file.as_mut().expect("handle open");
                file.write_all(bytes)?;
                self.offset += bytes.len() as u64;
                self.trusted_offset = self.offset;
                self.dirty = true;
            }
            WriteBuffer::Infinity => {
                self.wbuf.extend_from_slice(bytes);
                self.offset += bytes.len() as u64;
            }
            WriteBuffer::Limit(limit) => {
                self.wbuf.extend_from_slice(bytes);
                self.offset += bytes.len() as u64;
                if self.wbuf.len() >= limit {
                    self.flush_wbuf()?;
                }
            }
        }
        self.at_eof = true;
        Ok(())
    }

    pub fn read(&mut self, len: usize) -> Result<Vec<u8>> {
        if !self.mode.read {
            return Err(Error::NotOpenForReading);
        }
        self.ensure_open()?;
        self.flush_wbuf()?;
        let file = self.file.as_mut().expect("handle open");
        let mut buf = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                self.at_eof = true;
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.offset += filled as u64;
        self.trusted_offset = self.offset;
        Ok(buf)
    }

    pub fn seek(&mut self, target: SeekTo) -> Result<u64> {
        self.ensure_open()?;
        self.flush_wbuf()?;
        if needs_seek(self.at_eof, self.offset, target) {
            self.physical_seek(target)?;
        }
        Ok(self.offset)
    }

    fn physical_seek(&mut self, target: SeekTo) -> Result<()> {
        self.flush_wbuf()?;
        let file = self.file.as_mut().expect("handle open");
        let pos = match target {
            SeekTo::Bof(offset) => file.seek(SeekFrom::Start(offset))?,
            SeekTo::Cur(delta) => file.seek(SeekFrom::Current(delta))?,
            SeekTo::Eof => file.seek(SeekFrom::End(0))?,
        };
        self.offset = pos;
        self.trusted_offset = pos;
        self.at_eof = matches!(target, SeekTo::Eof);
        Ok(())
    }

    pub fn flush_wbuf(&mut self) -> Result<()> {
        if self.wbuf.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;
        let file = self.file.as_mut().expect("handle open");
        file.write_all(&self.wbuf)?;
        self.wbuf.clear();
        self.trusted_offset = self.offset;
        self.dirty = true;
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.flush_wbuf()?;
        if self.dirty {
            if let Some(file) = self.file.as_mut() {
                file.sync_data()?;
            }
            self.dirty = false;
        }
        Ok(())
    }

    /// Flush, sync and drop the OS descriptor, keeping the handle state.
    /// Returns whether a descriptor was actually released.
    pub fn soft_close(&mut self) -> Result<bool> {
        if self.file.is_none() {
            return Ok(false);
        }
        self.sync()?;
        self.file = None;
        self.at_eof = false;
        Ok(true)
    }

    pub fn size(&mut self) -> Result<u64> {
        self.flush_wbuf()?;
        self.ensure_open()?;
        let file = self.file.as_ref().expect("handle open");
        Ok(file.metadata()?.len())
    }
}

fn open_os(path: &PathBuf, mode: Mode) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(mode.read);
    if mode.write {
        options.write(true).create(true);
    }
    Ok(options.open(path)?)
}
