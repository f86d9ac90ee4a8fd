//! Clean-shutdown recovery store.
//!
//! A disk-backed table at `<data>/queues/clean.dot` mapping resource names
//! to opaque recovery blobs. The table lives in RAM and goes back to disk
//! only on an explicit `sync`, typically once at shutdown. Blobs are never
//! inspected and round-trip bit-identical.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

const FILE_NAME: &str = "clean.dot";
const MAGIC: &[u8; 4] = b"CLN1";

pub struct RecoveryStore {
    path: PathBuf,
    entries: BTreeMap<String, Vec<u8>>,
}

impl RecoveryStore {
    /// Opens (and loads) the store under `<data>/queues/`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref().join("queues");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(FILE_NAME);
        let entries = match File::open(&path) {
            Ok(mut file) => load(&mut file)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn insert(&mut self, name: impl Into<String>, terms: Vec<u8>) {
        self.entries.insert(name.into(), terms);
    }

    pub fn member(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Result<&[u8]> {
        self.entries
            .get(name)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::NotFound(format!("recovery terms for {name}")))
    }

    pub fn delete(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes the whole table back to disk.
    pub fn sync(&self) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(MAGIC)?;
        file.write_all(&(self.entries.len() as u32).to_le_bytes())?;
        for (name, terms) in &self.entries {
            let name_bytes = name.as_bytes();
            file.write_all(&(name_bytes.len() as u32).to_le_bytes())?;
            file.write_all(&(terms.len() as u32).to_le_bytes())?;
            file.write_all(&crc32fast::hash(terms).to_le_bytes())?;
            file.write_all(name_bytes)?;
            file.write_all(terms)?;
        }
        file.sync_all()?;
        Ok(())
    }
}

fn load(file: &mut File) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut magic = [0u8; 4];
    file.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(Error::Corrupt("bad recovery store magic"));
    }
    let mut count_buf = [0u8; 4];
    file.read_exact(&mut count_buf)?;
    let count = u32::from_le_bytes(count_buf);
    let mut entries = BTreeMap::new();
    for _ in 0..count {
        let mut header = [0u8; 12];
        file.read_exact(&mut header)?;
        let name_len = u32::from_le_bytes(header[0..4].try_into().expect("slice length")) as usize;
        let terms_len = u32::from_le_bytes(header[4..8].try_into().expect("slice length")) as usize;
        let crc = u32::from_le_bytes(header[8..12].try_into().expect("slice length"));
        let mut name = vec![0u8; name_len];
        file.read_exact(&mut name)?;
        let mut terms = vec![0u8; terms_len];
        file.read_exact(&mut terms)?;
        if crc32fast::hash(&terms) != crc {
            return Err(Error::Corrupt("recovery terms crc mismatch"));
        }
        let name =
            String::from_utf8(name).map_err(|_| Error::Corrupt("recovery name not utf-8"))?;
        entries.insert(name, terms);
    }
    Ok(entries)
}
