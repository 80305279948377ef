//! In-memory repository for tests.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::{Repo, TableStorage};

#[derive(Clone, Default)]
pub struct Memory {
    files: Arc<Mutex<HashMap<String, MemStorage>>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Default)]
pub struct MemStorage {
    buf: Arc<RwLock<Vec<u8>>>,
}

impl TableStorage for MemStorage {
    fn read_exact_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        let data = self.buf.read();
        let off = off as usize;
        if off + buf.len() > data.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.copy_from_slice(&data[off..off + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        let mut data = self.buf.write();
        let end = off as usize + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[off as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.buf.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        self.buf.write().resize(len as usize, 0);
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        Ok(())
    }
}

impl Repo for Memory {
    type Storage = MemStorage;

    fn create(&self, name: &str) -> io::Result<MemStorage> {
        let mut files = self.files.lock();
        if files.contains_key(name) {
            return Err(io::ErrorKind::AlreadyExists.into());
        }
        let storage = MemStorage::default();
        files.insert(name.to_owned(), storage.clone());
        Ok(storage)
    }

    fn open(&self, name: &str) -> io::Result<MemStorage> {
        self.files
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        self.files
            .lock()
            .remove(name)
            .map(drop)
            .ok_or_else(|| io::ErrorKind::NotFound.into())
    }

    fn existing(&self, ext: &str) -> io::Result<Vec<String>> {
        let suffix = format!(".{ext}");
        let mut names: Vec<String> = self
            .files
            .lock()
            .keys()
            .filter(|name| name.ends_with(&suffix))
            .cloned()
            .collect();
        names.sort_unstable();
        Ok(names)
    }
}
