use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

use log::debug;
use memmap2::MmapOptions;

use super::{Repo, TableStorage, Window};

/// Directory-backed repository: one file per physical table.
#[derive(Clone, Debug)]
pub struct Fs {
    root: Arc<PathBuf>,
}

impl Fs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Fs {
            root: Arc::new(root.into()),
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl TableStorage for File {
    fn read_exact_at(&self, buf: &mut [u8], off: u64) -> io::Result<()> {
        FileExt::read_exact_at(self, buf, off)
    }

    fn write_all_at(&self, buf: &[u8], off: u64) -> io::Result<()> {
        FileExt::write_all_at(self, buf, off)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }

    fn sync_data(&self) -> io::Result<()> {
        File::sync_data(self)
    }

    fn map(&self, off: u64, len: usize) -> io::Result<Window> {
        // SAFETY: the append-only discipline means mapped regions are only
        // ever extended, never rewritten, while a window is live.
        let mmap = unsafe { MmapOptions::new().offset(off).len(len).map(self)? };
        Ok(Window::Mapped(mmap))
    }
}

impl Repo for Fs {
    type Storage = File;

    fn create(&self, name: &str) -> io::Result<File> {
        debug!("create table file {name}");
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(self.path_of(name))
    }

    fn open(&self, name: &str) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(self.path_of(name))
    }

    fn remove(&self, name: &str) -> io::Result<()> {
        fs::remove_file(self.path_of(name))
    }

    fn existing(&self, ext: &str) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&*self.root)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == ext) {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    names.push(name.to_owned());
                }
            }
        }
        names.sort_unstable();
        Ok(names)
    }
}
