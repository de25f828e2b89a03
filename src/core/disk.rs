
use crate::core::buffer_pool::{get_page_buffer, put_page_buffer};
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::header::HeaderPage;
use crate::core::page::Page;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// The data file: page `n` lives at byte offset `n * PAGE_SIZE`.
///
/// Only checkpoints write here. Everything a transaction produces goes
/// through the WAL first.
pub struct DataFile {
    file: Mutex<File>,
}

impl DataFile {
    /// Opens `path`, creating it with a fresh header page when missing.
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(path: &str, permissions: u32) -> Result<Self> {
        let exists = Path::new(path).exists();

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !exists {
            options.create(true);
        }
        let file = options.open(path)?;

        #[cfg(unix)]
        {
            let metadata = file.metadata()?;
            let mut perms = metadata.permissions();
            perms.set_mode(permissions);
            file.set_permissions(perms)?;
        }

        let disk = Self { file: Mutex::new(file) };

        if !exists || disk.page_count()? == 0 {
            debug!(path, "initializing new data file");
            disk.write_pages(vec![HeaderPage::new().to_page()])?;
            disk.sync()?;
        }

        Ok(disk)
    }

    fn lock_file(&self) -> Result<std::sync::MutexGuard<'_, File>> {
        self.file
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "disk.file".to_string() })
    }

    pub fn page_count(&self) -> Result<u64> {
        let file = self.lock_file()?;
        Ok(file.metadata()?.len() / PAGE_SIZE as u64)
    }

    pub fn read_page(&self, page_id: PageId) -> Result<Page> {
        let mut file = self.lock_file()?;
        let offset = page_id as u64 * PAGE_SIZE as u64;
        if offset + PAGE_SIZE as u64 > file.metadata()?.len() {
            return Err(Error::PageOutOfRange { page_id });
        }
        file.seek(SeekFrom::Start(offset))?;

        let mut buf = get_page_buffer();
        let read = file.read_exact(&mut buf);
        drop(file);

        let page = read.map_err(Error::from).and_then(|_| Page::from_bytes(&buf));
        put_page_buffer(buf);
        page
    }

    pub fn read_header(&self) -> Result<HeaderPage> {
        HeaderPage::from_page(&self.read_page(HEADER_PAGE_ID)?)
    }

    /// Writes page images in ascending page order, batching runs of
    /// consecutive pages into single writes. Does not sync.
    pub fn write_pages(&self, pages: Vec<Page>) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }

        let mut sorted_pages = pages;
        sorted_pages.sort_unstable_by_key(|page| page.page_id);

        let mut file = self.lock_file()?;

        let mut batch_start = 0;
        while batch_start < sorted_pages.len() {
            let mut batch_end = batch_start;
            while batch_end + 1 < sorted_pages.len()
                && sorted_pages[batch_end + 1].page_id == sorted_pages[batch_end].page_id + 1
            {
                batch_end += 1;
            }

            let batch_size = batch_end - batch_start + 1;
            let mut batch_buffer = vec![0u8; batch_size * PAGE_SIZE];
            for (i, page) in sorted_pages[batch_start..=batch_end].iter().enumerate() {
                page.serialize_into(&mut batch_buffer[i * PAGE_SIZE..(i + 1) * PAGE_SIZE]);
            }

            let offset = sorted_pages[batch_start].page_id as u64 * PAGE_SIZE as u64;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&batch_buffer)?;

            batch_start = batch_end + 1;
        }

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.lock_file()?.sync_all()?;
        Ok(())
    }
}
