
use crate::core::buffer_pool::{get_frame_buffer, put_frame_buffer};
use crate::core::constants::*;
use crate::core::disk::DataFile;
use crate::core::errors::*;
use crate::core::header::HeaderPage;
use crate::core::metrics::Metrics;
use crate::core::page::Page;
use crate::core::tx_pages::PagePosition;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const WAL_BUFFER_SIZE: usize = 64 * 1024;

/// Write-ahead log as seen by a transaction.
///
/// Pages written through `write_pages` stay invisible to other readers until
/// a `confirm_transaction` naming their positions returns.
pub trait WalService: Send + Sync {
    /// Appends page images in the given order and records each page's frame
    /// position in `positions`.
    fn write_pages(&self, pages: Vec<Page>, positions: &mut HashMap<PageId, PagePosition>) -> Result<()>;

    /// Durably appends the confirm header and then publishes `positions`
    /// as one unit.
    fn confirm_transaction(&self, confirm: &HeaderPage, positions: &[PagePosition]) -> Result<()>;

    fn read_page(&self, position: u64) -> Result<Page>;

    /// Latest confirmed frame for `page_id`, if the log holds one.
    fn confirmed_position(&self, page_id: PageId) -> Option<u64>;
}

#[derive(Debug, Clone)]
pub struct WALHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub salt1: u32,
    pub salt2: u32,
}

#[derive(Debug, Clone)]
pub struct WALFrame {
    pub tx_id: TransactionID,
    pub page_id: PageId,
    pub page_data: Vec<u8>,
    pub checksum: u32,
    pub salt1: u32,
    pub salt2: u32,
}

impl WALFrame {
    fn is_confirm(&self) -> bool {
        self.page_id == HEADER_PAGE_ID && self.page_data[21] != 0
    }
}

struct WALInner {
    file: File,
    writer: BufWriter<File>,
    header: WALHeader,
    frame_num: u64,
    file_position: i64,
    max_transaction_id: TransactionID,
}

pub struct WAL {
    inner: Mutex<WALInner>,
    index: RwLock<HashMap<PageId, u64>>,
    metrics: RwLock<Option<Arc<Metrics>>>,
}

impl WAL {
    #[cfg_attr(not(unix), allow(unused_variables))]
    pub fn open(db_path: &str, permissions: u32) -> Result<Self> {
        let wal_path = format!("{}-wal", db_path);

        let is_new = !Path::new(&wal_path).exists();

        #[cfg(unix)]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(permissions)
            .open(&wal_path)?;

        #[cfg(not(unix))]
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&wal_path)?;

        let writer_file = file.try_clone()?;
        let writer = BufWriter::with_capacity(WAL_BUFFER_SIZE, writer_file);

        let mut inner = WALInner {
            file,
            writer,
            header: WALHeader {
                magic: WAL_MAGIC,
                version: 1,
                salt1: generate_salt(),
                salt2: generate_salt().rotate_left(16),
            },
            frame_num: 0,
            file_position: -1,
            max_transaction_id: 0,
        };

        let mut index = HashMap::new();
        if is_new {
            inner.write_header()?;
        } else {
            inner.header = inner.read_header()?;
            index = inner.restore_index()?;
            info!(
                path = %wal_path,
                frames = inner.frame_num,
                confirmed_pages = index.len(),
                "restored WAL index"
            );
        }

        Ok(WAL {
            inner: Mutex::new(inner),
            index: RwLock::new(index),
            metrics: RwLock::new(None),
        })
    }

    pub(crate) fn set_metrics(&self, metrics: Arc<Metrics>) {
        if let Ok(mut m) = self.metrics.write() {
            *m = Some(metrics);
        }
    }

    fn with_metrics(&self, f: impl FnOnce(&Metrics)) {
        if let Ok(m) = self.metrics.read() {
            if let Some(metrics) = m.as_ref() {
                f(metrics);
            }
        }
    }

    fn lock_inner(&self) -> Result<std::sync::MutexGuard<'_, WALInner>> {
        self.inner
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "wal.inner".to_string() })
    }

    /// Highest transaction id found in the log when it was opened. New
    /// transaction ids must start above it so no dead transaction's frames
    /// can be adopted by a later confirm.
    pub fn max_transaction_id(&self) -> TransactionID {
        self.inner.lock().map(|inner| inner.max_transaction_id).unwrap_or(0)
    }

    pub fn frame_count(&self) -> u64 {
        self.inner.lock().map(|inner| inner.frame_num).unwrap_or(0)
    }

    /// Number of pages currently resolved through the log instead of the data file.
    pub fn confirmed_pages(&self) -> usize {
        self.index.read().map(|index| index.len()).unwrap_or(0)
    }

    pub fn sync(&self) -> Result<()> {
        let mut inner = self.lock_inner()?;
        inner.writer.flush()?;
        inner.file.sync_all()?;
        Ok(())
    }

    /// Copies the latest confirmed image of every logged page into the data
    /// file, in ascending page order, then truncates the log.
    ///
    /// The caller must guarantee no transaction is running.
    pub fn checkpoint(&self, disk: &DataFile) -> Result<usize> {
        let mut inner = self.lock_inner()?;
        inner.writer.flush()?;

        let mut entries: Vec<(PageId, u64)> = {
            let index = self
                .index
                .read()
                .map_err(|_| Error::LockPoisoned { lock_name: "wal.index".to_string() })?;
            index.iter().map(|(&page_id, &position)| (page_id, position)).collect()
        };
        entries.sort_unstable_by_key(|&(page_id, _)| page_id);

        let mut pages = Vec::with_capacity(entries.len());
        for (page_id, position) in entries {
            let frame = inner.read_frame(position)?;
            if frame.page_id != page_id {
                return Err(Error::DataCorruption {
                    details: format!(
                        "WAL frame {} holds page {} but index expected page {}",
                        position, frame.page_id, page_id
                    ),
                });
            }
            pages.push(Page::from_bytes(&frame.page_data)?);
        }

        let count = pages.len();
        disk.write_pages(pages)?;
        disk.sync()?;

        inner.file.set_len(WAL_HEADER_SIZE as u64)?;
        inner.file.sync_all()?;
        inner.frame_num = 0;
        inner.file_position = -1;

        self.index
            .write()
            .map_err(|_| Error::LockPoisoned { lock_name: "wal.index".to_string() })?
            .clear();

        drop(inner);
        self.with_metrics(|m| m.checkpoint_completed());
        info!(pages = count, "checkpoint completed");

        Ok(count)
    }

    pub fn close(&self) -> Result<()> {
        self.sync()
    }
}

impl WalService for WAL {
    fn write_pages(&self, pages: Vec<Page>, positions: &mut HashMap<PageId, PagePosition>) -> Result<()> {
        if pages.is_empty() {
            return Ok(());
        }

        let mut inner = self.lock_inner()?;
        let count = pages.len();
        for page in pages {
            let position = inner.append_page(&page)?;
            positions.insert(page.page_id, PagePosition::new(page.page_id, position));
        }
        inner.writer.flush()?;
        drop(inner);

        self.with_metrics(|m| m.wal_write(count, (count * WAL_FRAME_SIZE) as u64));
        Ok(())
    }

    fn confirm_transaction(&self, confirm: &HeaderPage, positions: &[PagePosition]) -> Result<()> {
        let mut inner = self.lock_inner()?;

        let header_position = inner.append_page(&confirm.to_page())?;
        inner.writer.flush()?;
        inner.file.sync_all()?;

        {
            let mut index = self
                .index
                .write()
                .map_err(|_| Error::LockPoisoned { lock_name: "wal.index".to_string() })?;
            for position in positions {
                index.insert(position.page_id, position.position);
            }
            index.insert(HEADER_PAGE_ID, header_position);
        }
        drop(inner);

        self.with_metrics(|m| {
            m.wal_write(1, WAL_FRAME_SIZE as u64);
            m.transaction_confirmed();
        });
        debug!(
            tx_id = confirm.pending_transaction.unwrap_or(0),
            pages = positions.len(),
            "confirmed transaction in WAL"
        );

        Ok(())
    }

    fn read_page(&self, position: u64) -> Result<Page> {
        let mut inner = self.lock_inner()?;
        inner.writer.flush()?;
        let frame = inner.read_frame(position)?;
        Page::from_bytes(&frame.page_data)
    }

    fn confirmed_position(&self, page_id: PageId) -> Option<u64> {
        self.index.read().ok().and_then(|index| index.get(&page_id).copied())
    }
}

impl WALInner {
    fn write_header(&mut self) -> Result<()> {
        let mut data = vec![0u8; WAL_HEADER_SIZE];

        data[0..4].copy_from_slice(&self.header.magic);
        data[4..8].copy_from_slice(&self.header.version.to_le_bytes());
        data[8..12].copy_from_slice(&self.header.salt1.to_le_bytes());
        data[12..16].copy_from_slice(&self.header.salt2.to_le_bytes());

        self.writer.flush()?;
        self.writer.get_mut().seek(SeekFrom::Start(0))?;
        self.writer.write_all(&data)?;
        self.file_position = data.len() as i64;

        self.writer.flush()?;
        self.file.sync_all()?;

        Ok(())
    }

    fn read_header(&mut self) -> Result<WALHeader> {
        let mut data = vec![0u8; WAL_HEADER_SIZE];

        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut data).map_err(|_| Error::WALCorrupted)?;
        self.file_position = -1;

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&data[0..4]);

        let header = WALHeader {
            magic,
            version: u32::from_le_bytes(data[4..8].try_into()?),
            salt1: u32::from_le_bytes(data[8..12].try_into()?),
            salt2: u32::from_le_bytes(data[12..16].try_into()?),
        };

        if header.magic != WAL_MAGIC {
            return Err(Error::WALCorrupted);
        }

        Ok(header)
    }

    fn append_page(&mut self, page: &Page) -> Result<u64> {
        let mut data = get_frame_buffer();
        page.serialize_into(&mut data[24..24 + PAGE_SIZE]);
        data[0..8].copy_from_slice(&page.transaction_id.to_le_bytes());
        data[8..16].copy_from_slice(&(page.page_id as u64).to_le_bytes());
        data[16..20].copy_from_slice(&self.header.salt1.to_le_bytes());
        data[20..24].copy_from_slice(&self.header.salt2.to_le_bytes());
        let checksum = frame_checksum(&data, self.header.salt1, self.header.salt2);
        data[24 + PAGE_SIZE..28 + PAGE_SIZE].copy_from_slice(&checksum.to_le_bytes());

        let position = self.frame_num;
        let offset = WAL_HEADER_SIZE as i64 + (position as i64 * WAL_FRAME_SIZE as i64);

        // Sequential appends skip the seek; anything else (reads, reopen) resets it
        if self.file_position != offset {
            self.writer.flush()?;
            self.writer.get_mut().seek(SeekFrom::Start(offset as u64))?;
        }

        let written = self.writer.write_all(&data);
        put_frame_buffer(data);
        written?;

        self.file_position = offset + WAL_FRAME_SIZE as i64;
        self.frame_num += 1;

        Ok(position)
    }

    fn read_frame(&mut self, position: u64) -> Result<WALFrame> {
        if position >= self.frame_num {
            return Err(Error::Other(format!("WAL position {} is past the end of the log", position)));
        }

        let offset = WAL_HEADER_SIZE as u64 + position * WAL_FRAME_SIZE as u64;
        self.file.seek(SeekFrom::Start(offset))?;

        let mut data = get_frame_buffer();
        let read = self.file.read_exact(&mut data);
        self.file_position = -1;
        if let Err(e) = read {
            put_frame_buffer(data);
            return Err(e.into());
        }

        let frame = parse_frame(&data);
        let expected = frame_checksum(&data, self.header.salt1, self.header.salt2);
        put_frame_buffer(data);
        let frame = frame?;

        if frame.checksum != expected || frame.salt1 != self.header.salt1 || frame.salt2 != self.header.salt2 {
            return Err(Error::WALChecksumFail);
        }

        Ok(frame)
    }

    /// Scans the log and rebuilds the confirmed-page index. Frames of
    /// transactions that never wrote a confirm record are ignored; the scan
    /// stops at the first torn or foreign frame. Everything after the last
    /// confirm frame is cut off.
    fn restore_index(&mut self) -> Result<HashMap<PageId, u64>> {
        let size = self.file.metadata()?.len();
        let max_frames = size.saturating_sub(WAL_HEADER_SIZE as u64) / WAL_FRAME_SIZE as u64;

        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        self.file_position = -1;

        let mut index = HashMap::new();
        let mut pending: HashMap<TransactionID, Vec<(PageId, u64)>> = HashMap::new();
        let mut valid_frames = 0u64;
        let mut confirmed_end = 0u64;
        let mut data = vec![0u8; WAL_FRAME_SIZE];

        {
            let mut reader = BufReader::with_capacity(WAL_BUFFER_SIZE, &mut self.file);
            for position in 0..max_frames {
                if reader.read_exact(&mut data).is_err() {
                    break;
                }
                let frame = match parse_frame(&data) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                if frame.salt1 != self.header.salt1 || frame.salt2 != self.header.salt2 {
                    break;
                }
                if frame.checksum != frame_checksum(&data, self.header.salt1, self.header.salt2) {
                    warn!(position, "WAL frame checksum mismatch, ignoring the rest of the log");
                    break;
                }

                self.max_transaction_id = self.max_transaction_id.max(frame.tx_id);
                if frame.is_confirm() {
                    if let Some(pages) = pending.remove(&frame.tx_id) {
                        index.extend(pages);
                    }
                    index.insert(HEADER_PAGE_ID, position);
                    confirmed_end = position + 1;
                } else {
                    pending.entry(frame.tx_id).or_default().push((frame.page_id, position));
                }
                valid_frames += 1;
            }
        }

        // Past the last confirm there are only torn writes and frames of
        // transactions that died before committing
        if valid_frames > confirmed_end {
            warn!(
                frames = valid_frames - confirmed_end,
                "discarding unconfirmed frames at the end of the WAL"
            );
        }
        if confirmed_end < max_frames || size > WAL_HEADER_SIZE as u64 + max_frames * WAL_FRAME_SIZE as u64 {
            self.file.set_len(WAL_HEADER_SIZE as u64 + confirmed_end * WAL_FRAME_SIZE as u64)?;
        }
        self.frame_num = confirmed_end;

        Ok(index)
    }
}

fn parse_frame(data: &[u8]) -> Result<WALFrame> {
    if data.len() < WAL_FRAME_SIZE {
        return Err(Error::WALCorrupted);
    }

    Ok(WALFrame {
        tx_id: u64::from_le_bytes(data[0..8].try_into()?),
        page_id: u64::from_le_bytes(data[8..16].try_into()?) as PageId,
        salt1: u32::from_le_bytes(data[16..20].try_into()?),
        salt2: u32::from_le_bytes(data[20..24].try_into()?),
        page_data: data[24..24 + PAGE_SIZE].to_vec(),
        checksum: u32::from_le_bytes(data[24 + PAGE_SIZE..28 + PAGE_SIZE].try_into()?),
    })
}

fn frame_checksum(data: &[u8], salt1: u32, salt2: u32) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[0..16]);
    hasher.update(&data[24..24 + PAGE_SIZE]);
    hasher.finalize() ^ salt1 ^ salt2
}

fn generate_salt() -> u32 {
    use std::time::SystemTime;
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(n) => n.subsec_nanos() ^ n.as_secs() as u32,
        Err(_) => 12345,
    }
}
