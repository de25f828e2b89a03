
use crate::core::constants::*;
use crate::core::errors::*;
use crate::core::page::{Page, PageType};
use crate::core::tx_pages::TransactionPages;
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

const HEADER_FIXED_SIZE: usize = 38;

/// The shared root of the database, stored at page 0.
///
/// `pending_transaction`/`is_confirmed` form the in-flight marker: a confirm
/// copy handed to the WAL carries the committing transaction's id with
/// `is_confirmed = true`, while the live header is always stable (`None`,
/// `false`) outside of a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderPage {
    pub pending_transaction: Option<TransactionID>,
    pub is_confirmed: bool,
    pub free_empty_page_list: PageId,
    pub last_page_id: PageId,
    pub last_transaction_id: TransactionID,
    pub creation_time: u64,
    collections: Vec<(String, PageId)>,
}

impl Default for HeaderPage {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderPage {
    pub fn new() -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            pending_transaction: None,
            is_confirmed: false,
            free_empty_page_list: NO_PAGE,
            last_page_id: HEADER_PAGE_ID,
            last_transaction_id: 0,
            creation_time,
            collections: Vec::new(),
        }
    }

    pub fn collection(&self, name: &str) -> Option<PageId> {
        self.collections
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|&(_, page_id)| page_id)
    }

    pub fn collections(&self) -> &[(String, PageId)] {
        &self.collections
    }

    /// Whether one more collection named `name` still fits in the header page,
    /// counting the ones `pending` will add.
    pub fn has_room_for(&self, name: &str, pending: &[(String, PageId)]) -> bool {
        let used: usize = self
            .collections
            .iter()
            .chain(pending.iter())
            .map(|(n, _)| 1 + n.len() + 4)
            .sum();
        HEADER_FIXED_SIZE + used + 1 + name.len() + 4 <= PAGE_PAYLOAD_SIZE
    }

    /// Stamps this (confirm) copy with the committing transaction, the new
    /// free-list head and whatever the ledger changes in the catalog.
    pub fn update(&mut self, transaction_id: TransactionID, free_empty_page_id: PageId, pages: &TransactionPages) {
        self.mark_confirmed(transaction_id, free_empty_page_id);

        for (name, page_id) in pages.new_collections() {
            if self.collection(name).is_none() {
                self.collections.push((name.clone(), *page_id));
            }
        }
    }

    pub fn mark_confirmed(&mut self, transaction_id: TransactionID, free_empty_page_id: PageId) {
        self.pending_transaction = Some(transaction_id);
        self.is_confirmed = true;
        self.free_empty_page_list = free_empty_page_id;
        self.last_transaction_id = self.last_transaction_id.max(transaction_id);
    }

    /// Adopts a confirmed copy as the live state and clears the in-flight marker.
    pub fn mark_stable(&mut self, confirm: &HeaderPage) {
        *self = confirm.clone();
        self.pending_transaction = None;
        self.is_confirmed = false;
    }

    pub fn to_page(&self) -> Page {
        let mut page = Page::new(HEADER_PAGE_ID, PageType::Header);
        page.transaction_id = self.pending_transaction.unwrap_or(0);
        page.is_confirmed = self.is_confirmed;

        let buf = page.payload_mut();
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..12].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        buf[12..16].copy_from_slice(&self.free_empty_page_list.to_le_bytes());
        buf[16..20].copy_from_slice(&self.last_page_id.to_le_bytes());
        buf[20..28].copy_from_slice(&self.last_transaction_id.to_le_bytes());
        buf[28..36].copy_from_slice(&self.creation_time.to_le_bytes());
        buf[36..38].copy_from_slice(&(self.collections.len() as u16).to_le_bytes());

        let mut offset = HEADER_FIXED_SIZE;
        for (name, page_id) in &self.collections {
            let entry_len = 1 + name.len() + 4;
            if offset + entry_len > PAGE_PAYLOAD_SIZE {
                break;
            }
            buf[offset] = name.len() as u8;
            offset += 1;
            buf[offset..offset + name.len()].copy_from_slice(name.as_bytes());
            offset += name.len();
            buf[offset..offset + 4].copy_from_slice(&page_id.to_le_bytes());
            offset += 4;
        }

        page.clear_dirty();
        page
    }

    pub fn from_page(page: &Page) -> Result<Self> {
        if page.page_type != PageType::Header {
            return Err(Error::DataCorruption {
                details: format!("page {} is not a header page ({:?})", page.page_id, page.page_type),
            });
        }

        let data = page.payload();

        if data[0..4] != MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = u32::from_le_bytes(data[4..8].try_into()?);
        if version != VERSION {
            return Err(Error::InvalidVersion);
        }

        let page_size = u32::from_le_bytes(data[8..12].try_into()?);
        if page_size != PAGE_SIZE as u32 {
            return Err(Error::InvalidPageSize);
        }

        let free_empty_page_list = u32::from_le_bytes(data[12..16].try_into()?);
        let last_page_id = u32::from_le_bytes(data[16..20].try_into()?);
        let last_transaction_id = u64::from_le_bytes(data[20..28].try_into()?);
        let creation_time = u64::from_le_bytes(data[28..36].try_into()?);
        let count = u16::from_le_bytes(data[36..38].try_into()?) as usize;

        let mut collections = Vec::with_capacity(count);
        let mut offset = HEADER_FIXED_SIZE;
        for _ in 0..count {
            let name_len = *data.get(offset).ok_or_else(|| Error::DataCorruption {
                details: "collection catalog truncated".to_string(),
            })? as usize;
            offset += 1;
            if offset + name_len + 4 > data.len() {
                return Err(Error::DataCorruption {
                    details: "collection catalog truncated".to_string(),
                });
            }
            let name = std::str::from_utf8(&data[offset..offset + name_len])
                .map_err(|_| Error::DataCorruption {
                    details: "collection name is not valid UTF-8".to_string(),
                })?
                .to_string();
            offset += name_len;
            let page_id = u32::from_le_bytes(data[offset..offset + 4].try_into()?);
            offset += 4;
            collections.push((name, page_id));
        }

        let header = Self {
            pending_transaction: if page.transaction_id == 0 { None } else { Some(page.transaction_id) },
            is_confirmed: page.is_confirmed,
            free_empty_page_list,
            last_page_id,
            last_transaction_id,
            creation_time,
            collections,
        };
        header.validate()?;

        Ok(header)
    }

    /// Structural checks on a header read back from storage.
    pub fn validate(&self) -> Result<()> {
        if self.free_empty_page_list != NO_PAGE {
            if self.free_empty_page_list == HEADER_PAGE_ID {
                return Err(Error::DataCorruption {
                    details: "free list head points at the header page".to_string(),
                });
            }
            if self.free_empty_page_list > self.last_page_id {
                return Err(Error::DataCorruption {
                    details: format!(
                        "free list head {} is beyond last page {}",
                        self.free_empty_page_list, self.last_page_id
                    ),
                });
            }
        }

        let mut seen = HashSet::new();
        for (name, page_id) in &self.collections {
            if *page_id == HEADER_PAGE_ID || *page_id > self.last_page_id {
                return Err(Error::DataCorruption {
                    details: format!("collection '{}' has invalid page {}", name, page_id),
                });
            }
            if !seen.insert(name.to_lowercase()) {
                return Err(Error::DataCorruption {
                    details: format!("collection '{}' listed twice", name),
                });
            }
        }

        Ok(())
    }
}

/// Exclusive-access handle around the one live header of a database.
#[derive(Debug)]
pub struct SharedHeader {
    inner: Mutex<HeaderPage>,
}

impl SharedHeader {
    pub fn new(header: HeaderPage) -> Self {
        Self {
            inner: Mutex::new(header),
        }
    }

    /// Acquires the header lock. Every commit-visibility change happens
    /// while this guard is held.
    pub fn lock(&self) -> Result<MutexGuard<'_, HeaderPage>> {
        self.inner
            .lock()
            .map_err(|_| Error::LockPoisoned { lock_name: "header".to_string() })
    }

    /// Point-in-time copy for readers.
    pub fn snapshot(&self) -> Result<HeaderPage> {
        Ok(self.lock()?.clone())
    }
}
