
use crate::core::buffer_pool::get_page_buffer;
use crate::core::constants::*;
use crate::core::errors::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PageType {
    Empty = 0,
    Header = 1,
    Collection = 2,
    Data = 3,
    Index = 4,
}

impl PageType {
    pub fn from_u8(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PageType::Empty),
            1 => Ok(PageType::Header),
            2 => Ok(PageType::Collection),
            3 => Ok(PageType::Data),
            4 => Ok(PageType::Index),
            other => Err(Error::InvalidPageType(other)),
        }
    }
}

/// A fixed-size page image.
///
/// Layout (little-endian): `page_id u32 | page_type u8 | prev_page_id u32 |
/// next_page_id u32 | transaction_id u64 | is_confirmed u8 | reserved`,
/// then `PAGE_PAYLOAD_SIZE` bytes of payload owned by whoever uses the page.
/// The dirty flag is never serialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub page_id: PageId,
    pub page_type: PageType,
    pub prev_page_id: PageId,
    pub next_page_id: PageId,
    pub transaction_id: TransactionID,
    pub is_confirmed: bool,
    dirty: bool,
    payload: Vec<u8>,
}

impl Page {
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_id,
            page_type,
            prev_page_id: NO_PAGE,
            next_page_id: NO_PAGE,
            transaction_id: 0,
            is_confirmed: false,
            dirty: false,
            payload: vec![0u8; PAGE_PAYLOAD_SIZE],
        }
    }

    /// An empty-page record, as stored on the free list.
    pub fn empty(page_id: PageId) -> Self {
        Self::new(page_id, PageType::Empty)
    }

    /// Turns this page into an empty record linked to `next_page_id`,
    /// discarding its payload.
    pub fn reset_to_empty(&mut self, next_page_id: PageId) {
        self.page_type = PageType::Empty;
        self.prev_page_id = NO_PAGE;
        self.next_page_id = next_page_id;
        self.payload.fill(0);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.payload
    }

    /// Copies `data` into the payload at `offset`.
    pub fn write_payload(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset.checked_add(data.len()).ok_or(Error::InvalidPageSize)?;
        if end > PAGE_PAYLOAD_SIZE {
            return Err(Error::InvalidPageSize);
        }
        self.payload[offset..end].copy_from_slice(data);
        self.dirty = true;
        Ok(())
    }

    /// Serializes into a pooled `PAGE_SIZE` buffer. Hand it back with
    /// `put_page_buffer` once written.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = get_page_buffer();
        self.serialize_into(&mut buf);
        buf
    }

    pub fn serialize_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4] = self.page_type as u8;
        buf[5..9].copy_from_slice(&self.prev_page_id.to_le_bytes());
        buf[9..13].copy_from_slice(&self.next_page_id.to_le_bytes());
        buf[13..21].copy_from_slice(&self.transaction_id.to_le_bytes());
        buf[21] = self.is_confirmed as u8;
        buf[22..PAGE_HEADER_SIZE].fill(0);
        buf[PAGE_HEADER_SIZE..PAGE_SIZE].copy_from_slice(&self.payload);
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PAGE_SIZE {
            return Err(Error::InvalidPageSize);
        }

        Ok(Self {
            page_id: u32::from_le_bytes(data[0..4].try_into()?),
            page_type: PageType::from_u8(data[4])?,
            prev_page_id: u32::from_le_bytes(data[5..9].try_into()?),
            next_page_id: u32::from_le_bytes(data[9..13].try_into()?),
            transaction_id: u64::from_le_bytes(data[13..21].try_into()?),
            is_confirmed: data[21] != 0,
            dirty: false,
            payload: data[PAGE_HEADER_SIZE..PAGE_SIZE].to_vec(),
        })
    }
}
