//! The disseminated object: page table, version bookkeeping and storage.
//!
//! Page `n` lives at `n * page_size` in storage. A page is complete once
//! every packet bit is set; `current_rx_page` always names the lowest
//! incomplete page.

use std::collections::TryReserveError;
use std::io;
use std::time::Instant;

use deluge_core::{crc16, Geometry};

use crate::error::DelugeError;
use crate::storage::{read_at, storage_len, write_at, Storage};

/// `Page::flags` bit: every packet received and written to storage.
pub const PAGE_COMPLETE: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Version at which this page was last completed, or the version
    /// being fetched while incomplete.
    pub version: u8,
    /// One bit per received packet.
    pub packet_set: u8,
    /// CRC-16 of the page contents once complete.
    pub crc: u16,
    pub flags: u8,
    /// Last time a neighbour asked us for this page. `None` = never.
    pub last_request: Option<Instant>,
    /// Last time we received data for this page. `None` = never.
    pub last_data: Option<Instant>,
}

impl Page {
    fn missing(version: u8) -> Self {
        Self {
            version,
            packet_set: 0,
            crc: 0,
            flags: 0,
            last_request: None,
            last_data: None,
        }
    }

    fn seeded(version: u8, all_packets: u8, crc: u16) -> Self {
        Self {
            version,
            packet_set: all_packets,
            crc,
            flags: PAGE_COMPLETE,
            last_request: None,
            last_data: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.flags & PAGE_COMPLETE != 0
    }

    /// Forget the contents so the page is fetched again at `version`.
    fn invalidate(&mut self, version: u8) {
        self.packet_set = 0;
        self.flags &= !PAGE_COMPLETE;
        self.version = version;
    }
}

pub struct DisseminationObject<S> {
    filename: String,
    object_id: u8,
    size: u64,
    geometry: Geometry,
    storage: S,
    pub(crate) version: u8,
    pub(crate) update_version: u8,
    pub(crate) current_rx_page: usize,
    pub(crate) current_tx_page: Option<usize>,
    pub(crate) tx_set: u8,
    pub(crate) nrequests: u8,
    pub(crate) pages: Vec<Page>,
    /// Assembly buffer for `current_rx_page`.
    pub(crate) rx_buffer: Vec<u8>,
    page_writes: u64,
}

impl<S: Storage> DisseminationObject<S> {
    /// Wrap storage that already holds the complete object at `version`.
    pub fn seeded(
        mut storage: S,
        filename: impl Into<String>,
        object_id: u8,
        version: u8,
        geometry: Geometry,
    ) -> Result<Self, DelugeError> {
        let size = storage_len(&mut storage)?;
        let max = geometry.max_object_size();
        if size > max {
            return Err(DelugeError::ObjectTooLarge { size, max });
        }

        let mut object = Self::with_storage(storage, filename.into(), object_id, geometry);
        object.size = size;
        object.version = version;
        object.update_version = version;

        let count = geometry.page_count(size);
        let mut pages = Vec::with_capacity(count);
        for n in 0..count {
            let data = object.read_page(n)?;
            pages.push(Page::seeded(version, geometry.all_packets(), crc16(&data)));
        }
        object.pages = pages;
        object.current_rx_page = count;

        tracing::debug!(
            filename = %object.filename,
            size,
            pages = count,
            version,
            "seeded object"
        );
        Ok(object)
    }

    /// A node that has nothing yet; its layout arrives with the first profile.
    pub fn empty(
        storage: S,
        filename: impl Into<String>,
        object_id: u8,
        geometry: Geometry,
    ) -> Self {
        Self::with_storage(storage, filename.into(), object_id, geometry)
    }

    fn with_storage(storage: S, filename: String, object_id: u8, geometry: Geometry) -> Self {
        Self {
            filename,
            object_id,
            size: 0,
            geometry,
            storage,
            version: 0,
            update_version: 0,
            current_rx_page: 0,
            current_tx_page: None,
            tx_set: 0,
            nrequests: 0,
            pages: Vec::new(),
            rx_buffer: vec![0; geometry.page_size()],
            page_writes: 0,
        }
    }

    // ── Storage ──────────────────────────────────────────────────────────────

    /// Read one page. A short final page is zero-padded to the page size.
    pub fn read_page(&mut self, page: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; self.geometry.page_size()];
        read_at(&mut self.storage, self.geometry.page_offset(page), &mut buf)?;
        Ok(buf)
    }

    pub fn write_page(&mut self, page: usize, data: &[u8]) -> io::Result<()> {
        write_at(&mut self.storage, self.geometry.page_offset(page), data)?;
        self.page_writes += 1;
        Ok(())
    }

    // ── Page table ───────────────────────────────────────────────────────────

    /// Index of the first incomplete page; `page_count()` when all are complete.
    pub fn highest_available_page(&self) -> usize {
        self.pages
            .iter()
            .position(|p| !p.is_complete())
            .unwrap_or(self.pages.len())
    }

    /// Per-page versions, as carried in a profile.
    pub fn version_vector(&self) -> Vec<u8> {
        self.pages.iter().map(|p| p.version).collect()
    }

    /// Merge a newer profile into the page table.
    ///
    /// Pages whose advertised version is newer than ours are invalidated,
    /// pages beyond our old count are added incomplete at their advertised
    /// version, and surplus pages are dropped. A partially received page
    /// that keeps its version keeps its packets. Capacity is reserved before
    /// anything changes, so on failure the table is untouched.
    pub(crate) fn apply_version_vector(&mut self, vector: &[u8]) -> Result<(), TryReserveError> {
        let old = self.pages.len();
        if vector.len() > old {
            self.pages.try_reserve(vector.len() - old)?;
        }

        for (page, &incoming) in self.pages.iter_mut().zip(vector) {
            if incoming > page.version {
                page.invalidate(incoming);
            }
        }
        for &incoming in vector.iter().skip(old) {
            self.pages.push(Page::missing(incoming));
        }
        self.pages.truncate(vector.len());

        self.size = self.geometry.page_offset(vector.len());
        self.current_rx_page = self.highest_available_page();

        // Only the page being assembled has its packets in `rx_buffer`.
        let rx = self.current_rx_page;
        for (i, page) in self.pages.iter_mut().enumerate() {
            if i != rx && !page.is_complete() {
                page.packet_set = 0;
            }
        }
        if self.pages.get(rx).map_or(true, |p| p.packet_set == 0) {
            self.rx_buffer.fill(0);
        }
        Ok(())
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn object_id(&self) -> u8 {
        self.object_id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn version(&self) -> u8 {
        self.version
    }

    pub fn update_version(&self) -> u8 {
        self.update_version
    }

    pub fn current_rx_page(&self) -> usize {
        self.current_rx_page
    }

    pub fn current_tx_page(&self) -> Option<usize> {
        self.current_tx_page
    }

    pub fn tx_set(&self) -> u8 {
        self.tx_set
    }

    pub fn nrequests(&self) -> u8 {
        self.nrequests
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    /// Number of page writes issued to storage since creation.
    pub fn page_writes(&self) -> u64 {
        self.page_writes
    }

    /// Every page complete and no update pending.
    pub fn is_complete(&self) -> bool {
        self.version == self.update_version && self.pages.iter().all(Page::is_complete)
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn into_storage(self) -> S {
        self.storage
    }
}
