//! Navigation of a memory-mapped Bolt database.
//!
//! [`Db::open`] maps the file read-only and validates the meta pages;
//! [`Db::view`] scopes every read to a transaction that is released on
//! all exit paths.  [`MetadataStore`] layers the containerd namespace
//! index on top and owns the long-lived handle.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use log::debug;
use memmap2::Mmap;
use thiserror::Error;
use zerocopy::FromBytes;

use super::format::{
    BranchElement, BucketHeader, LeafElement, Meta, PageHeader, BRANCH_ELEMENT_SIZE,
    LEAF_ELEMENT_SIZE, LEAF_FLAG_BUCKET, PAGE_FLAG_BRANCH, PAGE_FLAG_LEAF, PAGE_HEADER_SIZE,
};

/// Top-level bucket holding one sub-bucket per containerd namespace.
const VERSION_BUCKET: &[u8] = b"v1";

/// A B+tree deeper than this is not a database we want to keep reading.
const MAX_TREE_DEPTH: usize = 100;

/// Metadata store lifecycle and format errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("metadata store unavailable: {}: {reason}", .path.display())]
    Unavailable { path: PathBuf, reason: String },
    #[error("metadata store corrupt: {0}")]
    Corrupt(String),
    #[error("metadata store is closed")]
    Closed,
}

fn corrupt(reason: &str) -> StoreError {
    StoreError::Corrupt(reason.to_string())
}

/// Page lookup over the raw mapping.  The data never outlives the mmap
/// held by [`Db`].
#[derive(Clone, Copy)]
struct Pages<'a> {
    data: &'a [u8],
    page_size: usize,
}

impl<'a> Pages<'a> {
    /// Return the full span of a page, including its overflow pages.
    fn page(&self, id: u64) -> Result<&'a [u8], StoreError> {
        let start = (id as usize)
            .checked_mul(self.page_size)
            .ok_or_else(|| corrupt("page id out of range"))?;
        let header_bytes = self
            .data
            .get(start..)
            .ok_or_else(|| corrupt("page offset past end of file"))?;
        let (header, _) = PageHeader::ref_from_prefix(header_bytes)
            .map_err(|_| corrupt("truncated page header"))?;
        let span = self.page_size * (1 + header.overflow.get() as usize);
        self.data
            .get(start..start + span)
            .ok_or_else(|| corrupt("page overflow past end of file"))
    }
}

fn page_header(page: &[u8]) -> Result<&PageHeader, StoreError> {
    Ok(PageHeader::ref_from_prefix(page)
        .map_err(|_| corrupt("truncated page header"))?
        .0)
}

/// Leaf element `index` of `page`, with its key and value slices.
fn leaf_element(page: &[u8], index: usize) -> Result<(&LeafElement, &[u8], &[u8]), StoreError> {
    let base = PAGE_HEADER_SIZE + index * LEAF_ELEMENT_SIZE;
    let bytes = page
        .get(base..)
        .ok_or_else(|| corrupt("leaf element out of range"))?;
    let (elem, _) =
        LeafElement::ref_from_prefix(bytes).map_err(|_| corrupt("truncated leaf element"))?;
    // pos is relative to the element's own offset in the page
    let kstart = base + elem.pos.get() as usize;
    let kend = kstart + elem.ksize.get() as usize;
    let vend = kend + elem.vsize.get() as usize;
    let key = page
        .get(kstart..kend)
        .ok_or_else(|| corrupt("leaf key out of range"))?;
    let value = page
        .get(kend..vend)
        .ok_or_else(|| corrupt("leaf value out of range"))?;
    Ok((elem, key, value))
}

/// Branch element `index` of `page`, with the smallest key of its subtree.
fn branch_element(page: &[u8], index: usize) -> Result<(&BranchElement, &[u8]), StoreError> {
    let base = PAGE_HEADER_SIZE + index * BRANCH_ELEMENT_SIZE;
    let bytes = page
        .get(base..)
        .ok_or_else(|| corrupt("branch element out of range"))?;
    let (elem, _) =
        BranchElement::ref_from_prefix(bytes).map_err(|_| corrupt("truncated branch element"))?;
    let kstart = base + elem.pos.get() as usize;
    let kend = kstart + elem.ksize.get() as usize;
    let key = page
        .get(kstart..kend)
        .ok_or_else(|| corrupt("branch key out of range"))?;
    Ok((elem, key))
}

/// Where a bucket's tree lives: a real page, or bytes embedded inline in
/// the parent bucket's value.
#[derive(Clone, Copy)]
enum BucketRoot<'a> {
    Paged(u64),
    Inline(&'a [u8]),
}

/// A read-only view of one bucket within a transaction.
pub struct Bucket<'a> {
    pages: Pages<'a>,
    root: BucketRoot<'a>,
}

impl<'a> Bucket<'a> {
    fn root_page(&self) -> Result<&'a [u8], StoreError> {
        match self.root {
            BucketRoot::Paged(id) => self.pages.page(id),
            BucketRoot::Inline(bytes) => Ok(bytes),
        }
    }

    fn open_nested(&self, value: &'a [u8]) -> Result<Bucket<'a>, StoreError> {
        let (header, inline) = BucketHeader::ref_from_prefix(value)
            .map_err(|_| corrupt("truncated bucket header"))?;
        let root = match header.root.get() {
            0 => BucketRoot::Inline(inline),
            id => BucketRoot::Paged(id),
        };
        Ok(Bucket {
            pages: self.pages,
            root,
        })
    }

    /// Look up `key`, returning the leaf element flags and value.
    fn get_raw(&self, key: &[u8]) -> Result<Option<(u32, &'a [u8])>, StoreError> {
        let mut page = self.root_page()?;
        for _ in 0..MAX_TREE_DEPTH {
            let header = page_header(page)?;
            let count = header.count.get() as usize;
            if header.flags.get() & PAGE_FLAG_LEAF != 0 {
                for index in 0..count {
                    let (elem, k, v) = leaf_element(page, index)?;
                    if k == key {
                        return Ok(Some((elem.flags.get(), v)));
                    }
                }
                return Ok(None);
            }
            if header.flags.get() & PAGE_FLAG_BRANCH == 0 {
                return Err(corrupt("unexpected page type in bucket tree"));
            }
            if count == 0 {
                return Err(corrupt("empty branch page"));
            }
            // Descend into the last child whose smallest key is <= the
            // target; keys below the first child still belong to it.
            let mut child = branch_element(page, 0)?.0.pgid.get();
            for index in 1..count {
                let (elem, k) = branch_element(page, index)?;
                if k <= key {
                    child = elem.pgid.get();
                } else {
                    break;
                }
            }
            page = self.pages.page(child)?;
        }
        Err(corrupt("bucket tree depth limit exceeded"))
    }

    /// Open the nested bucket stored under `name`, if present.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'a>>, StoreError> {
        match self.get_raw(name)? {
            Some((flags, value)) if flags & LEAF_FLAG_BUCKET != 0 => {
                Ok(Some(self.open_nested(value)?))
            }
            _ => Ok(None),
        }
    }

    /// Names of every nested bucket, in stored (byte) order.
    pub fn sub_bucket_names(&self) -> Result<Vec<Vec<u8>>, StoreError> {
        let mut names = Vec::new();
        self.collect_sub_buckets(self.root_page()?, 0, &mut names)?;
        Ok(names)
    }

    fn collect_sub_buckets(
        &self,
        page: &'a [u8],
        depth: usize,
        names: &mut Vec<Vec<u8>>,
    ) -> Result<(), StoreError> {
        if depth > MAX_TREE_DEPTH {
            return Err(corrupt("bucket tree depth limit exceeded"));
        }
        let header = page_header(page)?;
        let count = header.count.get() as usize;
        if header.flags.get() & PAGE_FLAG_LEAF != 0 {
            for index in 0..count {
                let (elem, key, _) = leaf_element(page, index)?;
                if elem.flags.get() & LEAF_FLAG_BUCKET != 0 {
                    names.push(key.to_vec());
                }
            }
        } else if header.flags.get() & PAGE_FLAG_BRANCH != 0 {
            for index in 0..count {
                let (elem, _) = branch_element(page, index)?;
                let child = self.pages.page(elem.pgid.get())?;
                self.collect_sub_buckets(child, depth + 1, names)?;
            }
        } else {
            return Err(corrupt("unexpected page type in bucket tree"));
        }
        Ok(())
    }
}

/// One read transaction.  Borrowing from the mapping ties every slice
/// handed out to the transaction scope.
pub struct Tx<'db> {
    pages: Pages<'db>,
    root: BucketHeader,
}

impl<'db> Tx<'db> {
    /// The database's top-level bucket.
    pub fn root_bucket(&self) -> Bucket<'db> {
        Bucket {
            pages: self.pages,
            root: BucketRoot::Paged(self.root.root.get()),
        }
    }

    /// Shorthand for a top-level bucket lookup.
    pub fn bucket(&self, name: &[u8]) -> Result<Option<Bucket<'db>>, StoreError> {
        self.root_bucket().bucket(name)
    }
}

/// A read-only, memory-mapped Bolt database file.
#[derive(Debug)]
pub struct Db {
    map: Mmap,
    page_size: usize,
    root: BucketHeader,
    path: PathBuf,
}

impl Db {
    /// Open `path` strictly read-only.  Any validation failure is
    /// [`StoreError::Unavailable`]; a non-database file must never
    /// panic.
    pub fn open(path: impl AsRef<Path>) -> Result<Db, StoreError> {
        let path = path.as_ref();
        let unavailable = |reason: String| StoreError::Unavailable {
            path: path.to_owned(),
            reason,
        };

        let file = File::open(path).map_err(|e| unavailable(e.to_string()))?;
        // Safety: the mapping is private and read-only; the contract of
        // this crate is that the file is a quiesced copy, not shared
        // with a live daemon.
        let map = unsafe { Mmap::map(&file) }.map_err(|e| unavailable(e.to_string()))?;

        let meta = Self::select_meta(&map)
            .ok_or_else(|| unavailable("no valid bolt meta page".to_string()))?;
        let page_size = meta.page_size.get() as usize;
        if page_size < PAGE_HEADER_SIZE {
            return Err(unavailable(format!("implausible page size {page_size}")));
        }

        debug!(
            "opened metadata store {} (page size {}, txid {})",
            path.display(),
            page_size,
            meta.txid.get()
        );

        Ok(Db {
            map,
            page_size,
            root: meta.root,
            path: path.to_owned(),
        })
    }

    fn meta_at(data: &[u8], offset: usize) -> Option<Meta> {
        let bytes = data.get(offset + PAGE_HEADER_SIZE..)?;
        let (meta, _) = Meta::ref_from_prefix(bytes).ok()?;
        meta.is_valid().then_some(*meta)
    }

    /// Both meta pages are candidates; the valid one with the highest
    /// transaction id describes the last committed state.
    fn select_meta(data: &[u8]) -> Option<Meta> {
        let meta0 = Self::meta_at(data, 0);
        let page_size = meta0.map_or(4096, |m| m.page_size.get() as usize);
        let meta1 = Self::meta_at(data, page_size);
        match (meta0, meta1) {
            (Some(a), Some(b)) => Some(if b.txid.get() > a.txid.get() { b } else { a }),
            (a, b) => a.or(b),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` inside a read transaction.  The transaction borrows the
    /// mapping and is released when this call returns, on success and
    /// on error alike.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let tx = Tx {
            pages: Pages {
                data: &self.map,
                page_size: self.page_size,
            },
            root: self.root,
        };
        f(&tx)
    }
}

/// The explorer's long-lived handle on the metadata database.
///
/// Opened once at construction and closed once at shutdown; every
/// operation after [`close`](Self::close) fails with
/// [`StoreError::Closed`].
#[derive(Debug)]
pub struct MetadataStore {
    db: Option<Db>,
}

impl MetadataStore {
    pub fn open(path: impl AsRef<Path>) -> Result<MetadataStore, StoreError> {
        Ok(MetadataStore {
            db: Some(Db::open(path)?),
        })
    }

    fn db(&self) -> Result<&Db, StoreError> {
        self.db.as_ref().ok_or(StoreError::Closed)
    }

    /// Every namespace name in the store's namespace index, in stored
    /// order.  Executes as a single read transaction.
    pub fn list_namespaces(&self) -> Result<Vec<String>, StoreError> {
        self.db()?.view(|tx| {
            let Some(index) = tx.bucket(VERSION_BUCKET)? else {
                debug!("metadata store has no namespace index");
                return Ok(Vec::new());
            };
            let mut namespaces = Vec::new();
            for name in index.sub_bucket_names()? {
                let name = String::from_utf8(name)
                    .map_err(|_| corrupt("namespace name is not valid UTF-8"))?;
                namespaces.push(name);
            }
            Ok(namespaces)
        })
    }

    /// Release the underlying file handle.  Idempotent.
    pub fn close(&mut self) {
        if let Some(db) = self.db.take() {
            debug!("closing metadata store {}", db.path().display());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.db.is_none()
    }
}
