//! Bolt on-disk format definitions.
//!
//! The structures below mirror bbolt's page layout: a fixed 16-byte page
//! header, meta pages at page ids 0 and 1, and branch/leaf pages whose
//! element arrays point at keys and values stored later in the same
//! page.  All integers are little-endian.  The format is externally
//! defined; nothing here is ever written back to disk by this crate.

use core::mem::size_of;

use zerocopy::{
    little_endian::{U16, U32, U64},
    FromBytes, Immutable, IntoBytes, KnownLayout,
};

/// bbolt magic number, stored in each meta page.
pub const MAGIC: u32 = 0xED0C_DAED;
/// The only data-format version this reader understands.
pub const VERSION: u32 = 2;

pub const PAGE_FLAG_BRANCH: u16 = 0x01;
pub const PAGE_FLAG_LEAF: u16 = 0x02;
pub const PAGE_FLAG_META: u16 = 0x04;
pub const PAGE_FLAG_FREELIST: u16 = 0x10;

/// Leaf element flag marking the value as a nested bucket.
pub const LEAF_FLAG_BUCKET: u32 = 0x01;

pub const PAGE_HEADER_SIZE: usize = size_of::<PageHeader>();
pub const META_SIZE: usize = size_of::<Meta>();
pub const BUCKET_HEADER_SIZE: usize = size_of::<BucketHeader>();
pub const BRANCH_ELEMENT_SIZE: usize = size_of::<BranchElement>();
pub const LEAF_ELEMENT_SIZE: usize = size_of::<LeafElement>();

/// Common header at the start of every page.  A page may spill into
/// `overflow` additional pages directly following it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct PageHeader {
    pub id: U64,
    pub flags: U16,
    pub count: U16,
    pub overflow: U32,
}

/// Root of a bucket's B+tree.  `root == 0` means the bucket is inline:
/// its single leaf page is embedded right after this header in the
/// parent's value bytes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct BucketHeader {
    pub root: U64,
    pub sequence: U64,
}

/// Meta page body, stored after the page header on pages 0 and 1.  The
/// valid meta with the highest transaction id wins.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct Meta {
    pub magic: U32,
    pub version: U32,
    pub page_size: U32,
    pub flags: U32,
    pub root: BucketHeader,
    pub freelist: U64,
    pub pgid: U64,
    pub txid: U64,
    pub checksum: U64,
}

/// Branch page element: a child page id plus the smallest key stored
/// under it.  `pos` is relative to the element's own offset in the page.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct BranchElement {
    pub pos: U32,
    pub ksize: U32,
    pub pgid: U64,
}

/// Leaf page element: a key/value pair, or a nested bucket when
/// `flags` has [`LEAF_FLAG_BUCKET`] set.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, Immutable, IntoBytes, KnownLayout)]
pub struct LeafElement {
    pub flags: U32,
    pub pos: U32,
    pub ksize: U32,
    pub vsize: U32,
}

impl Meta {
    /// FNV-1a checksum over everything before the checksum field, as
    /// computed by bbolt.
    pub fn compute_checksum(&self) -> u64 {
        fnv1a(&self.as_bytes()[..META_SIZE - size_of::<U64>()])
    }

    pub fn is_valid(&self) -> bool {
        self.magic.get() == MAGIC
            && self.version.get() == VERSION
            && self.checksum.get() == self.compute_checksum()
    }
}

/// 64-bit FNV-1a, matching Go's hash/fnv.
pub fn fnv1a(data: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}
