use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

/// Size in bytes of the fixed header: 256 `(table_pos, table_slots)` entries.
pub const HEADER_SIZE: u32 = 2048;

/// Number of hash tables in every database file.
pub const TABLE_COUNT: usize = 256;

/// Size in bytes of one `(u32, u32)` pair. Header entries, table slots and
/// record headers all share this shape.
pub(crate) const PAIR_SIZE: u32 = 8;

/// Decodes an 8-byte little-endian `(u32, u32)` pair.
pub(crate) fn unpack_pair(buf: &[u8]) -> (u32, u32) {
    (
        LittleEndian::read_u32(&buf[..4]),
        LittleEndian::read_u32(&buf[4..8]),
    )
}

/// Encodes an 8-byte little-endian `(u32, u32)` pair into the front of `buf`.
pub(crate) fn pack_pair(buf: &mut [u8], first: u32, second: u32) {
    LittleEndian::write_u32(&mut buf[..4], first);
    LittleEndian::write_u32(&mut buf[4..8], second);
}

/// Summary returned by [`ConstDbBuilder::finish`](crate::ConstDbBuilder::finish).
#[derive(Debug, Serialize, Default)]
pub struct ConstDbInfo {
    /// Final size of the published file in bytes.
    pub file_length: u64,
    /// Number of records written.
    pub entry_count: u64,
    /// Offset at which the hash tables begin (end of the record region).
    pub index_offset: u64,
    /// Combined size of the 256 hash tables in bytes.
    pub index_length: u64,
    /// Number of tables that ended up with zero slots.
    pub empty_tables: usize,
}
