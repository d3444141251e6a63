use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};

use crate::format::{pack_pair, ConstDbInfo, HEADER_SIZE, PAIR_SIZE, TABLE_COUNT};
use crate::{hash, Error, Result};

/// Configuration for [`ConstDbBuilder`].
#[derive(Debug, Clone)]
pub struct BuildOptions {
    buffer_size: usize,
    sync: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            buffer_size: 1 << 20, // 1 MiB
            sync: true,
        }
    }
}

impl BuildOptions {
    /// Adjusts the capacity of the buffered writer used while streaming
    /// records to the temporary file.
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Controls whether [`finish`](ConstDbBuilder::finish) fsyncs before the
    /// publishing rename. On by default; disabling it leaves durability of
    /// the published file to the environment.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }
}

/// One `(hash, record position)` pair per inserted record, in insertion
/// order. Also the working shape of a table slot, where `pos == 0` marks an
/// empty slot.
#[derive(Debug, Default, Clone, Copy)]
struct HashPos {
    hash: u32,
    pos: u32,
}

/// Streams records into a temporary file and publishes a constant database
/// atomically.
///
/// Records are appended one at a time with [`insert`](Self::insert);
/// [`finish`](Self::finish) computes the 256 hash tables in a single pass
/// over the accumulated `(hash, position)` pairs, patches the header and
/// renames the temporary file over the final path, so readers only ever
/// observe a complete database. A failure at any point leaves the final path
/// untouched; the temporary file stays behind for the environment to clean
/// up, as it does when a builder is dropped without finishing.
///
/// # Examples
///
/// ```
/// use constdb::ConstDbBuilder;
///
/// # fn main() -> constdb::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let mut builder = ConstDbBuilder::create(dir.path().join("numbers.cdb"))?;
/// builder.insert(b"one", b"1")?;
/// builder.insert(b"two", b"2")?;
/// let info = builder.finish()?;
/// assert_eq!(info.entry_count, 2);
/// # Ok(())
/// # }
/// ```
pub struct ConstDbBuilder {
    file: BufWriter<File>,
    final_path: PathBuf,
    temp_path: PathBuf,
    entries: Vec<HashPos>,
    pos: u32,
    sync: bool,
}

impl ConstDbBuilder {
    /// Creates a builder writing to `<path>.tmp` until published at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut temp = path.as_os_str().to_os_string();
        temp.push(".tmp");
        Self::with_options(path, PathBuf::from(temp), BuildOptions::default())
    }

    /// Creates a builder with an explicit temporary path.
    ///
    /// The temporary path must live on the same filesystem as `path` for the
    /// publishing rename to be atomic.
    pub fn new<P, Q>(path: P, temp_path: Q) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        Self::with_options(path, temp_path, BuildOptions::default())
    }

    /// Creates a builder with explicit [`BuildOptions`].
    pub fn with_options<P, Q>(path: P, temp_path: Q, options: BuildOptions) -> Result<Self>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        let temp_path = temp_path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)?;
        let mut file = BufWriter::with_capacity(options.buffer_size, file);
        // Skip the header region; the real header is patched in `finish`.
        file.seek(SeekFrom::Start(u64::from(HEADER_SIZE)))?;
        Ok(ConstDbBuilder {
            file,
            final_path: path.as_ref().to_path_buf(),
            temp_path,
            entries: Vec::new(),
            pos: HEADER_SIZE,
            sync: options.sync,
        })
    }

    /// Appends one record.
    ///
    /// Records become visible to readers only after
    /// [`finish`](Self::finish); until then they exist solely in the
    /// temporary file.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Overflow`] when the record would push the file
    /// past the 32-bit offset space, or [`Error::Io`] on any write failure
    /// (short writes surface as `WriteZero`).
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let klen = u32::try_from(key.len()).map_err(|_| Error::Overflow)?;
        let dlen = u32::try_from(value.len()).map_err(|_| Error::Overflow)?;
        let record_len = PAIR_SIZE
            .checked_add(klen)
            .and_then(|n| n.checked_add(dlen))
            .ok_or(Error::Overflow)?;
        let next = self.pos.checked_add(record_len).ok_or(Error::Overflow)?;

        self.file.write_u32::<LittleEndian>(klen)?;
        self.file.write_u32::<LittleEndian>(dlen)?;
        self.file.write_all(key)?;
        self.file.write_all(value)?;

        self.entries.push(HashPos {
            hash: hash(key),
            pos: self.pos,
        });
        self.pos = next;
        Ok(())
    }

    /// Computes the hash tables, publishes the database and returns a build
    /// summary.
    ///
    /// The tables are emitted after the records at half load factor and the
    /// header is patched with their positions. After an fsync (unless
    /// disabled in [`BuildOptions`]) the temporary file is renamed over the
    /// final path.
    pub fn finish(mut self) -> Result<ConstDbInfo> {
        let entries = std::mem::take(&mut self.entries);
        let entry_count = entries.len() as u64;

        let mut count = [0u32; TABLE_COUNT];
        for entry in &entries {
            count[(entry.hash & 0xff) as usize] += 1;
        }

        let max_slots = count.iter().map(|&c| c * 2).max().unwrap_or(0).max(1);
        check_scratch_size(max_slots, entry_count)?;

        // Partition by primary bucket: walking the pairs in reverse insertion
        // order while filling each bucket's range from the back keeps every
        // bucket in insertion order.
        let mut start = [0u32; TABLE_COUNT];
        let mut acc = 0u32;
        for (slot, &bucket_count) in start.iter_mut().zip(count.iter()) {
            acc += bucket_count;
            *slot = acc;
        }
        let mut split = vec![HashPos::default(); entries.len()];
        for &entry in entries.iter().rev() {
            let bucket = (entry.hash & 0xff) as usize;
            start[bucket] -= 1;
            split[start[bucket] as usize] = entry;
        }
        drop(entries);

        let index_offset = u64::from(self.pos);
        let mut header = [0u8; HEADER_SIZE as usize];
        let mut scratch = vec![HashPos::default(); max_slots as usize];
        for i in 0..TABLE_COUNT {
            let slots = count[i] * 2;
            pack_pair(&mut header[i * PAIR_SIZE as usize..], self.pos, slots);
            if slots == 0 {
                continue;
            }

            let table = &mut scratch[..slots as usize];
            table.fill(HashPos::default());
            let begin = start[i] as usize;
            for &entry in &split[begin..begin + count[i] as usize] {
                let mut slot = ((entry.hash >> 8) % slots) as usize;
                while table[slot].pos != 0 {
                    slot += 1;
                    if slot == table.len() {
                        slot = 0;
                    }
                }
                table[slot] = entry;
            }
            for slot in table.iter() {
                self.file.write_u32::<LittleEndian>(slot.hash)?;
                self.file.write_u32::<LittleEndian>(slot.pos)?;
            }

            let table_len = slots.checked_mul(PAIR_SIZE).ok_or(Error::Overflow)?;
            self.pos = self.pos.checked_add(table_len).ok_or(Error::Overflow)?;
        }
        let file_length = u64::from(self.pos);

        self.file.flush()?;
        let mut file = self.file.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header)?;
        file.flush()?;
        if self.sync {
            file.sync_all()?;
        }
        drop(file);
        fs::rename(&self.temp_path, &self.final_path)?;

        Ok(ConstDbInfo {
            file_length,
            entry_count,
            index_offset,
            index_length: file_length - index_offset,
            empty_tables: count.iter().filter(|&&c| c == 0).count(),
        })
    }
}

/// Rejects scratch sizes whose pairs could not stay addressable in 32 bits:
/// the largest table's slots plus one pair per record, mirroring the on-disk
/// limit.
fn check_scratch_size(max_slots: u32, entry_count: u64) -> Result<()> {
    let memsize = u64::from(max_slots) + entry_count;
    if memsize * u64::from(PAIR_SIZE) > u64::from(u32::MAX) {
        return Err(Error::Overflow);
    }
    Ok(())
}
