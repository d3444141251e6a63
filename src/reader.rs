use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::format::{unpack_pair, HEADER_SIZE, PAIR_SIZE};
use crate::{hash, ConstDbSource, Error, Result};

/// Read-only handle over a published constant database.
///
/// A `ConstDb` resolves keys through the file's two-level hash index: the low
/// byte of a key's hash selects one of 256 tables, the remaining bits pick a
/// slot, and collisions probe linearly within the table. A lookup costs one
/// header read plus one read per probed slot.
///
/// The handle also carries a walk cursor ([`first_key`](Self::first_key) /
/// [`next_key`](Self::next_key)) whose interplay with [`fetch`](Self::fetch)
/// lets a host enumerate a database without re-probing the index for every
/// key; see those methods for the exact protocol. One handle serves one
/// thread; open the file again for concurrent readers.
///
/// # Examples
///
/// ```
/// use constdb::{ConstDb, ConstDbBuilder};
///
/// # fn main() -> constdb::Result<()> {
/// let dir = tempfile::tempdir()?;
/// let path = dir.path().join("greetings.cdb");
/// let mut builder = ConstDbBuilder::create(&path)?;
/// builder.insert(b"one", b"Hello")?;
/// builder.insert(b"one", b"world")?;
/// builder.finish()?;
///
/// let mut db = ConstDb::open(&path)?;
/// assert_eq!(db.fetch(b"one")?, Some(b"Hello".to_vec()));
/// assert_eq!(db.multi_fetch(b"one")?.len(), 2);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ConstDb<S: ConstDbSource> {
    source: S,
    size: u32,
    /// End of the record region while a walk is active, 0 otherwise.
    end: u32,
    /// Offset of the record under the walk cursor.
    curpos: u32,
    /// Owned copy of the key under the walk cursor.
    curkey: Vec<u8>,
    /// Whether a cursor fetch should advance to the next record.
    fetch_advance: bool,
}

impl ConstDb<Mmap> {
    /// Opens a published database, memory-mapping it for zero-copy reads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] when the file cannot be opened or mapped and
    /// [`Error::Malformed`] when it cannot hold the fixed header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: published files are immutable and the map cannot outlive
        // the handle that owns it.
        let map = unsafe { Mmap::map(&file)? };
        Self::new(map)
    }
}

impl ConstDb<File> {
    /// Opens a published database for descriptor-based positional reads, for
    /// files that cannot be memory-mapped.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::new(File::open(path)?)
    }
}

impl<S: ConstDbSource> ConstDb<S> {
    /// Wraps an already-opened source.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Malformed`] when the file is too small to hold the
    /// 2048-byte header or larger than 32-bit offsets can address.
    pub fn new(source: S) -> Result<Self> {
        let size = source.size()?;
        if size < u64::from(HEADER_SIZE) {
            return Err(Error::Malformed("file too small for the header"));
        }
        if size > u64::from(u32::MAX) {
            return Err(Error::Malformed("file exceeds the 32-bit size limit"));
        }
        Ok(ConstDb {
            source,
            size: size as u32,
            end: 0,
            curpos: 0,
            curkey: Vec::new(),
            fetch_advance: false,
        })
    }

    /// Returns the value of the first record inserted under `key`.
    ///
    /// While a walk started by [`first_key`](Self::first_key) is active and
    /// `key` is the key under the cursor, the value is served from the cursor
    /// position instead of probing the index; in the key-pass-then-value-pass
    /// pattern this also advances the cursor to the next record. Any other
    /// key falls through to a fresh index probe and leaves the cursor alone.
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.end != 0 && self.curpos < self.end && key == self.curkey.as_slice() {
            let (klen, dlen) = self.record_at(self.curpos, self.end)?;
            let dpos = self.curpos + PAIR_SIZE + klen;
            let value = self.read_vec(dpos, dlen)?;
            if self.fetch_advance {
                self.curpos = dpos + dlen;
                if self.curpos < self.end {
                    self.load_cursor_key()?;
                } else {
                    self.end_walk();
                }
            }
            return Ok(Some(value));
        }
        let mut probe = Probe::new();
        match probe.next_match(self, key)? {
            Some((dpos, dlen)) => Ok(Some(self.read_vec(dpos, dlen)?)),
            None => Ok(None),
        }
    }

    /// Returns every value stored under `key`, lazily and in insertion order.
    pub fn find<'a>(&'a self, key: &'a [u8]) -> ConstDbValues<'a, S> {
        ConstDbValues {
            db: self,
            probe: Probe::new(),
            key,
            done: false,
        }
    }

    /// Returns every value stored under `key` in insertion order.
    pub fn multi_fetch(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.find(key).collect()
    }

    /// Tests whether at least one record is stored under `key`.
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let mut probe = Probe::new();
        Ok(probe.next_match(self, key)?.is_some())
    }

    /// Iterates over every `(key, value)` record in insertion order.
    ///
    /// The iterator keeps its own cursor and leaves the handle's walk state
    /// alone, so any number of them may run over one handle.
    pub fn iter(&self) -> ConstDbIter<'_, S> {
        ConstDbIter {
            db: self,
            pos: HEADER_SIZE,
            end: None,
            failed: false,
        }
    }

    /// Starts a walk over every record and returns the first key, or `None`
    /// for an empty database, in which case no walk is left active.
    ///
    /// Records are visited in insertion order. While the walk is active,
    /// [`fetch`](Self::fetch) with the key under the cursor reads its value
    /// without touching the index, and [`next_key`](Self::next_key) moves the
    /// cursor forward. Calling `first_key` again restarts the walk.
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        self.end = self.read_record_end()?;
        self.curpos = HEADER_SIZE;
        self.fetch_advance = false;
        if self.curpos < self.end {
            self.load_cursor_key()?;
            Ok(Some(self.curkey.clone()))
        } else {
            self.end_walk();
            Ok(None)
        }
    }

    /// Advances the walk cursor past `prev` and returns the next key.
    ///
    /// `prev` must be the key currently under the cursor (the one most
    /// recently returned by [`first_key`](Self::first_key) or `next_key`);
    /// passing anything else, or calling this without an active walk, is a
    /// contract violation and panics.
    ///
    /// When the last key is passed, the walk rewinds to the first record and
    /// switches [`fetch`](Self::fetch) into its advancing mode, so a second
    /// pass can collect every value in order without re-probing the index;
    /// `None` marks the end of the key pass. The final cursor fetch of that
    /// second pass ends the walk.
    pub fn next_key(&mut self, prev: &[u8]) -> Result<Option<Vec<u8>>> {
        assert!(
            self.end != 0 && prev == self.curkey.as_slice(),
            "next_key: walk cursor is not on the supplied key"
        );
        let (klen, dlen) = self.record_at(self.curpos, self.end)?;
        self.curpos += PAIR_SIZE + klen + dlen;
        if self.curpos < self.end {
            self.load_cursor_key()?;
            return Ok(Some(self.curkey.clone()));
        }
        // Keys exhausted: rewind for the value pass.
        self.end = self.read_record_end()?;
        self.curpos = HEADER_SIZE;
        self.fetch_advance = true;
        if self.curpos < self.end {
            self.load_cursor_key()?;
        } else {
            self.end_walk();
        }
        Ok(None)
    }

    /// Reads the offset where the record region ends, from the first header
    /// entry.
    fn read_record_end(&self) -> Result<u32> {
        let (end, _) = self.read_pair(0)?;
        if end < HEADER_SIZE || end > self.size {
            return Err(Error::Malformed("record region outside the file"));
        }
        Ok(end)
    }

    /// Reads the record header at `pos` and returns `(klen, dlen)` after
    /// checking that the whole record stays inside `limit`.
    fn record_at(&self, pos: u32, limit: u32) -> Result<(u32, u32)> {
        let (klen, dlen) = self.read_pair(pos)?;
        let end = pos
            .checked_add(PAIR_SIZE)
            .and_then(|p| p.checked_add(klen))
            .and_then(|p| p.checked_add(dlen))
            .ok_or(Error::Malformed("record extends past the record region"))?;
        if end > limit {
            return Err(Error::Malformed("record extends past the record region"));
        }
        Ok((klen, dlen))
    }

    /// Copies the key of the record under the cursor into `curkey`.
    fn load_cursor_key(&mut self) -> Result<()> {
        let (klen, _) = self.record_at(self.curpos, self.end)?;
        let kpos = u64::from(self.curpos) + u64::from(PAIR_SIZE);
        let curkey = &mut self.curkey;
        self.source.read_exact_at(kpos, u64::from(klen), |data| {
            curkey.clear();
            curkey.extend_from_slice(data);
            Ok(())
        })
    }

    fn end_walk(&mut self) {
        self.end = 0;
        self.curpos = 0;
        self.curkey = Vec::new();
        self.fetch_advance = false;
    }

    fn read_pair(&self, pos: u32) -> Result<(u32, u32)> {
        self.source
            .read_exact_at(u64::from(pos), u64::from(PAIR_SIZE), |data| {
                Ok(unpack_pair(data))
            })
    }

    fn read_vec(&self, pos: u32, len: u32) -> Result<Vec<u8>> {
        self.source
            .read_exact_at(u64::from(pos), u64::from(len), |data| Ok(data.to_vec()))
    }

    /// Compares `key` against the file bytes at `pos` in 32-byte chunks,
    /// without materializing the on-disk key.
    fn key_matches(&self, pos: u32, key: &[u8]) -> Result<bool> {
        let mut offset = u64::from(pos);
        for chunk in key.chunks(32) {
            let equal = self
                .source
                .read_exact_at(offset, chunk.len() as u64, |data| Ok(data == chunk))?;
            if !equal {
                return Ok(false);
            }
            offset += chunk.len() as u64;
        }
        Ok(true)
    }
}

/// Open-addressing probe over one hash table.
///
/// Created per lookup; repeated [`next_match`](Self::next_match) calls resume
/// after the previous hit, which is how multi-value lookups walk every record
/// sharing a key in insertion order.
struct Probe {
    started: bool,
    khash: u32,
    hpos: u32,
    hslots: u32,
    kpos: u32,
    seen: u32,
}

impl Probe {
    fn new() -> Self {
        Probe {
            started: false,
            khash: 0,
            hpos: 0,
            hslots: 0,
            kpos: 0,
            seen: 0,
        }
    }

    /// Advances to the next record whose key equals `key`, returning the
    /// position and length of its value.
    fn next_match<S: ConstDbSource>(
        &mut self,
        db: &ConstDb<S>,
        key: &[u8],
    ) -> Result<Option<(u32, u32)>> {
        if !self.started {
            self.started = true;
            let h = hash(key);
            let (hpos, hslots) = db.read_pair((h & 0xff) << 3)?;
            if hslots == 0 {
                return Ok(None);
            }
            let table_len = hslots
                .checked_mul(PAIR_SIZE)
                .ok_or(Error::Malformed("hash table slot count out of range"))?;
            let table_end = hpos
                .checked_add(table_len)
                .ok_or(Error::Malformed("hash table outside the file"))?;
            if hpos < HEADER_SIZE || table_end > db.size {
                return Err(Error::Malformed("hash table outside the file"));
            }
            self.khash = h;
            self.hpos = hpos;
            self.hslots = hslots;
            self.kpos = hpos + ((h >> 8) % hslots) * PAIR_SIZE;
        }
        while self.seen < self.hslots {
            let (slot_hash, record_pos) = db.read_pair(self.kpos)?;
            if record_pos == 0 {
                return Ok(None);
            }
            self.seen += 1;
            self.kpos += PAIR_SIZE;
            if self.kpos == self.hpos + self.hslots * PAIR_SIZE {
                self.kpos = self.hpos;
            }
            if slot_hash != self.khash {
                continue;
            }
            if record_pos < HEADER_SIZE {
                return Err(Error::Malformed("record position inside the header"));
            }
            let (klen, dlen) = db.record_at(record_pos, db.size)?;
            if klen as usize != key.len() {
                continue;
            }
            let kpos = record_pos + PAIR_SIZE;
            if db.key_matches(kpos, key)? {
                return Ok(Some((kpos + klen, dlen)));
            }
        }
        Ok(None)
    }
}

/// Lazy iterator over the values stored under one key, in insertion order.
///
/// Returned by [`ConstDb::find`]. The first error ends the iteration.
pub struct ConstDbValues<'a, S: ConstDbSource> {
    db: &'a ConstDb<S>,
    probe: Probe,
    key: &'a [u8],
    done: bool,
}

impl<'a, S: ConstDbSource> Iterator for ConstDbValues<'a, S> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.probe.next_match(self.db, self.key) {
            Ok(Some((dpos, dlen))) => match self.db.read_vec(dpos, dlen) {
                Ok(value) => Some(Ok(value)),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            },
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over every record of a database, in insertion order.
///
/// Returned by [`ConstDb::iter`]. Yields owned `(key, value)` pairs; the
/// first error is yielded in place and ends the iteration.
pub struct ConstDbIter<'a, S: ConstDbSource> {
    db: &'a ConstDb<S>,
    pos: u32,
    end: Option<u32>,
    failed: bool,
}

impl<'a, S: ConstDbSource> Iterator for ConstDbIter<'a, S> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let end = match self.end {
            Some(end) => end,
            None => match self.db.read_record_end() {
                Ok(end) => {
                    self.end = Some(end);
                    end
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            },
        };
        if self.pos >= end {
            return None;
        }
        match self.read_record(end) {
            Ok(item) => Some(Ok(item)),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl<'a, S: ConstDbSource> ConstDbIter<'a, S> {
    fn read_record(&mut self, end: u32) -> Result<(Vec<u8>, Vec<u8>)> {
        let (klen, dlen) = self.db.record_at(self.pos, end)?;
        let kpos = self.pos + PAIR_SIZE;
        let key = self.db.read_vec(kpos, klen)?;
        let value = self.db.read_vec(kpos + klen, dlen)?;
        self.pos = kpos + klen + dlen;
        Ok((key, value))
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    use byteorder::{ByteOrder, LittleEndian};
    use std::path::Path;

    fn build<P: AsRef<Path>>(path: P, records: &[(&[u8], &[u8])]) -> ConstDbInfo {
        let mut builder = ConstDbBuilder::create(path).unwrap();
        for (key, value) in records {
            builder.insert(key, value).unwrap();
        }
        builder.finish().unwrap()
    }

    #[test]
    fn test_basic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("basic.cdb");
        let info = build(
            &path,
            &[
                (b"apple", b"red"),
                (b"banana", b"yellow"),
                (b"cherry", b"dark red"),
            ],
        );
        assert_eq!(info.entry_count, 3);
        assert_eq!(info.file_length, std::fs::metadata(&path).unwrap().len());

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.fetch(b"apple").unwrap(), Some(b"red".to_vec()));
        assert_eq!(db.fetch(b"banana").unwrap(), Some(b"yellow".to_vec()));
        assert_eq!(db.fetch(b"cherry").unwrap(), Some(b"dark red".to_vec()));
        assert_eq!(db.fetch(b"durian").unwrap(), None);
        assert!(db.exists(b"apple").unwrap());
        assert!(!db.exists(b"durian").unwrap());

        let records: Vec<_> = db.iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(
            records,
            vec![
                (b"apple".to_vec(), b"red".to_vec()),
                (b"banana".to_vec(), b"yellow".to_vec()),
                (b"cherry".to_vec(), b"dark red".to_vec()),
            ]
        );
    }

    #[test]
    fn test_empty_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.cdb");
        let info = build(&path, &[]);
        assert_eq!(info.entry_count, 0);
        assert_eq!(info.file_length, 2048);

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.fetch(b"a").unwrap(), None);
        assert!(!db.exists(b"a").unwrap());
        assert!(db.multi_fetch(b"a").unwrap().is_empty());
        assert_eq!(db.iter().count(), 0);
        assert_eq!(db.first_key().unwrap(), None);
    }

    #[test]
    fn test_duplicate_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dup.cdb");
        build(
            &path,
            &[(b"k", b"1"), (b"x", b"9"), (b"k", b"2"), (b"k", b"3")],
        );

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.fetch(b"k").unwrap(), Some(b"1".to_vec()));
        assert_eq!(
            db.multi_fetch(b"k").unwrap(),
            vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]
        );
        assert_eq!(db.multi_fetch(b"x").unwrap(), vec![b"9".to_vec()]);

        let mut values = db.find(b"k");
        assert_eq!(values.next().unwrap().unwrap(), b"1".to_vec());
        assert_eq!(values.next().unwrap().unwrap(), b"2".to_vec());
        assert_eq!(values.next().unwrap().unwrap(), b"3".to_vec());
        assert!(values.next().is_none());

        let keys: Vec<_> = db.iter().map(|r| r.unwrap().0).collect();
        assert_eq!(
            keys,
            vec![b"k".to_vec(), b"x".to_vec(), b"k".to_vec(), b"k".to_vec()]
        );
    }

    #[test]
    fn test_binary_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("binary.cdb");
        build(
            &path,
            &[
                (b"\x00\xff\x00", b"\x01\x02\x03\x04"),
                (b"", b"empty key"),
                (b"empty value", b""),
            ],
        );

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(
            db.fetch(b"\x00\xff\x00").unwrap(),
            Some(b"\x01\x02\x03\x04".to_vec())
        );
        assert_eq!(db.fetch(b"").unwrap(), Some(b"empty key".to_vec()));
        assert_eq!(db.fetch(b"empty value").unwrap(), Some(b"".to_vec()));
    }

    #[test]
    fn test_long_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("long.cdb");
        // Longer than one compare chunk, with a late difference.
        let key_a = vec![b'a'; 100];
        let mut key_b = key_a.clone();
        key_b[99] = b'b';
        build(&path, &[(&key_a, b"first"), (&key_b, b"second")]);

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.fetch(&key_a).unwrap(), Some(b"first".to_vec()));
        assert_eq!(db.fetch(&key_b).unwrap(), Some(b"second".to_vec()));
    }

    #[test]
    fn test_walk_interleaved() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk1.cdb");
        build(&path, &[(b"a", b"A"), (b"b", b"B"), (b"c", b"C")]);

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.first_key().unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(db.fetch(b"a").unwrap(), Some(b"A".to_vec()));
        assert_eq!(db.next_key(b"a").unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(db.fetch(b"b").unwrap(), Some(b"B".to_vec()));
        assert_eq!(db.next_key(b"b").unwrap().as_deref(), Some(&b"c"[..]));
        assert_eq!(db.fetch(b"c").unwrap(), Some(b"C".to_vec()));
        assert_eq!(db.next_key(b"c").unwrap(), None);
    }

    #[test]
    fn test_walk_value_pass() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk2.cdb");
        build(&path, &[(b"a", b"A"), (b"b", b"B"), (b"c", b"C")]);

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.first_key().unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(db.next_key(b"a").unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(db.next_key(b"b").unwrap().as_deref(), Some(&b"c"[..]));
        assert_eq!(db.next_key(b"c").unwrap(), None);
        // The rewound cursor serves the value pass and advances itself.
        assert_eq!(db.fetch(b"a").unwrap(), Some(b"A".to_vec()));
        assert_eq!(db.fetch(b"b").unwrap(), Some(b"B".to_vec()));
        assert_eq!(db.fetch(b"c").unwrap(), Some(b"C".to_vec()));
        // The walk has ended; fetches go back to the index.
        assert_eq!(db.fetch(b"b").unwrap(), Some(b"B".to_vec()));
    }

    #[test]
    fn test_walk_fetch_unrelated_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk3.cdb");
        build(&path, &[(b"a", b"A"), (b"b", b"B")]);

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.first_key().unwrap().as_deref(), Some(&b"a"[..]));
        // A fetch of some other key probes the index and leaves the cursor
        // where it was.
        assert_eq!(db.fetch(b"b").unwrap(), Some(b"B".to_vec()));
        assert_eq!(db.fetch(b"missing").unwrap(), None);
        assert_eq!(db.fetch(b"a").unwrap(), Some(b"A".to_vec()));
        assert_eq!(db.next_key(b"a").unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(db.next_key(b"b").unwrap(), None);
    }

    #[test]
    fn test_walk_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk4.cdb");
        build(&path, &[(b"a", b"A"), (b"b", b"B")]);

        let mut db = ConstDb::open(&path).unwrap();
        assert_eq!(db.first_key().unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(db.next_key(b"a").unwrap().as_deref(), Some(&b"b"[..]));
        assert_eq!(db.first_key().unwrap().as_deref(), Some(&b"a"[..]));
    }

    #[test]
    #[should_panic(expected = "walk cursor")]
    fn test_walk_cursor_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("walk5.cdb");
        build(&path, &[(b"a", b"A"), (b"b", b"B")]);

        let mut db = ConstDb::open(&path).unwrap();
        db.first_key().unwrap();
        let _ = db.next_key(b"b");
    }

    #[test]
    fn test_cursor_fetch_matches_probe() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cursor.cdb");
        let records: Vec<(Vec<u8>, Vec<u8>)> = (0..50)
            .map(|i| {
                (
                    format!("key-{:02}", i).into_bytes(),
                    format!("value-{:02}", i).into_bytes(),
                )
            })
            .collect();
        let mut builder = ConstDbBuilder::create(&path).unwrap();
        for (key, value) in &records {
            builder.insert(key, value).unwrap();
        }
        builder.finish().unwrap();

        let mut walking = ConstDb::open(&path).unwrap();
        let mut cold = ConstDb::open(&path).unwrap();
        let mut key = walking.first_key().unwrap();
        while let Some(current) = key {
            let via_cursor = walking.fetch(&current).unwrap();
            let via_probe = cold.fetch(&current).unwrap();
            assert_eq!(via_cursor, via_probe);
            key = walking.next_key(&current).unwrap();
        }
    }

    #[test]
    fn test_bucket_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("collide.cdb");
        // More keys than tables, so buckets are shared; a duplicate on top
        // exercises probing past equal hashes.
        let mut builder = ConstDbBuilder::create(&path).unwrap();
        for i in 0..600u32 {
            builder
                .insert(
                    format!("key-{}", i).as_bytes(),
                    format!("value-{}", i).as_bytes(),
                )
                .unwrap();
        }
        builder.insert(b"key-77", b"again").unwrap();
        let info = builder.finish().unwrap();
        assert_eq!(info.entry_count, 601);

        let mut db = ConstDb::open(&path).unwrap();
        for i in 0..600u32 {
            assert_eq!(
                db.fetch(format!("key-{}", i).as_bytes()).unwrap(),
                Some(format!("value-{}", i).into_bytes()),
            );
        }
        assert_eq!(
            db.multi_fetch(b"key-77").unwrap(),
            vec![b"value-77".to_vec(), b"again".to_vec()]
        );
        assert_eq!(db.fetch(b"key-600").unwrap(), None);
        assert_eq!(db.iter().count(), 601);
    }

    #[test]
    fn test_file_source() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fd.cdb");
        build(&path, &[(b"one", b"Hello"), (b"two", b"world")]);

        let mut db = ConstDb::open_file(&path).unwrap();
        assert_eq!(db.fetch(b"one").unwrap(), Some(b"Hello".to_vec()));
        assert_eq!(db.fetch(b"three").unwrap(), None);
        assert_eq!(db.iter().count(), 2);
        assert_eq!(db.first_key().unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(db.next_key(b"one").unwrap().as_deref(), Some(&b"two"[..]));
    }

    #[test]
    fn test_open_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConstDb::open(dir.path().join("missing.cdb")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_short_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.cdb");
        std::fs::write(&path, b"not a database").unwrap();
        let err = ConstDb::open(&path).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn test_corrupt_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corrupt.cdb");
        build(&path, &[(b"one", b"Hello")]);

        let mut bytes = std::fs::read(&path).unwrap();
        for b in bytes[..2048].iter_mut() {
            *b = 0xff;
        }
        std::fs::write(&path, &bytes).unwrap();

        let mut db = ConstDb::open(&path).unwrap();
        assert!(matches!(db.fetch(b"one"), Err(Error::Malformed(_))));
        assert!(matches!(db.first_key(), Err(Error::Malformed(_))));
        let mut iter = db.iter();
        assert!(matches!(iter.next(), Some(Err(Error::Malformed(_)))));
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_truncated_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("truncated.cdb");
        build(&path, &[(b"one", b"Hello")]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 8);
        std::fs::write(&path, &bytes).unwrap();

        let mut db = ConstDb::open(&path).unwrap();
        assert!(matches!(db.fetch(b"one"), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_corrupt_record_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("badlen.cdb");
        build(&path, &[(b"one", b"Hello")]);

        // Inflate the first record's value length far past the file end.
        let mut bytes = std::fs::read(&path).unwrap();
        LittleEndian::write_u32(&mut bytes[2052..2056], 10_000);
        std::fs::write(&path, &bytes).unwrap();

        let mut db = ConstDb::open(&path).unwrap();
        assert!(matches!(db.fetch(b"one"), Err(Error::Malformed(_))));
        let mut iter = db.iter();
        assert!(matches!(iter.next(), Some(Err(Error::Malformed(_)))));

        // The descriptor path rejects the record before attempting the read,
        // so no oversized buffer is ever allocated.
        let mut db = ConstDb::open_file(&path).unwrap();
        assert!(matches!(db.fetch(b"one"), Err(Error::Malformed(_))));
    }

    #[test]
    fn test_reopen_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.cdb");
        build(&path, &[(b"a", b"A"), (b"b", b"B")]);

        let mut first = ConstDb::open(&path).unwrap();
        let mut second = ConstDb::open(&path).unwrap();
        assert_eq!(first.fetch(b"a").unwrap(), second.fetch(b"a").unwrap());
        assert_eq!(first.fetch(b"b").unwrap(), second.fetch(b"b").unwrap());
        assert_eq!(
            first.iter().collect::<Result<Vec<_>>>().unwrap(),
            second.iter().collect::<Result<Vec<_>>>().unwrap(),
        );
    }

    #[test]
    fn test_bulk_random() {
        use rand::Rng;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bulk.cdb");
        let mut rng = rand::thread_rng();
        const N: usize = 10_000;
        let records: Vec<(Vec<u8>, Vec<u8>)> = (0..N)
            .map(|i| {
                let value: Vec<u8> = (0..rng.gen_range(0..64)).map(|_| rng.gen()).collect();
                (format!("key-{}", i).into_bytes(), value)
            })
            .collect();

        let mut builder = ConstDbBuilder::create(&path).unwrap();
        for (key, value) in &records {
            builder.insert(key, value).unwrap();
        }
        let info = builder.finish().unwrap();
        assert_eq!(info.entry_count, N as u64);

        let mut db = ConstDb::open(&path).unwrap();
        for (key, value) in &records {
            assert_eq!(db.fetch(key).unwrap().as_ref(), Some(value));
        }
        let walked: Vec<_> = db.iter().collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(walked, records);
    }
}
