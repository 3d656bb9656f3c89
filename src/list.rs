use crate::prelude::*;
use crate::lockable::{self, LockOp, LockState, Lockable, LockableFile, OpenFlags};
use memmap2::{Mmap, MmapOptions};
use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::FileExt as _;

// An append-only file of fixed-width records. No header: the file is the
// records, and the only metadata (the row count) is derived from the file
// length, which is why the length must always be an exact multiple of the
// width. Appends go through a small RAM buffer that is written out in one
// pwrite when it fills or when the write lock is released.
//
// Lists get big (the quad import path runs through one), so sorting is
// external-memory: sort each chunk in place through a mapping, then stream
// the sorted-unique sequence with a k-way merge over per-chunk cursors.

const LIST_BUFFER_ROWS: usize = 256;

/// Unit of in-place sorting. Must be a multiple of both the record width
/// and the page size.
pub const DEFAULT_CHUNK_SIZE: usize = 131072 * 4096;

const PAGE_SIZE: usize = 4096;

type Cmp = Box<dyn Fn(&[u8], &[u8]) -> Ordering>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SortState {
    Unsorted,
    ChunkSorted,
    Sorted,
}

pub struct List {
    lf: LockableFile,
    width: usize,
    chunk_size: usize,
    // rows on disk; rows in the buffer live past this
    offset: u64,
    buffer: Vec<u8>,
    buffered: usize,
    sort: SortState,
    cmp: Option<Cmp>,
    merge: Option<MergeState>,
}

struct MergeState {
    map: Mmap,
    pos: Vec<usize>,
    end: Vec<usize>,
    last: Vec<u8>,
    started: bool,
}

impl Lockable for List {
    fn lf(&self) -> &LockableFile {
        &self.lf
    }

    fn lf_mut(&mut self) -> &mut LockableFile {
        &mut self.lf
    }

    fn read_metadata(&mut self) -> Result<()> {
        let len = self.lf.len()?;
        if len % self.width as u64 != 0 {
            bail!(StoreError::BadLength {
                path: self.lf.path().to_path_buf(),
                len,
                width: self.width,
            });
        }
        self.offset = len / self.width as u64;
        Ok(())
    }

    // flush any buffered rows out to the end of the file
    fn write_metadata(&mut self) -> Result<()> {
        self.flush()
    }
}

impl List {
    pub fn open(path: &Path, width: usize, flags: OpenFlags) -> Result<List> {
        List::open_with_chunk_size(path, width, flags, DEFAULT_CHUNK_SIZE)
    }

    /// Like [`List::open`] but with an explicit sort-chunk size. Mostly
    /// useful for exercising the chunked merge on small lists.
    pub fn open_with_chunk_size(
        path: &Path,
        width: usize,
        flags: OpenFlags,
        chunk_size: usize,
    ) -> Result<List> {
        if width == 0 || chunk_size % width != 0 {
            bail!(StoreError::BadChunkSize {
                path: path.to_path_buf(),
                chunk: chunk_size,
                width,
            });
        }
        if chunk_size % PAGE_SIZE != 0 {
            bail!(
                "chunk size {} of '{}' is not a multiple of the page size",
                chunk_size,
                path.display()
            );
        }
        let lf = LockableFile::open(path, flags)?;
        let mut l = List {
            lf,
            width,
            chunk_size,
            offset: 0,
            buffer: vec![0; LIST_BUFFER_ROWS * width],
            buffered: 0,
            sort: SortState::Unsorted,
            cmp: None,
            merge: None,
        };
        lockable::init(&mut l)?;
        Ok(l)
    }

    pub fn width(&self) -> usize {
        self.width
    }

    fn require_ex(&self) -> Result<()> {
        if !self.holds(LockState::Exclusive) {
            bail!(StoreError::LockRequired {
                path: self.lf.path().to_path_buf(),
                needed: "write",
            });
        }
        Ok(())
    }

    fn require_any(&self) -> Result<()> {
        if !self.holds_any() {
            bail!(StoreError::LockRequired {
                path: self.lf.path().to_path_buf(),
                needed: "read",
            });
        }
        Ok(())
    }

    fn check_width(&self, data: &[u8]) -> Result<()> {
        if data.len() != self.width {
            bail!(
                "record of {} bytes passed to list '{}' of width {}",
                data.len(),
                self.lf.path().display(),
                self.width
            );
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.buffered > 0 {
            let bytes = &self.buffer[..self.buffered * self.width];
            self.lf
                .file()
                .write_all_at(bytes, self.offset * self.width as u64)
                .wrap_err_with(|| {
                    format!("failed to write to list '{}'", self.lf.path().display())
                })?;
            self.buffered = 0;
        }
        self.offset = self.lf.len()? / self.width as u64;
        Ok(())
    }

    /// Append a record. Returns its zero-based position, counting buffered
    /// rows. Caller must hold the write lock.
    pub fn add_r(&mut self, data: &[u8]) -> Result<u64> {
        self.require_ex()?;
        self.check_width(data)?;

        if self.buffered == LIST_BUFFER_ROWS {
            self.flush()?;
        }

        self.buffer[self.buffered * self.width..][..self.width].copy_from_slice(data);
        self.buffered += 1;

        Ok(self.offset + self.buffered as u64 - 1)
    }

    pub fn add(&mut self, data: &[u8]) -> Result<u64> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.add_r(data);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Read the record at `pos`. Positions past the on-disk row count are
    /// served from the append buffer.
    pub fn get_r(&self, pos: u64, out: &mut [u8]) -> Result<()> {
        self.require_any()?;
        self.check_width(out)?;

        if pos >= self.offset {
            if pos >= self.offset + self.buffered as u64 {
                bail!(StoreError::OutOfRange {
                    path: self.lf.path().to_path_buf(),
                    pos,
                    len: self.offset + self.buffered as u64,
                });
            }
            let start = (pos - self.offset) as usize * self.width;
            out.copy_from_slice(&self.buffer[start..start + self.width]);
            return Ok(());
        }

        self.lf
            .file()
            .read_exact_at(out, pos * self.width as u64)
            .wrap_err_with(|| {
                format!(
                    "failed to read record {} from list '{}'",
                    pos,
                    self.lf.path().display()
                )
            })
    }

    pub fn get(&mut self, pos: u64, out: &mut [u8]) -> Result<()> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_r(pos, out);
        self.lock(LockOp::Unlock)?;
        ret
    }

    pub fn length_r(&self) -> Result<u64> {
        self.require_any()?;
        Ok(self.offset + self.buffered as u64)
    }

    /// Reset the file position for [`List::next_value_r`] streaming.
    pub fn rewind_r(&self) -> Result<()> {
        self.require_any()?;
        let mut f = self.lf.file();
        f.seek(SeekFrom::Start(0))
            .wrap_err_with(|| format!("lseek({})", self.lf.path().display()))?;
        Ok(())
    }

    /// Read the next record at the current file position. Returns false at
    /// end of file. Only meaningful inside a held lock, after a rewind, and
    /// not interleaved with appends.
    pub fn next_value_r(&self, out: &mut [u8]) -> Result<bool> {
        self.require_any()?;
        self.check_width(out)?;

        let mut f = self.lf.file();
        let mut got = 0;
        while got < self.width {
            let n = f.read(&mut out[got..]).wrap_err_with(|| {
                format!("error reading entry from list '{}'", self.lf.path().display())
            })?;
            if n == 0 {
                break;
            }
            got += n;
        }
        if got == 0 {
            return Ok(false);
        }
        if got < self.width {
            bail!(
                "error reading entry from list '{}', got {} bytes instead of {}",
                self.lf.path().display(),
                got,
                self.width
            );
        }
        Ok(true)
    }

    /// In-place sort of the whole file.
    pub fn sort_r(&mut self, cmp: impl Fn(&[u8], &[u8]) -> Ordering + 'static) -> Result<()> {
        self.require_ex()?;
        self.flush()?;
        self.cmp = Some(Box::new(cmp));
        self.sort_span(0, self.offset)?;
        self.sort = SortState::Sorted;
        Ok(())
    }

    pub fn sort(&mut self, cmp: impl Fn(&[u8], &[u8]) -> Ordering + 'static) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.sort_r(cmp);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Sort each chunk of the file independently, in place. Leaves the list
    /// ready for [`List::next_sort_uniqed_r`].
    pub fn sort_chunked_r(
        &mut self,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering + 'static,
    ) -> Result<()> {
        self.require_ex()?;
        self.flush()?;
        self.cmp = Some(Box::new(cmp));

        let rows_per_chunk = (self.chunk_size / self.width) as u64;
        let mut row = 0;
        while row < self.offset {
            let rows = rows_per_chunk.min(self.offset - row);
            self.sort_span(row, rows).wrap_err_with(|| {
                format!("chunked sort failed at chunk {}", row / rows_per_chunk)
            })?;
            row += rows_per_chunk;
        }

        self.sort = if self.offset <= rows_per_chunk {
            SortState::Sorted
        } else {
            SortState::ChunkSorted
        };
        Ok(())
    }

    pub fn sort_chunked(
        &mut self,
        cmp: impl Fn(&[u8], &[u8]) -> Ordering + 'static,
    ) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.sort_chunked_r(cmp);
        self.lock(LockOp::Unlock)?;
        ret
    }

    fn sort_span(&self, start_row: u64, rows: u64) -> Result<()> {
        if rows == 0 {
            return Ok(());
        }
        let cmp = self.cmp.as_ref().expect("sort_span without a comparator");
        let mut map = unsafe {
            MmapOptions::new()
                .offset(start_row * self.width as u64)
                .len(rows as usize * self.width)
                .map_mut(self.lf.file())
        }
        .wrap_err_with(|| {
            format!(
                "failed to map '{}', {}+{} for sort",
                self.lf.path().display(),
                start_row * self.width as u64,
                rows * self.width as u64
            )
        })?;
        sort_records(&mut map, self.width, cmp);
        Ok(())
    }

    /// Stream the sorted-unique sequence over a (chunk-)sorted list. Returns
    /// false at end of merge. The first call sets up one cursor per chunk;
    /// the cursors are torn down when the merge is exhausted.
    pub fn next_sort_uniqed_r(&mut self, out: &mut [u8]) -> Result<bool> {
        self.require_any()?;
        self.check_width(out)?;

        match self.sort {
            SortState::Unsorted => {
                warn!(
                    "tried to iterate unsorted list '{}'",
                    self.lf.path().display()
                );
                return Ok(false);
            }
            SortState::Sorted | SortState::ChunkSorted => {}
        }

        if self.merge.is_none() {
            if self.offset == 0 {
                return Ok(false);
            }
            self.merge = Some(self.init_merge()?);
        }

        let w = self.width;
        loop {
            // pick the chunk whose current record is the smallest
            let best = {
                let m = self.merge.as_ref().unwrap();
                let cmp = self.cmp.as_ref().expect("sorted list without a comparator");
                let mut best: Option<usize> = None;
                for c in 0..m.pos.len() {
                    if m.pos[c] >= m.end[c] {
                        continue;
                    }
                    best = match best {
                        None => Some(c),
                        Some(b) => {
                            if cmp(&m.map[m.pos[c]..m.pos[c] + w], &m.map[m.pos[b]..m.pos[b] + w])
                                == Ordering::Less
                            {
                                Some(c)
                            } else {
                                Some(b)
                            }
                        }
                    };
                }
                best
            };

            let Some(b) = best else {
                self.merge = None;
                return Ok(false);
            };

            let m = self.merge.as_mut().unwrap();
            let rec = m.pos[b];
            m.pos[b] += w;
            if m.started && m.map[rec..rec + w] == m.last[..] {
                // duplicate
                continue;
            }
            out.copy_from_slice(&m.map[rec..rec + w]);
            m.last.copy_from_slice(&m.map[rec..rec + w]);
            m.started = true;
            return Ok(true);
        }
    }

    fn init_merge(&self) -> Result<MergeState> {
        let total = self.offset as usize * self.width;
        let chunks = total / self.chunk_size + 1;
        let pos: Vec<usize> = (0..chunks).map(|c| c * self.chunk_size).collect();
        let mut end: Vec<usize> = (1..=chunks).map(|c| c * self.chunk_size).collect();
        end[chunks - 1] = total;

        let rows: usize = pos
            .iter()
            .zip(&end)
            .map(|(&p, &e)| (e - p) / self.width)
            .sum();
        if rows as u64 != self.offset {
            bail!(
                "length(chunks) = {}, length(list) = {}, not merging '{}'",
                rows,
                self.offset,
                self.lf.path().display()
            );
        }

        let map = unsafe { MmapOptions::new().len(total).map(self.lf.file()) }
            .wrap_err_with(|| format!("failed to map '{}' for merge", self.lf.path().display()))?;

        Ok(MergeState {
            map,
            pos,
            end,
            last: vec![0; self.width],
            started: false,
        })
    }

    pub fn truncate_r(&mut self) -> Result<()> {
        self.require_ex()?;
        self.lf
            .file()
            .set_len(0)
            .wrap_err_with(|| format!("failed to truncate '{}'", self.lf.path().display()))?;
        self.offset = 0;
        self.buffered = 0;
        self.sort = SortState::Unsorted;
        self.merge = None;
        Ok(())
    }

    pub fn truncate(&mut self) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.truncate_r();
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Remove the backing file. The list is unusable afterwards.
    pub fn unlink(&self) -> Result<()> {
        fs::remove_file(self.lf.path())
            .wrap_err_with(|| format!("unlink({})", self.lf.path().display()))
    }
}

// Sort fixed-width records inside a byte buffer: introsort an index vector
// with the caller's comparator, then apply the permutation cycle by cycle
// with one record of scratch. Side memory is 4 bytes per record instead of
// a second copy of the chunk.
fn sort_records(buf: &mut [u8], w: usize, cmp: &Cmp) {
    let n = buf.len() / w;
    let mut order: Vec<u32> = (0..n as u32).collect();
    order.sort_unstable_by(|&a, &b| {
        cmp(
            &buf[a as usize * w..a as usize * w + w],
            &buf[b as usize * w..b as usize * w + w],
        )
    });

    // slot i must end up holding record order[i]
    let mut scratch = vec![0u8; w];
    for i in 0..n {
        if order[i] as usize == i {
            continue;
        }
        scratch.copy_from_slice(&buf[i * w..i * w + w]);
        let mut j = i;
        loop {
            let src = order[j] as usize;
            order[j] = j as u32;
            if src == i {
                buf[j * w..j * w + w].copy_from_slice(&scratch);
                break;
            }
            buf.copy_within(src * w..src * w + w, j * w);
            j = src;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    fn quad(v: u64) -> [u8; 32] {
        let mut row = [0u8; 32];
        for part in 0..4 {
            row[part * 8..part * 8 + 8].copy_from_slice(&v.to_ne_bytes());
        }
        row
    }

    fn by_first_u64(a: &[u8], b: &[u8]) -> Ordering {
        let ka = u64::from_ne_bytes(a[..8].try_into().unwrap());
        let kb = u64::from_ne_bytes(b[..8].try_into().unwrap());
        ka.cmp(&kb)
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();

        l.lock(LockOp::Exclusive).unwrap();
        for i in 0..100u64 {
            let pos = l.add_r(&quad(i + 23)).unwrap();
            assert_eq!(pos, i);
        }
        assert_eq!(l.length_r().unwrap(), 100);
        l.lock(LockOp::Unlock).unwrap();

        l.lock(LockOp::Shared).unwrap();
        l.rewind_r().unwrap();
        let mut row = [0u8; 32];
        for i in 0..100u64 {
            assert!(l.next_value_r(&mut row).unwrap());
            assert_eq!(row, quad(i + 23));
        }
        assert!(!l.next_value_r(&mut row).unwrap());
        assert_eq!(l.length_r().unwrap(), 100);
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn buffer_overflow_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();

        l.lock(LockOp::Exclusive).unwrap();
        for i in 0..300u64 {
            l.add_r(&quad(i)).unwrap();
        }
        assert_eq!(l.length_r().unwrap(), 300);
        // row 0 is on disk by now, row 299 still buffered
        let mut row = [0u8; 32];
        l.get_r(0, &mut row).unwrap();
        assert_eq!(row, quad(0));
        l.get_r(299, &mut row).unwrap();
        assert_eq!(row, quad(299));
        assert!(l.get_r(300, &mut row).is_err());
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn requires_locks() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();
        let mut row = [0u8; 32];
        assert!(l.add_r(&quad(1)).is_err());
        assert!(l.get_r(0, &mut row).is_err());
        assert!(l.length_r().is_err());

        // _r ops under SH: reads fine, writes rejected
        l.lock(LockOp::Shared).unwrap();
        assert!(l.add_r(&quad(1)).is_err());
        assert_eq!(l.length_r().unwrap(), 0);
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn sort_uniq_small() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();

        l.lock(LockOp::Exclusive).unwrap();
        // descending, and everything twice
        for i in (0..100u64).rev() {
            l.add_r(&quad(i + 23)).unwrap();
            l.add_r(&quad(i + 23)).unwrap();
        }
        l.sort_chunked_r(by_first_u64).unwrap();
        let mut row = [0u8; 32];
        for i in 0..100u64 {
            assert!(l.next_sort_uniqed_r(&mut row).unwrap());
            assert_eq!(row, quad(i + 23));
        }
        assert!(!l.next_sort_uniqed_r(&mut row).unwrap());
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn sort_uniq_across_chunks() {
        let dir = tempfile::tempdir().unwrap();
        // 4096-byte chunks = 128 rows per chunk
        let mut l = List::open_with_chunk_size(
            &dir.path().join("t.list"),
            32,
            OpenFlags::truncate(),
            4096,
        )
        .unwrap();

        fastrand::seed(7);
        let mut input = HashSet::new();
        l.lock(LockOp::Exclusive).unwrap();
        for _ in 0..1000 {
            // small key space so we get plenty of duplicates
            let row = quad(fastrand::u64(0..200));
            input.insert(row);
            l.add_r(&row).unwrap();
        }
        l.sort_chunked_r(by_first_u64).unwrap();

        let mut row = [0u8; 32];
        let mut seen = HashSet::new();
        let mut prev: Option<[u8; 32]> = None;
        while l.next_sort_uniqed_r(&mut row).unwrap() {
            if let Some(p) = prev {
                assert_ne!(p, row, "duplicate emitted");
                assert_ne!(
                    by_first_u64(&row, &p),
                    Ordering::Less,
                    "merge output not sorted"
                );
            }
            assert!(input.contains(&row), "emitted row not in input");
            seen.insert(row);
            prev = Some(row);
        }
        assert_eq!(seen, input);
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn leading_zero_row_survives_uniq() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();

        l.lock(LockOp::Exclusive).unwrap();
        l.add_r(&quad(5)).unwrap();
        l.add_r(&quad(0)).unwrap();
        l.sort_chunked_r(by_first_u64).unwrap();
        let mut row = [0u8; 32];
        assert!(l.next_sort_uniqed_r(&mut row).unwrap());
        assert_eq!(row, quad(0));
        assert!(l.next_sort_uniqed_r(&mut row).unwrap());
        assert_eq!(row, quad(5));
        assert!(!l.next_sort_uniqed_r(&mut row).unwrap());
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn next_sort_uniqed_on_unsorted_list() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();
        l.lock(LockOp::Exclusive).unwrap();
        l.add_r(&quad(1)).unwrap();
        let mut row = [0u8; 32];
        assert!(!l.next_sort_uniqed_r(&mut row).unwrap());
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn full_sort() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();

        fastrand::seed(99);
        l.lock(LockOp::Exclusive).unwrap();
        for _ in 0..500 {
            l.add_r(&quad(fastrand::u64(..))).unwrap();
        }
        l.sort_r(by_first_u64).unwrap();
        l.rewind_r().unwrap();
        let mut row = [0u8; 32];
        let mut prev = 0u64;
        while l.next_value_r(&mut row).unwrap() {
            let k = u64::from_ne_bytes(row[..8].try_into().unwrap());
            assert!(k >= prev);
            prev = k;
        }
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn truncate_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open(&dir.path().join("t.list"), 32, OpenFlags::truncate()).unwrap();
        l.lock(LockOp::Exclusive).unwrap();
        for i in 0..10u64 {
            l.add_r(&quad(i)).unwrap();
        }
        l.truncate_r().unwrap();
        assert_eq!(l.length_r().unwrap(), 0);
        l.lock(LockOp::Unlock).unwrap();

        l.lock(LockOp::Shared).unwrap();
        assert_eq!(l.length_r().unwrap(), 0);
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn reopen_sees_flushed_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.list");
        {
            let mut l = List::open(&path, 32, OpenFlags::truncate()).unwrap();
            for i in 0..10u64 {
                l.add(&quad(i)).unwrap();
            }
        }
        let mut l = List::open(&path, 32, OpenFlags::read_only()).unwrap();
        l.lock(LockOp::Shared).unwrap();
        assert_eq!(l.length_r().unwrap(), 10);
        let mut row = [0u8; 32];
        l.get_r(7, &mut row).unwrap();
        assert_eq!(row, quad(7));
        l.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn width_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(List::open_with_chunk_size(
            &dir.path().join("t.list"),
            24,
            OpenFlags::truncate(),
            4096,
        )
        .is_err());
    }

    // the listtest.c volume run; takes a while, so opt-in
    #[test]
    #[ignore]
    fn sort_uniq_large() {
        let dir = tempfile::tempdir().unwrap();
        let mut l = List::open_with_chunk_size(
            &dir.path().join("big.list"),
            32,
            OpenFlags::truncate(),
            64 * 1024 * 1024,
        )
        .unwrap();

        const ROWS: usize = 20_443_501;
        fastrand::seed(23);
        l.lock(LockOp::Exclusive).unwrap();
        for _ in 0..ROWS {
            let mut row = [0u8; 32];
            for b in row.iter_mut() {
                *b = fastrand::u8(..);
            }
            l.add_r(&row).unwrap();
        }
        l.sort_chunked_r(by_first_u64).unwrap();

        let mut row = [0u8; 32];
        let mut count = 0usize;
        let mut prev = 0u64;
        while l.next_sort_uniqed_r(&mut row).unwrap() {
            let k = u64::from_ne_bytes(row[..8].try_into().unwrap());
            assert!(k >= prev);
            prev = k;
            count += 1;
        }
        assert!(count <= ROWS);
        l.lock(LockOp::Unlock).unwrap();
    }
}
