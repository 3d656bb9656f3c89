use crate::prelude::*;
use crate::list::List;
use crate::lockable::{self, do_lock, LockOp, LockState, Lockable, LockableFile, OpenFlags};
use crate::prefixes::{PrefixDict, PrefixFinder};
use crate::rid::{self, RID_NULL};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::borrow::Cow;
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::FileExt as _;

mod bcd;

use bcd::INLINE_STR_LEN;

// Persistent map from a resource rid to its attribute and lexical form.
// The table itself is mmapped: a 512-byte header, then size × bucket_size
// packed 32-byte entries. Short and numeric-ish lexical forms are packed
// into the entry itself; everything else spills to the append-only
// `<name>.lex` sibling, optionally zlib-compressed or reduced to a
// dictionary prefix code plus suffix. The prefix dictionary is persisted
// as a third sibling, `<name>.prefixes`, a List of 512-byte records, and
// its lock is folded into ours so one lock call covers both files.

const RHASH_ID: u32 = 0x4a58_5230; // "JXR0"
const DEFAULT_SIZE: u32 = 65536;
const DEFAULT_SEARCH_DIST: u32 = 32;
const DEFAULT_BUCKET_SIZE: u32 = 16;
const REVISION: u32 = 1;
const HEADER_SIZE: usize = 512;
const ENTRY_SIZE: usize = 32;
const PREFIX_RECORD_SIZE: usize = 512;

// header field offsets
const H_ID: usize = 0;
const H_SIZE: usize = 4;
const H_COUNT: usize = 8;
const H_SEARCH_DIST: usize = 12;
const H_BUCKET_SIZE: usize = 16;
const H_REVISION: usize = 20;

// dispositions: where and how the lexical form is stored
const DISP_I_UTF8: u8 = b'i';
const DISP_I_NUMBER: u8 = b'N';
const DISP_I_DATE: u8 = b'D';
const DISP_I_PREFIX: u8 = b'p';
const DISP_F_UTF8: u8 = b'f';
const DISP_F_PREFIX: u8 = b'P';
const DISP_F_ZCOMP: u8 = b'Z';

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub rid: Rid,
    pub attr: Rid,
    pub lex: String,
}

impl Resource {
    pub fn new(rid: Rid, attr: Rid, lex: impl Into<String>) -> Resource {
        Resource { rid, attr, lex: lex.into() }
    }

    /// A lookup shell for [`ResourceHash::get_r`].
    pub fn lookup(rid: Rid) -> Resource {
        Resource { rid, attr: 0, lex: String::new() }
    }
}

// One packed table entry. aval holds either the attribute rid or, for
// prefix-coded dispositions, the prefix code plus the first 7 suffix
// bytes; val holds either the inline payload or the lex-file offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    rid: Rid,
    aval: [u8; 8],
    val: [u8; INLINE_STR_LEN],
    disp: u8,
}

impl Entry {
    const EMPTY: Entry = Entry { rid: 0, aval: [0; 8], val: [0; INLINE_STR_LEN], disp: 0 };

    fn attr(&self) -> Rid {
        u64::from_ne_bytes(self.aval)
    }

    fn lex_offset(&self) -> u64 {
        i64::from_ne_bytes(self.val[..8].try_into().unwrap()) as u64
    }

    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut b = [0u8; ENTRY_SIZE];
        b[..8].copy_from_slice(&self.rid.to_ne_bytes());
        b[8..16].copy_from_slice(&self.aval);
        b[16..31].copy_from_slice(&self.val);
        b[31] = self.disp;
        b
    }

    fn from_bytes(b: &[u8]) -> Entry {
        Entry {
            rid: u64::from_ne_bytes(b[..8].try_into().unwrap()),
            aval: b[8..16].try_into().unwrap(),
            val: b[16..31].try_into().unwrap(),
            disp: b[31],
        }
    }
}

// Read-only opens can't get a writable mapping, so carry both flavors.
enum Map {
    Rw(MmapMut),
    Ro(Mmap),
}

impl Map {
    fn bytes(&self) -> &[u8] {
        match self {
            Map::Rw(m) => m,
            Map::Ro(m) => m,
        }
    }

    fn bytes_mut(&mut self) -> Result<&mut [u8]> {
        match self {
            Map::Rw(m) => Ok(m),
            Map::Ro(_) => bail!("tried to write through a read-only rhash mapping"),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            Map::Rw(m) => Ok(m.flush()?),
            Map::Ro(_) => Ok(()),
        }
    }
}

pub struct ResourceHash {
    lf: LockableFile,
    map: Option<Map>,
    // bucket count the current mapping was built for; when the header says
    // otherwise the file grew under us and we remap
    size: u32,
    lex_file: File,
    lex_path: PathBuf,
    prefix_file: List,
    // the prefix list's metadata generation the dictionary was loaded at
    prefix_gen: u64,
    prefixes: PrefixDict,
    finder: PrefixFinder,
}

impl Lockable for ResourceHash {
    fn lf(&self) -> &LockableFile {
        &self.lf
    }

    fn lf_mut(&mut self) -> &mut LockableFile {
        &mut self.lf
    }

    fn read_metadata(&mut self) -> Result<()> {
        self.remap()
    }

    fn write_metadata(&mut self) -> Result<()> {
        if self.map.is_none() {
            // initialising a fresh file
            let mut hdr = [0u8; HEADER_SIZE];
            hdr[H_ID..H_ID + 4].copy_from_slice(&RHASH_ID.to_ne_bytes());
            hdr[H_SIZE..H_SIZE + 4].copy_from_slice(&DEFAULT_SIZE.to_ne_bytes());
            hdr[H_COUNT..H_COUNT + 4].copy_from_slice(&0u32.to_ne_bytes());
            hdr[H_SEARCH_DIST..H_SEARCH_DIST + 4]
                .copy_from_slice(&DEFAULT_SEARCH_DIST.to_ne_bytes());
            hdr[H_BUCKET_SIZE..H_BUCKET_SIZE + 4]
                .copy_from_slice(&DEFAULT_BUCKET_SIZE.to_ne_bytes());
            hdr[H_REVISION..H_REVISION + 4].copy_from_slice(&REVISION.to_ne_bytes());
            self.lf
                .file()
                .write_all_at(&hdr, 0)
                .wrap_err_with(|| {
                    format!("failed to write header on '{}'", self.lf.path().display())
                })?;
            self.ensure_size()?;
        }
        if let Some(map) = &self.map {
            map.flush()?;
        }
        if self.lf.writable() {
            self.lex_file
                .sync_all()
                .wrap_err_with(|| format!("fsync({})", self.lex_path.display()))?;
        }
        Ok(())
    }

    // one lock call covers the table and the prefix list, otherwise data
    // imports would spend their time locking and unlocking the prefixes
    fn lock(&mut self, op: LockOp) -> Result<()> {
        match op {
            LockOp::Shared | LockOp::Exclusive => {
                do_lock(self, op)?;
                if let Err(e) = self.prefix_file.lock(op) {
                    let _ = do_lock(self, LockOp::Unlock);
                    return Err(e);
                }
                if let Err(e) = self.refresh_prefixes() {
                    let _ = self.prefix_file.lock(LockOp::Unlock);
                    let _ = do_lock(self, LockOp::Unlock);
                    return Err(e);
                }
                Ok(())
            }
            LockOp::Unlock => {
                // release in reverse acquisition order
                let prefix = self.prefix_file.lock(LockOp::Unlock);
                let primary = do_lock(self, LockOp::Unlock);
                prefix.and(primary)
            }
        }
    }
}

impl ResourceHash {
    pub fn open(path: &Path, flags: OpenFlags) -> Result<ResourceHash> {
        let lf = LockableFile::open(path, flags)?;

        let lex_path = sibling(path, ".lex");
        let lex_file = if flags.write {
            OpenOptions::new()
                .read(true)
                .append(true)
                .create(true)
                .open(&lex_path)
        } else {
            File::open(&lex_path)
        }
        .wrap_err_with(|| format!("failed to open rhash lex file '{}'", lex_path.display()))?;

        let prefix_file = List::open(&sibling(path, ".prefixes"), PREFIX_RECORD_SIZE, flags)?;

        let mut rh = ResourceHash {
            lf,
            map: None,
            size: 0,
            lex_file,
            lex_path,
            prefix_file,
            prefix_gen: 0,
            prefixes: PrefixDict::new(),
            finder: PrefixFinder::new(),
        };
        lockable::init(&mut rh)?;

        // the dictionary hasn't been loaded yet, pull it in
        rh.prefix_file.lock(LockOp::Shared)?;
        let loaded = rh.load_prefixes();
        rh.prefix_file.lock(LockOp::Unlock)?;
        loaded?;

        Ok(rh)
    }

    /// Number of resources stored, from the header.
    pub fn count_r(&self) -> u32 {
        self.hdr_u32(H_COUNT)
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

    // ---- header / mapping ----

    fn hdr_u32(&self, off: usize) -> u32 {
        let m = self.map.as_ref().expect("rhash not mapped");
        u32::from_ne_bytes(m.bytes()[off..off + 4].try_into().unwrap())
    }

    fn set_hdr_u32(&mut self, off: usize, v: u32) -> Result<()> {
        let m = self.map.as_mut().expect("rhash not mapped");
        m.bytes_mut()?[off..off + 4].copy_from_slice(&v.to_ne_bytes());
        Ok(())
    }

    fn bucket_size(&self) -> u64 {
        self.hdr_u32(H_BUCKET_SIZE).max(1) as u64
    }

    fn total_entries(&self) -> u64 {
        self.hdr_u32(H_SIZE) as u64 * self.bucket_size()
    }

    fn home(&self, rid: Rid) -> u64 {
        ((rid >> 10) & (self.hdr_u32(H_SIZE) as u64 - 1)) * self.bucket_size()
    }

    fn remap(&mut self) -> Result<()> {
        let (size, bucket_size) = match &self.map {
            None => {
                // first time: read the header straight off the file
                let mut hdr = [0u8; HEADER_SIZE];
                self.lf.file().read_exact_at(&mut hdr, 0).wrap_err_with(|| {
                    format!("failed to read header of '{}'", self.lf.path().display())
                })?;
                if u32::from_ne_bytes(hdr[H_ID..H_ID + 4].try_into().unwrap()) != RHASH_ID {
                    bail!(StoreError::BadMagic {
                        path: self.lf.path().to_path_buf(),
                        kind: "rhash",
                    });
                }
                (
                    u32::from_ne_bytes(hdr[H_SIZE..H_SIZE + 4].try_into().unwrap()),
                    u32::from_ne_bytes(hdr[H_BUCKET_SIZE..H_BUCKET_SIZE + 4].try_into().unwrap()),
                )
            }
            // the header page is shared, so this sees a grower's new size
            Some(m) => {
                let b = m.bytes();
                (
                    u32::from_ne_bytes(b[H_SIZE..H_SIZE + 4].try_into().unwrap()),
                    u32::from_ne_bytes(b[H_BUCKET_SIZE..H_BUCKET_SIZE + 4].try_into().unwrap()),
                )
            }
        };

        if self.map.is_some() && self.size == size {
            return Ok(());
        }

        let len = HEADER_SIZE + size as usize * bucket_size.max(1) as usize * ENTRY_SIZE;
        // unmap the old window before mapping the larger one
        self.map = None;
        let map = if self.lf.writable() {
            Map::Rw(
                unsafe { MmapOptions::new().len(len).map_mut(self.lf.file()) }
                    .wrap_err_with(|| format!("mmap({})", self.lf.path().display()))?,
            )
        } else {
            Map::Ro(
                unsafe { MmapOptions::new().len(len).map(self.lf.file()) }
                    .wrap_err_with(|| format!("mmap({})", self.lf.path().display()))?,
            )
        };
        self.map = Some(map);
        self.size = size;
        Ok(())
    }

    // Make sure the file physically covers the table before it is mapped:
    // one byte written past the end, so the last entry's page exists and
    // a straggling write can't truncate the final rid.
    fn ensure_size(&self) -> Result<()> {
        if !self.lf.writable() {
            return Ok(());
        }
        let (size, bucket_size) = match &self.map {
            None => (DEFAULT_SIZE as u64, DEFAULT_BUCKET_SIZE as u64),
            Some(_) => (self.hdr_u32(H_SIZE) as u64, self.bucket_size()),
        };
        let len = HEADER_SIZE as u64 + size * bucket_size * ENTRY_SIZE as u64;
        self.lf
            .file()
            .write_all_at(&[0u8], len)
            .wrap_err_with(|| format!("couldn't pre-allocate for '{}'", self.lf.path().display()))
    }

    fn entry_at(&self, idx: u64) -> Entry {
        let m = self.map.as_ref().expect("rhash not mapped");
        let off = HEADER_SIZE + idx as usize * ENTRY_SIZE;
        Entry::from_bytes(&m.bytes()[off..off + ENTRY_SIZE])
    }

    fn set_entry(&mut self, idx: u64, e: Entry) -> Result<()> {
        let m = self.map.as_mut().expect("rhash not mapped");
        let off = HEADER_SIZE + idx as usize * ENTRY_SIZE;
        m.bytes_mut()?[off..off + ENTRY_SIZE].copy_from_slice(&e.to_bytes());
        Ok(())
    }

    // ---- prefix dictionary ----

    fn refresh_prefixes(&mut self) -> Result<()> {
        if self.prefix_file.lf().generation() == self.prefix_gen {
            return Ok(());
        }
        self.load_prefixes()
    }

    // requires at least a read lock on the prefix file
    fn load_prefixes(&mut self) -> Result<()> {
        self.prefixes = PrefixDict::new();
        let mut rec = vec![0u8; PREFIX_RECORD_SIZE];
        self.prefix_file.rewind_r()?;
        while self.prefix_file.next_value_r(&mut rec)? {
            let code = u32::from_ne_bytes(rec[..4].try_into().unwrap());
            let end = rec[4..]
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(PREFIX_RECORD_SIZE - 4);
            let prefix = std::str::from_utf8(&rec[4..4 + end])
                .wrap_err_with(|| {
                    format!(
                        "invalid prefix record {} in '{}'",
                        code,
                        self.prefix_file.lf().path().display()
                    )
                })?
                .to_owned();
            self.prefixes.set(code, prefix);
        }
        self.prefix_gen = self.prefix_file.lf().generation();
        Ok(())
    }

    // A URI went to the lex file: feed the discovery side, and when it
    // fills up, install the best candidates it found.
    fn discover_prefix(&mut self, lex: &str) -> Result<()> {
        if self.finder.note(lex) {
            return Ok(());
        }
        for cand in self.finder.top(32) {
            if self.prefixes.is_full() {
                break;
            }
            if self.prefixes.contains(&cand.prefix) {
                continue;
            }
            let code = self
                .prefixes
                .push(cand.prefix.clone())
                .expect("dictionary checked not full");
            info!("adding prefix {} <{}>", code, cand.prefix);
            let mut rec = vec![0u8; PREFIX_RECORD_SIZE];
            rec[..4].copy_from_slice(&(code as u32).to_ne_bytes());
            rec[4..4 + cand.prefix.len()].copy_from_slice(cand.prefix.as_bytes());
            self.prefix_file.add_r(&rec)?;
        }
        self.finder = PrefixFinder::new();
        Ok(())
    }

    // ---- lex spill file ----

    fn append_lex(&mut self, disp: u8, data: &[u8], uncompressed_len: usize) -> Result<u64> {
        let pos = self
            .lex_file
            .seek(SeekFrom::End(0))
            .wrap_err_with(|| format!("failed to seek to end of '{}'", self.lex_path.display()))?;
        let mut buf = Vec::with_capacity(data.len() + 9);
        buf.extend_from_slice(&(data.len() as i32).to_ne_bytes());
        if disp == DISP_F_ZCOMP {
            buf.extend_from_slice(&(uncompressed_len as i32).to_ne_bytes());
        }
        buf.extend_from_slice(data);
        buf.push(0);
        self.lex_file
            .write_all(&buf)
            .wrap_err_with(|| format!("failed writing to lexical file '{}'", self.lex_path.display()))?;
        Ok(pos)
    }

    fn read_lex_i32(&self, off: u64) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.lex_file.read_exact_at(&mut buf, off).wrap_err_with(|| {
            format!(
                "read error from lexical store '{}', offset {}",
                self.lex_path.display(),
                off
            )
        })?;
        Ok(i32::from_ne_bytes(buf))
    }

    fn read_lex_bytes(&self, off: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.lex_file.read_exact_at(&mut buf, off).wrap_err_with(|| {
            format!(
                "read error from lexical store '{}', offset {}",
                self.lex_path.display(),
                off
            )
        })?;
        Ok(buf)
    }

    // ---- put ----

    /// Store a resource. A rid that is already present is left untouched
    /// (rid hashes are assumed collision-free; the first writer wins).
    pub fn put_r(&mut self, res: &Resource) -> Result<()> {
        self.require_ex()?;

        loop {
            let home = self.home(res.rid);
            let total = self.total_entries();
            if home >= total {
                bail!(
                    "tried to write into rhash '{}' with bad entry number {}",
                    self.lf.path().display(),
                    home
                );
            }

            let mut free: Option<u64> = None;
            for i in 0..self.hdr_u32(H_SEARCH_DIST) as u64 {
                let idx = home + i;
                if idx >= total {
                    break;
                }
                let e = self.entry_at(idx);
                if e.rid == res.rid {
                    return Ok(());
                }
                if e.rid == 0 && free.is_none() {
                    free = Some(idx);
                }
            }

            let Some(slot) = free else {
                // hash overfull, grow
                self.double_size()?;
                continue;
            };

            let e = self.encode(res)?;
            self.set_entry(slot, e)?;
            let count = self.hdr_u32(H_COUNT);
            self.set_hdr_u32(H_COUNT, count + 1)?;
            return Ok(());
        }
    }

    pub fn put(&mut self, res: &Resource) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.put_r(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Batched put: sorted by `(home slot, rid)` for locality, consecutive
    /// duplicate rids and null rids skipped.
    pub fn put_multi_r(&mut self, res: &mut [Resource]) -> Result<()> {
        self.require_ex()?;
        self.sort_by_home(res);

        let mut last = RID_NULL;
        for r in res.iter() {
            if r.rid == RID_NULL || r.rid == last {
                continue;
            }
            self.put_r(r)?;
            last = r.rid;
        }
        Ok(())
    }

    pub fn put_multi(&mut self, res: &mut [Resource]) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.put_multi_r(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    fn sort_by_home(&self, res: &mut [Resource]) {
        let size = self.hdr_u32(H_SIZE) as u64;
        let bucket_size = self.bucket_size();
        res.sort_unstable_by(|a, b| {
            let ha = ((a.rid >> 10) & (size - 1)) * bucket_size;
            let hb = ((b.rid >> 10) & (size - 1)) * bucket_size;
            ha.cmp(&hb).then_with(|| a.rid.cmp(&b.rid))
        });
    }

    fn encode(&mut self, res: &Resource) -> Result<Entry> {
        let mut e = Entry {
            rid: res.rid,
            aval: res.attr.to_ne_bytes(),
            val: [0; INLINE_STR_LEN],
            disp: 0,
        };
        let lex = res.lex.as_str();

        if lex.len() <= INLINE_STR_LEN {
            e.val[..lex.len()].copy_from_slice(lex.as_bytes());
            e.disp = DISP_I_UTF8;
            return Ok(e);
        }
        if let Some(packed) = bcd::compress_bcd(lex) {
            e.val = packed;
            e.disp = DISP_I_NUMBER;
            return Ok(e);
        }
        if let Some(packed) = bcd::compress_bcdate(lex) {
            e.val = packed;
            e.disp = DISP_I_DATE;
            return Ok(e);
        }

        let matched = if rid::is_uri(res.rid) {
            self.prefixes.longest_match(lex)
        } else {
            None
        };

        if let Some((code, plen)) = matched {
            let suffix = &lex.as_bytes()[plen..];
            e.aval = [0; 8];
            e.aval[0] = code;
            if suffix.len() > 22 {
                // even with the prefix, won't fit inline
                let pos = self.append_lex(DISP_F_PREFIX, suffix, 0)?;
                e.val[..8].copy_from_slice(&(pos as i64).to_ne_bytes());
                e.disp = DISP_F_PREFIX;
            } else {
                let head = suffix.len().min(7);
                e.aval[1..1 + head].copy_from_slice(&suffix[..head]);
                if suffix.len() > 7 {
                    e.val[..suffix.len() - 7].copy_from_slice(&suffix[7..]);
                }
                e.disp = DISP_I_PREFIX;
            }
            return Ok(e);
        }

        // goes to the external file
        if rid::is_uri(res.rid) {
            self.discover_prefix(lex)?;
        }

        let bytes = lex.as_bytes();
        let mut data: Cow<[u8]> = Cow::Borrowed(bytes);
        let mut disp = DISP_F_UTF8;
        // only worth trying to compress reasonably long strings
        if bytes.len() > 100 {
            if let Some(z) = try_compress(bytes) {
                data = Cow::Owned(z);
                disp = DISP_F_ZCOMP;
            }
        }
        let pos = self.append_lex(disp, &data, bytes.len())?;
        e.val[..8].copy_from_slice(&(pos as i64).to_ne_bytes());
        e.disp = disp;
        Ok(e)
    }

    fn double_size(&mut self) -> Result<()> {
        let oldsize = self.hdr_u32(H_SIZE) as u64;
        info!("doubling rhash ({})", self.lf.path().display());

        self.set_hdr_u32(H_SIZE, (oldsize * 2) as u32)?;
        self.ensure_size()?;
        self.remap()?;

        let bucket_size = self.bucket_size();
        let old_entries = oldsize * bucket_size;
        let mut hi = vec![Entry::EMPTY; bucket_size as usize];

        for base in (0..old_entries).step_by(bucket_size as usize) {
            hi.fill(Entry::EMPTY);
            for j in 0..bucket_size {
                let e = self.entry_at(base + j);
                if e.rid == 0 {
                    continue;
                }
                if self.home(e.rid) >= old_entries {
                    hi[j as usize] = e;
                    self.set_entry(base + j, Entry::EMPTY)?;
                }
            }
            // mirror bucket in the new upper half; entries keep their
            // position within the bucket
            for j in 0..bucket_size {
                self.set_entry(base + old_entries + j, hi[j as usize])?;
            }
        }
        Ok(())
    }

    // ---- get ----

    /// Look up `res.rid` and fill in `attr` and `lex`. Returns false (with
    /// a synthetic lex) when the rid isn't present, so batch callers can
    /// keep going.
    pub fn get_r(&self, res: &mut Resource) -> Result<bool> {
        self.require_any()?;

        let home = self.home(res.rid);
        let total = self.total_entries();
        let search_dist = self.hdr_u32(H_SEARCH_DIST) as u64;
        for k in 0..search_dist {
            let idx = home + k;
            if idx >= total {
                break;
            }
            let e = self.entry_at(idx);
            if e.rid == res.rid {
                return self.decode(&e, res);
            }
        }

        warn!(
            "resource {:016x} not found in § {:#x}-{:#x} of {}",
            res.rid,
            home,
            home + search_dist - 1,
            self.lf.path().display()
        );
        res.lex = format!("¡resource {:x} not found!", res.rid);
        res.attr = 0;
        Ok(false)
    }

    pub fn get(&mut self, res: &mut Resource) -> Result<bool> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_r(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Batched get, sorted by `(home slot, rid)` for locality. Blank-node
    /// rids are synthesized without touching the table. Returns the number
    /// of rids that were not found.
    pub fn get_multi_r(&self, res: &mut [Resource]) -> Result<usize> {
        self.require_any()?;
        self.sort_by_home(res);

        let mut misses = 0;
        for r in res.iter_mut() {
            r.attr = RID_NULL;
            r.lex = String::new();
            if rid::is_bnode(r.rid) {
                r.lex = format!("_:b{:x}", r.rid);
                continue;
            }
            if !self.get_r(r)? {
                misses += 1;
            }
        }
        Ok(misses)
    }

    pub fn get_multi(&mut self, res: &mut [Resource]) -> Result<usize> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_multi_r(res);
        self.lock(LockOp::Unlock)?;
        ret
    }

    fn decode(&self, e: &Entry, res: &mut Resource) -> Result<bool> {
        match e.disp {
            DISP_I_UTF8 => {
                let len = e.val.iter().position(|&b| b == 0).unwrap_or(INLINE_STR_LEN);
                res.lex = String::from_utf8(e.val[..len].to_vec())
                    .wrap_err("invalid UTF-8 in inline entry")?;
                res.attr = e.attr();
            }
            DISP_I_NUMBER => {
                res.lex = bcd::uncompress_bcd(&e.val);
                res.attr = e.attr();
            }
            DISP_I_DATE => {
                res.lex = bcd::uncompress_bcdate(&e.val);
                res.attr = e.attr();
            }
            DISP_I_PREFIX => {
                let code = e.aval[0];
                let Some(prefix) = self.prefixes.get(code) else {
                    error!("prefix {} out of range, count={}", code, self.prefixes.len());
                    res.lex = format!("¡bad prefix {} (max {})!", code, self.prefixes.len() as i64 - 1);
                    res.attr = 0;
                    return Ok(true);
                };
                let head_len = e.aval[1..].iter().position(|&b| b == 0).unwrap_or(7);
                let tail_len = e.val.iter().position(|&b| b == 0).unwrap_or(INLINE_STR_LEN);
                let mut bytes = Vec::with_capacity(prefix.len() + head_len + tail_len);
                bytes.extend_from_slice(prefix.as_bytes());
                bytes.extend_from_slice(&e.aval[1..1 + head_len]);
                bytes.extend_from_slice(&e.val[..tail_len]);
                res.lex = String::from_utf8(bytes)
                    .wrap_err("invalid UTF-8 in prefix-coded entry")?;
                res.attr = 0;
            }
            DISP_F_UTF8 => {
                let off = e.lex_offset();
                let len = self.read_lex_i32(off)? as usize;
                let bytes = self.read_lex_bytes(off + 4, len)?;
                res.lex =
                    String::from_utf8(bytes).wrap_err("invalid UTF-8 in lexical store")?;
                res.attr = e.attr();
            }
            DISP_F_PREFIX => {
                let code = e.aval[0];
                let Some(prefix) = self.prefixes.get(code) else {
                    error!("prefix {} out of range, count={}", code, self.prefixes.len());
                    res.lex = format!("¡bad prefix {} (max {})!", code, self.prefixes.len() as i64 - 1);
                    res.attr = 0;
                    return Ok(false);
                };
                let off = e.lex_offset();
                let suffix_len = self.read_lex_i32(off)? as usize;
                let suffix = self.read_lex_bytes(off + 4, suffix_len)?;
                let mut bytes = Vec::with_capacity(prefix.len() + suffix.len());
                bytes.extend_from_slice(prefix.as_bytes());
                bytes.extend_from_slice(&suffix);
                res.lex = String::from_utf8(bytes)
                    .wrap_err("invalid UTF-8 in prefix-coded entry")?;
                res.attr = 0;
            }
            DISP_F_ZCOMP => {
                let off = e.lex_offset();
                let comp_len = self.read_lex_i32(off)? as usize;
                let lex_len = self.read_lex_i32(off + 4)? as usize;
                let comp = self.read_lex_bytes(off + 8, comp_len)?;

                let mut bytes = Vec::with_capacity(lex_len);
                let mut dec = flate2::bufread::ZlibDecoder::new(&comp[..]);
                match dec.read_to_end(&mut bytes) {
                    Ok(_) => {
                        if bytes.len() != lex_len {
                            error!(
                                "decompression of rid {:016x} produced {} bytes, expected {}",
                                e.rid,
                                bytes.len(),
                                lex_len
                            );
                        }
                        res.lex = String::from_utf8(bytes)
                            .wrap_err("invalid UTF-8 in lexical store")?;
                        res.attr = e.attr();
                    }
                    Err(err) => {
                        warn!("zlib error reading rid {:016x}: {err}", e.rid);
                        res.lex = String::new();
                        res.attr = e.attr();
                        return Ok(false);
                    }
                }
            }
            other => {
                res.lex = format!("error: unknown disposition: {}", other as char);
                res.attr = 0;
                return Ok(false);
            }
        }
        Ok(true)
    }
}

fn try_compress(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    if let Err(err) = enc.write_all(bytes) {
        warn!("zlib error: {err}");
        return None;
    }
    match enc.finish() {
        // only worth storing compressed if it actually saves more than the
        // extra length field
        Ok(z) if !z.is_empty() && z.len() < bytes.len() - 4 => Some(z),
        Ok(_) => None,
        Err(err) => {
            warn!("zlib error: {err}");
            None
        }
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}
