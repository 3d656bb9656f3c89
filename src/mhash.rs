use crate::prelude::*;
use crate::lockable::{self, LockOp, LockState, Lockable, LockableFile, OpenFlags};
use std::os::unix::fs::FileExt as _;

// Persistent map from a model rid to its index node: 0 = no models, 1 = the
// quads live in a separate file, 2+ = position in the model list. Small key
// sets, updated in place, so plain positional I/O instead of a mapping.
//
// Open addressing with a bounded linear probe. A put that cannot find a
// free slot inside the probe window doubles the table; entries whose home
// gains the new high bit move to the mirror slot in the upper half, which
// is the whole rehash.

const MHASH_ID: u32 = 0x4a58_4d30; // "JXM0"
const DEFAULT_SIZE: u32 = 4096;
const DEFAULT_SEARCH_DIST: u32 = 16;
const HEADER_SIZE: usize = 512;
const ENTRY_SIZE: usize = 12;

pub type IndexNode = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Entry {
    rid: Rid,
    val: IndexNode,
}

impl Entry {
    fn to_bytes(self) -> [u8; ENTRY_SIZE] {
        let mut b = [0u8; ENTRY_SIZE];
        b[..8].copy_from_slice(&self.rid.to_ne_bytes());
        b[8..].copy_from_slice(&self.val.to_ne_bytes());
        b
    }

    fn from_bytes(b: &[u8; ENTRY_SIZE]) -> Entry {
        Entry {
            rid: u64::from_ne_bytes(b[..8].try_into().unwrap()),
            val: u32::from_ne_bytes(b[8..].try_into().unwrap()),
        }
    }
}

/// The triple-chain collaborator consulted by [`ModelHash::check_chain_r`].
/// Implemented elsewhere; the model hash only needs these two probes.
pub trait TripleChain {
    fn check_consistency(&mut self, model: Rid, node: IndexNode) -> Result<()>;
    fn check_leaks(&mut self) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainCheckReport {
    pub scanned: u32,
    pub failures: u32,
}

pub struct ModelHash {
    lf: LockableFile,
    size: u32,
    count: u32,
    search_dist: u32,
}

impl Lockable for ModelHash {
    fn lf(&self) -> &LockableFile {
        &self.lf
    }

    fn lf_mut(&mut self) -> &mut LockableFile {
        &mut self.lf
    }

    fn read_metadata(&mut self) -> Result<()> {
        let mut hdr = [0u8; HEADER_SIZE];
        self.lf
            .file()
            .read_exact_at(&mut hdr, 0)
            .wrap_err_with(|| format!("failed to read header of '{}'", self.lf.path().display()))?;
        if u32::from_ne_bytes(hdr[..4].try_into().unwrap()) != MHASH_ID {
            bail!(StoreError::BadMagic {
                path: self.lf.path().to_path_buf(),
                kind: "mhash",
            });
        }
        self.size = u32::from_ne_bytes(hdr[4..8].try_into().unwrap());
        self.count = u32::from_ne_bytes(hdr[8..12].try_into().unwrap());
        self.search_dist = u32::from_ne_bytes(hdr[12..16].try_into().unwrap());
        Ok(())
    }

    fn write_metadata(&mut self) -> Result<()> {
        let mut hdr = [0u8; HEADER_SIZE];
        hdr[..4].copy_from_slice(&MHASH_ID.to_ne_bytes());
        hdr[4..8].copy_from_slice(&self.size.to_ne_bytes());
        hdr[8..12].copy_from_slice(&self.count.to_ne_bytes());
        hdr[12..16].copy_from_slice(&self.search_dist.to_ne_bytes());
        self.lf
            .file()
            .write_all_at(&hdr, 0)
            .wrap_err_with(|| format!("failed to write header on '{}'", self.lf.path().display()))
    }
}

impl ModelHash {
    pub fn open(path: &Path, flags: OpenFlags) -> Result<ModelHash> {
        let lf = LockableFile::open(path, flags)?;
        let mut mh = ModelHash {
            lf,
            size: DEFAULT_SIZE,
            count: 0,
            search_dist: DEFAULT_SEARCH_DIST,
        };
        lockable::init(&mut mh)?;
        Ok(mh)
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

    fn home(&self, rid: Rid) -> u64 {
        (rid >> 10) & (self.size as u64 - 1)
    }

    fn entry_at(&self, slot: u64) -> Result<Entry> {
        let mut buf = [0u8; ENTRY_SIZE];
        let base = HEADER_SIZE as u64 + slot * ENTRY_SIZE as u64;
        let mut filled = 0;
        while filled < ENTRY_SIZE {
            let n = self
                .lf
                .file()
                .read_at(&mut buf[filled..], base + filled as u64)
                .wrap_err_with(|| format!("read from '{}' failed", self.lf.path().display()))?;
            if n == 0 {
                // past EOF: the slot was never written, which reads as empty
                break;
            }
            filled += n;
        }
        Ok(Entry::from_bytes(&buf))
    }

    fn set_entry(&self, slot: u64, e: Entry) -> Result<()> {
        self.lf
            .file()
            .write_all_at(&e.to_bytes(), HEADER_SIZE as u64 + slot * ENTRY_SIZE as u64)
            .wrap_err_with(|| format!("write to '{}' failed", self.lf.path().display()))
    }

    /// Map `rid` to `val`. `val == 0` removes the mapping (the slot keeps
    /// the rid, so the count is the number of non-zero values).
    pub fn put_r(&mut self, rid: Rid, val: IndexNode) -> Result<()> {
        self.require_ex()?;

        loop {
            let mut slot = self.home(rid);
            let mut candidate: Option<u64> = None;
            let mut i = 0u32;
            let found = loop {
                let e = self.entry_at(slot)?;
                if e.rid == rid {
                    break Some((slot, e));
                }
                if e.rid == 0 && candidate.is_none() {
                    // can't stop here: a matching entry may still be
                    // later in the window
                    candidate = Some(slot);
                }
                if i == self.search_dist || slot == self.size as u64 - 1 {
                    break match candidate {
                        Some(c) => Some((c, self.entry_at(c)?)),
                        None => None,
                    };
                }
                slot += 1;
                i += 1;
            };

            let Some((slot, cur)) = found else {
                // overfull, grow and try again
                self.double_size()?;
                continue;
            };

            if cur.rid == rid && cur.val == val {
                // no change, don't touch the file
                return Ok(());
            }

            let oldval = cur.val;
            self.set_entry(slot, Entry { rid, val })?;
            if val != 0 {
                if oldval == 0 {
                    self.count += 1;
                }
            } else if oldval != 0 {
                self.count -= 1;
            }
            return Ok(());
        }
    }

    pub fn put(&mut self, rid: Rid, val: IndexNode) -> Result<()> {
        self.lock(LockOp::Exclusive)?;
        let ret = self.put_r(rid, val);
        self.lock(LockOp::Unlock)?;
        ret
    }

    fn double_size(&mut self) -> Result<()> {
        let oldsize = self.size as u64;
        self.size *= 2;
        self.search_dist = self.search_dist * 2 + 1;
        self.ensure_size()?;

        for i in 0..oldsize {
            let e = self.entry_at(i)?;
            if e.rid == 0 {
                continue;
            }
            if self.home(e.rid) >= oldsize {
                self.set_entry(i, Entry::default())?;
                self.set_entry(oldsize + i, e)?;
            }
        }
        Ok(())
    }

    // grow the file past the new last entry before anything lands there
    fn ensure_size(&self) -> Result<()> {
        let len = HEADER_SIZE as u64 + self.size as u64 * ENTRY_SIZE as u64;
        self.lf
            .file()
            .write_all_at(&[0u8], len)
            .wrap_err_with(|| {
                format!("couldn't pre-allocate for '{}'", self.lf.path().display())
            })
    }

    /// Look up `rid`. Returns 0 for absent keys.
    pub fn get_r(&self, rid: Rid) -> Result<IndexNode> {
        self.require_any()?;

        let mut slot = self.home(rid);
        for _ in 0..self.search_dist {
            let e = self.entry_at(slot)?;
            if e.rid == rid {
                return Ok(e.val);
            }
            slot = (slot + 1) & (self.size as u64 - 1);
            if slot == 0 {
                break;
            }
        }
        Ok(0)
    }

    pub fn get(&mut self, rid: Rid) -> Result<IndexNode> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_r(rid);
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// All rids whose value is non-zero, in table order.
    pub fn get_keys_r(&self) -> Result<Vec<Rid>> {
        self.require_any()?;
        let mut keys = Vec::new();
        for slot in 0..self.size as u64 {
            let e = self.entry_at(slot)?;
            if e.val != 0 {
                keys.push(e.rid);
            }
        }
        Ok(keys)
    }

    pub fn get_keys(&mut self) -> Result<Vec<Rid>> {
        self.lock(LockOp::Shared)?;
        let ret = self.get_keys_r();
        self.lock(LockOp::Unlock)?;
        ret
    }

    /// Number of models stored, from the header.
    pub fn count_r(&self) -> u32 {
        self.count
    }

    /// Run the triple-chain consistency check over every populated entry.
    pub fn check_chain_r(&self, tbc: &mut dyn TripleChain) -> Result<ChainCheckReport> {
        self.require_any()?;

        let mut report = ChainCheckReport::default();
        for slot in 0..self.size as u64 {
            let e = self.entry_at(slot)?;
            if e.rid != 0 && e.val != 0 {
                report.scanned += 1;
                if let Err(err) = tbc.check_consistency(e.rid, e.val) {
                    warn!("chain check failed for model {:016x}: {err}", e.rid);
                    report.failures += 1;
                }
            }
        }
        if report.scanned > 0 {
            if let Err(err) = tbc.check_leaks() {
                warn!("chain leak check failed: {err}");
                report.failures += 1;
            }
        }
        if report.scanned != self.count {
            error!(
                "{}: header count {} != scanned count {}",
                self.lf.path().display(),
                self.count,
                report.scanned
            );
        }
        Ok(report)
    }

    pub fn check_chain(&mut self, tbc: &mut dyn TripleChain) -> Result<ChainCheckReport> {
        self.lock(LockOp::Shared)?;
        let ret = self.check_chain_r(tbc);
        self.lock(LockOp::Unlock)?;
        ret
    }
}
