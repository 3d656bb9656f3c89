use crate::prelude::*;
use fs2::FileExt;
use std::fs::OpenOptions;
use std::io;
use std::time::SystemTime;

// Shared base for every on-disk container: a file descriptor, the advisory
// whole-file lock protocol around it, and the "revalidate the header when
// someone else touched the file" discipline.
//
// The protocol, as seen by other processes:
//
// - writers hold EX for the duration of a batch of mutations; releasing EX
//   writes the container's metadata, fsyncs, and only then drops the flock,
//   so a reader that acquires SH afterwards sees a consistent file;
// - every acquisition stats the file and re-reads the metadata if the mtime
//   moved past the value cached at our last sync, so containers notice
//   growth (and remap, reload dictionaries, ...) without any side channel.
//
// Locks are never upgraded or downgraded through this API; flock(2) would
// happily convert them, but a conversion drops the old lock first and that
// window has bitten us before. Asking for one is a programmer error.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOp {
    Shared,
    Exclusive,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Shared,
    Exclusive,
}

#[derive(Debug, Clone, Copy)]
pub struct OpenFlags {
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub fn read_only() -> OpenFlags {
        OpenFlags { write: false, create: false, truncate: false }
    }

    pub fn read_write() -> OpenFlags {
        OpenFlags { write: true, create: false, truncate: false }
    }

    pub fn create() -> OpenFlags {
        OpenFlags { write: true, create: true, truncate: false }
    }

    pub fn truncate() -> OpenFlags {
        OpenFlags { write: true, create: true, truncate: true }
    }
}

// fs2's lock methods are thin wrappers around flock(2) and in particular
// don't handle EINTR.
fn retry_interrupted(mut f: impl FnMut() -> io::Result<()>) -> io::Result<()> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

#[derive(Debug)]
pub struct LockableFile {
    file: File,
    path: PathBuf,
    flags: OpenFlags,
    state: LockState,
    // mtime at our last init/sync; None until init has run
    mtime: Option<SystemTime>,
    // bumped every time read_metadata runs, so owners of sibling files can
    // tell "the metadata I depend on was just re-read" apart from an
    // ordinary lock acquisition
    generation: u64,
}

impl LockableFile {
    pub fn open(path: &Path, flags: OpenFlags) -> Result<LockableFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(flags.write)
            .create(flags.create)
            .truncate(flags.truncate)
            .open(path)
            .wrap_err_with(|| format!("failed to open '{}'", path.display()))?;
        Ok(LockableFile {
            file,
            path: path.to_path_buf(),
            flags,
            state: LockState::Unlocked,
            mtime: None,
            generation: 0,
        })
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn writable(&self) -> bool {
        self.flags.write
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self
            .file
            .metadata()
            .wrap_err_with(|| format!("fstat({})", self.path.display()))?
            .len())
    }

    fn stat_mtime(&self) -> Result<SystemTime> {
        self.file
            .metadata()
            .wrap_err_with(|| format!("fstat({})", self.path.display()))?
            .modified()
            .wrap_err_with(|| format!("fstat({})", self.path.display()))
    }

    fn flock(&self, op: LockOp) -> Result<()> {
        retry_interrupted(|| match op {
            LockOp::Shared => self.file.lock_shared(),
            LockOp::Exclusive => self.file.lock_exclusive(),
            LockOp::Unlock => self.file.unlock(),
        })
        .wrap_err_with(|| format!("flock({})", self.path.display()))
    }

    pub fn sync_all(&self) -> Result<()> {
        // sync_all is a real barrier on Darwin too (F_FULLFSYNC)
        self.file
            .sync_all()
            .wrap_err_with(|| format!("fsync({})", self.path.display()))
    }
}

/// The capability a container needs to live behind the locking protocol:
/// access to its `LockableFile` plus the two metadata callbacks. `lock` has
/// a default implementation; a container that must couple another file into
/// its lock (the resource hash and its prefix list) overrides it and calls
/// back into [`do_lock`].
pub trait Lockable {
    fn lf(&self) -> &LockableFile;
    fn lf_mut(&mut self) -> &mut LockableFile;

    /// Re-read the container's header/metadata from disk. Called under a
    /// held lock whenever the file's mtime has moved past our cached value.
    fn read_metadata(&mut self) -> Result<()>;

    /// Write the container's metadata out. Called under EX, before fsync.
    fn write_metadata(&mut self) -> Result<()>;

    fn lock(&mut self, op: LockOp) -> Result<()> {
        do_lock(self, op)
    }

    /// Does the current lock state match `state`?
    fn holds(&self, state: LockState) -> bool {
        self.lf().state == state
    }

    fn holds_any(&self) -> bool {
        self.lf().state != LockState::Unlocked
    }
}

/// Flush metadata and data to disc. Requires EX.
fn sync<T: Lockable + ?Sized>(this: &mut T) -> Result<()> {
    debug_assert!(this.holds(LockState::Exclusive));
    this.write_metadata()?;
    this.lf().sync_all()
}

/// The shared lock state machine. Containers normally reach this through
/// `Lockable::lock`.
pub fn do_lock<T: Lockable + ?Sized>(this: &mut T, op: LockOp) -> Result<()> {
    let state = this.lf().state;

    match (state, op) {
        (LockState::Shared, LockOp::Exclusive) | (LockState::Exclusive, LockOp::Shared) => {
            bail!(StoreError::LockTransition { path: this.lf().path.clone() })
        }
        (LockState::Shared, LockOp::Shared) | (LockState::Exclusive, LockOp::Exclusive) => {
            bail!(StoreError::DoubleLock { path: this.lf().path.clone(), op })
        }
        _ => {}
    }

    // releasing a write lock flushes data first, and refreshes the cached
    // mtime so our own flush doesn't look like someone else's change
    if state == LockState::Exclusive && op == LockOp::Unlock {
        sync(this)?;
        let mtime = this.lf().stat_mtime()?;
        this.lf_mut().mtime = Some(mtime);
    }

    this.lf().flock(op)?;
    this.lf_mut().state = match op {
        LockOp::Shared => LockState::Shared,
        LockOp::Exclusive => LockState::Exclusive,
        LockOp::Unlock => LockState::Unlocked,
    };

    if matches!(op, LockOp::Shared | LockOp::Exclusive) {
        if let Err(e) = revalidate(this) {
            // don't hold the lock across a failure
            let _ = this.lf().flock(LockOp::Unlock);
            this.lf_mut().state = LockState::Unlocked;
            return Err(e);
        }
    }

    Ok(())
}

fn revalidate<T: Lockable + ?Sized>(this: &mut T) -> Result<()> {
    let mtime = this.lf().stat_mtime()?;
    let stale = match this.lf().mtime {
        Some(cached) => mtime > cached,
        None => true,
    };
    if stale {
        this.read_metadata()?;
        this.lf_mut().generation += 1;
    }
    Ok(())
}

/// Bring a freshly opened container into a consistent state: write the
/// header if the file is new (or was truncated), read the metadata, cache
/// the mtime. Leaves the file unlocked.
pub fn init<T: Lockable + ?Sized>(this: &mut T) -> Result<()> {
    if let Err(e) = init_inner(this) {
        let _ = this.lf().flock(LockOp::Unlock);
        this.lf_mut().state = LockState::Unlocked;
        return Err(e);
    }
    Ok(())
}

fn init_inner<T: Lockable + ?Sized>(this: &mut T) -> Result<()> {
    if this.lf().flags.truncate {
        // we just truncated the file, so write a fresh header
        this.lf().flock(LockOp::Exclusive)?;
        this.write_metadata()?;
        this.lf().sync_all()?;
        // SH after EX atomically replaces the lock
        this.lf().flock(LockOp::Shared)?;
    } else {
        // don't take the exclusive lock yet so we don't unnecessarily
        // block other readers
        this.lf().flock(LockOp::Shared)?;
        if this.lf().len()? == 0 {
            // empty file: either we just created it, or someone else did
            // and hasn't initialized it yet. Check again with the lock
            // upgraded.
            this.lf().flock(LockOp::Exclusive)?;
            if this.lf().len()? == 0 {
                this.write_metadata()?;
            }
            this.lf().sync_all()?;
            this.lf().flock(LockOp::Shared)?;
        }
    }

    // holding a read lock here; pull in the header
    this.lf_mut().state = LockState::Shared;
    this.read_metadata()?;
    this.lf_mut().generation += 1;

    let mtime = this.lf().stat_mtime()?;
    this.lf_mut().mtime = Some(mtime);

    this.lf().flock(LockOp::Unlock)?;
    this.lf_mut().state = LockState::Unlocked;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::os::unix::fs::FileExt as _;

    // minimal container: the metadata is a single u64 at offset 0
    struct Counter {
        lf: LockableFile,
        value: u64,
        reads: u32,
    }

    impl Counter {
        fn open(path: &Path, flags: OpenFlags) -> Result<Counter> {
            let lf = LockableFile::open(path, flags)?;
            let mut c = Counter { lf, value: 0, reads: 0 };
            init(&mut c)?;
            Ok(c)
        }
    }

    impl Lockable for Counter {
        fn lf(&self) -> &LockableFile {
            &self.lf
        }
        fn lf_mut(&mut self) -> &mut LockableFile {
            &mut self.lf
        }
        fn read_metadata(&mut self) -> Result<()> {
            let mut buf = [0u8; 8];
            let n = self.lf.file().read_at(&mut buf, 0)?;
            if n == 8 {
                self.value = u64::from_ne_bytes(buf);
            }
            self.reads += 1;
            Ok(())
        }
        fn write_metadata(&mut self) -> Result<()> {
            self.lf.file().write_all_at(&self.value.to_ne_bytes(), 0)?;
            Ok(())
        }
    }

    #[test]
    fn init_leaves_unlocked() {
        let dir = tempfile::tempdir().unwrap();
        let c = Counter::open(&dir.path().join("c"), OpenFlags::truncate()).unwrap();
        assert!(c.holds(LockState::Unlocked));
        assert_eq!(c.value, 0);
    }

    #[test]
    fn double_lock_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Counter::open(&dir.path().join("c"), OpenFlags::truncate()).unwrap();

        c.lock(LockOp::Shared).unwrap();
        assert!(c.lock(LockOp::Shared).is_err());
        assert!(c.holds(LockState::Shared));
        c.lock(LockOp::Unlock).unwrap();

        c.lock(LockOp::Exclusive).unwrap();
        assert!(c.lock(LockOp::Exclusive).is_err());
        assert!(c.holds(LockState::Exclusive));
        c.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn upgrade_downgrade_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = Counter::open(&dir.path().join("c"), OpenFlags::truncate()).unwrap();

        c.lock(LockOp::Shared).unwrap();
        assert!(c.lock(LockOp::Exclusive).is_err());
        assert!(c.holds(LockState::Shared));
        c.lock(LockOp::Unlock).unwrap();

        c.lock(LockOp::Exclusive).unwrap();
        assert!(c.lock(LockOp::Shared).is_err());
        assert!(c.holds(LockState::Exclusive));
        c.lock(LockOp::Unlock).unwrap();
    }

    #[test]
    fn mtime_revalidation_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c");

        let mut writer = Counter::open(&path, OpenFlags::truncate()).unwrap();
        let mut reader = Counter::open(&path, OpenFlags::read_only()).unwrap();
        assert_eq!(reader.value, 0);

        // coarse mtime clocks: make sure the writer's flush lands on a
        // later timestamp than the reader's cached one
        std::thread::sleep(std::time::Duration::from_millis(25));

        writer.lock(LockOp::Exclusive).unwrap();
        writer.value = 42;
        writer.lock(LockOp::Unlock).unwrap();

        let gen_before = reader.lf().generation();
        reader.lock(LockOp::Shared).unwrap();
        assert_eq!(reader.value, 42);
        assert_eq!(reader.lf().generation(), gen_before + 1);
        reader.lock(LockOp::Unlock).unwrap();
    }
}
