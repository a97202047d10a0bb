//! Page-map construction, copy-on-write sharing, and three-way merge.
//!
//! The four-level tree described by the data model is realized here as a
//! tree of allocator-backed [`Table`]s rather than as raw pointers into
//! identity-mapped physical memory: each interior/leaf frame still comes
//! from [`FRAMES`] (so refcount and sharing accounting stay authoritative),
//! but its *content* lives in a side table keyed by frame number. This
//! keeps the walker host-testable without a real MMU underneath it; see
//! DESIGN.md for the tradeoff.
//!
//! Copy-on-write is realized at leaf (page) granularity. `copy`/`merge`
//! alias individual data frames across roots and bump their refcount;
//! interior subtables are never shared between roots, so the generic
//! per-level COW-propagation the data model describes for subtables has
//! no observable counterpart here — only the leaf path needs it, and that
//! lives in [`crate::mm::pagefault`].

extern crate alloc;

use alloc::boxed::Box;
use alloc::collections::BTreeMap;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame::{FrameNumber, FRAMES, FRAME_SIZE, ZERO_FRAME};
use crate::net::rr::RemoteRef;
use crate::println;

bitflags::bitflags! {
    /// Nominal (software) permission bits recorded on a PTE, independent of
    /// whatever hardware-valid/writable bits the leaf's current form implies.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PtePerm: u8 {
        const READ  = 0b01;
        const WRITE = 0b10;
    }
}

/// Lower bound of the mappable user window (inclusive).
pub const USERLO: u64 = 0x0000_0000_0010_0000;
/// Upper bound of the mappable user window (exclusive).
pub const USERHI: u64 = 0x0000_0000_4000_0000;

/// Slot in the root table reserved for the copied-by-value kernel half.
/// Never touched by `insert`/`remove`/`copy`/`merge`/`setperm`, all of
/// which only ever address `[USERLO, USERHI)`.
const KERNEL_SLOT: usize = 511;

const LEVEL_SHIFTS: [u32; 4] = [39, 30, 21, 12];

fn level_index(va: u64, level: usize) -> usize {
    ((va >> LEVEL_SHIFTS[level]) & 0x1FF) as usize
}

/// One slot in the tree. At interior levels `Present` names a subtable
/// frame; at the leaf level it names a data frame.
#[derive(Clone, Copy, Debug)]
pub enum Entry {
    /// Demand-zero: reads succeed (as all-zero bytes) only if `perm`
    /// grants read; any write traps into [`crate::mm::pagefault`].
    Zero(PtePerm),
    /// The subtree (or page) is known to live on another node and has not
    /// been pulled in yet.
    Remote(RemoteRef),
    /// A real frame backs this slot.
    Present {
        frame: FrameNumber,
        writable: bool,
        perm: PtePerm,
    },
}

impl Entry {
    const fn empty() -> Self {
        Entry::Zero(PtePerm::empty())
    }
}

#[derive(Clone, Copy)]
struct Table {
    entries: [Entry; 512],
}

impl Table {
    fn zeroed() -> Self {
        Self {
            entries: [Entry::empty(); 512],
        }
    }
}

/// One leaf slot: which L1 table, and which index within it.
#[derive(Clone, Copy)]
struct Leaf {
    table: FrameNumber,
    index: usize,
}

static TABLES: Mutex<BTreeMap<u64, Box<Table>>> = Mutex::new(BTreeMap::new());
static PAGES: Mutex<BTreeMap<u64, Box<[u8; FRAME_SIZE]>>> = Mutex::new(BTreeMap::new());

fn with_table<R>(frame: FrameNumber, f: impl FnOnce(&Table) -> R) -> R {
    let guard = TABLES.lock();
    let t = guard.get(&frame.as_u64()).expect("subtable content missing");
    f(t)
}

fn with_table_mut<R>(frame: FrameNumber, f: impl FnOnce(&mut Table) -> R) -> R {
    let mut guard = TABLES.lock();
    let t = guard
        .get_mut(&frame.as_u64())
        .expect("subtable content missing");
    f(t)
}

fn with_page<R>(frame: FrameNumber, f: impl FnOnce(&[u8; FRAME_SIZE]) -> R) -> R {
    let guard = PAGES.lock();
    let p = guard.get(&frame.as_u64()).expect("page content missing");
    f(p)
}

pub(crate) fn with_page_mut<R>(frame: FrameNumber, f: impl FnOnce(&mut [u8; FRAME_SIZE]) -> R) -> R {
    let mut guard = PAGES.lock();
    let p = guard.get_mut(&frame.as_u64()).expect("page content missing");
    f(p)
}

pub(crate) fn page_bytes(frame: FrameNumber) -> [u8; FRAME_SIZE] {
    with_page(frame, |p| *p)
}

fn alloc_table() -> KernelResult<FrameNumber> {
    let frame = FRAMES.alloc()?;
    TABLES.lock().insert(frame.as_u64(), Box::new(Table::zeroed()));
    Ok(frame)
}

pub(crate) fn alloc_page_zeroed() -> KernelResult<FrameNumber> {
    let frame = FRAMES.alloc()?;
    PAGES.lock().insert(frame.as_u64(), Box::new([0u8; FRAME_SIZE]));
    Ok(frame)
}

fn free_table_if_reclaimed(frame: FrameNumber) -> KernelResult<()> {
    if FRAMES.dec_ref(frame)? {
        TABLES.lock().remove(&frame.as_u64());
    }
    Ok(())
}

pub(crate) fn free_page_if_reclaimed(frame: FrameNumber) -> KernelResult<()> {
    if FRAMES.dec_ref(frame)? {
        PAGES.lock().remove(&frame.as_u64());
    }
    Ok(())
}

fn materialize_subtable(parent: FrameNumber, idx: usize, perm: PtePerm) -> KernelResult<FrameNumber> {
    let fresh = alloc_table()?;
    with_table_mut(parent, |t| {
        t.entries[idx] = Entry::Present {
            frame: fresh,
            writable: true,
            perm,
        };
    });
    Ok(fresh)
}

/// Descend the first three levels (L4, L3, L2), reading only. Returns
/// `None` the moment an interior slot is absent -- nothing is mapped at
/// `va`, and nothing is materialized.
fn descend_read(root: FrameNumber, va: u64) -> KernelResult<Option<Leaf>> {
    let mut table = root;
    for level in 0..3 {
        let idx = level_index(va, level);
        let entry = with_table(table, |t| t.entries[idx]);
        table = match entry {
            Entry::Present { frame, .. } => frame,
            Entry::Zero(_) => return Ok(None),
            Entry::Remote(rr) => return Err(KernelError::RemoteDenied { rr }),
        };
    }
    Ok(Some(Leaf {
        table,
        index: level_index(va, 3),
    }))
}

/// Descend the first three levels, materializing any absent subtable along
/// the way, so the caller is guaranteed a leaf slot to read or write.
fn descend_write(root: FrameNumber, va: u64) -> KernelResult<Leaf> {
    let mut table = root;
    for level in 0..3 {
        let idx = level_index(va, level);
        let entry = with_table(table, |t| t.entries[idx]);
        table = match entry {
            Entry::Present { frame, .. } => frame,
            Entry::Zero(perm) => materialize_subtable(table, idx, perm)?,
            Entry::Remote(rr) => return Err(KernelError::RemoteDenied { rr }),
        };
    }
    Ok(Leaf {
        table,
        index: level_index(va, 3),
    })
}

/// Read-only peek at the leaf entry for `va`; an absent interior path reads
/// back as an empty zero-mapping.
pub fn peek(root: FrameNumber, va: u64) -> KernelResult<Entry> {
    match descend_read(root, va)? {
        None => Ok(Entry::empty()),
        Some(leaf) => Ok(with_table(leaf.table, |t| t.entries[leaf.index])),
    }
}

fn check_user_range(va: u64, size: u64) -> KernelResult<()> {
    if va % FRAME_SIZE as u64 != 0 || size % FRAME_SIZE as u64 != 0 {
        return Err(KernelError::Unaligned { addr: va });
    }
    let end = va.checked_add(size).ok_or(KernelError::InvalidAddress { addr: va })?;
    if va < USERLO || end > USERHI {
        return Err(KernelError::InvalidAddress { addr: va });
    }
    Ok(())
}

/// Build a fresh root for a new process: the kernel slot copied by value
/// (refcount-shared, since nothing in this module ever mutates it) from
/// `kernel_template`; the whole user window left as empty zero-mappings.
pub fn new_root(kernel_template: FrameNumber) -> KernelResult<FrameNumber> {
    let root = alloc_table()?;
    let kernel_entry = with_table(kernel_template, |t| t.entries[KERNEL_SLOT]);
    if let Entry::Present { frame, .. } = kernel_entry {
        FRAMES.inc_ref(frame)?;
    }
    with_table_mut(root, |t| t.entries[KERNEL_SLOT] = kernel_entry);
    Ok(root)
}

/// Build the template root used to seed every process's kernel slot. The
/// hardware specifics of identity-mapping physical memory are assumed
/// (see the purpose-and-scope note on trap frames); this allocates one
/// placeholder frame standing in for that mapping.
pub fn build_kernel_template() -> KernelResult<FrameNumber> {
    let root = alloc_table()?;
    let placeholder = alloc_page_zeroed()?;
    with_table_mut(root, |t| {
        t.entries[KERNEL_SLOT] = Entry::Present {
            frame: placeholder,
            writable: true,
            perm: PtePerm::READ | PtePerm::WRITE,
        };
    });
    Ok(root)
}

/// Install `frame` at `va`, replacing (and dropping the refcount of) any
/// prior mapping.
pub fn insert(root: FrameNumber, frame: FrameNumber, va: u64, perm: PtePerm) -> KernelResult<()> {
    check_user_range(va, FRAME_SIZE as u64)?;
    let leaf = descend_write(root, va)?;
    let prior = with_table(leaf.table, |t| t.entries[leaf.index]);
    if let Entry::Present { frame: old, .. } = prior {
        free_page_if_reclaimed(old)?;
    }
    FRAMES.inc_ref(frame)?;
    with_table_mut(leaf.table, |t| {
        t.entries[leaf.index] = Entry::Present {
            frame,
            writable: perm.contains(PtePerm::WRITE),
            perm,
        };
    });
    Ok(())
}

fn discard_leaf(leaf: Leaf) -> KernelResult<()> {
    let prior = with_table(leaf.table, |t| t.entries[leaf.index]);
    if let Entry::Present { frame, .. } = prior {
        free_page_if_reclaimed(frame)?;
    }
    with_table_mut(leaf.table, |t| t.entries[leaf.index] = Entry::empty());
    Ok(())
}

fn remove_page(root: FrameNumber, va: u64) -> KernelResult<()> {
    match descend_read(root, va)? {
        Some(leaf) => discard_leaf(leaf),
        None => Ok(()),
    }
}

/// Clear every mapping in `[va, va+size)`.
pub fn remove(root: FrameNumber, va: u64, size: u64) -> KernelResult<()> {
    check_user_range(va, size)?;
    let pages = size / FRAME_SIZE as u64;
    for i in 0..pages {
        remove_page(root, va + i * FRAME_SIZE as u64)?;
    }
    Ok(())
}

/// Read a page's bytes regardless of which form its entry takes.
fn read_page_bytes(entry: Entry) -> KernelResult<[u8; FRAME_SIZE]> {
    match entry {
        Entry::Zero(_) => Ok([0u8; FRAME_SIZE]),
        Entry::Present { frame, .. } => Ok(with_page(frame, |p| *p)),
        Entry::Remote(rr) => Err(KernelError::RemoteDenied { rr }),
    }
}

fn copy_page(src_root: FrameNumber, src_va: u64, dst_root: FrameNumber, dst_va: u64) -> KernelResult<()> {
    let src_leaf = descend_write(src_root, src_va)?;
    let src_entry = with_table(src_leaf.table, |t| t.entries[src_leaf.index]);
    let shared_entry = match src_entry {
        Entry::Zero(perm) => Entry::Zero(perm),
        Entry::Remote(rr) => Entry::Remote(rr),
        Entry::Present { frame, perm, .. } => {
            with_table_mut(src_leaf.table, |t| {
                t.entries[src_leaf.index] = Entry::Present {
                    frame,
                    writable: false,
                    perm,
                };
            });
            FRAMES.inc_ref(frame)?;
            Entry::Present {
                frame,
                writable: false,
                perm,
            }
        }
    };
    let dst_leaf = descend_write(dst_root, dst_va)?;
    let prior_dst = with_table(dst_leaf.table, |t| t.entries[dst_leaf.index]);
    if let Entry::Present { frame: old, .. } = prior_dst {
        free_page_if_reclaimed(old)?;
    }
    with_table_mut(dst_leaf.table, |t| t.entries[dst_leaf.index] = shared_entry);
    Ok(())
}

/// Copy-on-write snapshot: after this call every byte in
/// `[dst_va, dst_va+size)` equals the corresponding byte in
/// `[src_va, src_va+size)`, and both sides read-alias the same frames
/// until either writes.
pub fn copy(src_root: FrameNumber, src_va: u64, dst_root: FrameNumber, dst_va: u64, size: u64) -> KernelResult<()> {
    check_user_range(src_va, size)?;
    check_user_range(dst_va, size)?;
    let pages = size / FRAME_SIZE as u64;
    for i in 0..pages {
        let off = i * FRAME_SIZE as u64;
        copy_page(src_root, src_va + off, dst_root, dst_va + off)?;
    }
    Ok(())
}

/// Clone one table frame into a fresh allocation. `level` is the
/// `level_index` value used to address entries *within* `src` (mirroring
/// `descend_write`'s level counter): `level == 3` means `src`'s entries are
/// leaf entries naming data frames, anything less means they name further
/// interior tables. Leaf data frames are shared with their refcount bumped
/// and marked non-writable on both the original and the clone, exactly as
/// `copy_page` already does between any two distinct roots; interior tables
/// are never shared, so the clone is independent of whatever `src_root`
/// does afterwards (including a COW write-fault copy).
fn clone_table(src: FrameNumber, level: usize) -> KernelResult<FrameNumber> {
    let fresh = alloc_table()?;
    let entries = with_table(src, |t| t.entries);
    for (i, entry) in entries.iter().enumerate() {
        let cloned = if level == 3 {
            match *entry {
                Entry::Present { frame, perm, .. } => {
                    FRAMES.inc_ref(frame)?;
                    with_table_mut(src, |t| {
                        t.entries[i] = Entry::Present { frame, writable: false, perm };
                    });
                    Entry::Present { frame, writable: false, perm }
                }
                other => other,
            }
        } else {
            match *entry {
                Entry::Present { frame: sub, .. } => {
                    let cloned_sub = clone_table(sub, level + 1)?;
                    Entry::Present { frame: cloned_sub, writable: true, perm: PtePerm::empty() }
                }
                other => other,
            }
        };
        with_table_mut(fresh, |t| t.entries[i] = cloned);
    }
    Ok(fresh)
}

/// Build an independent copy-on-write snapshot root mirroring `src_root`'s
/// current user-window mappings, for PUT's `SNAP` flag. The kernel slot is
/// copied by reference the same way [`new_root`] does it; the user-window
/// subtree is recursively cloned via [`clone_table`] rather than walked
/// page-by-page, so an otherwise-empty address space costs one allocation,
/// not one per absent page across the whole `[USERLO, USERHI)` span.
pub fn snapshot_root(src_root: FrameNumber) -> KernelResult<FrameNumber> {
    let root = alloc_table()?;

    let kernel_entry = with_table(src_root, |t| t.entries[KERNEL_SLOT]);
    if let Entry::Present { frame, .. } = kernel_entry {
        FRAMES.inc_ref(frame)?;
    }
    with_table_mut(root, |t| t.entries[KERNEL_SLOT] = kernel_entry);

    let user_index = level_index(USERLO, 0);
    let user_entry = with_table(src_root, |t| t.entries[user_index]);
    let cloned_user_entry = match user_entry {
        Entry::Present { frame: sub, .. } => {
            let cloned_sub = clone_table(sub, 1)?;
            Entry::Present { frame: cloned_sub, writable: true, perm: PtePerm::empty() }
        }
        other => other,
    };
    with_table_mut(root, |t| t.entries[user_index] = cloned_user_entry);

    Ok(root)
}

fn same_content(a: Entry, b: Entry) -> KernelResult<bool> {
    match (a, b) {
        (Entry::Present { frame: fa, .. }, Entry::Present { frame: fb, .. }) if fa == fb => Ok(true),
        (Entry::Zero(_), Entry::Zero(_)) => Ok(true),
        (Entry::Remote(ra), Entry::Remote(rb)) => Ok(ra == rb),
        _ => {
            let ba = read_page_bytes(a)?;
            let bb = read_page_bytes(b)?;
            Ok(ba == bb)
        }
    }
}

fn merge_page(
    ref_root: FrameNumber,
    src_root: FrameNumber,
    snapshot_va: u64,
    dst_root: FrameNumber,
    dst_va: u64,
) -> KernelResult<()> {
    let ref_entry = peek(ref_root, snapshot_va)?;
    let src_entry = peek(src_root, snapshot_va)?;
    if same_content(ref_entry, src_entry)? {
        return Ok(());
    }
    let dst_entry = peek(dst_root, dst_va)?;
    if same_content(ref_entry, dst_entry)? {
        return copy_page(src_root, snapshot_va, dst_root, dst_va);
    }

    let ref_bytes = read_page_bytes(ref_entry)?;
    let src_bytes = read_page_bytes(src_entry)?;
    let dst_bytes = read_page_bytes(dst_entry)?;

    let dst_leaf = descend_write(dst_root, dst_va)?;
    let current = with_table(dst_leaf.table, |t| t.entries[dst_leaf.index]);
    let work_frame = match current {
        Entry::Present { frame, writable: true, .. } if FRAMES.refcount(frame)? == 1 => frame,
        _ => {
            let fresh = alloc_page_zeroed()?;
            if let Entry::Present { frame: old, .. } = current {
                free_page_if_reclaimed(old)?;
            }
            with_table_mut(dst_leaf.table, |t| {
                t.entries[dst_leaf.index] = Entry::Present {
                    frame: fresh,
                    writable: true,
                    perm: PtePerm::READ | PtePerm::WRITE,
                };
            });
            fresh
        }
    };

    let mut merged = [0u8; FRAME_SIZE];
    let mut conflict = false;
    for i in 0..FRAME_SIZE {
        merged[i] = if src_bytes[i] == ref_bytes[i] {
            dst_bytes[i]
        } else if dst_bytes[i] == ref_bytes[i] {
            src_bytes[i]
        } else {
            conflict = true;
            0
        };
    }

    if conflict {
        println!("[mm] merge conflict at va {:#x}, destination page unmapped", dst_va);
        free_page_if_reclaimed(work_frame)?;
        with_table_mut(dst_leaf.table, |t| {
            t.entries[dst_leaf.index] = Entry::Zero(PtePerm::READ | PtePerm::WRITE);
        });
        return Ok(());
    }

    with_page_mut(work_frame, |p| *p = merged);
    Ok(())
}

/// Three-way merge: for each page, if `src == ref` the destination is left
/// untouched; if `dst == ref` the source wins outright; otherwise the page
/// is merged byte-by-byte, with any true conflict unmapping the
/// destination page (it re-faults to zero on next touch).
pub fn merge(
    ref_root: FrameNumber,
    src_root: FrameNumber,
    src_va: u64,
    dst_root: FrameNumber,
    dst_va: u64,
    size: u64,
) -> KernelResult<()> {
    check_user_range(src_va, size)?;
    check_user_range(dst_va, size)?;
    let pages = size / FRAME_SIZE as u64;
    for i in 0..pages {
        let off = i * FRAME_SIZE as u64;
        merge_page(ref_root, src_root, src_va + off, dst_root, dst_va + off)?;
    }
    Ok(())
}

fn setperm_page(root: FrameNumber, va: u64, perm: PtePerm) -> KernelResult<()> {
    if perm.is_empty() {
        return remove_page(root, va);
    }
    let leaf = descend_write(root, va)?;
    let current = with_table(leaf.table, |t| t.entries[leaf.index]);
    let updated = match current {
        Entry::Zero(_) => {
            if perm.contains(PtePerm::WRITE) {
                // Leave demand-zero in place; the first write faults and
                // pagefault::handle_write_fault copies out.
                Entry::Zero(perm)
            } else {
                let zero = ZERO_FRAME.get();
                FRAMES.inc_ref(zero)?;
                Entry::Present {
                    frame: zero,
                    writable: false,
                    perm,
                }
            }
        }
        Entry::Present { frame, .. } => {
            let writable = perm.contains(PtePerm::WRITE) && FRAMES.refcount(frame)? == 1;
            Entry::Present { frame, writable, perm }
        }
        Entry::Remote(rr) => return Err(KernelError::RemoteDenied { rr }),
    };
    with_table_mut(leaf.table, |t| t.entries[leaf.index] = updated);
    Ok(())
}

/// Set nominal permissions across `[va, va+size)`. Granting read alone maps
/// the canonical zero frame read-only; granting write leaves demand-zero in
/// place for the page-fault handler to materialize on first touch.
pub fn setperm(root: FrameNumber, va: u64, size: u64, perm: PtePerm) -> KernelResult<()> {
    check_user_range(va, size)?;
    let pages = size / FRAME_SIZE as u64;
    for i in 0..pages {
        setperm_page(root, va + i * FRAME_SIZE as u64, perm)?;
    }
    Ok(())
}

pub(crate) fn leaf_entry(root: FrameNumber, va: u64) -> KernelResult<(FrameNumber, usize, Entry)> {
    check_user_range(va, FRAME_SIZE as u64)?;
    let leaf = descend_write(root, va)?;
    let entry = with_table(leaf.table, |t| t.entries[leaf.index]);
    Ok((leaf.table, leaf.index, entry))
}

pub(crate) fn set_leaf_entry(table: FrameNumber, index: usize, entry: Entry) {
    with_table_mut(table, |t| t.entries[index] = entry);
}

/// Read one raw slot of any table frame, interior or leaf. Used by the net
/// module when translating a pulled directory page back into local form.
pub(crate) fn table_entry(table: FrameNumber, index: usize) -> Entry {
    with_table(table, |t| t.entries[index])
}

/// Allocate a fresh, all-zero-mapping table frame. Used by the net module
/// to build the destination root for an incoming migration.
pub(crate) fn alloc_table_zeroed() -> KernelResult<FrameNumber> {
    alloc_table()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::ensure_test_frames;

    fn fresh_root() -> FrameNumber {
        ensure_test_frames();
        alloc_table().unwrap()
    }

    #[test]
    fn insert_then_peek_reads_back_frame() {
        let root = fresh_root();
        let data = alloc_page_zeroed().unwrap();
        insert(root, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();
        match peek(root, USERLO).unwrap() {
            Entry::Present { frame, writable, .. } => {
                assert_eq!(frame, data);
                assert!(writable);
            }
            other => panic!("expected present entry, got {:?}", other),
        }
    }

    #[test]
    fn copy_shares_frame_and_bumps_refcount() {
        let src = fresh_root();
        let dst = fresh_root();
        let data = alloc_page_zeroed().unwrap();
        insert(src, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();
        assert_eq!(FRAMES.refcount(data).unwrap(), 1);

        copy(src, USERLO, dst, USERLO, FRAME_SIZE as u64).unwrap();
        assert_eq!(FRAMES.refcount(data).unwrap(), 2);

        for root in [src, dst] {
            match peek(root, USERLO).unwrap() {
                Entry::Present { frame, writable, .. } => {
                    assert_eq!(frame, data);
                    assert!(!writable);
                }
                other => panic!("expected shared present entry, got {:?}", other),
            }
        }
    }

    #[test]
    fn remove_drops_refcount_to_zero() {
        let root = fresh_root();
        let data = alloc_page_zeroed().unwrap();
        insert(root, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();
        remove(root, USERLO, FRAME_SIZE as u64).unwrap();
        assert_eq!(FRAMES.refcount(data).unwrap(), 0);
        assert!(matches!(peek(root, USERLO).unwrap(), Entry::Zero(_)));
    }

    #[test]
    fn merge_keeps_destination_when_source_matches_reference() {
        let reference = fresh_root();
        let dst = fresh_root();
        let shared = alloc_page_zeroed().unwrap();
        insert(reference, shared, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();
        copy(reference, USERLO, dst, USERLO, FRAME_SIZE as u64).unwrap();

        with_page_mut(shared, |p| p[0] = 0xAA);
        // dst still aliases `shared` directly (no write went through dst),
        // so src == ref and merge must leave dst untouched.
        merge(reference, reference, USERLO, dst, USERLO, FRAME_SIZE as u64).unwrap();
        let dst_entry = peek(dst, USERLO).unwrap();
        assert!(matches!(dst_entry, Entry::Present { frame, .. } if frame == shared));
    }

    #[test]
    fn merge_conflict_unmaps_destination() {
        let reference = fresh_root();
        let src = fresh_root();
        let dst = fresh_root();

        let ref_frame = alloc_page_zeroed().unwrap();
        with_page_mut(ref_frame, |p| p[16] = b'A');
        insert(reference, ref_frame, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        copy(reference, USERLO, src, USERLO, FRAME_SIZE as u64).unwrap();
        copy(reference, USERLO, dst, USERLO, FRAME_SIZE as u64).unwrap();

        let src_frame = alloc_page_zeroed().unwrap();
        with_page_mut(src_frame, |p| {
            *p = with_page(ref_frame, |r| *r);
            p[16] = b'C';
        });
        insert(src, src_frame, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        let dst_frame = alloc_page_zeroed().unwrap();
        with_page_mut(dst_frame, |p| {
            *p = with_page(ref_frame, |r| *r);
            p[16] = b'B';
        });
        insert(dst, dst_frame, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        merge(reference, src, USERLO, dst, USERLO, FRAME_SIZE as u64).unwrap();
        assert!(matches!(peek(dst, USERLO).unwrap(), Entry::Zero(_)));
    }

    #[test]
    fn setperm_zero_then_regrant_is_fresh_zero() {
        let root = fresh_root();
        let data = alloc_page_zeroed().unwrap();
        insert(root, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        setperm(root, USERLO, FRAME_SIZE as u64, PtePerm::empty()).unwrap();
        assert_eq!(FRAMES.refcount(data).unwrap(), 0);

        setperm(root, USERLO, FRAME_SIZE as u64, PtePerm::READ | PtePerm::WRITE).unwrap();
        assert!(matches!(peek(root, USERLO).unwrap(), Entry::Zero(p) if p == PtePerm::READ | PtePerm::WRITE));
    }

    #[test]
    fn setperm_read_only_maps_canonical_zero_frame() {
        let root = fresh_root();
        ZERO_FRAME.init(alloc_page_zeroed().unwrap());
        setperm(root, USERLO, FRAME_SIZE as u64, PtePerm::READ).unwrap();
        match peek(root, USERLO).unwrap() {
            Entry::Present { frame, writable, .. } => {
                assert_eq!(frame, ZERO_FRAME.get());
                assert!(!writable);
            }
            other => panic!("expected present zero-frame mapping, got {:?}", other),
        }
    }

    #[test]
    fn out_of_range_address_rejected() {
        let root = fresh_root();
        let data = alloc_page_zeroed().unwrap();
        assert_eq!(
            insert(root, data, USERHI, PtePerm::READ).unwrap_err(),
            KernelError::InvalidAddress { addr: USERHI }
        );
    }

    #[test]
    fn snapshot_root_is_independent_of_later_writes() {
        let src = fresh_root();
        let data = alloc_page_zeroed().unwrap();
        insert(src, data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        let snap = snapshot_root(src).unwrap();
        assert_eq!(FRAMES.refcount(data).unwrap(), 2);
        match peek(src, USERLO).unwrap() {
            Entry::Present { frame, writable, .. } => {
                assert_eq!(frame, data);
                assert!(!writable);
            }
            other => panic!("expected shared present entry, got {:?}", other),
        }

        // A COW write-fault on the live root installs a fresh frame there;
        // the snapshot must keep pointing at the original content because
        // its interior tables are its own, not shared with `src`.
        let new_data = alloc_page_zeroed().unwrap();
        with_page_mut(new_data, |p| p[0] = 0x22);
        insert(src, new_data, USERLO, PtePerm::READ | PtePerm::WRITE).unwrap();

        match peek(snap, USERLO).unwrap() {
            Entry::Present { frame, .. } => assert_eq!(frame, data),
            other => panic!("expected present entry, got {:?}", other),
        }
        match peek(src, USERLO).unwrap() {
            Entry::Present { frame, .. } => assert_eq!(frame, new_data),
            other => panic!("expected present entry, got {:?}", other),
        }
    }
}
