//! Root-process file glue: a tiny synthetic file table pinned at a fixed
//! virtual address in the root process's address space, plus the console
//! input/output inodes it reads and writes through.
//!
//! Only the root process may perform external I/O; every other process
//! talks to the world indirectly through PUT/GET with its parent. That
//! privilege separation is enforced by the caller (the syscall layer checks
//! `pid == root()` before routing CPUTS/console reads here), not by this
//! module.

extern crate alloc;

use alloc::collections::VecDeque;

use lazy_static::lazy_static;
use spin::Mutex;

use crate::error::{KernelError, KernelResult};
use crate::mm::frame::FRAME_SIZE;
use crate::mm::pagemap::{self, PtePerm};
use crate::process::pcb::ProcessId;

pub const FILEINO_ROOTDIR: u32 = 1;
pub const FILEINO_CONSIN: u32 = 2;
pub const FILEINO_CONSOUT: u32 = 3;
pub const FILEINO_GENERAL: u32 = 4;
pub const FILE_INODES: usize = 64;

/// Virtual address the synthetic file table is pinned at, one page below
/// the top of the mappable window so it never collides with a process's
/// ordinary data pages.
pub const FILESVA: u64 = pagemap::USERHI - FRAME_SIZE as u64;

const CONSBUFSIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InodeMode {
    Free,
    Dir,
    Reg,
}

#[derive(Debug, Clone, Copy)]
pub struct Inode {
    pub dino: u32,
    pub mode: InodeMode,
    pub size: u32,
}

impl Inode {
    const fn empty() -> Self {
        Self {
            dino: 0,
            mode: InodeMode::Free,
            size: 0,
        }
    }
}

struct FileTable {
    root: Option<ProcessId>,
    inodes: [Inode; FILE_INODES],
    next_general: u32,
    consin: VecDeque<u8>,
    consout_written: usize,
}

lazy_static! {
    static ref FILES: Mutex<FileTable> = Mutex::new(FileTable {
        root: None,
        inodes: [Inode::empty(); FILE_INODES],
        next_general: FILEINO_GENERAL,
        consin: VecDeque::new(),
        consout_written: 0,
    });
}

/// Seed the root process's synthetic file table: the root directory and the
/// console-in/console-out inodes. Must run exactly once, before the root
/// process is made `READY`.
pub fn init_root(root: ProcessId) -> KernelResult<()> {
    let mut files = FILES.lock();
    files.root = Some(root);
    files.inodes[FILEINO_ROOTDIR as usize] = Inode {
        dino: FILEINO_ROOTDIR,
        mode: InodeMode::Dir,
        size: 0,
    };
    files.inodes[FILEINO_CONSIN as usize] = Inode {
        dino: FILEINO_ROOTDIR,
        mode: InodeMode::Reg,
        size: 0,
    };
    files.inodes[FILEINO_CONSOUT as usize] = Inode {
        dino: FILEINO_ROOTDIR,
        mode: InodeMode::Reg,
        size: 0,
    };
    drop(files);

    let page = pagemap::alloc_page_zeroed()?;
    pagemap::insert(root_frame_of(root)?, page, FILESVA, PtePerm::READ | PtePerm::WRITE)?;
    Ok(())
}

fn root_frame_of(root: ProcessId) -> KernelResult<crate::mm::frame::FrameNumber> {
    crate::process::pcb::with_pcb(root, |p| p.root)
}

fn is_root(pid: ProcessId) -> KernelResult<bool> {
    Ok(FILES.lock().root == Some(pid))
}

/// Load one of the initial file-image blobs into a fresh general-purpose
/// inode. Mirrors the original's `initfiles` table; here the caller (boot
/// sequence) supplies the bytes directly instead of linking them in as
/// object-file symbols.
pub fn load_initial_file(requester: ProcessId, data: &[u8]) -> KernelResult<u32> {
    if !is_root(requester)? {
        return Err(KernelError::PermissionDenied { addr: FILESVA });
    }
    let mut files = FILES.lock();
    let ino = files.next_general;
    if ino as usize >= FILE_INODES {
        return Err(KernelError::InvalidArgument { name: "file_inodes_exhausted" });
    }
    files.inodes[ino as usize] = Inode {
        dino: FILEINO_ROOTDIR,
        mode: InodeMode::Reg,
        size: data.len() as u32,
    };
    files.next_general += 1;
    Ok(ino)
}

/// Debug string straight to the serial console -- the CPUTS syscall's only
/// job. Any process may call it; it bypasses the file table entirely, same
/// as the original's direct `cprintf` path.
pub fn cputs(bytes: &[u8]) {
    if let Ok(text) = core::str::from_utf8(bytes) {
        crate::print!("{}", text);
    }
}

/// Feed one byte of input from whatever device produced it (keyboard,
/// serial) into the console's ring buffer. Device drivers are out of scope;
/// this is the seam they call into.
pub fn feed_input(byte: u8) {
    let mut files = FILES.lock();
    if files.consin.len() == CONSBUFSIZE {
        files.consin.pop_front();
    }
    files.consin.push_back(byte);
}

/// Root-process-only: drain whatever input has accumulated.
pub fn read_consin(requester: ProcessId, buf: &mut [u8]) -> KernelResult<usize> {
    if !is_root(requester)? {
        return Err(KernelError::PermissionDenied { addr: FILESVA });
    }
    let mut files = FILES.lock();
    let mut n = 0;
    while n < buf.len() {
        match files.consin.pop_front() {
            Some(b) => {
                buf[n] = b;
                n += 1;
            }
            None => break,
        }
    }
    Ok(n)
}

/// Root-process-only: append to console output.
pub fn write_consout(requester: ProcessId, bytes: &[u8]) -> KernelResult<()> {
    if !is_root(requester)? {
        return Err(KernelError::PermissionDenied { addr: FILESVA });
    }
    cputs(bytes);
    FILES.lock().consout_written += bytes.len();
    Ok(())
}

/// Mirrors `file_io`'s `cons_io`: called when the root process returns with
/// nothing else to do. Returns whether any input became available for it to
/// consume (the caller re-runs the root process on `true`, parks it waiting
/// for a device interrupt on `false`).
pub fn io_poll() -> bool {
    !FILES.lock().consin.is_empty()
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::frame::ensure_test_frames;
    use crate::process::pcb;

    fn spawn_root() -> ProcessId {
        ensure_test_frames();
        let root_frame = pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap();
        pcb::alloc(None, root_frame).unwrap()
    }

    #[test]
    fn feed_then_read_consin_round_trips() {
        let root = spawn_root();
        init_root(root).unwrap();
        feed_input(b'h');
        feed_input(b'i');
        let mut buf = [0u8; 8];
        let n = read_consin(root, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
    }

    #[test]
    fn non_root_cannot_read_console() {
        let root = spawn_root();
        init_root(root).unwrap();
        let impostor = pcb::alloc(None, pagemap::new_root(pagemap::build_kernel_template().unwrap()).unwrap()).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(
            read_consin(impostor, &mut buf).unwrap_err(),
            KernelError::PermissionDenied { addr: FILESVA }
        );
    }

    #[test]
    fn io_poll_reports_pending_input() {
        let root = spawn_root();
        init_root(root).unwrap();
        assert!(!io_poll());
        feed_input(b'x');
        assert!(io_poll());
        let mut buf = [0u8; 1];
        read_consin(root, &mut buf).unwrap();
        assert!(!io_poll());
    }

    #[test]
    fn load_initial_file_assigns_sequential_inodes() {
        let root = spawn_root();
        init_root(root).unwrap();
        let a = load_initial_file(root, b"hello").unwrap();
        let b = load_initial_file(root, b"world!").unwrap();
        assert_eq!(a, FILEINO_GENERAL);
        assert_eq!(b, FILEINO_GENERAL + 1);
    }
}
