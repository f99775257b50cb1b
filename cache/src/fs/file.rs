/// Generic file I/O over the two caches.
///
/// Reads are served from the page cache; a miss pulls the data through the
/// buffer cache block by block, zero-filling holes. Writes go to the buffer
/// cache and are propagated into any cached page covering the same range,
/// so an immediate read observes them without a sync in between.
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::cache::{PageCache, PageHandle};
use crate::errno::Errno;

use super::inode::{BmapMode, Inode};
use super::FsContext;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const WRONLY = 0x1;
        const RDWR = 0x2;
        const APPEND = 0x400;
    }
}

/// Per-open-file cursor state: the client side of the open/close/lseek
/// contract.
#[derive(Debug)]
pub struct OpenFile {
    pub flags: OpenFlags,
    pub offset: u64,
}

/// `lseek` origins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

impl OpenFile {
    pub fn new(flags: OpenFlags) -> Self {
        Self { flags, offset: 0 }
    }

    /// Reposition the cursor. `size` is the current inode size, for the
    /// `End` origin. A position before the start of the file is refused.
    pub fn lseek(&mut self, whence: Whence, offset: i64, size: u64) -> Result<u64, Errno> {
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.offset,
            Whence::End => size,
        };
        let pos = base.checked_add_signed(offset).ok_or(Errno::Inval)?;
        self.offset = pos;
        Ok(pos)
    }
}

/// Read from `inode` at the file cursor into `dst`, via the page cache.
/// Returns the byte count, short at end of file.
pub fn file_read(
    ctx: &FsContext<'_>,
    inode: &Inode,
    file: &mut OpenFile,
    dst: &mut [u8],
) -> Result<usize, Errno> {
    let page_size = ctx.pages.page_size() as u64;

    inode.lock(ctx.sched);
    let size = inode.size();
    if file.offset > size {
        file.offset = size;
    }
    let mut remaining = (dst.len() as u64).min(size - file.offset);
    let mut done = 0usize;

    while remaining > 0 {
        let poff = (file.offset % page_size) as usize;
        let pbase = file.offset & !(page_size - 1);

        let page = match ctx.pages.search_page_hash(inode.dev(), inode.ino(), pbase) {
            Some(page) => page,
            None => {
                let Some(page) = ctx.pages.get_free_page() else {
                    inode.unlock(ctx.sched);
                    return if done > 0 { Ok(done) } else { Err(Errno::NoMem) };
                };
                if let Err(e) = bread_page(ctx, &page, inode, pbase, true) {
                    ctx.pages.release_page(page);
                    inode.unlock(ctx.sched);
                    return if done > 0 { Ok(done) } else { Err(e) };
                }
                page
            }
        };

        let chunk = (page_size as usize - poff).min(remaining as usize);
        {
            let guard = ctx.pages.lock_page(&page);
            dst[done..done + chunk].copy_from_slice(&guard[poff..poff + chunk]);
        }
        ctx.pages.release_page(page);

        file.offset += chunk as u64;
        done += chunk;
        remaining -= chunk as u64;
    }

    inode.unlock(ctx.sched);
    Ok(done)
}

/// Write `src` at the file cursor through the buffer cache. Every block
/// fragment also lands in a cached page covering it, if there is one, so
/// the page cache never serves stale data. Returns the byte count; a
/// failure after some progress reports the short count instead.
pub fn file_write(
    ctx: &FsContext<'_>,
    inode: &Inode,
    file: &mut OpenFile,
    src: &[u8],
) -> Result<usize, Errno> {
    let block_size = inode.block_size();

    inode.lock(ctx.sched);
    if file.flags.contains(OpenFlags::APPEND) {
        file.offset = inode.size();
    }

    let mut done = 0usize;
    while done < src.len() {
        let boff = (file.offset % block_size as u64) as usize;
        let chunk = (block_size - boff).min(src.len() - done);

        let block = match inode.bmap(file.offset, BmapMode::ForWriting) {
            Ok(0) => {
                log::error!(
                    "[fs] bmap gave no block for inode {} offset {}",
                    inode.ino(),
                    file.offset
                );
                return write_done(ctx, inode, file, done, Err(Errno::Io));
            }
            Ok(block) => block,
            Err(e) => return write_done(ctx, inode, file, done, Err(e)),
        };

        // Even a full-block write reads the block first; partial-block
        // semantics need the rest of its contents.
        let mut buf = match ctx.buffers.bread(inode.dev(), block, block_size) {
            Ok(buf) => buf,
            Err(e) => return write_done(ctx, inode, file, done, Err(e)),
        };
        buf.data_mut()[boff..boff + chunk].copy_from_slice(&src[done..done + chunk]);
        update_page_cache(ctx.pages, inode, file.offset, &src[done..done + chunk]);
        ctx.buffers.bwrite(buf);

        file.offset += chunk as u64;
        done += chunk;
    }

    write_done(ctx, inode, file, done, Ok(()))
}

/// Common tail of the write path: grow the size if the cursor passed it,
/// touch the times, unlock, and fold partial progress into the result.
fn write_done(
    ctx: &FsContext<'_>,
    inode: &Inode,
    file: &mut OpenFile,
    done: usize,
    res: Result<(), Errno>,
) -> Result<usize, Errno> {
    if done > 0 {
        if file.offset > inode.size() {
            inode.set_size(file.offset);
        }
        inode.touch(ctx.clock.now());
    }
    inode.unlock(ctx.sched);
    match res {
        Ok(()) => Ok(done),
        Err(_) if done > 0 => Ok(done),
        Err(e) => Err(e),
    }
}

/// Propagate freshly written bytes into a cached page so reads that hit
/// the page cache observe them immediately. An absent page stays absent;
/// the next read will fetch fresh contents from the buffer cache anyway.
pub fn update_page_cache(pages: &PageCache, inode: &Inode, offset: u64, src: &[u8]) {
    let page_size = pages.page_size() as u64;
    let pbase = offset & !(page_size - 1);
    let poff = (offset % page_size) as usize;

    if let Some(page) = pages.search_page_hash(inode.dev(), inode.ino(), pbase) {
        {
            let mut guard = pages.lock_page(&page);
            guard[poff..poff + src.len()].copy_from_slice(src);
        }
        pages.release_page(page);
    }
}

/// Fill `page` with the file contents at `base`, chaining `bmap` and
/// `bread` over consecutive blocks. A zero mapping on the reading path is
/// a hole: the chunk is zero-filled without touching the device. Any error
/// aborts the whole page.
///
/// With `cacheable` the filled page is inserted into the page hash;
/// fills for private writable mappings pass `false` so the page gets its
/// identity but never aliases with shared readers.
pub fn bread_page(
    ctx: &FsContext<'_>,
    page: &PageHandle,
    inode: &Inode,
    base: u64,
    cacheable: bool,
) -> Result<(), Errno> {
    let page_size = ctx.pages.page_size();
    let block_size = inode.block_size();
    assert!(page_size % block_size == 0);

    {
        let mut guard = ctx.pages.lock_page(page);
        let mut off = 0usize;
        while off < page_size {
            let block = inode.bmap(base + off as u64, BmapMode::ForReading)?;
            if block == 0 {
                guard[off..off + block_size].fill(0);
            } else {
                let buf = ctx.buffers.bread(inode.dev(), block, block_size)?;
                guard[off..off + block_size].copy_from_slice(buf.data());
                ctx.buffers.brelse(buf);
            }
            off += block_size;
        }
    }

    if cacheable {
        ctx.pages
            .insert_page_hash(page, inode.dev(), inode.ino(), base);
    } else {
        ctx.pages
            .set_page_identity(page, inode.dev(), inode.ino(), base);
    }
    Ok(())
}

/// Clean a dirty mapped page by handing its first `len` bytes to the
/// filesystem's `write` callback at `offset`. `Errno::Inval` when the
/// filesystem has none. The caller must not hold the inode lock; the
/// callback takes it itself.
pub fn write_page(
    ctx: &FsContext<'_>,
    page: &PageHandle,
    inode: &Inode,
    offset: u64,
    len: usize,
) -> Result<usize, Errno> {
    assert!(len <= ctx.pages.page_size());

    // Copy out under the page lock; the write callback re-enters the page
    // cache through update_page_cache and must find the page unlocked.
    let data: Vec<u8> = {
        let guard = ctx.pages.lock_page(page);
        guard[..len].to_vec()
    };

    let mut file = OpenFile {
        flags: OpenFlags::WRONLY,
        offset,
    };
    inode.ops().write(ctx, inode, &mut file, &data)
}
