//! Request dispatcher (spec §4.10): the single entry point mapping FUSE
//! operations onto the layers above, holding the global metadata lock
//! discipline from spec §5.
//!
//! Grounded on the teacher's `impl Filesystem for RFS<T>`
//! (`src/rfs_lib/fuse.rs`): same one-method-per-FUSE-callback shape,
//! `TTL`/reply conventions. The teacher converts each op's `Result` to a
//! FUSE reply via undefined `rep!`/`prv!` macros (never defined anywhere in
//! that repo — confirmed dead); `reply_result!` below is a working
//! replacement built the same way: resolve the inner call, log and bail out
//! through `reply.error(errno)` on failure.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyStatfs, ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use libc::ENOENT;

use crate::error::S3qlError;
use crate::filesystem::S3ql;
use crate::metadata::ns_since_epoch;

const TTL: Duration = Duration::from_secs(1);

/// Evaluates `$body`; on `Err(e)`, logs and replies with `e.to_errno()`,
/// returning from the enclosing function.
macro_rules! reply_result {
    ($reply:expr, $body:expr) => {
        match $body {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{}", e);
                $reply.error(e.to_errno());
                return;
            }
        }
    };
}

fn time_or_now(t: Option<TimeOrNow>) -> Option<i64> {
    t.map(|t| match t {
        TimeOrNow::SpecificTime(st) => ns_since_epoch(st),
        TimeOrNow::Now => ns_since_epoch(SystemTime::now()),
    })
}

impl Filesystem for S3ql {
    /// `S3ql::on_mount` already ran in `main.rs` before `fuser::mount2` was
    /// called — running it here too would double-claim a seq_no slot, and
    /// any `S3qlError` it raised would arrive wrapped in `fuser`'s own
    /// `std::io::Error`, losing the exit code the CLI layer depends on
    /// (spec §6).
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.on_unmount() {
            log::error!("clean unmount failed: {e}");
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let inode = reply_result!(reply, self.inodes.lookup(parent as i64, &name_bytes));
        reply.entry(&TTL, &inode.to_fuse_attr(self.block_size() as u32), 0);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyAttr) {
        let inode = reply_result!(reply, self.inodes.get_attr(ino as i64));
        reply.attr(&TTL, &inode.to_fuse_attr(self.block_size() as u32));
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if let Some(size) = size {
            reply_result!(reply, self.inodes.truncate(ino as i64, size));
        }
        let inode = reply_result!(
            reply,
            self.inodes
                .set_attr(ino as i64, mode, uid, gid, time_or_now(atime), time_or_now(mtime))
        );
        reply.attr(&TTL, &inode.to_fuse_attr(self.block_size() as u32));
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let target = reply_result!(reply, self.inodes.readlink(ino as i64));
        reply.data(&target);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let inode = reply_result!(
            reply,
            self.inodes
                .mknod(parent as i64, &name_bytes, mode, req.uid(), req.gid(), rdev)
        );
        reply.entry(&TTL, &inode.to_fuse_attr(self.block_size() as u32), 0);
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, mode: u32, _umask: u32, reply: ReplyEntry) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let inode = reply_result!(
            reply,
            self.inodes.mkdir(parent as i64, &name_bytes, mode, req.uid(), req.gid())
        );
        reply.entry(&TTL, &inode.to_fuse_attr(self.block_size() as u32), 0);
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        reply_result!(reply, self.inodes.unlink(parent as i64, &name_bytes));
        reply.ok();
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        reply_result!(reply, self.inodes.rmdir(parent as i64, &name_bytes));
        reply.ok();
    }

    fn symlink(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        link: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let target = link.to_string_lossy().into_owned().into_bytes();
        let inode = reply_result!(
            reply,
            self.inodes
                .symlink(parent as i64, &name_bytes, &target, req.uid(), req.gid())
        );
        reply.entry(&TTL, &inode.to_fuse_attr(self.block_size() as u32), 0);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let newname_bytes = newname.to_string_lossy().into_owned().into_bytes();
        reply_result!(
            reply,
            self.inodes
                .rename(parent as i64, &name_bytes, newparent as i64, &newname_bytes)
        );
        reply.ok();
    }

    fn link(&mut self, _req: &Request<'_>, ino: u64, newparent: u64, newname: &OsStr, reply: ReplyEntry) {
        let newname_bytes = newname.to_string_lossy().into_owned().into_bytes();
        let inode = reply_result!(reply, self.inodes.link(ino as i64, newparent as i64, &newname_bytes));
        reply.entry(&TTL, &inode.to_fuse_attr(self.block_size() as u32), 0);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: fuser::ReplyOpen) {
        if self.inodes.get_attr(ino as i64).is_err() {
            reply.error(ENOENT);
            return;
        }
        self.inodes.open(ino as i64);
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let data = reply_result!(reply, self.inodes.read(ino as i64, offset.max(0) as u64, size));
        reply.data(&data);
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let written = reply_result!(reply, self.inodes.write(ino as i64, offset.max(0) as u64, data));
        reply.written(written as u32);
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        reply_result!(reply, self.drain_uploads_sync());
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        reply_result!(reply, self.drain_uploads_sync());
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply_result!(reply, self.inodes.release(ino as i64));
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let entries = reply_result!(reply, self.inodes.readdir(ino as i64));
        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            let child = match self.inodes.get_attr(entry.child_inode) {
                Ok(node) => node,
                Err(_) => continue,
            };
            let full = reply.add(
                entry.child_inode as u64,
                (i + 1) as i64,
                child.file_type().to_fuser_kind(),
                OsStr::new(&entry.name_str()),
            );
            if full {
                break;
            }
        }
        reply.ok();
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let inode = reply_result!(
            reply,
            self.inodes
                .create(parent as i64, &name_bytes, libc::S_IFREG | (mode & 0o7777), req.uid(), req.gid())
        );
        self.inodes.open(inode.id);
        reply.created(&TTL, &inode.to_fuse_attr(self.block_size() as u32), 0, 0, 0);
    }

    fn getxattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, size: u32, reply: ReplyXattr) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        let value = reply_result!(reply, self.get_xattr(ino as i64, &name_bytes));
        if size == 0 {
            reply.size(value.len() as u32);
        } else if value.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&value);
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        reply_result!(reply, self.set_xattr(ino as i64, &name_bytes, value));
        reply.ok();
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let names = reply_result!(reply, self.list_xattrs(ino as i64));
        let mut buf = Vec::new();
        for name in &names {
            buf.extend_from_slice(name);
            buf.push(0);
        }
        if size == 0 {
            reply.size(buf.len() as u32);
        } else if buf.len() > size as usize {
            reply.error(libc::ERANGE);
        } else {
            reply.data(&buf);
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let name_bytes = name.to_string_lossy().into_owned().into_bytes();
        reply_result!(reply, self.remove_xattr(ino as i64, &name_bytes));
        reply.ok();
    }

    /// `statfs` always reports free space as `max(used, 1 TiB)` so
    /// `used+free ≈ 2·used` but never less than 2 TiB (spec §6).
    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let used_bytes = reply_result!(reply, self.used_bytes());
        let bs = self.block_size();
        let used_blocks = used_bytes.div_ceil(bs);
        let free_blocks = used_blocks.max((1u64 << 40) / bs);
        let total_blocks = used_blocks + free_blocks;
        reply.statfs(
            total_blocks,
            free_blocks,
            free_blocks,
            0,
            0,
            bs as u32,
            crate::metadata::MAX_NAME_LEN as u32,
            0,
        );
    }
}

impl S3ql {
    fn used_bytes(&self) -> crate::error::Result<u64> {
        self.store.transaction(|tx| {
            let mut total: i64 = 0;
            for id in self.store.all_object_ids(tx)? {
                total += tx.query_row(
                    "SELECT phys_size FROM objects WHERE id = ?1",
                    rusqlite::params![id],
                    |r| r.get::<_, i64>(0),
                )?;
            }
            Ok(total.max(0) as u64)
        })
    }
}

