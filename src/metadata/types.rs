//! Row types for the metadata store (spec §3).
//!
//! These mirror the teacher's `Ext2INode`/`Ext2DirEntry` structs
//! (`src/rfs_lib/desc.rs`) in spirit — plain data, `to_attr`-style
//! conversion to the FUSE attribute struct — but are backed by SQL rows
//! instead of `unsafe`-cast disk blocks, since spec §4.3 requires a real
//! relational store with indexes and constraints rather than a raw C
//! struct layout.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Inode reserved for the root directory (spec §3).
pub const ROOT_INODE: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl FileType {
    pub fn from_mode(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFDIR => FileType::Directory,
            libc::S_IFLNK => FileType::Symlink,
            libc::S_IFCHR => FileType::CharDevice,
            libc::S_IFBLK => FileType::BlockDevice,
            libc::S_IFIFO => FileType::Fifo,
            libc::S_IFSOCK => FileType::Socket,
            _ => FileType::RegularFile,
        }
    }

    pub fn to_fuser_kind(self) -> fuser::FileType {
        match self {
            FileType::RegularFile => fuser::FileType::RegularFile,
            FileType::Directory => fuser::FileType::Directory,
            FileType::Symlink => fuser::FileType::Symlink,
            FileType::CharDevice => fuser::FileType::CharDevice,
            FileType::BlockDevice => fuser::FileType::BlockDevice,
            FileType::Fifo => fuser::FileType::NamedPipe,
            FileType::Socket => fuser::FileType::Socket,
        }
    }
}

/// One row of the `inodes` table (spec §3 "Inode").
#[derive(Debug, Clone)]
pub struct Inode {
    pub id: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
    pub refcount: i64,
    pub locked: bool,
    pub rdev: u32,
}

fn system_time_from_ns(ns: i64) -> SystemTime {
    if ns >= 0 {
        UNIX_EPOCH + Duration::from_nanos(ns as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos((-ns) as u64)
    }
}

pub fn ns_since_epoch(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

impl Inode {
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    /// Converts to the attribute struct `fuser::ReplyAttr`/`ReplyEntry`
    /// expect, the way the teacher's `Ext2INode::to_attr` does.
    pub fn to_fuse_attr(&self, block_size: u32) -> fuser::FileAttr {
        let blocks = (self.size.max(0) as u64).div_ceil(block_size as u64);
        fuser::FileAttr {
            ino: self.id as u64,
            size: self.size.max(0) as u64,
            blocks,
            atime: system_time_from_ns(self.atime_ns),
            mtime: system_time_from_ns(self.mtime_ns),
            ctime: system_time_from_ns(self.ctime_ns),
            crtime: system_time_from_ns(self.ctime_ns),
            kind: self.file_type().to_fuser_kind(),
            perm: (self.mode & 0o7777) as u16,
            nlink: self.refcount.max(0) as u32,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            blksize: block_size,
            flags: 0,
        }
    }
}

/// One row of the `contents` table (spec §3 "Directory entry").
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub parent_inode: i64,
    pub name: Vec<u8>,
    pub child_inode: i64,
}

impl DirEntry {
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

pub const MAX_NAME_LEN: usize = 255;

/// One row of the `blocks` table (spec §3 "Block").
#[derive(Debug, Clone)]
pub struct Block {
    pub id: i64,
    pub hash: [u8; 32],
    pub refcount: i64,
    pub size: i64,
    pub obj_id: i64,
}

/// One row of the `objects` table (spec §3 "Object").
#[derive(Debug, Clone)]
pub struct Object {
    pub id: i64,
    pub refcount: i64,
    pub hash: [u8; 32],
    pub phys_size: i64,
    pub length: i64,
}

impl Object {
    pub fn backend_key(obj_id: i64) -> String {
        format!("s3ql_data_{obj_id}")
    }
}

/// One row of the `inode_blocks` table (spec §3 "Inode_block mapping").
#[derive(Debug, Clone)]
pub struct InodeBlock {
    pub inode: i64,
    pub blockno: i64,
    pub block_id: i64,
}
