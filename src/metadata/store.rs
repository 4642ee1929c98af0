//! Embedded relational metadata store (spec §4.3).
//!
//! The teacher reads/writes fixed-layout structs straight off disk blocks
//! (`get_inode`/`set_inode` in `src/rfs_lib/mod.rs`, `unsafe { deserialize_row(..) }`).
//! Spec §4.3 asks for a real embedded relational database with B-tree
//! indexes and serializable transactions instead, so this layer is built on
//! `rusqlite` (attested in the pack by `clockworklabs-SpacetimeDB`,
//! `get-convex-convex-backend` and `pyroth-sbx`) rather than hand-rolled
//! struct casting. `parking_lot::Mutex` guards the connection because both
//! FUSE request threads and the background delete-drain/uploader threads
//! touch it (spec §5: "one global mutex guards metadata transactions").

use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, S3qlError};
use crate::metadata::types::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS inodes (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    mode      INTEGER NOT NULL,
    uid       INTEGER NOT NULL,
    gid       INTEGER NOT NULL,
    size      INTEGER NOT NULL,
    atime_ns  INTEGER NOT NULL,
    mtime_ns  INTEGER NOT NULL,
    ctime_ns  INTEGER NOT NULL,
    refcount  INTEGER NOT NULL,
    locked    INTEGER NOT NULL DEFAULT 0,
    rdev      INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS contents (
    parent_inode INTEGER NOT NULL,
    name         BLOB NOT NULL,
    child_inode  INTEGER NOT NULL,
    PRIMARY KEY (parent_inode, name)
);
CREATE INDEX IF NOT EXISTS idx_contents_child ON contents(child_inode);

CREATE TABLE IF NOT EXISTS symlink_targets (
    inode  INTEGER PRIMARY KEY,
    target BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS xattr_names (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name BLOB NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS ext_attributes (
    inode   INTEGER NOT NULL,
    name_id INTEGER NOT NULL,
    value   BLOB NOT NULL,
    PRIMARY KEY (inode, name_id)
);

CREATE TABLE IF NOT EXISTS objects (
    id        INTEGER PRIMARY KEY AUTOINCREMENT,
    refcount  INTEGER NOT NULL,
    hash      BLOB NOT NULL,
    phys_size INTEGER NOT NULL,
    length    INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS blocks (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    hash     BLOB NOT NULL UNIQUE,
    refcount INTEGER NOT NULL,
    size     INTEGER NOT NULL,
    obj_id   INTEGER NOT NULL REFERENCES objects(id)
);
CREATE INDEX IF NOT EXISTS idx_blocks_hash ON blocks(hash);

CREATE TABLE IF NOT EXISTS inode_blocks (
    inode    INTEGER NOT NULL,
    blockno  INTEGER NOT NULL,
    block_id INTEGER NOT NULL REFERENCES blocks(id),
    PRIMARY KEY (inode, blockno)
);
CREATE INDEX IF NOT EXISTS idx_inode_blocks_block ON inode_blocks(block_id);

CREATE TABLE IF NOT EXISTS objects_to_delete (
    obj_id INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS mount_state (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct MetadataStore {
    conn: Mutex<Connection>,
}

impl MetadataStore {
    /// Opens (creating if needed) the metadata database under the cache
    /// directory, exactly where spec §4.3 says it lives while mounted.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Runs `f` inside a serializable transaction (spec §4.3: "All
    /// structural mutation happens inside a serializable transaction").
    pub fn transaction<T>(&self, f: impl FnOnce(&rusqlite::Transaction) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Creates the root directory inode (id 1) and seeds `mount_state`.
    /// Called once by mkfs.
    pub fn init_fresh(&self) -> Result<()> {
        self.transaction(|tx| {
            let now = ns_since_epoch(std::time::SystemTime::now());
            tx.execute(
                "INSERT INTO inodes (id, mode, uid, gid, size, atime_ns, mtime_ns, ctime_ns, refcount, locked, rdev)
                 VALUES (1, ?1, 0, 0, 0, ?2, ?2, ?2, 1, 0, 0)",
                params![libc::S_IFDIR | 0o755, now],
            )?;
            tx.execute(
                "INSERT INTO contents (parent_inode, name, child_inode) VALUES (1, '.', 1)",
                [],
            )?;
            tx.execute(
                "INSERT INTO contents (parent_inode, name, child_inode) VALUES (1, '..', 1)",
                [],
            )?;
            Ok(())
        })
    }

    // ---- inodes ----------------------------------------------------

    pub fn get_inode(&self, tx: &rusqlite::Transaction, id: i64) -> Result<Inode> {
        tx.query_row(
            "SELECT id, mode, uid, gid, size, atime_ns, mtime_ns, ctime_ns, refcount, locked, rdev
             FROM inodes WHERE id = ?1",
            params![id],
            Self::row_to_inode,
        )
        .optional()?
        .ok_or(S3qlError::NoEntry)
    }

    fn row_to_inode(row: &rusqlite::Row) -> rusqlite::Result<Inode> {
        Ok(Inode {
            id: row.get(0)?,
            mode: row.get(1)?,
            uid: row.get(2)?,
            gid: row.get(3)?,
            size: row.get(4)?,
            atime_ns: row.get(5)?,
            mtime_ns: row.get(6)?,
            ctime_ns: row.get(7)?,
            refcount: row.get(8)?,
            locked: row.get::<_, i64>(9)? != 0,
            rdev: row.get(10)?,
        })
    }

    pub fn create_inode(
        &self,
        tx: &rusqlite::Transaction,
        mode: u32,
        uid: u32,
        gid: u32,
        rdev: u32,
    ) -> Result<i64> {
        let now = ns_since_epoch(std::time::SystemTime::now());
        let initial_refcount = if FileType::from_mode(mode) == FileType::Directory {
            1
        } else {
            1
        };
        tx.execute(
            "INSERT INTO inodes (mode, uid, gid, size, atime_ns, mtime_ns, ctime_ns, refcount, locked, rdev)
             VALUES (?1, ?2, ?3, 0, ?4, ?4, ?4, ?5, 0, ?6)",
            params![mode, uid, gid, now, initial_refcount, rdev],
        )?;
        Ok(tx.last_insert_rowid())
    }

    pub fn set_inode(&self, tx: &rusqlite::Transaction, inode: &Inode) -> Result<()> {
        tx.execute(
            "UPDATE inodes SET mode=?2, uid=?3, gid=?4, size=?5, atime_ns=?6, mtime_ns=?7,
             ctime_ns=?8, refcount=?9, locked=?10, rdev=?11 WHERE id=?1",
            params![
                inode.id,
                inode.mode,
                inode.uid,
                inode.gid,
                inode.size,
                inode.atime_ns,
                inode.mtime_ns,
                inode.ctime_ns,
                inode.refcount,
                inode.locked as i64,
                inode.rdev,
            ],
        )?;
        Ok(())
    }

    pub fn delete_inode(&self, tx: &rusqlite::Transaction, id: i64) -> Result<()> {
        tx.execute("DELETE FROM inodes WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM symlink_targets WHERE inode = ?1", params![id])?;
        tx.execute("DELETE FROM ext_attributes WHERE inode = ?1", params![id])?;
        Ok(())
    }

    // ---- directory contents -----------------------------------------

    pub fn lookup_entry(
        &self,
        tx: &rusqlite::Transaction,
        parent: i64,
        name: &[u8],
    ) -> Result<Option<i64>> {
        Ok(tx
            .query_row(
                "SELECT child_inode FROM contents WHERE parent_inode = ?1 AND name = ?2",
                params![parent, name],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn add_entry(
        &self,
        tx: &rusqlite::Transaction,
        parent: i64,
        name: &[u8],
        child: i64,
    ) -> Result<()> {
        if name.len() > MAX_NAME_LEN || name.contains(&0) || name.contains(&b'/') {
            return Err(S3qlError::InvalidArgument(
                "directory entry names must be <=255 bytes and exclude NUL and '/'".to_string(),
            ));
        }
        let existing = self.lookup_entry(tx, parent, name)?;
        if existing.is_some() {
            return Err(S3qlError::InvalidArgument(format!(
                "entry already exists: parent={parent}"
            )));
        }
        tx.execute(
            "INSERT INTO contents (parent_inode, name, child_inode) VALUES (?1, ?2, ?3)",
            params![parent, name, child],
        )?;
        Ok(())
    }

    pub fn remove_entry(&self, tx: &rusqlite::Transaction, parent: i64, name: &[u8]) -> Result<i64> {
        let child = self
            .lookup_entry(tx, parent, name)?
            .ok_or(S3qlError::NoEntry)?;
        tx.execute(
            "DELETE FROM contents WHERE parent_inode = ?1 AND name = ?2",
            params![parent, name],
        )?;
        Ok(child)
    }

    pub fn list_entries(&self, tx: &rusqlite::Transaction, parent: i64) -> Result<Vec<DirEntry>> {
        let mut stmt = tx.prepare(
            "SELECT parent_inode, name, child_inode FROM contents WHERE parent_inode = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![parent], |r| {
            Ok(DirEntry {
                parent_inode: r.get(0)?,
                name: r.get(1)?,
                child_inode: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// True if `child` is named by more than the one entry passed (used by
    /// rmdir/rename-into-descendant checks — spec §8's acyclicity invariant
    /// "a directory inode has exactly one naming entry").
    pub fn entry_count_for_inode(&self, tx: &rusqlite::Transaction, inode: i64) -> Result<i64> {
        tx.query_row(
            "SELECT COUNT(*) FROM contents WHERE child_inode = ?1 AND parent_inode != child_inode",
            params![inode],
            |r| r.get(0),
        )
        .map_err(S3qlError::from)
    }

    // ---- symlinks -----------------------------------------------------

    pub fn set_symlink_target(&self, tx: &rusqlite::Transaction, inode: i64, target: &[u8]) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO symlink_targets (inode, target) VALUES (?1, ?2)",
            params![inode, target],
        )?;
        Ok(())
    }

    pub fn get_symlink_target(&self, tx: &rusqlite::Transaction, inode: i64) -> Result<Vec<u8>> {
        tx.query_row(
            "SELECT target FROM symlink_targets WHERE inode = ?1",
            params![inode],
            |r| r.get(0),
        )
        .optional()?
        .ok_or(S3qlError::NoEntry)
    }

    // ---- extended attributes -------------------------------------------

    fn intern_xattr_name(&self, tx: &rusqlite::Transaction, name: &[u8]) -> Result<i64> {
        if let Some(id) = tx
            .query_row(
                "SELECT id FROM xattr_names WHERE name = ?1",
                params![name],
                |r| r.get(0),
            )
            .optional()?
        {
            return Ok(id);
        }
        tx.execute("INSERT INTO xattr_names (name) VALUES (?1)", params![name])?;
        Ok(tx.last_insert_rowid())
    }

    pub fn set_xattr(&self, tx: &rusqlite::Transaction, inode: i64, name: &[u8], value: &[u8]) -> Result<()> {
        let name_id = self.intern_xattr_name(tx, name)?;
        tx.execute(
            "INSERT OR REPLACE INTO ext_attributes (inode, name_id, value) VALUES (?1, ?2, ?3)",
            params![inode, name_id, value],
        )?;
        Ok(())
    }

    pub fn get_xattr(&self, tx: &rusqlite::Transaction, inode: i64, name: &[u8]) -> Result<Vec<u8>> {
        tx.query_row(
            "SELECT ea.value FROM ext_attributes ea
             JOIN xattr_names n ON n.id = ea.name_id
             WHERE ea.inode = ?1 AND n.name = ?2",
            params![inode, name],
            |r| r.get(0),
        )
        .optional()?
        .ok_or(S3qlError::NoXattr)
    }

    pub fn list_xattrs(&self, tx: &rusqlite::Transaction, inode: i64) -> Result<Vec<Vec<u8>>> {
        let mut stmt = tx.prepare(
            "SELECT n.name FROM ext_attributes ea JOIN xattr_names n ON n.id = ea.name_id WHERE ea.inode = ?1",
        )?;
        let rows = stmt.query_map(params![inode], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn remove_xattr(&self, tx: &rusqlite::Transaction, inode: i64, name: &[u8]) -> Result<()> {
        let changed = tx.execute(
            "DELETE FROM ext_attributes WHERE inode = ?1 AND name_id = (SELECT id FROM xattr_names WHERE name = ?2)",
            params![inode, name],
        )?;
        if changed == 0 {
            return Err(S3qlError::NoXattr);
        }
        Ok(())
    }

    // ---- objects & blocks (dedup table, spec §4.4) ---------------------

    pub fn find_block_by_hash(&self, tx: &rusqlite::Transaction, hash: &[u8; 32]) -> Result<Option<Block>> {
        Ok(tx
            .query_row(
                "SELECT id, hash, refcount, size, obj_id FROM blocks WHERE hash = ?1",
                params![hash.as_slice()],
                Self::row_to_block,
            )
            .optional()?)
    }

    fn row_to_block(row: &rusqlite::Row) -> rusqlite::Result<Block> {
        let hash_vec: Vec<u8> = row.get(1)?;
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&hash_vec);
        Ok(Block {
            id: row.get(0)?,
            hash,
            refcount: row.get(2)?,
            size: row.get(3)?,
            obj_id: row.get(4)?,
        })
    }

    pub fn get_block(&self, tx: &rusqlite::Transaction, block_id: i64) -> Result<Block> {
        tx.query_row(
            "SELECT id, hash, refcount, size, obj_id FROM blocks WHERE id = ?1",
            params![block_id],
            Self::row_to_block,
        )
        .optional()?
        .ok_or(S3qlError::NoEntry)
    }

    pub fn create_object(&self, tx: &rusqlite::Transaction, hash: &[u8; 32], phys_size: i64, length: i64) -> Result<i64> {
        tx.execute(
            "INSERT INTO objects (refcount, hash, phys_size, length) VALUES (0, ?1, ?2, ?3)",
            params![hash.as_slice(), phys_size, length],
        )?;
        Ok(tx.last_insert_rowid())
    }

    pub fn create_block(&self, tx: &rusqlite::Transaction, hash: &[u8; 32], size: i64, obj_id: i64) -> Result<i64> {
        tx.execute(
            "INSERT INTO blocks (hash, refcount, size, obj_id) VALUES (?1, 0, ?2, ?3)",
            params![hash.as_slice(), size, obj_id],
        )?;
        tx.execute(
            "UPDATE objects SET refcount = refcount + 1 WHERE id = ?1",
            params![obj_id],
        )?;
        Ok(tx.last_insert_rowid())
    }

    pub fn incref_block(&self, tx: &rusqlite::Transaction, block_id: i64) -> Result<()> {
        tx.execute(
            "UPDATE blocks SET refcount = refcount + 1 WHERE id = ?1",
            params![block_id],
        )?;
        Ok(())
    }

    /// Decrements a block's refcount; if it reaches zero, decrements its
    /// object's refcount and, if that also reaches zero, enqueues the
    /// backend delete (spec §4.4: removal is deferred).
    pub fn decref_block(&self, tx: &rusqlite::Transaction, block_id: i64) -> Result<()> {
        let block = self.get_block(tx, block_id)?;
        let new_refcount = block.refcount - 1;
        if new_refcount > 0 {
            tx.execute(
                "UPDATE blocks SET refcount = ?2 WHERE id = ?1",
                params![block_id, new_refcount],
            )?;
            return Ok(());
        }
        tx.execute("DELETE FROM blocks WHERE id = ?1", params![block_id])?;
        let obj_refcount: i64 = tx.query_row(
            "SELECT refcount FROM objects WHERE id = ?1",
            params![block.obj_id],
            |r| r.get(0),
        )?;
        let new_obj_refcount = obj_refcount - 1;
        if new_obj_refcount > 0 {
            tx.execute(
                "UPDATE objects SET refcount = ?2 WHERE id = ?1",
                params![block.obj_id, new_obj_refcount],
            )?;
        } else {
            tx.execute("DELETE FROM objects WHERE id = ?1", params![block.obj_id])?;
            self.enqueue_delete(tx, block.obj_id)?;
        }
        Ok(())
    }

    // ---- inode <-> block mapping ---------------------------------------

    pub fn block_for(&self, tx: &rusqlite::Transaction, inode: i64, blockno: i64) -> Result<Option<i64>> {
        Ok(tx
            .query_row(
                "SELECT block_id FROM inode_blocks WHERE inode = ?1 AND blockno = ?2",
                params![inode, blockno],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_block_for(&self, tx: &rusqlite::Transaction, inode: i64, blockno: i64, block_id: i64) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO inode_blocks (inode, blockno, block_id) VALUES (?1, ?2, ?3)",
            params![inode, blockno, block_id],
        )?;
        Ok(())
    }

    pub fn remove_block_mapping(&self, tx: &rusqlite::Transaction, inode: i64, blockno: i64) -> Result<Option<i64>> {
        let block_id = self.block_for(tx, inode, blockno)?;
        tx.execute(
            "DELETE FROM inode_blocks WHERE inode = ?1 AND blockno = ?2",
            params![inode, blockno],
        )?;
        Ok(block_id)
    }

    pub fn blocks_for_inode_from(&self, tx: &rusqlite::Transaction, inode: i64, from_blockno: i64) -> Result<Vec<InodeBlock>> {
        let mut stmt = tx.prepare(
            "SELECT inode, blockno, block_id FROM inode_blocks WHERE inode = ?1 AND blockno >= ?2 ORDER BY blockno",
        )?;
        let rows = stmt.query_map(params![inode, from_blockno], |r| {
            Ok(InodeBlock {
                inode: r.get(0)?,
                blockno: r.get(1)?,
                block_id: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn max_blockno(&self, tx: &rusqlite::Transaction, inode: i64) -> Result<Option<i64>> {
        Ok(tx.query_row(
            "SELECT MAX(blockno) FROM inode_blocks WHERE inode = ?1",
            params![inode],
            |r| r.get(0),
        )?)
    }

    // ---- deferred delete queue (spec §4.4) ------------------------------

    pub fn enqueue_delete(&self, tx: &rusqlite::Transaction, obj_id: i64) -> Result<()> {
        tx.execute(
            "INSERT OR IGNORE INTO objects_to_delete (obj_id) VALUES (?1)",
            params![obj_id],
        )?;
        Ok(())
    }

    pub fn drain_delete_queue(&self, tx: &rusqlite::Transaction, limit: i64) -> Result<Vec<i64>> {
        let mut stmt = tx.prepare("SELECT obj_id FROM objects_to_delete LIMIT ?1")?;
        let rows = stmt.query_map(params![limit], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn remove_from_delete_queue(&self, tx: &rusqlite::Transaction, obj_id: i64) -> Result<()> {
        tx.execute("DELETE FROM objects_to_delete WHERE obj_id = ?1", params![obj_id])?;
        Ok(())
    }

    // ---- mount_state key-value (seq_no, dirty page tracking, ...) -----

    pub fn get_state(&self, tx: &rusqlite::Transaction, key: &str) -> Result<Option<String>> {
        Ok(tx
            .query_row(
                "SELECT value FROM mount_state WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn set_state(&self, tx: &rusqlite::Transaction, key: &str, value: &str) -> Result<()> {
        tx.execute(
            "INSERT OR REPLACE INTO mount_state (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    // ---- whole-database serialization for the uploader (spec §4.7) -----

    /// Serializes the full database to bytes (used for the full metadata
    /// snapshot on unmount).
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let conn = self.conn.lock();
        Ok(conn.serialize(rusqlite::DatabaseName::Main)?.to_vec())
    }

    pub fn load_serialized(&self, bytes: &[u8]) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.deserialize(rusqlite::DatabaseName::Main, bytes.to_vec())?;
        Ok(())
    }

    // ---- fsck support ----------------------------------------------------

    pub fn all_block_ids(&self, tx: &rusqlite::Transaction) -> Result<Vec<i64>> {
        let mut stmt = tx.prepare("SELECT id FROM blocks")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_object_ids(&self, tx: &rusqlite::Transaction) -> Result<Vec<i64>> {
        let mut stmt = tx.prepare("SELECT id FROM objects")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn all_inode_ids(&self, tx: &rusqlite::Transaction) -> Result<Vec<i64>> {
        let mut stmt = tx.prepare("SELECT id FROM inodes")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn actual_block_refcount(&self, tx: &rusqlite::Transaction, block_id: i64) -> Result<i64> {
        Ok(tx.query_row(
            "SELECT COUNT(*) FROM inode_blocks WHERE block_id = ?1",
            params![block_id],
            |r| r.get(0),
        )?)
    }

    pub fn actual_object_refcount(&self, tx: &rusqlite::Transaction, obj_id: i64) -> Result<i64> {
        Ok(tx.query_row(
            "SELECT COUNT(*) FROM blocks WHERE obj_id = ?1",
            params![obj_id],
            |r| r.get(0),
        )?)
    }

    /// Directories always have refcount 1 (spec §3: "for directories
    /// always 1"); only files are reconciled against the number of naming
    /// directory entries. `entry_count_for_inode` counts every `..`
    /// backlink from child subdirectories too, so applying it to a
    /// directory would count that directory's own subdirectories as
    /// additional links to it — that's a backlink, not a hardlink.
    pub fn actual_inode_refcount(&self, tx: &rusqlite::Transaction, inode: i64) -> Result<i64> {
        if inode == ROOT_INODE || self.get_inode(tx, inode)?.file_type() == FileType::Directory {
            return Ok(1);
        }
        self.entry_count_for_inode(tx, inode)
    }

    pub fn fix_block_refcount(&self, tx: &rusqlite::Transaction, block_id: i64, refcount: i64) -> Result<()> {
        if refcount <= 0 {
            self.decref_block_to_zero_for_fsck(tx, block_id)
        } else {
            tx.execute(
                "UPDATE blocks SET refcount = ?2 WHERE id = ?1",
                params![block_id, refcount],
            )?;
            Ok(())
        }
    }

    fn decref_block_to_zero_for_fsck(&self, tx: &rusqlite::Transaction, block_id: i64) -> Result<()> {
        let block = self.get_block(tx, block_id)?;
        tx.execute("DELETE FROM blocks WHERE id = ?1", params![block_id])?;
        tx.execute(
            "UPDATE objects SET refcount = MAX(refcount - 1, 0) WHERE id = ?1",
            params![block.obj_id],
        )?;
        self.enqueue_delete(tx, block.obj_id)?;
        Ok(())
    }

    pub fn fix_object_refcount(&self, tx: &rusqlite::Transaction, obj_id: i64, refcount: i64) -> Result<()> {
        if refcount <= 0 {
            tx.execute("DELETE FROM objects WHERE id = ?1", params![obj_id])?;
            self.enqueue_delete(tx, obj_id)?;
        } else {
            tx.execute(
                "UPDATE objects SET refcount = ?2 WHERE id = ?1",
                params![obj_id, refcount],
            )?;
        }
        Ok(())
    }

    pub fn fix_inode_refcount(&self, tx: &rusqlite::Transaction, inode: i64, refcount: i64) -> Result<()> {
        tx.execute(
            "UPDATE inodes SET refcount = ?2 WHERE id = ?1",
            params![inode, refcount.max(0)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_fresh_creates_root() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.init_fresh().unwrap();
        store
            .transaction(|tx| {
                let root = store.get_inode(tx, ROOT_INODE)?;
                assert_eq!(root.file_type(), FileType::Directory);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn nonroot_directory_with_subdirs_keeps_refcount_one() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.init_fresh().unwrap();
        store
            .transaction(|tx| {
                let parent = store.create_inode(tx, libc::S_IFDIR | 0o755, 0, 0, 0)?;
                store.add_entry(tx, ROOT_INODE, b"parent", parent)?;
                store.add_entry(tx, parent, b".", parent)?;
                store.add_entry(tx, parent, b"..", ROOT_INODE)?;

                for name in [b"child1".as_slice(), b"child2".as_slice()] {
                    let child = store.create_inode(tx, libc::S_IFDIR | 0o755, 0, 0, 0)?;
                    store.add_entry(tx, parent, name, child)?;
                    store.add_entry(tx, child, b".", child)?;
                    store.add_entry(tx, child, b"..", parent)?;
                }

                // Two subdirectories each name `parent` via `..`, which would
                // inflate entry_count_for_inode(parent) to 2 if it weren't
                // exempted as a directory.
                assert_eq!(store.actual_inode_refcount(tx, parent)?, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn dedup_reuses_block_row_by_hash() {
        let store = MetadataStore::open_in_memory().unwrap();
        let hash = [7u8; 32];
        store
            .transaction(|tx| {
                let obj_id = store.create_object(tx, &hash, 100, 50)?;
                let block_id = store.create_block(tx, &hash, 50, obj_id)?;
                store.incref_block(tx, block_id)?;
                let found = store.find_block_by_hash(tx, &hash)?.unwrap();
                assert_eq!(found.id, block_id);
                assert_eq!(found.refcount, 1);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn decref_to_zero_cascades_to_object_and_enqueues_delete() {
        let store = MetadataStore::open_in_memory().unwrap();
        let hash = [9u8; 32];
        store
            .transaction(|tx| {
                let obj_id = store.create_object(tx, &hash, 10, 10)?;
                let block_id = store.create_block(tx, &hash, 10, obj_id)?;
                store.incref_block(tx, block_id)?;
                store.decref_block(tx, block_id)?;
                assert!(store.find_block_by_hash(tx, &hash)?.is_none());
                let queued = store.drain_delete_queue(tx, 10)?;
                assert_eq!(queued, vec![obj_id]);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn directory_entry_rejects_overlong_name() {
        let store = MetadataStore::open_in_memory().unwrap();
        store.init_fresh().unwrap();
        store
            .transaction(|tx| {
                let child = store.create_inode(tx, libc::S_IFREG | 0o644, 0, 0, 0)?;
                let long_name = vec![b'a'; 300];
                assert!(store.add_entry(tx, ROOT_INODE, &long_name, child).is_err());
                Ok(())
            })
            .unwrap();
    }
}
