//! CLI entry point (spec §6): `mkfs`, `mount`, and `fsck` subcommands over a
//! single binary, mirroring the teacher's fork/retry/signal mount loop
//! (`examples/chiro2001-rfs/src/main.rs`) adapted onto `fuser::mount2` and
//! the layered filesystem built in [`s3ql::filesystem`].

use std::env::set_var;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{arg, command, ArgAction, Command};
use fork::{fork, Fork};
use log::*;
use nix::sys::signal;
use retry::delay::Fixed;
use retry::{retry_with_index, OperationResult};

use backend::local::LocalBackend;
use backend::retrying::RetryingBackend;
use backend::Backend;
use s3ql::config::{CompressionAlgorithm, MountConfig, Parameters, Tunables};
use s3ql::filesystem::{self, S3ql};
use s3ql::fsck::Fsck;
use s3ql::metadata::MetadataStore;

const RETRY_TIMES: u64 = 3;

fn unmount(mountpoint: &str) {
    info!("unmounting {mountpoint}");
    let mut cmd = std::process::Command::new("fusermount");
    cmd.arg("-u").arg(mountpoint).stdout(Stdio::piped());
    match cmd.status() {
        Ok(status) if status.success() => info!("unmount done"),
        Ok(status) => warn!("fusermount exited with {status}"),
        Err(e) => warn!("failed to invoke fusermount: {e}"),
    }
}

/// Drives a clean unmount, which in turn runs `Filesystem::destroy` and
/// therefore [`S3ql::on_unmount`] through the kernel's own FUSE teardown
/// (spec §6, §9).
extern "C" fn sigint_handler(_: i32) {
    if let Some(mountpoint) = s3ql::MOUNT_POINT.get() {
        unmount(&mountpoint.to_string_lossy());
    }
    std::process::exit(0);
}

fn install_sigint_handler() {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(sigint_handler),
        signal::SaFlags::SA_NODEFER,
        signal::SigSet::empty(),
    );
    unsafe {
        if let Err(e) = signal::sigaction(signal::SIGINT, &action) {
            warn!("failed to install SIGINT handler: {e:?}");
        }
    }
}

fn parse_compression(s: &str) -> Result<CompressionAlgorithm> {
    Ok(match s {
        "none" => CompressionAlgorithm::None,
        "zlib" => CompressionAlgorithm::Zlib,
        "lzma" => CompressionAlgorithm::Lzma,
        "zstd" => CompressionAlgorithm::Zstd,
        other => return Err(anyhow!("unknown compression algorithm '{other}'")),
    })
}

fn run_mkfs(matches: &clap::ArgMatches) -> Result<()> {
    let backend_dir = matches.get_one::<String>("backend_dir").unwrap();
    let label = matches.get_one::<String>("label").unwrap().clone();
    let block_size: u64 = matches
        .get_one::<String>("block_size")
        .unwrap()
        .parse()
        .context("--block-size must be an integer")?;
    let passphrase = matches.get_one::<String>("passphrase").unwrap();

    let backend: Arc<dyn Backend> = Arc::new(RetryingBackend::new(LocalBackend::new(backend_dir)?));
    let params = Parameters::new(block_size, label)?;
    filesystem::mkfs(backend, &params, passphrase)?;
    info!("filesystem '{}' created in {}", params.fs_uuid, backend_dir);
    Ok(())
}

fn run_fsck(matches: &clap::ArgMatches) -> Result<()> {
    let backend_dir = matches.get_one::<String>("backend_dir").unwrap();
    let passphrase = matches.get_one::<String>("passphrase").unwrap();
    let deep = matches.get_flag("deep");

    let backend: Arc<dyn Backend> = Arc::new(RetryingBackend::new(LocalBackend::new(backend_dir)?));
    let master_key = filesystem::read_master_key(&*backend, passphrase)?;
    let params = filesystem::load_params(backend.clone(), &master_key)?;

    let store = Arc::new(MetadataStore::open_in_memory()?);
    let uploader = s3ql::uploader::MetadataUploader::new(
        store.clone(),
        backend.clone(),
        master_key.clone(),
        CompressionAlgorithm::None,
        1,
    );
    uploader.download_and_apply()?;

    let fsck = Fsck::new(store.clone(), backend.clone(), master_key);
    let report = fsck.run(deep)?;
    info!(
        "fsck on '{}' complete: {} block refcounts fixed, {} object refcounts fixed, \
         {} inode refcounts fixed, {} orphaned objects removed, {} objects missing, \
         {} hash mismatches",
        params.label,
        report.block_refcounts_fixed,
        report.object_refcounts_fixed,
        report.inode_refcounts_fixed,
        report.orphaned_backend_objects,
        report.missing_backend_objects,
        report.hash_mismatches,
    );

    // A completed repair run re-records `clean_seq_no` at the current
    // highest seq-no object before re-publishing metadata, so the next
    // mount's clean-shutdown check (spec §4.8) sees a consistent snapshot
    // instead of staying stuck in `not-clean` forever.
    let current_seq_no = s3ql::mount_exclusion::highest_seq_no(&*backend)?.unwrap_or(0);
    store.transaction(|tx| {
        store.set_state(tx, s3ql::mount_exclusion::CLEAN_SEQ_NO_KEY, &current_seq_no.to_string())
    })?;
    uploader.upload_full()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn mount_once(
    backend_dir: &str,
    mountpoint: &std::path::Path,
    cache_dir: &str,
    passphrase: &str,
    upload_threads: usize,
    cache_size: u64,
    compression: CompressionAlgorithm,
    options: &[fuser::MountOption],
) -> Result<()> {
    let backend: Arc<dyn Backend> = Arc::new(RetryingBackend::new(LocalBackend::new(backend_dir)?));
    let master_key = filesystem::read_master_key(&*backend, passphrase)?;
    let params = filesystem::load_params(backend.clone(), &master_key)?;

    let mut tunables = Tunables::default();
    tunables.upload_threads = upload_threads;
    tunables.max_cache_size = cache_size;
    tunables.compression_algorithm = compression;

    let config = MountConfig {
        cache_dir: std::path::PathBuf::from(cache_dir),
        params,
        tunables,
    };
    let mut fs = S3ql::new(config, backend, master_key)?;
    // Run before handing off to `fuser::mount2`: an `S3qlError` raised here
    // propagates through `anyhow` intact, whereas `fuser::mount2` wraps any
    // error its `init` callback returns into a generic `std::io::Error`,
    // which would erase the NotClean/AlreadyMounted/Auth exit code (spec §6).
    fs.on_mount()?;
    fuser::mount2(fs, mountpoint, options)?;
    info!("unmounted cleanly");
    Ok(())
}

fn run_mount(matches: &clap::ArgMatches) -> Result<()> {
    let backend_dir = matches.get_one::<String>("backend_dir").unwrap().clone();
    let mountpoint = matches.get_one::<String>("mountpoint").unwrap().clone();
    let passphrase = matches.get_one::<String>("passphrase").unwrap().clone();
    let cache_dir = matches.get_one::<String>("cache").unwrap().clone();
    let foreground = matches.get_flag("foreground");
    let read_only = matches.get_flag("read_only");
    let compression = parse_compression(matches.get_one::<String>("compress").unwrap())?;
    let upload_threads: usize = matches
        .get_one::<String>("parallelism")
        .unwrap()
        .parse()
        .context("--parallelism must be an integer")?;
    let cache_size: u64 = matches
        .get_one::<String>("cachesize")
        .unwrap()
        .parse()
        .context("--cachesize must be an integer (bytes)")?;

    let abspath_mountpoint = std::fs::canonicalize(&mountpoint)
        .with_context(|| format!("mount point {mountpoint} does not exist"))?;
    s3ql::MOUNT_POINT
        .set(abspath_mountpoint.clone())
        .map_err(|_| anyhow!("mount point already initialized"))?;
    install_sigint_handler();

    let options = if read_only {
        vec![fuser::MountOption::RO, fuser::MountOption::FSName("s3ql".to_string())]
    } else {
        vec![fuser::MountOption::RW, fuser::MountOption::FSName("s3ql".to_string())]
    };

    match if foreground { Ok(Fork::Child) } else { fork() } {
        Ok(Fork::Parent(child)) => {
            info!("daemon running at pid: {child}");
            Ok(())
        }
        Ok(Fork::Child) => {
            // `retry`'s `OperationResult::Err` only carries a `String`, which
            // would erase the exit code an `S3qlError` maps to (spec §6);
            // stash it here so the caller can still surface it precisely.
            let fatal_exit_code = std::cell::Cell::new(None);
            let result = retry_with_index(Fixed::from_millis(100), |current_try| {
                info!(
                    "[try {current_try}/{RETRY_TIMES}] mounting {backend_dir} at {}",
                    abspath_mountpoint.display()
                );
                match mount_once(
                    &backend_dir,
                    &abspath_mountpoint,
                    &cache_dir,
                    &passphrase,
                    upload_threads,
                    cache_size,
                    compression,
                    &options,
                ) {
                    Ok(()) => OperationResult::Ok(()),
                    // Not-clean / already-mounted / auth failures never
                    // succeed on retry; surface them immediately instead of
                    // burning through the retry budget.
                    Err(e) if e.downcast_ref::<s3ql::error::S3qlError>().is_some() => {
                        let code = e.downcast_ref::<s3ql::error::S3qlError>().unwrap().exit_code();
                        fatal_exit_code.set(Some(code));
                        OperationResult::Err(e.to_string())
                    }
                    Err(e) => {
                        if current_try >= RETRY_TIMES {
                            OperationResult::Err(format!(
                                "failed to mount after {RETRY_TIMES} retries: {e}"
                            ))
                        } else {
                            unmount(&abspath_mountpoint.to_string_lossy());
                            OperationResult::Retry(format!("failed to mount, retrying: {e}"))
                        }
                    }
                }
            });
            result.map_err(|e| {
                if let Some(code) = fatal_exit_code.get() {
                    error!("{e}");
                    std::process::exit(code);
                }
                anyhow!("mount failed with {e}")
            })
        }
        Err(e) => Err(anyhow!("fork returned error {e}")),
    }
}

fn main() -> Result<()> {
    let matches = command!() // requires `cargo` feature
        .subcommand(
            Command::new("mkfs")
                .about("Initializes a new filesystem on a backend")
                .arg(arg!(<backend_dir> "Local directory backend path"))
                .arg(
                    arg!(--"block-size" <BYTES> "Data block size in bytes")
                        .id("block_size")
                        .default_value("10485760"),
                )
                .arg(arg!(--label <LABEL> "Filesystem label").default_value("s3ql"))
                .arg(arg!(--passphrase <PASSPHRASE> "Passphrase wrapping the master key")),
        )
        .subcommand(
            Command::new("mount")
                .about("Mounts a filesystem")
                .arg(arg!(<backend_dir> "Local directory backend path"))
                .arg(arg!(<mountpoint> "Mount point"))
                .arg(arg!(--passphrase <PASSPHRASE> "Passphrase unwrapping the master key"))
                .arg(arg!(--cache <DIR> "Local cache directory").default_value("/var/cache/s3ql"))
                .arg(
                    arg!(--compress <ALG> "Compression algorithm: none, zlib, lzma, zstd")
                        .default_value("lzma"),
                )
                .arg(arg!(--parallelism <N> "Number of concurrent upload threads").default_value("4"))
                .arg(
                    arg!(--cachesize <BYTES> "Maximum local cache size in bytes")
                        .default_value("536870912"),
                )
                .arg(arg!(-r --read_only "Mount as a read-only filesystem").action(ArgAction::SetTrue))
                .arg(
                    arg!(-f --foreground "Keep the mount process in the foreground")
                        .action(ArgAction::SetTrue),
                )
                .arg(
                    arg!(-v --verbose "Print more debug information, or set `RUST_LOG=debug`")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(
            Command::new("fsck")
                .about("Checks and repairs a filesystem's metadata offline")
                .arg(arg!(<backend_dir> "Local directory backend path"))
                .arg(arg!(--passphrase <PASSPHRASE> "Passphrase unwrapping the master key"))
                .arg(
                    arg!(--deep "Re-download and verify every object's stored hash")
                        .action(ArgAction::SetTrue),
                ),
        )
        .get_matches();

    let (name, sub_matches) = matches
        .subcommand()
        .ok_or_else(|| anyhow!("a subcommand (mkfs, mount, fsck) is required"))?;

    if sub_matches.try_get_one::<bool>("verbose").ok().flatten() == Some(&true) {
        set_var("RUST_LOG", "debug");
    }
    env_logger::init();

    let result = match name {
        "mkfs" => run_mkfs(sub_matches),
        "mount" => run_mount(sub_matches),
        "fsck" => run_fsck(sub_matches),
        other => Err(anyhow!("unknown subcommand '{other}'")),
    };

    if let Err(e) = &result {
        if let Some(s3ql_err) = e.downcast_ref::<s3ql::error::S3qlError>() {
            error!("{s3ql_err}");
            std::process::exit(s3ql_err.exit_code());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_compression_algorithms() {
        assert_eq!(parse_compression("zstd").unwrap(), CompressionAlgorithm::Zstd);
        assert_eq!(parse_compression("none").unwrap(), CompressionAlgorithm::None);
        assert!(parse_compression("bzip2").is_err());
    }
}
