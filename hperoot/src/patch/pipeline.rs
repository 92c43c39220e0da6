// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! Magisk root patch for a boot image, driven by `magiskboot`. All
//! intermediate files live in a [`WorkDir`] and every tool invocation runs
//! inside it.

use std::{
    env,
    fs::{self, File},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{debug, info};

use crate::{
    format::magisk::{self, MagiskConfig},
    patch::{
        apk::{self, Abi},
        classify::{self, RAMDISK, RamdiskState},
        magiskboot::{self, BootTool, CpioOp, Session},
    },
    stream,
    util::NumBytes,
};

pub const BOOT_IMAGE: &str = "boot.img";
/// Output of `magiskboot repack`.
pub const NEW_BOOT_IMAGE: &str = "new-boot.img";
pub const RAMDISK_ORIG: &str = "ramdisk.cpio.orig";
pub const CONFIG: &str = "config";
pub const CUSTOM_RC: &str = "custom.rc";
pub const SUPERPOWER_APK: &str = "superpower.apk";

/// Default name of the work directory when none is specified.
pub const DEFAULT_WORK_DIR: &str = "hpesuperpower_temp";

#[derive(Debug, Error)]
pub enum Error {
    #[error("APK error")]
    Apk(#[from] apk::Error),
    #[error("Classification error")]
    Classify(#[from] classify::Error),
    #[error("Magisk config error")]
    Config(#[from] magisk::Error),
    #[error("magiskboot error")]
    MagiskBoot(#[from] magiskboot::Error),
    #[error("Refusing to clear work directory {path:?}: it contains {contains:?}")]
    UnsafeWorkDir { path: PathBuf, contains: PathBuf },
    #[error("File I/O error: {0:?}")]
    File(PathBuf, #[source] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Scratch directory for one patching run. Any leftovers from a previous run
/// are removed when it is created. It is not removed automatically so that
/// the intermediate files can be inspected after a failure.
#[derive(Debug)]
pub struct WorkDir {
    path: PathBuf,
}

impl WorkDir {
    /// Create `path`, deleting what's already there. An existing directory
    /// that contains the current directory or any of `protected` is refused
    /// instead of being cleared.
    pub fn create(path: &Path, protected: &[&Path]) -> Result<Self> {
        match fs::canonicalize(path) {
            Ok(dir) => {
                let cwd = env::current_dir().map_err(|e| Error::File(PathBuf::from("."), e))?;
                let cwd = fs::canonicalize(&cwd).map_err(|e| Error::File(cwd, e))?;

                // Inputs that don't exist can't be lost.
                let inputs = protected.iter().filter_map(|p| fs::canonicalize(p).ok());

                if let Some(contains) = [cwd].into_iter().chain(inputs).find(|p| p.starts_with(&dir))
                {
                    return Err(Error::UnsafeWorkDir {
                        path: path.to_owned(),
                        contains,
                    });
                }

                fs::remove_dir_all(path).map_err(|e| Error::File(path.to_owned(), e))?;
                debug!("Removed stale work directory: {path:?}");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::File(path.to_owned(), e)),
        }

        fs::create_dir_all(path).map_err(|e| Error::File(path.to_owned(), e))?;

        Ok(Self {
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    pub fn remove(self) -> Result<()> {
        fs::remove_dir_all(&self.path).map_err(|e| Error::File(self.path.clone(), e))
    }
}

#[derive(Clone, Debug)]
pub struct PatchOptions {
    /// Boot image to patch. This may be stock or already patched by Magisk.
    pub boot_image: PathBuf,
    pub magisk_apk: PathBuf,
    pub abi: Abi,
    /// Init script added as `overlay.d/custom.rc`.
    pub custom_rc: PathBuf,
    /// APK added as `overlay.d/sbin/superpower.apk`.
    pub superpower_apk: PathBuf,
    pub preinit_device: String,
}

impl PatchOptions {
    /// Files the patch reads from.
    pub fn inputs(&self) -> [&Path; 4] {
        [
            self.boot_image.as_path(),
            self.magisk_apk.as_path(),
            self.custom_rc.as_path(),
            self.superpower_apk.as_path(),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Patched { image: PathBuf, state: RamdiskState },
    /// The image was patched by an unsupported tool and was left alone.
    Unsupported,
}

/// Ramdisk operations that install Magisk and the extra payload. `patch` runs
/// before `backup` so that the backup captures every change made to the stock
/// ramdisk.
pub fn injection_ops() -> Vec<CpioOp> {
    vec![
        CpioOp::add(0o750, "init", apk::MAGISKINIT),
        CpioOp::mkdir(0o750, "overlay.d"),
        CpioOp::mkdir(0o750, "overlay.d/sbin"),
        CpioOp::add(0o644, "overlay.d/sbin/magisk.xz", "magisk.xz"),
        CpioOp::add(0o644, "overlay.d/sbin/stub.xz", "stub.xz"),
        CpioOp::add(0o644, "overlay.d/sbin/init-ld.xz", "init-ld.xz"),
        CpioOp::Patch,
        CpioOp::backup(RAMDISK_ORIG),
        CpioOp::mkdir(0o000, ".backup"),
        CpioOp::add(0o000, classify::BACKUP_CONFIG, CONFIG),
        CpioOp::add(0o644, "overlay.d/custom.rc", CUSTOM_RC),
        CpioOp::add(0o755, "overlay.d/sbin/superpower.apk", SUPERPOWER_APK),
    ]
}

fn copy_file(source: &Path, target: &Path, cancel_signal: &AtomicBool) -> Result<()> {
    let reader = File::open(source).map_err(|e| Error::File(source.to_owned(), e))?;
    let writer = File::create(target).map_err(|e| Error::File(target.to_owned(), e))?;
    let mut writer = BufWriter::new(writer);

    let n = stream::copy(BufReader::new(reader), &mut writer, cancel_signal)
        .map_err(|e| Error::File(target.to_owned(), e))?;
    writer
        .flush()
        .map_err(|e| Error::File(target.to_owned(), e))?;

    debug!("Copied {source:?} to {target:?} ({})", NumBytes(n));

    Ok(())
}

/// Patch `options.boot_image` with Magisk. `work_dir` should be freshly
/// created. On success, the patched image is at [`NEW_BOOT_IMAGE`] inside the
/// work directory.
///
/// If the input was already patched by Magisk, it is restored to stock first,
/// so patching the output again produces the same config record and the same
/// sequence of tool invocations.
pub fn patch_boot_image(
    tool: &dyn BootTool,
    options: &PatchOptions,
    work_dir: &WorkDir,
    cancel_signal: &AtomicBool,
) -> Result<PatchOutcome> {
    let session = Session::new(tool, work_dir.path());

    copy_file(&options.boot_image, &work_dir.join(BOOT_IMAGE), cancel_signal)?;
    copy_file(&options.custom_rc, &work_dir.join(CUSTOM_RC), cancel_signal)?;
    copy_file(
        &options.superpower_apk,
        &work_dir.join(SUPERPOWER_APK),
        cancel_signal,
    )?;
    apk::extract_payload(
        &options.magisk_apk,
        options.abi,
        work_dir.path(),
        cancel_signal,
    )?;

    session.unpack(BOOT_IMAGE)?;

    let state = classify::classify(&session, &options.boot_image, cancel_signal)?;
    let sha1 = match state {
        RamdiskState::Stock { sha1 } | RamdiskState::MagiskPatched { sha1 } => sha1,
        RamdiskState::Unsupported => return Ok(PatchOutcome::Unsupported),
    };

    // Snapshot of the stock ramdisk for `cpio backup`.
    copy_file(
        &work_dir.join(RAMDISK),
        &work_dir.join(RAMDISK_ORIG),
        cancel_signal,
    )?;

    for (input, output) in [
        (apk::MAGISK, "magisk.xz"),
        (apk::STUB, "stub.xz"),
        (apk::INIT_LD, "init-ld.xz"),
    ] {
        session.compress_xz(input, output)?;
    }

    let config = MagiskConfig::new(sha1, &options.preinit_device)?;
    let config_path = work_dir.join(CONFIG);
    fs::write(&config_path, config.to_string()).map_err(|e| Error::File(config_path, e))?;

    info!("Injecting Magisk into ramdisk");

    session.cpio(RAMDISK, &injection_ops(), &config.entries())?;

    session.repack(BOOT_IMAGE)?;

    Ok(PatchOutcome::Patched {
        image: work_dir.join(NEW_BOOT_IMAGE),
        state,
    })
}
