// SPDX-FileCopyrightText: 2024 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    cell::RefCell,
    ffi::OsString,
    fs::{self, File},
    io::{Cursor, Write},
    ops::Range,
    path::Path,
    sync::atomic::AtomicBool,
};

use assert_matches::assert_matches;
use clap::Parser;
use ring::digest::{self, SHA1_FOR_LEGACY_USE_ONLY};
use tempfile::TempDir;
use zip::{ZipWriter, write::SimpleFileOptions};

use hperoot::{
    cli::root::{self, RestoreCli, RootCli},
    format::{
        gpt::{BLOCK_SIZE, Guid, PartitionAttributes, PartitionEntry, PartitionTable},
        magisk,
    },
    install::{Channel, InstallPaths},
    patch::{
        apk::Abi,
        classify::{self, RAMDISK, RamdiskState},
        magiskboot::{self, BootTool},
        pipeline::{self, NEW_BOOT_IMAGE, PatchOptions, PatchOutcome, WorkDir},
    },
    stream::ToWriter,
};

const IMAGE_HEADER: &[u8] = b"ANDROID!";
const PATCHED_TAG: &[u8] = b"magisk\n";
const BACKUP_SEPARATOR: &[u8] = b"--\n";

#[derive(Debug, PartialEq, Eq)]
struct Call {
    args: Vec<String>,
    env: Vec<(String, String)>,
}

/// Emulates the file effects of magiskboot. A "boot image" is a header, the
/// ramdisk, and zero padding. A patched ramdisk is the tag, the config record,
/// a separator, and the stock ramdisk that the backup was made from.
#[derive(Default)]
struct FakeMagiskBoot {
    calls: RefCell<Vec<Call>>,
    fail_command: Option<&'static str>,
}

impl FakeMagiskBoot {
    fn failing(command: &'static str) -> Self {
        Self {
            fail_command: Some(command),
            ..Default::default()
        }
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.calls.borrow().iter().map(|c| c.args.clone()).collect()
    }

    fn split_patched(ramdisk: &[u8]) -> (&[u8], &[u8]) {
        let data = ramdisk.strip_prefix(PATCHED_TAG).unwrap();
        let split = data
            .windows(BACKUP_SEPARATOR.len())
            .position(|w| w == BACKUP_SEPARATOR)
            .unwrap();

        (&data[..split], &data[split + BACKUP_SEPARATOR.len()..])
    }

    fn cpio(dir: &Path, ops: &[String]) -> i32 {
        let path = dir.join(RAMDISK);
        let mut ramdisk = fs::read(&path).unwrap();
        let mut config = None;
        let mut backup = None;

        for op in ops {
            match op.split(' ').collect::<Vec<_>>().as_slice() {
                ["test"] => {
                    return if ramdisk.starts_with(PATCHED_TAG) {
                        1
                    } else if ramdisk.starts_with(b"other") {
                        2
                    } else {
                        0
                    };
                }
                ["extract", ".backup/.magisk", output] => {
                    let (record, _) = Self::split_patched(&ramdisk);
                    fs::write(dir.join(output), record).unwrap();
                }
                ["restore"] => {
                    let (_, stock) = Self::split_patched(&ramdisk);
                    ramdisk = stock.to_vec();
                }
                ["backup", original] => {
                    backup = Some(fs::read(dir.join(original)).unwrap());
                }
                ["add", "0000", ".backup/.magisk", source] => {
                    config = Some(fs::read(dir.join(source)).unwrap());
                }
                ["add", _, _, source] => {
                    assert!(dir.join(source).is_file(), "Missing {source:?}");
                }
                ["mkdir", _, _] | ["patch"] => {}
                _ => return 2,
            }
        }

        if let (Some(config), Some(backup)) = (config, backup) {
            ramdisk = [PATCHED_TAG, config.as_slice(), BACKUP_SEPARATOR, backup.as_slice()].concat();
        }

        fs::write(path, ramdisk).unwrap();

        0
    }
}

impl BootTool for FakeMagiskBoot {
    fn run(
        &self,
        args: &[OsString],
        dir: &Path,
        env: &[(&str, String)],
    ) -> Result<i32, magiskboot::Error> {
        let args = args
            .iter()
            .map(|a| a.to_str().unwrap().to_owned())
            .collect::<Vec<_>>();

        self.calls.borrow_mut().push(Call {
            args: args.clone(),
            env: env
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        });

        if self.fail_command == Some(args[0].as_str()) {
            return Ok(1);
        }

        let copy = |from: &str, to: &str, prefix: &[u8]| {
            let data = [prefix, fs::read(dir.join(from)).unwrap().as_slice()].concat();
            fs::write(dir.join(to), data).unwrap();
        };

        match args[0].as_str() {
            "unpack" => {
                let image = fs::read(dir.join(&args[1])).unwrap();
                let Some(data) = image.strip_prefix(IMAGE_HEADER) else {
                    return Ok(1);
                };
                let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
                fs::write(dir.join(RAMDISK), &data[..end]).unwrap();
            }
            "repack" => copy(RAMDISK, NEW_BOOT_IMAGE, IMAGE_HEADER),
            "compress=xz" => copy(&args[1], &args[2], b"xz:"),
            "cpio" => return Ok(Self::cpio(dir, &args[2..])),
            _ => return Ok(2),
        }

        Ok(0)
    }
}

fn boot_image(ramdisk: &[u8]) -> Vec<u8> {
    [IMAGE_HEADER, ramdisk].concat()
}

fn sha1_hex(data: &[u8]) -> String {
    hex::encode(digest::digest(&SHA1_FOR_LEGACY_USE_ONLY, data))
}

fn create_apk(path: &Path) {
    let mut writer = ZipWriter::new(File::create(path).unwrap());

    for (name, data) in [
        ("lib/x86_64/libmagiskinit.so", b"magiskinit".as_slice()),
        ("lib/x86_64/libmagisk.so", b"magisk".as_slice()),
        ("lib/x86_64/libinit-ld.so", b"init-ld".as_slice()),
        ("assets/stub.apk", b"stub".as_slice()),
    ] {
        writer.start_file(name, SimpleFileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap();
}

fn setup(ramdisk: &[u8]) -> (TempDir, PatchOptions) {
    let temp_dir = tempfile::tempdir().unwrap();
    let options = PatchOptions {
        boot_image: temp_dir.path().join("boot_a.img"),
        magisk_apk: temp_dir.path().join("magisk.apk"),
        abi: Abi::X86_64,
        custom_rc: temp_dir.path().join("custom.rc"),
        superpower_apk: temp_dir.path().join("superpower.apk"),
        preinit_device: magisk::DEFAULT_PREINIT_DEVICE.to_owned(),
    };

    fs::write(&options.boot_image, boot_image(ramdisk)).unwrap();
    create_apk(&options.magisk_apk);
    fs::write(&options.custom_rc, b"on boot\n").unwrap();
    fs::write(&options.superpower_apk, b"superpower").unwrap();

    (temp_dir, options)
}

fn command(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| (*a).to_owned()).collect()
}

fn expected_commands(restore: bool) -> Vec<Vec<String>> {
    let mut commands = vec![
        command(&["unpack", "boot.img"]),
        command(&["cpio", "ramdisk.cpio", "test"]),
    ];

    if restore {
        commands.push(command(&[
            "cpio",
            "ramdisk.cpio",
            "extract .backup/.magisk config.orig",
            "restore",
        ]));
    }

    commands.extend([
        command(&["compress=xz", "magisk", "magisk.xz"]),
        command(&["compress=xz", "stub.apk", "stub.xz"]),
        command(&["compress=xz", "init-ld", "init-ld.xz"]),
        command(&[
            "cpio",
            "ramdisk.cpio",
            "add 0750 init magiskinit",
            "mkdir 0750 overlay.d",
            "mkdir 0750 overlay.d/sbin",
            "add 0644 overlay.d/sbin/magisk.xz magisk.xz",
            "add 0644 overlay.d/sbin/stub.xz stub.xz",
            "add 0644 overlay.d/sbin/init-ld.xz init-ld.xz",
            "patch",
            "backup ramdisk.cpio.orig",
            "mkdir 0000 .backup",
            "add 0000 .backup/.magisk config",
            "add 0644 overlay.d/custom.rc custom.rc",
            "add 0755 overlay.d/sbin/superpower.apk superpower.apk",
        ]),
        command(&["repack", "boot.img"]),
    ]);

    commands
}

fn expected_config(sha1: &str) -> String {
    format!(
        "KEEPVERITY=true\n\
         KEEPFORCEENCRYPT=true\n\
         RECOVERYMODE=false\n\
         PREINITDEVICE=metadata\n\
         SHA1={sha1}\n"
    )
}

#[test]
fn patch_stock_image() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"stock ramdisk");
    let work_dir = WorkDir::create(&temp_dir.path().join("work"), &[]).unwrap();
    let tool = FakeMagiskBoot::default();
    let sha1 = sha1_hex(&boot_image(b"stock ramdisk"));

    let outcome = pipeline::patch_boot_image(&tool, &options, &work_dir, &cancel_signal).unwrap();
    let image = assert_matches!(
        outcome,
        PatchOutcome::Patched {
            image,
            state: RamdiskState::Stock { sha1: s },
        } if s.to_string() == sha1 => image
    );

    assert_eq!(image, work_dir.join(NEW_BOOT_IMAGE));
    assert_eq!(tool.commands(), expected_commands(false));

    // The digest covers the whole input image, not the unpacked ramdisk.
    assert_eq!(sha1, sha1_hex(&fs::read(&options.boot_image).unwrap()));
    let ramdisk = fs::read(work_dir.join(pipeline::RAMDISK_ORIG)).unwrap();
    assert_eq!(ramdisk, b"stock ramdisk");
    assert_ne!(sha1, sha1_hex(&ramdisk));

    let config = fs::read_to_string(work_dir.join(pipeline::CONFIG)).unwrap();
    assert_eq!(config, expected_config(&sha1));

    let expected_env = [
        ("KEEPVERITY", "true"),
        ("KEEPFORCEENCRYPT", "true"),
        ("RECOVERYMODE", "false"),
        ("PREINITDEVICE", "metadata"),
        ("SHA1", sha1.as_str()),
    ]
    .map(|(k, v)| (k.to_owned(), v.to_owned()));

    let calls = tool.calls.borrow();
    for (i, call) in calls.iter().enumerate() {
        if i == 5 {
            assert_eq!(call.env, expected_env);
        } else {
            assert!(call.env.is_empty(), "Unexpected env for {:?}", call.args);
        }
    }

    assert_eq!(
        fs::read(&image).unwrap(),
        [
            IMAGE_HEADER,
            PATCHED_TAG,
            config.as_bytes(),
            BACKUP_SEPARATOR,
            b"stock ramdisk".as_slice(),
        ]
        .concat(),
    );
}

#[test]
fn repatching_is_idempotent() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, mut options) = setup(b"stock ramdisk");
    let sha1 = sha1_hex(&boot_image(b"stock ramdisk"));

    let first_dir = WorkDir::create(&temp_dir.path().join("first"), &[]).unwrap();
    let first_tool = FakeMagiskBoot::default();
    pipeline::patch_boot_image(&first_tool, &options, &first_dir, &cancel_signal).unwrap();

    let first_image = fs::read(first_dir.join(NEW_BOOT_IMAGE)).unwrap();
    let first_config = fs::read(first_dir.join(pipeline::CONFIG)).unwrap();

    // Patch the output of the first run.
    options.boot_image = first_dir.join(NEW_BOOT_IMAGE);

    let second_dir = WorkDir::create(&temp_dir.path().join("second"), &[]).unwrap();
    let second_tool = FakeMagiskBoot::default();
    let outcome =
        pipeline::patch_boot_image(&second_tool, &options, &second_dir, &cancel_signal).unwrap();

    assert_matches!(
        outcome,
        PatchOutcome::Patched {
            state: RamdiskState::MagiskPatched { sha1: s },
            ..
        } if s.to_string() == sha1
    );
    assert_eq!(second_tool.commands(), expected_commands(true));

    let config_orig = fs::read_to_string(second_dir.join(classify::ORIG_CONFIG)).unwrap();
    assert_eq!(config_orig, expected_config(&sha1));

    assert_eq!(fs::read(second_dir.join(pipeline::CONFIG)).unwrap(), first_config);
    assert_eq!(fs::read(second_dir.join(NEW_BOOT_IMAGE)).unwrap(), first_image);
    assert_eq!(
        fs::read(second_dir.join(pipeline::RAMDISK_ORIG)).unwrap(),
        b"stock ramdisk",
    );
}

#[test]
fn unsupported_image_stops_cleanly() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"other patcher");
    let work_dir = WorkDir::create(&temp_dir.path().join("work"), &[]).unwrap();
    let tool = FakeMagiskBoot::default();

    let outcome = pipeline::patch_boot_image(&tool, &options, &work_dir, &cancel_signal).unwrap();

    assert_eq!(outcome, PatchOutcome::Unsupported);
    assert_eq!(tool.commands(), expected_commands(false)[..2]);
    assert!(!work_dir.join(NEW_BOOT_IMAGE).exists());
}

#[test]
fn tool_failure_aborts() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"stock ramdisk");
    let work_dir = WorkDir::create(&temp_dir.path().join("work"), &[]).unwrap();
    let tool = FakeMagiskBoot::failing("repack");

    assert_matches!(
        pipeline::patch_boot_image(&tool, &options, &work_dir, &cancel_signal),
        Err(pipeline::Error::MagiskBoot(magiskboot::Error::ExternalTool { args, code: 1 }))
            if args == "repack boot.img"
    );

    // Intermediate files are kept for inspection.
    assert!(work_dir.join(pipeline::CONFIG).is_file());
    assert!(work_dir.join(pipeline::RAMDISK_ORIG).is_file());
    assert!(!work_dir.join(NEW_BOOT_IMAGE).exists());
}

#[test]
fn early_tool_failure_aborts() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"stock ramdisk");
    let work_dir = WorkDir::create(&temp_dir.path().join("work"), &[]).unwrap();
    let tool = FakeMagiskBoot::failing("unpack");

    assert_matches!(
        pipeline::patch_boot_image(&tool, &options, &work_dir, &cancel_signal),
        Err(pipeline::Error::MagiskBoot(magiskboot::Error::ExternalTool { code: 1, .. }))
    );
    assert_eq!(tool.commands(), expected_commands(false)[..1]);
}

#[test]
fn backup_record_without_sha1() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"magisk\nKEEPVERITY=true\n--\nstock ramdisk");
    let work_dir = WorkDir::create(&temp_dir.path().join("work"), &[]).unwrap();
    let tool = FakeMagiskBoot::default();

    assert_matches!(
        pipeline::patch_boot_image(&tool, &options, &work_dir, &cancel_signal),
        Err(pipeline::Error::Classify(classify::Error::Config(
            _,
            magisk::Error::MissingKey("SHA1"),
        )))
    );
}

#[test]
fn missing_apk_entry() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, mut options) = setup(b"stock ramdisk");
    let work_dir = WorkDir::create(&temp_dir.path().join("work"), &[]).unwrap();
    let tool = FakeMagiskBoot::default();
    options.abi = Abi::Arm64V8a;

    assert_matches!(
        pipeline::patch_boot_image(&tool, &options, &work_dir, &cancel_signal),
        Err(pipeline::Error::Apk(_))
    );
    assert!(tool.commands().is_empty());
}

const DISK_BLOCKS: u64 = 400;
const BOOT_BLOCKS: Range<u64> = 100..200;
const FIRMWARE: &[u8] = b"firmware verified_boot_android end";

fn block_range(blocks: &Range<u64>) -> Range<usize> {
    (blocks.start * BLOCK_SIZE) as usize..(blocks.end * BLOCK_SIZE) as usize
}

/// Create an emulator installation whose `boot_a` partition holds a boot image
/// with the given ramdisk. Every other byte outside the partition table is
/// 0xee.
fn create_install(root: &Path, ramdisk: &[u8]) -> InstallPaths {
    let paths = InstallPaths::new(Channel::Stable, Some(root));
    fs::create_dir_all(paths.disk_image().parent().unwrap()).unwrap();

    let mut data = vec![0xeeu8; (DISK_BLOCKS * BLOCK_SIZE) as usize];
    let boot = &mut data[block_range(&BOOT_BLOCKS)];
    boot.fill(0);
    let image = boot_image(ramdisk);
    boot[..image.len()].copy_from_slice(&image);

    let table = PartitionTable {
        disk_guid: Guid([0x42; 16]),
        first_usable_block: 34,
        last_usable_block: DISK_BLOCKS - 34,
        partitions: vec![PartitionEntry {
            name: "boot_a".to_owned(),
            type_guid: Guid([0xaa; 16]),
            unique_guid: Guid([0xbb; 16]),
            first_block: BOOT_BLOCKS.start,
            last_block: BOOT_BLOCKS.end - 1,
            attributes: PartitionAttributes::empty(),
        }],
    };
    let mut writer = Cursor::new(data);
    table.to_writer(&mut writer).unwrap();

    fs::write(paths.disk_image(), writer.into_inner()).unwrap();
    fs::write(paths.bios(), FIRMWARE).unwrap();

    paths
}

fn root_cli(paths: &InstallPaths, options: &PatchOptions, work_dir: &Path) -> RootCli {
    let args: [(&str, &Path); 6] = [
        ("--magisk", options.magisk_apk.as_path()),
        ("--magiskboot", Path::new("magiskboot")),
        ("--custom-rc", options.custom_rc.as_path()),
        ("--superpower-apk", options.superpower_apk.as_path()),
        ("--work-dir", work_dir),
        ("--install-dir", paths.root.as_path()),
    ];
    let mut argv = vec![OsString::from("root")];
    for (flag, value) in args {
        argv.push(flag.into());
        argv.push(value.into());
    }

    RootCli::try_parse_from(argv).unwrap()
}

#[test]
fn root_and_restore() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"stock ramdisk");
    let paths = create_install(&temp_dir.path().join("install"), b"stock ramdisk");
    let work_dir = temp_dir.path().join("work");
    let cli = root_cli(&paths, &options, &work_dir);
    let stock_disk = fs::read(paths.disk_image()).unwrap();
    let boot_range = block_range(&BOOT_BLOCKS);

    let tool = FakeMagiskBoot::default();
    root::root_with_tool(&cli, &tool, &cancel_signal).unwrap();

    assert_eq!(tool.commands(), expected_commands(false));
    assert!(!work_dir.exists());
    assert_eq!(fs::read(paths.bios_backup()).unwrap(), FIRMWARE);
    assert_eq!(
        fs::read(paths.bios()).unwrap(),
        b"firmware          boot_android end",
    );

    let stock_boot = fs::read(paths.boot_backup()).unwrap();
    assert_eq!(stock_boot, stock_disk[boot_range.clone()]);

    let patched = [
        IMAGE_HEADER,
        PATCHED_TAG,
        expected_config(&sha1_hex(&stock_boot)).as_bytes(),
        BACKUP_SEPARATOR,
        b"stock ramdisk".as_slice(),
    ]
    .concat();

    let rooted_disk = fs::read(paths.disk_image()).unwrap();
    let boot_a = &rooted_disk[boot_range.clone()];
    assert!(boot_a.starts_with(&patched));
    assert_eq!(boot_a[patched.len()..], stock_boot[patched.len()..]);
    assert_eq!(rooted_disk[..boot_range.start], stock_disk[..boot_range.start]);
    assert_eq!(rooted_disk[boot_range.end..], stock_disk[boot_range.end..]);

    // Rooting again patches the existing stock backup, not the partition.
    let tool = FakeMagiskBoot::default();
    root::root_with_tool(&cli, &tool, &cancel_signal).unwrap();

    assert_eq!(tool.commands(), expected_commands(false));
    assert_eq!(fs::read(paths.boot_backup()).unwrap(), stock_boot);
    assert_eq!(fs::read(paths.disk_image()).unwrap(), rooted_disk);

    let restore_cli = RestoreCli::try_parse_from([
        OsString::from("restore"),
        "--install-dir".into(),
        paths.root.clone().into(),
    ])
    .unwrap();
    root::restore_main(&restore_cli, &cancel_signal).unwrap();

    assert_eq!(fs::read(paths.disk_image()).unwrap(), stock_disk);
    assert_eq!(fs::read(paths.bios()).unwrap(), FIRMWARE);
}

#[test]
fn root_leaves_unsupported_image_alone() {
    let cancel_signal = AtomicBool::new(false);
    let (temp_dir, options) = setup(b"stock ramdisk");
    let paths = create_install(&temp_dir.path().join("install"), b"other patcher");
    let cli = root_cli(&paths, &options, &temp_dir.path().join("work"));
    let stock_disk = fs::read(paths.disk_image()).unwrap();

    let tool = FakeMagiskBoot::default();
    root::root_with_tool(&cli, &tool, &cancel_signal).unwrap();

    assert_eq!(tool.commands(), expected_commands(false)[..2]);
    assert_eq!(fs::read(paths.disk_image()).unwrap(), stock_disk);
    assert_eq!(
        fs::read(paths.boot_backup()).unwrap(),
        stock_disk[block_range(&BOOT_BLOCKS)],
    );
}
