//! Simulated host for integration tests
//!
//! `FakeHost` implements `ToolRunner` by interpreting each typed command
//! against in-memory state: a partition table, LUKS key slots (keyed by the
//! contents of the key file passed in), the active mapping, and the mount
//! table. Mounts act on real directories under a tempdir so descriptor and
//! artifact writes land somewhere inspectable.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use easeinstall::config::InstallerConfig;
use easeinstall::devices::partition_path;
use easeinstall::hardware::{HardwareInfo, HardwareSecurity};
use easeinstall::retry::RetryPolicy;
use easeinstall::tool_args::ToolArgs;
use easeinstall::tool_runner::{ToolOutput, ToolRunner};
use easeinstall::types::FirmwareMode;
use tempfile::TempDir;

pub const DISK: &str = "/dev/vda";
pub const LUKS_UUID: &str = "4f1c2d3e-5a6b-4c7d-8e9f-0a1b2c3d4e5f";
pub const RECOVERY_KEY: &str = "cbdefghi-jklnrtuv-cbdefghi-jklnrtuv-cbdefghi-jklnrtuv-cbdefghi-jklnrtuv";
pub const TPM_SLOT: &str = "<tpm2>";
pub const PASSWORD: &str = "Str0ng!pass";

/// How `systemd-cryptenroll --recovery-key` behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutput {
    /// Prints the key in the usual layout
    Standard,
    /// Enrolls a key but prints nothing parseable
    Garbled,
    /// Prints a well-formed key that is not the enrolled one
    Mistranscribed,
}

pub struct FakeHost {
    pub fail_tpm: bool,
    pub recovery_output: RecoveryOutput,
    pub fail_materializer: bool,
    pub fail_openssl: bool,
    pub fail_generate_config: bool,
    /// Number of `cryptsetup close` calls that report "busy"
    pub busy_closes: Cell<u32>,

    pub log: RefCell<Vec<String>>,
    pub partitions: RefCell<BTreeSet<u32>>,
    pub partprobed: Cell<bool>,
    pub formatted: RefCell<Vec<String>>,
    /// Unlock material per slot, in enrollment order
    pub key_slots: RefCell<Vec<String>>,
    /// Contents of the key file used at luksFormat
    pub bootstrap_key: RefCell<Option<String>>,
    pub mapping_open: Cell<bool>,
    /// Mountpoint → source
    pub mounts: RefCell<BTreeMap<PathBuf, PathBuf>>,
    pub materializer_runs: Cell<u32>,
}

impl Default for FakeHost {
    fn default() -> Self {
        Self {
            fail_tpm: false,
            recovery_output: RecoveryOutput::Standard,
            fail_materializer: false,
            fail_openssl: false,
            fail_generate_config: false,
            busy_closes: Cell::new(0),
            log: RefCell::new(Vec::new()),
            partitions: RefCell::new(BTreeSet::new()),
            partprobed: Cell::new(false),
            formatted: RefCell::new(Vec::new()),
            key_slots: RefCell::new(Vec::new()),
            bootstrap_key: RefCell::new(None),
            mapping_open: Cell::new(false),
            mounts: RefCell::new(BTreeMap::new()),
            materializer_runs: Cell::new(0),
        }
    }
}

fn read_key(path: &str) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

fn ok(stdout: impl Into<String>) -> ToolOutput {
    ToolOutput::ok(stdout)
}

fn fail(stderr: &str) -> ToolOutput {
    ToolOutput::failed(1, stderr)
}

fn flag_value<'a>(args: &'a [String], prefix: &str) -> Option<&'a str> {
    args.iter().find_map(|a| a.strip_prefix(prefix))
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `key` opens one of the container's key slots.
    pub fn unlocks(&self, key: &str) -> bool {
        self.key_slots.borrow().iter().any(|k| k == key)
    }

    pub fn count(&self, needle: &str) -> usize {
        self.log.borrow().iter().filter(|c| c.contains(needle)).count()
    }

    pub fn ran(&self, needle: &str) -> bool {
        self.count(needle) > 0
    }

    fn mapper_node(&self) -> PathBuf {
        PathBuf::from("/dev/mapper/cryptroot")
    }

    fn cryptsetup(&self, args: &[String]) -> ToolOutput {
        match args.first().map(String::as_str) {
            Some("luksFormat") => {
                let key = flag_after(args, "--key-file").map(read_key).unwrap_or_default();
                *self.bootstrap_key.borrow_mut() = Some(key.clone());
                *self.key_slots.borrow_mut() = vec![key];
                ok("")
            }
            Some("luksUUID") => ok(format!("{}\n", LUKS_UUID)),
            Some("open") => {
                let key = flag_after(args, "--key-file").map(read_key).unwrap_or_default();
                if self.mapping_open.get() {
                    fail("Device cryptroot already exists.")
                } else if self.unlocks(&key) {
                    self.mapping_open.set(true);
                    ok("")
                } else {
                    ToolOutput::failed(2, "No key available with this passphrase.")
                }
            }
            Some("status") => {
                if self.mapping_open.get() {
                    ok("/dev/mapper/cryptroot is active.")
                } else {
                    ToolOutput::failed(4, "/dev/mapper/cryptroot is inactive.")
                }
            }
            Some("close") => {
                let node = self.mapper_node();
                let in_use = self.mounts.borrow().values().any(|s| *s == node);
                if in_use {
                    return ToolOutput::failed(5, "Device cryptroot is still in use.");
                }
                if self.busy_closes.get() > 0 {
                    self.busy_closes.set(self.busy_closes.get() - 1);
                    return ToolOutput::failed(5, "Device cryptroot is still in use.");
                }
                self.mapping_open.set(false);
                ok("")
            }
            Some("luksRemoveKey") => {
                let key = args.last().map(|p| read_key(p)).unwrap_or_default();
                let mut slots = self.key_slots.borrow_mut();
                match slots.iter().position(|k| *k == key) {
                    Some(i) => {
                        slots.remove(i);
                        ok("")
                    }
                    None => ToolOutput::failed(2, "No key available with this passphrase."),
                }
            }
            _ => fail("unsupported cryptsetup call"),
        }
    }

    fn cryptenroll(&self, args: &[String]) -> ToolOutput {
        let unlock = flag_value(args, "--unlock-key-file=").map(read_key).unwrap_or_default();
        if !self.unlocks(&unlock) {
            return fail("Failed to unlock disk.");
        }

        if args.iter().any(|a| a.starts_with("--tpm2-device")) {
            if self.fail_tpm {
                return fail("Failed to enroll TPM2 key: No such device");
            }
            self.key_slots.borrow_mut().push(TPM_SLOT.to_string());
            return ok("New TPM2 token enrolled as key slot 1.");
        }

        if args.iter().any(|a| a == "--recovery-key") {
            self.key_slots.borrow_mut().push(RECOVERY_KEY.to_string());
            // Prose goes to stderr, the key alone to stdout.
            let prose = "A secret recovery key has been generated for this volume:\n\n\
                         Please save this secret recovery key at a secure location. It may be used to\n\
                         regain access to the volume if the other configured access credentials have\n\
                         been lost or forgotten.\n\
                         New recovery key enrolled as key slot 2.\n";
            let stdout = match self.recovery_output {
                RecoveryOutput::Standard => format!("    \u{1f510} {}\n", RECOVERY_KEY),
                RecoveryOutput::Garbled => "(not shown: output is not a terminal)\n".to_string(),
                RecoveryOutput::Mistranscribed => format!("    {}\n", RECOVERY_KEY.replace('c', "d")),
            };
            return ToolOutput {
                stdout,
                stderr: prose.to_string(),
                exit_code: Some(0),
                success: true,
            };
        }

        fail("unsupported systemd-cryptenroll call")
    }

    fn mount(&self, args: &[String]) -> ToolOutput {
        let n = args.len();
        if n < 2 {
            return fail("mount: bad usage");
        }
        let source = PathBuf::from(&args[n - 2]);
        let target = PathBuf::from(&args[n - 1]);

        if source == self.mapper_node() && !self.mapping_open.get() {
            return ToolOutput::failed(32, "mount: special device does not exist.");
        }
        if self.mounts.borrow().contains_key(&target) {
            return ToolOutput::failed(32, "mount: already mounted.");
        }
        if !target.is_dir() {
            return ToolOutput::failed(32, "mount: mount point does not exist.");
        }
        self.mounts.borrow_mut().insert(target, source);
        ok("")
    }

    fn umount(&self, args: &[String]) -> ToolOutput {
        let Some(target) = args.last().map(PathBuf::from) else {
            return fail("umount: bad usage");
        };
        let mut mounts = self.mounts.borrow_mut();
        if !mounts.contains_key(&target) {
            return ToolOutput::failed(32, "umount: not mounted.");
        }
        let busy = mounts.keys().any(|m| m != &target && m.starts_with(&target));
        if busy {
            return ToolOutput::failed(32, "umount: target is busy.");
        }
        mounts.remove(&target);
        ok("")
    }

    pub fn mounted(&self) -> Vec<PathBuf> {
        self.mounts.borrow().keys().cloned().collect()
    }
}

fn flag_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

impl ToolRunner for FakeHost {
    fn run(&self, tool: &dyn ToolArgs) -> anyhow::Result<ToolOutput> {
        let args = tool.to_cli_args();
        self.log.borrow_mut().push(tool.describe());

        let out = match tool.program() {
            "lsblk" => ok(
                r#"{"blockdevices":[{"name":"vda","type":"disk","size":"64G","model":"QEMU HARDDISK","tran":null,"fstype":null}]}"#,
            ),
            "openssl" => {
                if self.fail_openssl {
                    fail("openssl: unknown option")
                } else {
                    let input = flag_after(&args, "-in").map(read_key).unwrap_or_default();
                    ok(format!("$6$fakesalt${:x}\n", input.len() * 7919))
                }
            }
            "wipefs" => ok(""),
            "sgdisk" => {
                if args.iter().any(|a| a == "--zap-all") {
                    self.partitions.borrow_mut().clear();
                    self.partprobed.set(false);
                } else if let Some(spec) = flag_value(&args, "--new=") {
                    if let Some(num) = spec.split(':').next().and_then(|n| n.parse().ok()) {
                        self.partitions.borrow_mut().insert(num);
                    }
                }
                ok("The operation has completed successfully.")
            }
            "partprobe" => {
                self.partprobed.set(true);
                ok("")
            }
            "udevadm" => ok(""),
            p if p.starts_with("mkfs.") => {
                if let Some(dev) = args.last() {
                    self.formatted.borrow_mut().push(format!("{} {}", p, dev));
                }
                ok("")
            }
            "btrfs" => match args.last() {
                Some(path) if Path::new(path).parent().is_some_and(Path::is_dir) => {
                    fs::create_dir_all(path)?;
                    ok(format!("Create subvolume '{}'", path))
                }
                _ => fail("ERROR: cannot access parent directory"),
            },
            "mount" => self.mount(&args),
            "umount" => self.umount(&args),
            "mountpoint" => match args.last() {
                Some(t) if self.mounts.borrow().contains_key(Path::new(t)) => ok(""),
                _ => ToolOutput::failed(32, ""),
            },
            "cryptsetup" => self.cryptsetup(&args),
            "systemd-cryptenroll" => self.cryptenroll(&args),
            "fuser" => ok(""),
            "nixos-generate-config" if self.fail_generate_config => {
                fail("nixos-generate-config: cannot determine root filesystem")
            }
            "nixos-generate-config" => {
                let root = flag_after(&args, "--root").unwrap_or("/");
                let dir = Path::new(root).join("etc/nixos");
                fs::create_dir_all(&dir)?;
                fs::write(dir.join("hardware-configuration.nix"), "{ ... }: { }\n")?;
                ok(format!("writing {}/hardware-configuration.nix...", dir.display()))
            }
            "nixos-install" => {
                self.materializer_runs.set(self.materializer_runs.get() + 1);
                if self.fail_materializer {
                    ToolOutput {
                        stdout: "building the flake in path:/mnt/etc/nixos...\n".to_string(),
                        stderr: "error: builder for '/nix/store/...-system.drv' failed with exit code 1"
                            .to_string(),
                        exit_code: Some(1),
                        success: false,
                    }
                } else {
                    ok("building the system configuration...\ninstallation finished!\n")
                }
            }
            other => fail(&format!("{}: command not simulated", other)),
        };
        Ok(out)
    }

    fn is_block_device(&self, path: &Path) -> bool {
        let disk = Path::new(DISK);
        if path == disk {
            return true;
        }
        self.partprobed.get()
            && self
                .partitions
                .borrow()
                .iter()
                .any(|n| partition_path(disk, *n) == path)
    }
}

/// Scratch environment: mount root, live log dir, secrets dir, template.
pub struct Sandbox {
    pub dir: TempDir,
    pub config: InstallerConfig,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = dir.path();

        let template = base.join("template");
        fs::create_dir_all(template.join("modules")).expect("template");
        fs::write(template.join("flake.nix"), "{ outputs = { ... }: { }; }\n").expect("flake");
        fs::write(template.join("modules/base.nix"), "{ ... }: { }\n").expect("module");
        fs::create_dir_all(base.join("secrets")).expect("secrets");
        fs::create_dir_all(base.join("live")).expect("live");

        let config = InstallerConfig {
            mount_root: base.join("mnt"),
            transcript_path: base.join("live/easyos-install.log"),
            secrets_dir: base.join("secrets"),
            template_dir: template,
            settle_retry: RetryPolicy::new(3, 0),
            close_retry: RetryPolicy::new(5, 0),
            connectivity_retry: RetryPolicy::new(1, 0),
            ..InstallerConfig::default()
        };

        Self { dir, config }
    }

    pub fn root(&self) -> &Path {
        &self.config.mount_root
    }

    pub fn in_target(&self, rel: &str) -> PathBuf {
        self.config.mount_root.join(rel)
    }

    /// Secrets directory must be empty after every run.
    pub fn leftover_secrets(&self) -> usize {
        fs::read_dir(&self.config.secrets_dir)
            .map(|d| d.count())
            .unwrap_or(0)
    }
}

pub fn hardware(firmware: FirmwareMode, tpm: bool) -> HardwareInfo {
    HardwareInfo {
        firmware,
        security: HardwareSecurity {
            tpm_device: tpm.then(|| PathBuf::from("/dev/tpmrm0")),
            secure_boot: tpm,
        },
    }
}

/// Answers for a full session with a preset device. Encrypted runs also
/// confirm the recovery key was written down.
pub fn answers(encrypt: bool) -> Vec<String> {
    vec![
        "easeos".to_string(),
        "alice".to_string(),
        PASSWORD.to_string(),
        PASSWORD.to_string(),
        String::new(),
        if encrypt { "y" } else { "n" }.to_string(),
        "yes".to_string(),
        "ERASE".to_string(),
    ]
    .into_iter()
    .chain(encrypt.then(|| "yes".to_string()))
    .collect()
}
