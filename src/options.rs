use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::{Error, Result};

/// Tmpfs budget for the sandbox root when `--storage` is not given.
pub const DEFAULT_STORAGE_BYTES: u64 = 512 * 1024 * 1024;

/// Baseline environment of every sandbox, in fixed order.
const BASE_ENVIRON: [(&str, &str); 4] = [
    ("PATH", "/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin"),
    ("HOME", "/root"),
    ("TERM", "xterm"),
    ("LANG", "C.UTF-8"),
];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum FsMode {
    /// Private tmpfs root populated with `/proc`, `/dev`, `/tmp`, `/etc`.
    #[default]
    Tmpfs,
    /// The host root, re-bound under a private mount namespace.
    Host,
    /// Overlay root with the given directory as the read-only lower layer.
    Rootfs(PathBuf),
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetMode {
    /// Fresh network namespace with nothing but loopback.
    #[default]
    None,
    /// Share the host network namespace.
    Host,
    /// Veth pair bridged and NAT-ed to the default egress interface.
    Bridge,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum UserNsMode {
    #[default]
    Isolated,
    Host,
}

#[derive(Clone, Debug)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

/// The full sandbox plan. Populated through the builder methods, checked
/// by [`SandboxOptions::validate`], consumed by `spawn`.
#[derive(Clone, Debug)]
pub struct SandboxOptions {
    pub(crate) fs: FsMode,
    pub(crate) read_only: bool,
    pub(crate) storage_bytes: u64,
    pub(crate) binds: Vec<BindMount>,
    pub(crate) net: NetMode,
    pub(crate) dns: Vec<Ipv4Addr>,
    pub(crate) hostname: String,
    pub(crate) user_ns: UserNsMode,
    pub(crate) cap_add: Vec<String>,
    pub(crate) cap_drop: Vec<String>,
    pub(crate) cpus: f64,
    pub(crate) memory_bytes: u64,
    pub(crate) syscall_allow: Vec<String>,
    pub(crate) syscall_deny: Vec<String>,
    pub(crate) command: Vec<String>,
    pub(crate) environ: Vec<(String, String)>,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            fs: FsMode::default(),
            read_only: false,
            storage_bytes: DEFAULT_STORAGE_BYTES,
            binds: Vec::new(),
            net: NetMode::default(),
            dns: Vec::new(),
            hostname: String::new(),
            user_ns: UserNsMode::default(),
            cap_add: Vec::new(),
            cap_drop: Vec::new(),
            cpus: 0.0,
            memory_bytes: 0,
            syscall_allow: Vec::new(),
            syscall_deny: Vec::new(),
            command: Vec::new(),
            environ: Vec::new(),
        }
    }
}

impl SandboxOptions {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn fs(mut self, fs: FsMode) -> Self {
        self.fs = fs;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn storage_bytes(mut self, storage_bytes: u64) -> Self {
        self.storage_bytes = storage_bytes;
        self
    }

    pub fn mount_ro(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.binds.push(BindMount {
            source: source.into(),
            target: target.into(),
            read_only: true,
        });
        self
    }

    pub fn mount_rw(mut self, source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.binds.push(BindMount {
            source: source.into(),
            target: target.into(),
            read_only: false,
        });
        self
    }

    pub fn net(mut self, net: NetMode) -> Self {
        self.net = net;
        self
    }

    pub fn dns(mut self, server: Ipv4Addr) -> Self {
        self.dns.push(server);
        self
    }

    pub fn hostname<T: ToString>(mut self, hostname: T) -> Self {
        self.hostname = hostname.to_string();
        self
    }

    pub fn user_ns(mut self, user_ns: UserNsMode) -> Self {
        self.user_ns = user_ns;
        self
    }

    pub fn cap_add<T: ToString>(mut self, name: T) -> Self {
        self.cap_add.push(name.to_string());
        self
    }

    pub fn cap_drop<T: ToString>(mut self, name: T) -> Self {
        self.cap_drop.push(name.to_string());
        self
    }

    pub fn cpus(mut self, cpus: f64) -> Self {
        self.cpus = cpus;
        self
    }

    pub fn memory_bytes(mut self, memory_bytes: u64) -> Self {
        self.memory_bytes = memory_bytes;
        self
    }

    pub fn allow_syscall<T: ToString>(mut self, name: T) -> Self {
        self.syscall_allow.push(name.to_string());
        self
    }

    pub fn deny_syscall<T: ToString>(mut self, name: T) -> Self {
        self.syscall_deny.push(name.to_string());
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    pub fn env<K: ToString, V: ToString>(mut self, key: K, value: V) -> Self {
        self.environ.push((key.to_string(), value.to_string()));
        self
    }

    /// Checks the invariants the rest of the pipeline relies on.
    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(Error::InvalidOption(
                "no command to run; pass argv after --".into(),
            ));
        }
        if !self.cpus.is_finite() || self.cpus < 0.0 {
            return Err(Error::InvalidOption(
                "--cpus must be a non-negative number".into(),
            ));
        }
        for bind in &self.binds {
            if !bind.target.is_absolute() {
                return Err(Error::InvalidOption(format!(
                    "bind target {:?} is not absolute",
                    bind.target
                )));
            }
        }
        if matches!(self.fs, FsMode::Host) && !self.binds.is_empty() {
            return Err(Error::InvalidOption(
                "--fs host cannot be combined with --mount-ro/--mount-rw".into(),
            ));
        }
        if let FsMode::Rootfs(path) = &self.fs {
            if !path.is_dir() {
                return Err(Error::InvalidOption(format!(
                    "rootfs {path:?} is not a directory"
                )));
            }
        }
        for (key, _) in &self.environ {
            if key.is_empty() {
                return Err(Error::InvalidOption(
                    "--env requires KEY=VALUE with a non-empty KEY".into(),
                ));
            }
        }
        Ok(())
    }

    /// Builds the child environment: baseline keys first in fixed order,
    /// then the remaining user keys sorted. User values win.
    pub fn merged_environ(&self) -> Vec<String> {
        let user: BTreeMap<&str, &str> = self
            .environ
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        let mut merged = Vec::with_capacity(BASE_ENVIRON.len() + user.len());
        for (key, value) in BASE_ENVIRON {
            merged.push(format!("{key}={}", user.get(key).copied().unwrap_or(value)));
        }
        for (key, value) in user {
            if BASE_ENVIRON.iter().any(|(base, _)| *base == key) {
                continue;
            }
            merged.push(format!("{key}={value}"));
        }
        merged
    }
}
