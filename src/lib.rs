mod capabilities;
mod cgroup;
mod error;
mod ipam;
mod mounts;
mod netlink;
mod network;
mod options;
mod sandbox;
mod seccomp;
mod syscall;
mod userns;

pub use capabilities::{compute_set as compute_capability_set, resolve_capability};
pub use cgroup::Cgroup;
pub use error::{Error, Result};
pub use ipam::{Ipam, IpamLease, DEFAULT_DB_PATH};
pub use network::NetworkHandle;
pub use options::{
    BindMount, FsMode, NetMode, SandboxOptions, UserNsMode, DEFAULT_STORAGE_BYTES,
};
pub use sandbox::SandboxProcess;
pub use seccomp::compute_deny_list;
pub use syscall::Pid;

/// Opportunistically removes leftovers of launchers that died mid-run:
/// empty per-sandbox cgroups and host veths with no owning process.
pub fn collect_stale() {
    cgroup::collect_stale();
    network::collect_stale();
}
