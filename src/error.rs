use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds surfaced by the sandbox pipeline.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("{0} requires root privileges; re-run with sudo")]
    PrivilegeRequired(&'static str),

    #[error("cannot clone sandbox process: {0}")]
    CloneFailed(#[source] nix::Error),

    #[error("cannot map user ids: {0}")]
    IdMapFailed(String),

    #[error("cgroup setup failed: {0}")]
    CgroupFailed(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("netlink operation failed: {0}")]
    NetlinkFailed(String),

    #[error("firewall setup failed: {0}")]
    FirewallFailed(String),

    #[error("no free address left in {subnet}")]
    IpamExhausted { subnet: String },

    #[error("address database {db:?} is busy")]
    IpamBusy { db: PathBuf },

    #[error("address database failed: {0}")]
    IpamFailed(String),

    #[error("seccomp filter failed: {0}")]
    SeccompFailed(String),

    #[error("capability setup failed: {0}")]
    CapabilityFailed(String),

    #[error("sandbox setup failed: {0}")]
    ChildSetupFailed(String),

    #[error("cannot execute {program}: {source}")]
    ExecFailed {
        program: String,
        #[source]
        source: nix::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Os(#[from] nix::Error),
}
