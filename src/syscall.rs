use std::os::fd::{AsRawFd, OwnedFd};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::syscall;

use crate::{Error, Result};

pub type Pid = nix::unistd::Pid;

#[repr(C, align(8))]
#[derive(Debug, Default)]
pub(crate) struct CloneArgs {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
    pub exit_signal: u64,
    pub stack: u64,
    pub stack_size: u64,
    pub tls: u64,
    pub set_tid: u64,
    pub set_tid_size: u64,
    pub cgroup: u64,
}

impl CloneArgs {
    pub fn flag_newuser(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUSER as u64;
    }

    pub fn flag_newns(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNS as u64;
    }

    pub fn flag_newpid(&mut self) {
        self.flags |= nix::libc::CLONE_NEWPID as u64;
    }

    pub fn flag_newnet(&mut self) {
        self.flags |= nix::libc::CLONE_NEWNET as u64;
    }

    pub fn flag_newipc(&mut self) {
        self.flags |= nix::libc::CLONE_NEWIPC as u64;
    }

    pub fn flag_newuts(&mut self) {
        self.flags |= nix::libc::CLONE_NEWUTS as u64;
    }

    pub fn flag_newtime(&mut self) {
        self.flags |= nix::libc::CLONE_NEWTIME as u64;
    }

    pub fn flag_newcgroup(&mut self) {
        self.flags |= nix::libc::CLONE_NEWCGROUP as u64;
    }

    /// The kernel stores the new pidfd into the pointed-at location.
    pub fn flag_pidfd(&mut self, pidfd: &mut nix::libc::c_int) {
        self.flags |= nix::libc::CLONE_PIDFD as u64;
        self.pidfd = pidfd as *mut nix::libc::c_int as u64;
    }

    pub fn exit_signal(&mut self, signal: nix::sys::signal::Signal) {
        self.exit_signal = signal as u64;
    }
}

pub(crate) enum CloneResult {
    Child,
    Parent { child: Pid },
}

pub(crate) unsafe fn clone3(cl_args: &CloneArgs) -> std::result::Result<CloneResult, Errno> {
    let res = syscall(
        nix::libc::SYS_clone3,
        cl_args as *const CloneArgs,
        core::mem::size_of::<CloneArgs>(),
    );
    Errno::result(res).map(|v| match v {
        0 => CloneResult::Child,
        v => CloneResult::Parent {
            child: Pid::from_raw(v as nix::libc::pid_t),
        },
    })
}

/// One-shot wake gate between parent and child. Both ends are
/// close-on-exec so nothing leaks into the sandboxed program.
pub(crate) struct Pipe {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl Pipe {
    pub fn new() -> Result<Self> {
        let (rx, tx) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        Ok(Self { rx, tx })
    }

    pub fn rx(self) -> OwnedFd {
        self.rx
    }

    pub fn tx(self) -> OwnedFd {
        self.tx
    }
}

/// Releases the child. Called by the parent once host-side setup is done.
pub(crate) fn write_wake(tx: &OwnedFd) -> Result<()> {
    nix::unistd::write(tx, &[1])?;
    Ok(())
}

/// Blocks until the parent wakes the child. A closed pipe means the
/// parent failed before waking; the caller must not proceed.
pub(crate) fn read_wake(rx: &OwnedFd) -> Result<()> {
    let mut buf = [0u8; 1];
    match nix::unistd::read(rx.as_raw_fd(), &mut buf) {
        Ok(1) => Ok(()),
        Ok(_) => Err(Error::ChildSetupFailed(
            "sandbox setup aborted by parent".into(),
        )),
        Err(err) => Err(err.into()),
    }
}
