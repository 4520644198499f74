use std::convert::Infallible;
use std::ffi::CString;
use std::net::Ipv4Addr;
use std::os::fd::{AsFd, FromRawFd, OwnedFd};
use std::panic::{catch_unwind, AssertUnwindSafe};

use caps::CapsHashSet;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitid, Id, WaitPidFlag, WaitStatus};
use nix::unistd::{execvpe, sethostname, Uid};
use tracing::{debug, warn};

use crate::cgroup::Cgroup;
use crate::ipam::{Ipam, IpamLease, DEFAULT_DB_PATH};
use crate::network::NetworkHandle;
use crate::options::{NetMode, SandboxOptions, UserNsMode};
use crate::syscall::{clone3, read_wake, write_wake, CloneArgs, CloneResult, Pid, Pipe};
use crate::{capabilities, mounts, network, seccomp, userns, Error, Result};

impl SandboxOptions {
    /// Spawns the sandboxed command. Returns once the child has been
    /// mapped, limited, plumbed and released; the child finishes its
    /// own jail and execs on its side of the handshake.
    pub fn spawn(self) -> Result<SandboxProcess> {
        self.validate()?;
        check_privileges(&self)?;
        // Resolve everything that can still fail with a clean error
        // while no resources exist yet.
        let deny_list = seccomp::compute_deny_list(&self.syscall_allow, &self.syscall_deny);
        let cap_set = capabilities::compute_set(&self.cap_add, &self.cap_drop)?;
        let environ = self.merged_environ();

        // The lease is taken before clone so the child side of the plan
        // already knows its address.
        let ipam = Ipam::new(DEFAULT_DB_PATH);
        let lease = match self.net {
            NetMode::Bridge => Some(ipam.acquire(network::subnet(), &[network::BRIDGE_ADDR])?),
            _ => None,
        };

        let pipe = match Pipe::new() {
            Ok(v) => v,
            Err(err) => {
                release_lease(&ipam, &lease);
                return Err(err);
            }
        };
        let mut raw_pidfd: nix::libc::c_int = -1;
        let mut clone_args = CloneArgs::default();
        clone_args.flag_newpid();
        clone_args.flag_newuts();
        clone_args.flag_newipc();
        clone_args.flag_newcgroup();
        clone_args.flag_newtime();
        clone_args.flag_newns();
        clone_args.flag_pidfd(&mut raw_pidfd);
        clone_args.exit_signal(Signal::SIGCHLD);
        if self.user_ns == UserNsMode::Isolated {
            clone_args.flag_newuser();
        }
        if self.net != NetMode::Host {
            clone_args.flag_newnet();
        }
        let cloned = match unsafe { clone3(&clone_args) } {
            Ok(v) => v,
            Err(errno) => {
                release_lease(&ipam, &lease);
                return Err(Error::CloneFailed(errno));
            }
        };
        match cloned {
            CloneResult::Child => {
                // Never returns: the child execs the command or dies.
                let addr = lease.as_ref().map(|v| v.addr);
                child_main(pipe.rx(), &self, addr, &deny_list, &cap_set, &environ)
            }
            CloneResult::Parent { child } => {
                let pidfd = unsafe { OwnedFd::from_raw_fd(raw_pidfd) };
                let tx = pipe.tx();
                let mut process = SandboxProcess {
                    id: format!("mbx-{child}"),
                    pid: child,
                    pidfd,
                    cgroup: None,
                    network: None,
                    ipam,
                };
                if let Err(err) = parent_setup(&self, &mut process, lease) {
                    // Never wake the child: EOF on the pipe makes it
                    // exit on its own.
                    drop(tx);
                    process.reap();
                    process.teardown();
                    return Err(err);
                }
                if let Err(err) = write_wake(&tx) {
                    process.reap();
                    process.teardown();
                    return Err(err);
                }
                debug!(id = process.id, pid = process.pid.as_raw(), "sandbox released");
                Ok(process)
            }
        }
    }
}

/// Host-privileged setup, strictly before the wake byte: the child must
/// never run unmapped, unlimited or unplumbed.
fn parent_setup(
    options: &SandboxOptions,
    process: &mut SandboxProcess,
    lease: Option<IpamLease>,
) -> Result<()> {
    // Park the lease in the handle up front so teardown releases it
    // whatever fails below.
    if let Some(lease) = lease {
        process.network = Some(NetworkHandle::new(process.pid, lease));
    }
    if options.user_ns == UserNsMode::Isolated {
        userns::map_user(process.pid)?;
    }
    match Cgroup::setup(process.pid, options.cpus, options.memory_bytes) {
        Ok(cgroup) => process.cgroup = Some(cgroup),
        Err(err) if options.cpus == 0.0 && options.memory_bytes == 0 => {
            // No limit was asked for; an unwritable hierarchy is not
            // worth failing the launch.
            warn!("cannot set up cgroup: {err}");
        }
        Err(err) => return Err(err),
    }
    if let Some(handle) = &process.network {
        network::host_setup(process.pid, handle)?;
        debug!(
            veth = handle.host_veth,
            addr = %handle.lease.addr,
            "host network ready"
        );
    }
    Ok(())
}

fn check_privileges(options: &SandboxOptions) -> Result<()> {
    if Uid::effective().is_root() {
        return Ok(());
    }
    if options.net == NetMode::Bridge {
        return Err(Error::PrivilegeRequired("bridged networking"));
    }
    if options.cpus > 0.0 || options.memory_bytes > 0 {
        return Err(Error::PrivilegeRequired("cgroup limits"));
    }
    // Rootless mount building leans on the in-namespace root that only
    // the isolated user namespace provides.
    if options.user_ns == UserNsMode::Host {
        return Err(Error::PrivilegeRequired(
            "filesystem isolation without a user namespace",
        ));
    }
    Ok(())
}

fn release_lease(ipam: &Ipam, lease: &Option<IpamLease>) {
    if let Some(lease) = lease {
        if let Err(err) = ipam.release(lease) {
            warn!("cannot release address {}: {err}", lease.addr);
        }
    }
}

fn child_main(
    rx: OwnedFd,
    options: &SandboxOptions,
    addr: Option<Ipv4Addr>,
    deny_list: &[String],
    cap_set: &CapsHashSet,
    environ: &[String],
) -> ! {
    // EOF means the parent gave up; its error is already on stderr.
    if read_wake(&rx).is_err() {
        unsafe { nix::libc::_exit(127) }
    }
    drop(rx);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        jail_and_exec(options, addr, deny_list, cap_set, environ)
    }));
    if let Ok(Err(err)) = outcome {
        eprintln!("microbox: {err}");
    }
    unsafe { nix::libc::_exit(127) }
}

/// The child's side of the pipeline, in its fixed order: identity,
/// filesystem, network, capabilities, seccomp last, then exec.
fn jail_and_exec(
    options: &SandboxOptions,
    addr: Option<Ipv4Addr>,
    deny_list: &[String],
    cap_set: &CapsHashSet,
    environ: &[String],
) -> Result<Infallible> {
    if !options.hostname.is_empty() {
        sethostname(&options.hostname)
            .map_err(|v| Error::ChildSetupFailed(format!("cannot set hostname: {v}")))?;
    }
    // Re-anchor the cgroup namespace at the group the parent attached
    // us to, so the mounted hierarchy shows this sandbox's own limits.
    let _ = nix::sched::unshare(nix::sched::CloneFlags::CLONE_NEWCGROUP);
    mounts::setup_rootfs(options)?;
    if let Some(addr) = addr {
        network::child_setup(addr)?;
    }
    capabilities::apply(cap_set)?;
    seccomp::install(deny_list)?;
    let program = options.command[0].clone();
    let filename = CString::new(program.as_bytes())
        .map_err(|v| Error::ChildSetupFailed(format!("bad argv: {v}")))?;
    let argv = options
        .command
        .iter()
        .map(|v| CString::new(v.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|v| Error::ChildSetupFailed(format!("bad argv: {v}")))?;
    let envp = environ
        .iter()
        .map(|v| CString::new(v.as_bytes()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|v| Error::ChildSetupFailed(format!("bad environment: {v}")))?;
    Ok(execvpe(&filename, &argv, &envp).map_err(|v| Error::ExecFailed {
        program,
        source: v,
    })?)
}

/// A running sandbox, owned by the parent.
pub struct SandboxProcess {
    id: String,
    pid: Pid,
    pidfd: OwnedFd,
    cgroup: Option<Cgroup>,
    network: Option<NetworkHandle>,
    ipam: Ipam,
}

impl SandboxProcess {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn network(&self) -> Option<&NetworkHandle> {
        self.network.as_ref()
    }

    pub fn cgroup(&self) -> Option<&Cgroup> {
        self.cgroup.as_ref()
    }

    /// Waits for the child and maps its termination to an exit code:
    /// the exit status as-is, or 128 + signum for a signalled child.
    /// Host-side resources are torn down before returning.
    pub fn wait(&mut self) -> Result<i32> {
        let status = waitid(Id::PIDFd(self.pidfd.as_fd()), WaitPidFlag::WEXITED)?;
        let code = match status {
            WaitStatus::Exited(_, code) => code,
            WaitStatus::Signaled(_, signal, _) => 128 + signal as i32,
            _ => 0,
        };
        self.teardown();
        Ok(code)
    }

    fn reap(&self) {
        let _ = waitid(Id::PIDFd(self.pidfd.as_fd()), WaitPidFlag::WEXITED);
    }

    /// Best-effort: every step warns and moves on, a half-torn sandbox
    /// must not leak the rest.
    fn teardown(&mut self) {
        if let Some(handle) = self.network.take() {
            if let Err(err) = network::teardown(&handle) {
                warn!("cannot delete {}: {err}", handle.host_veth);
            }
            if let Err(err) = self.ipam.release(&handle.lease) {
                warn!("cannot release address {}: {err}", handle.lease.addr);
            }
        }
        if let Some(cgroup) = self.cgroup.take() {
            if let Err(err) = cgroup.kill_and_remove() {
                warn!("cannot remove cgroup {}: {err}", cgroup.as_path().display());
            }
        }
    }
}
