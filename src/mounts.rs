use std::fs::{self, create_dir, create_dir_all, remove_dir, remove_file, File};
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::chdir;

use crate::options::{BindMount, FsMode, SandboxOptions};
use crate::{Error, Result};

/// Staging mount point for the new root, torn down with the namespace.
const BOX_DIR: &str = "/box";

const DEFAULT_NAMESERVERS: [&str; 2] = ["8.8.8.8", "8.8.4.4"];

/// Kernel interfaces hidden from the sandbox. Directories get an empty
/// read-only tmpfs, files a read-only bind of /dev/null.
const PROC_MASKED: &[&str] = &[
    "/proc/asound",
    "/proc/acpi",
    "/proc/interrupts",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/proc/firmware",
    "/proc/devices/virtual/powercap",
];

/// Writable kernel knobs remounted read-only.
const PROC_RDONLY: &[&str] = &[
    "/proc/sys",
    "/proc/sysrq-trigger",
    "/proc/irq",
    "/proc/bus",
    "/proc/fs",
];

/// Device nodes bind-mounted from the host.
const DEV_ALLOWED: &[&str] = &["null", "zero", "random", "urandom", "tty"];

/// Host system directories mirrored read-only into a tmpfs root so the
/// sandbox has binaries and libraries to exec.
const SYSTEM_DIRS: &[&str] = &["/bin", "/sbin", "/usr", "/lib", "/lib64"];

/// Builds the private filesystem view. Runs in the child, inside its
/// fresh mount namespace, before capabilities and seccomp are applied.
pub(crate) fn setup_rootfs(options: &SandboxOptions) -> Result<()> {
    // Nothing below may propagate back to the host.
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_PRIVATE | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|v| Error::MountFailed(format!("cannot make / private: {v}")))?;
    match &options.fs {
        FsMode::Host => setup_host_root(options),
        FsMode::Tmpfs => setup_tmpfs_root(options),
        FsMode::Rootfs(lower) => setup_overlay_root(options, lower),
    }
}

/// Host root re-bound under a private namespace: same files, but mounts
/// and pivots stay local to the sandbox.
fn setup_host_root(options: &SandboxOptions) -> Result<()> {
    let root = Path::new(BOX_DIR);
    mount_box_tmpfs(root, options.storage_bytes)?;
    mount(
        Some("/"),
        root,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|v| Error::MountFailed(format!("cannot bind host root: {v}")))?;
    pivot_root(root)?;
    if options.read_only {
        remount_root_readonly()?;
    }
    Ok(())
}

fn setup_tmpfs_root(options: &SandboxOptions) -> Result<()> {
    let root = PathBuf::from(BOX_DIR);
    mount_box_tmpfs(&root, options.storage_bytes)?;
    mirror_system_dirs(&root)?;
    populate_root(&root, options)?;
    pivot_root(&root)?;
    if options.read_only {
        remount_root_readonly()?;
    }
    Ok(())
}

/// User rootfs as the lower layer, all writes caught by a tmpfs upper.
fn setup_overlay_root(options: &SandboxOptions, lower: &Path) -> Result<()> {
    let boxdir = Path::new(BOX_DIR);
    mount_box_tmpfs(boxdir, options.storage_bytes)?;
    let overlay = boxdir.join("overlay");
    let upper = overlay.join("upper");
    let work = overlay.join("work");
    let merged = overlay.join("merged");
    for dir in [&overlay, &upper, &work, &merged] {
        create_dir(dir)
            .map_err(|v| Error::MountFailed(format!("cannot create {}: {v}", dir.display())))?;
    }
    let lowerdir = lower
        .as_os_str()
        .to_str()
        .ok_or_else(|| Error::MountFailed(format!("invalid overlay lowerdir: {lower:?}")))?;
    let mount_data = format!(
        "lowerdir={lowerdir},upperdir={},workdir={}",
        upper.display(),
        work.display()
    );
    mount(
        Some("overlay"),
        &merged,
        Some("overlay"),
        MsFlags::empty(),
        Some(mount_data.as_str()),
    )
    .map_err(|v| Error::MountFailed(format!("cannot mount overlay: {v}")))?;
    populate_root(&merged, options)?;
    pivot_root(&merged)?;
    if options.read_only {
        remount_root_readonly()?;
    }
    Ok(())
}

fn populate_root(root: &Path, options: &SandboxOptions) -> Result<()> {
    setup_proc(root)?;
    setup_sys(root);
    setup_dev(root)?;
    setup_tmp(root)?;
    setup_etc(root, options)?;
    for bind in &options.binds {
        apply_bind(root, bind)?;
    }
    Ok(())
}

/// Read-only sysfs plus the cgroup2 hierarchy, so the sandbox can see
/// its own limits. Best-effort: with a host network namespace inside a
/// user namespace the kernel refuses to mount sysfs at all.
fn setup_sys(root: &Path) {
    let sysfs = setup_mount(
        root,
        "sysfs",
        "/sys",
        "sysfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC | MsFlags::MS_RDONLY,
        None,
    );
    if sysfs.is_ok() {
        let _ = setup_mount(
            root,
            "cgroup",
            "/sys/fs/cgroup",
            "cgroup2",
            MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC
                | MsFlags::MS_RELATIME
                | MsFlags::MS_RDONLY,
            None,
        );
    }
}

fn mirror_system_dirs(root: &Path) -> Result<()> {
    for dir in SYSTEM_DIRS {
        let source = Path::new(dir);
        let meta = match fs::symlink_metadata(source) {
            Ok(v) => v,
            Err(_) => continue,
        };
        let target = root.join(dir.trim_start_matches('/'));
        // On usr-merged systems /bin and friends are symlinks into /usr.
        if meta.file_type().is_symlink() {
            let dest = fs::read_link(source)
                .map_err(|v| Error::MountFailed(format!("cannot read link {dir}: {v}")))?;
            symlink(&dest, &target)
                .map_err(|v| Error::MountFailed(format!("cannot link {dir}: {v}")))?;
            continue;
        }
        create_dir(&target)
            .map_err(|v| Error::MountFailed(format!("cannot create {dir}: {v}")))?;
        mount(
            Some(source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|v| Error::MountFailed(format!("cannot bind {dir}: {v}")))?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|v| Error::MountFailed(format!("cannot remount {dir} read-only: {v}")))?;
    }
    Ok(())
}

fn mount_box_tmpfs(path: &Path, storage_bytes: u64) -> Result<()> {
    ignore_kind(create_dir(path), ErrorKind::AlreadyExists)
        .map_err(|v| Error::MountFailed(format!("cannot create {}: {v}", path.display())))?;
    let data = format!("mode=755,size={storage_bytes}");
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(data.as_str()),
    )
    .map_err(|v| Error::MountFailed(format!("cannot mount tmpfs on {}: {v}", path.display())))
}

/// Swaps the root for `new_root` and detaches the old one.
fn pivot_root(new_root: &Path) -> Result<()> {
    let failed = |v: nix::Error| Error::MountFailed(format!("cannot pivot root: {v}"));
    chdir(new_root).map_err(failed)?;
    ignore_kind(create_dir(".old_root"), ErrorKind::AlreadyExists)
        .map_err(|v| Error::MountFailed(format!("cannot create .old_root: {v}")))?;
    nix::unistd::pivot_root(".", ".old_root").map_err(failed)?;
    chdir("/").map_err(failed)?;
    umount2("/.old_root", MntFlags::MNT_DETACH).map_err(failed)?;
    remove_dir("/.old_root")
        .map_err(|v| Error::MountFailed(format!("cannot remove .old_root: {v}")))?;
    Ok(())
}

fn remount_root_readonly() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
        None::<&str>,
    )
    .map_err(|v| Error::MountFailed(format!("cannot remount / read-only: {v}")))
}

fn setup_proc(root: &Path) -> Result<()> {
    setup_mount(
        root,
        "proc",
        "/proc",
        "proc",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC | MsFlags::MS_NODEV,
        None,
    )?;
    for path in PROC_MASKED {
        let target = root.join(path.trim_start_matches('/'));
        let meta = match fs::metadata(&target) {
            Ok(v) => v,
            // Kernel- and config-dependent entries; skip the absent ones.
            Err(_) => continue,
        };
        if meta.is_dir() {
            mount(
                Some("tmpfs"),
                &target,
                Some("tmpfs"),
                MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                Some("mode=755"),
            )
            .map_err(|v| Error::MountFailed(format!("cannot mask {path}: {v}")))?;
        } else {
            mount(
                Some("/dev/null"),
                &target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .map_err(|v| Error::MountFailed(format!("cannot mask {path}: {v}")))?;
            let _ = mount(
                None::<&str>,
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            );
        }
    }
    for path in PROC_RDONLY {
        let target = root.join(path.trim_start_matches('/'));
        if fs::symlink_metadata(&target).is_err() {
            continue;
        }
        mount(
            Some(&target),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|v| Error::MountFailed(format!("cannot bind {path}: {v}")))?;
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOEXEC,
            None::<&str>,
        )
        .map_err(|v| Error::MountFailed(format!("cannot remount {path} read-only: {v}")))?;
    }
    Ok(())
}

fn setup_dev(root: &Path) -> Result<()> {
    setup_mount(
        root,
        "tmpfs",
        "/dev",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_STRICTATIME,
        Some("mode=755,size=65536k"),
    )?;
    setup_mount(
        root,
        "devpts",
        "/dev/pts",
        "devpts",
        MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
        Some("newinstance,ptmxmode=0666,mode=0620"),
    )?;
    setup_mount(
        root,
        "tmpfs",
        "/dev/shm",
        "tmpfs",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        Some("mode=1777,size=65536k"),
    )?;
    // mqueue needs CAP_SYS_ADMIN over the ipc namespace; tolerate denial.
    let _ = setup_mount(
        root,
        "mqueue",
        "/dev/mqueue",
        "mqueue",
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
        None,
    );
    let dev = root.join("dev");
    let links = [
        ("pts/ptmx", "ptmx"),
        ("/proc/self/fd", "fd"),
        ("/proc/self/fd/0", "stdin"),
        ("/proc/self/fd/1", "stdout"),
        ("/proc/self/fd/2", "stderr"),
        ("/proc/kcore", "core"),
    ];
    for (source, name) in links {
        symlink(source, dev.join(name))
            .map_err(|v| Error::MountFailed(format!("cannot link /dev/{name}: {v}")))?;
    }
    for name in DEV_ALLOWED {
        let source = Path::new("/dev").join(name);
        let target = dev.join(name);
        File::create(&target)
            .map_err(|v| Error::MountFailed(format!("cannot create /dev/{name}: {v}")))?;
        mount(
            Some(&source),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|v| Error::MountFailed(format!("cannot bind /dev/{name}: {v}")))?;
    }
    Ok(())
}

fn setup_tmp(root: &Path) -> Result<()> {
    let tmp = root.join("tmp");
    ignore_kind(create_dir(&tmp), ErrorKind::AlreadyExists)
        .map_err(|v| Error::MountFailed(format!("cannot create /tmp: {v}")))?;
    fs::set_permissions(&tmp, fs::Permissions::from_mode(0o1777))
        .map_err(|v| Error::MountFailed(format!("cannot chmod /tmp: {v}")))?;
    Ok(())
}

fn setup_etc(root: &Path, options: &SandboxOptions) -> Result<()> {
    let etc = root.join("etc");
    ignore_kind(create_dir(&etc), ErrorKind::AlreadyExists)
        .map_err(|v| Error::MountFailed(format!("cannot create /etc: {v}")))?;
    // A dangling or host-pointing symlink must not receive our config.
    let resolv = etc.join("resolv.conf");
    if let Ok(meta) = fs::symlink_metadata(&resolv) {
        if meta.file_type().is_symlink() {
            remove_file(&resolv)
                .map_err(|v| Error::MountFailed(format!("cannot replace resolv.conf: {v}")))?;
        }
    }
    let mut content = String::new();
    if options.dns.is_empty() {
        for server in DEFAULT_NAMESERVERS {
            content.push_str(&format!("nameserver {server}\n"));
        }
    } else {
        for server in &options.dns {
            content.push_str(&format!("nameserver {server}\n"));
        }
    }
    fs::write(&resolv, content)
        .map_err(|v| Error::MountFailed(format!("cannot write resolv.conf: {v}")))?;
    if Path::new("/etc/hosts").exists() {
        let target = etc.join("hosts");
        if fs::symlink_metadata(&target).is_err() {
            File::create(&target)
                .map_err(|v| Error::MountFailed(format!("cannot create /etc/hosts: {v}")))?;
        }
        mount(
            Some("/etc/hosts"),
            &target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|v| Error::MountFailed(format!("cannot bind /etc/hosts: {v}")))?;
        let _ = mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
            None::<&str>,
        );
    }
    if !options.hostname.is_empty() {
        fs::write(etc.join("hostname"), format!("{}\n", options.hostname))
            .map_err(|v| Error::MountFailed(format!("cannot write /etc/hostname: {v}")))?;
    }
    Ok(())
}

fn apply_bind(root: &Path, bind: &BindMount) -> Result<()> {
    let meta = fs::symlink_metadata(&bind.source).map_err(|v| {
        Error::MountFailed(format!("bind source {:?}: {v}", bind.source))
    })?;
    if meta.file_type().is_symlink() {
        return Err(Error::MountFailed(format!(
            "refusing to bind symlink {:?}",
            bind.source
        )));
    }
    let target = root.join(
        bind.target
            .strip_prefix("/")
            .map_err(|_| Error::MountFailed(format!("bind target {:?} is not absolute", bind.target)))?,
    );
    if meta.is_dir() {
        create_dir_all(&target)
            .map_err(|v| Error::MountFailed(format!("cannot create {:?}: {v}", bind.target)))?;
    } else {
        if let Some(parent) = target.parent() {
            create_dir_all(parent)
                .map_err(|v| Error::MountFailed(format!("cannot create {:?}: {v}", bind.target)))?;
        }
        if fs::symlink_metadata(&target).is_err() {
            File::create(&target)
                .map_err(|v| Error::MountFailed(format!("cannot create {:?}: {v}", bind.target)))?;
        }
    }
    mount(
        Some(&bind.source),
        &target,
        None::<&str>,
        MsFlags::MS_BIND | MsFlags::MS_REC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        None::<&str>,
    )
    .map_err(|v| Error::MountFailed(format!("cannot bind {:?}: {v}", bind.source)))?;
    if bind.read_only {
        mount(
            None::<&str>,
            &target,
            None::<&str>,
            MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV,
            None::<&str>,
        )
        .map_err(|v| {
            Error::MountFailed(format!("cannot remount {:?} read-only: {v}", bind.target))
        })?;
    }
    Ok(())
}

fn setup_mount(
    root: &Path,
    source: &str,
    target: &str,
    fstype: &str,
    flags: MsFlags,
    data: Option<&str>,
) -> Result<()> {
    let target_path = root.join(target.trim_start_matches('/'));
    ignore_kind(create_dir(&target_path), ErrorKind::AlreadyExists)
        .map_err(|v| Error::MountFailed(format!("cannot create {target}: {v}")))?;
    mount(Some(source), &target_path, Some(fstype), flags, data)
        .map_err(|v| Error::MountFailed(format!("cannot mount {target}: {v}")))
}

fn ignore_kind(result: std::io::Result<()>, kind: ErrorKind) -> std::io::Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == kind => Ok(()),
        Err(err) => Err(err),
    }
}
