use std::collections::BTreeSet;

use libseccomp::{ScmpAction, ScmpFilterContext, ScmpSyscall};

use crate::{Error, Result};

/// Syscalls denied by default: kernel modules, keyrings, tracing,
/// clock tampering, mount and namespace manipulation, and the other
/// host-affecting interfaces a sandboxed program has no business with.
const DEFAULT_DENY: &[&str] = &[
    "_sysctl",
    "acct",
    "add_key",
    "adjtimex",
    "bpf",
    "clock_adjtime",
    "create_module",
    "delete_module",
    "fanotify_init",
    "finit_module",
    "fsconfig",
    "fsmount",
    "fsopen",
    "fspick",
    "init_module",
    "io_uring_enter",
    "io_uring_register",
    "io_uring_setup",
    "ioperm",
    "iopl",
    "kcmp",
    "kexec_file_load",
    "kexec_load",
    "keyctl",
    "lookup_dcookie",
    "mount",
    "mount_setattr",
    "move_mount",
    "move_pages",
    "name_to_handle_at",
    "nfsservctl",
    "nsenter",
    "open_by_handle_at",
    "open_tree",
    "perf_event_open",
    "personality",
    "pivot_root",
    "process_vm_readv",
    "process_vm_writev",
    "ptrace",
    "quotactl",
    "reboot",
    "request_key",
    "set_mempolicy",
    "setns",
    "settimeofday",
    "stime",
    "sysfs",
    "umount",
    "umount2",
    "unshare",
    "userfaultfd",
    "vm86",
    "vm86old",
];

/// The effective deny list: `default ∪ user_deny \ user_allow`,
/// sorted and deduplicated.
pub fn compute_deny_list(allow: &[String], deny: &[String]) -> Vec<String> {
    let mut set: BTreeSet<String> = DEFAULT_DENY.iter().map(|v| (*v).to_owned()).collect();
    for name in deny {
        set.insert(name.clone());
    }
    for name in allow {
        set.remove(name.as_str());
    }
    set.into_iter().collect()
}

/// Builds and loads the filter: allow by default, ENOSYS for denied
/// names. ENOSYS rather than EPERM, so programs with fallback paths
/// keep working. Installed last in the child, right before exec.
pub(crate) fn install(deny: &[String]) -> Result<()> {
    let mut filter = ScmpFilterContext::new_filter(ScmpAction::Allow)
        .map_err(|v| Error::SeccompFailed(format!("cannot create filter: {v}")))?;
    for name in deny {
        let syscall = match ScmpSyscall::from_name(name) {
            Ok(v) => v,
            // Not a syscall on this kernel or architecture.
            Err(_) => continue,
        };
        filter
            .add_rule(ScmpAction::Errno(nix::libc::ENOSYS), syscall)
            .map_err(|v| Error::SeccompFailed(format!("cannot deny {name}: {v}")))?;
    }
    filter
        .load()
        .map_err(|v| Error::SeccompFailed(format!("cannot load filter: {v}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(names: &[&str]) -> Vec<String> {
        names.iter().map(|v| (*v).to_owned()).collect()
    }

    #[test]
    fn deny_list_is_sorted_and_unique() {
        let list = compute_deny_list(&[], &[]);
        let mut sorted = list.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(list, sorted);
    }

    #[test]
    fn user_deny_extends_the_default() {
        let list = compute_deny_list(&[], &strings(&["socket", "mount"]));
        assert!(list.iter().any(|v| v == "socket"));
        // Already denied; no duplicate entry.
        assert_eq!(list.iter().filter(|v| *v == "mount").count(), 1);
    }

    #[test]
    fn user_allow_carves_out_defaults() {
        let list = compute_deny_list(&strings(&["mount", "unshare"]), &[]);
        assert!(!list.iter().any(|v| v == "mount"));
        assert!(!list.iter().any(|v| v == "unshare"));
        assert!(list.iter().any(|v| v == "umount2"));
    }

    #[test]
    fn unknown_names_survive_computation() {
        // Resolution happens at install time, where unknown names are
        // skipped; the computed list keeps them.
        let list = compute_deny_list(&[], &strings(&["definitely_not_a_syscall"]));
        assert!(list.iter().any(|v| v == "definitely_not_a_syscall"));
    }

    #[test]
    fn allow_beats_deny() {
        let list = compute_deny_list(&strings(&["socket"]), &strings(&["socket"]));
        assert!(!list.iter().any(|v| v == "socket"));
    }
}
