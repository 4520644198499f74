use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};

use crate::{Error, Result};

/// Docker-equivalent default capability set.
const DEFAULT_CAPS: &[Capability] = &[
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_CHOWN,
    Capability::CAP_DAC_OVERRIDE,
    Capability::CAP_FOWNER,
    Capability::CAP_FSETID,
    Capability::CAP_KILL,
    Capability::CAP_MKNOD,
    Capability::CAP_NET_BIND_SERVICE,
    Capability::CAP_NET_RAW,
    Capability::CAP_SETFCAP,
    Capability::CAP_SETGID,
    Capability::CAP_SETPCAP,
    Capability::CAP_SETUID,
    Capability::CAP_SYS_CHROOT,
];

/// Resolves a user-supplied name. Case-insensitive, `CAP_` optional.
/// Unknown names are an error: the user meant something precise.
pub fn resolve_capability(name: &str) -> Result<Capability> {
    let mut normalized = name.trim().to_ascii_uppercase();
    if !normalized.starts_with("CAP_") {
        normalized = format!("CAP_{normalized}");
    }
    Capability::from_str(&normalized)
        .map_err(|_| Error::CapabilityFailed(format!("unknown capability: {name}")))
}

/// Computes the final set: default ∪ add \ drop. `--cap-drop ALL`
/// empties the default set first, so `--cap-drop ALL --cap-add X`
/// leaves exactly X.
pub fn compute_set(add: &[String], drop: &[String]) -> Result<CapsHashSet> {
    let drop_all = drop.iter().any(|v| v.eq_ignore_ascii_case("all"));
    let mut set: CapsHashSet = if drop_all {
        CapsHashSet::new()
    } else {
        DEFAULT_CAPS.iter().copied().collect()
    };
    for name in add {
        set.insert(resolve_capability(name)?);
    }
    for name in drop {
        if name.eq_ignore_ascii_case("all") {
            continue;
        }
        set.remove(&resolve_capability(name)?);
    }
    Ok(set)
}

/// Applies the set in the child, after filesystem setup. Bounding is
/// trimmed first, while CAP_SETPCAP is still effective; permitted goes
/// last so the intermediate states stay legal.
pub(crate) fn apply(set: &CapsHashSet) -> Result<()> {
    nix::sys::prctl::set_no_new_privs()
        .map_err(|v| Error::CapabilityFailed(format!("cannot set no_new_privs: {v}")))?;
    caps::clear(None, CapSet::Ambient)
        .map_err(|v| Error::CapabilityFailed(format!("cannot clear ambient set: {v}")))?;
    let bounding = caps::read(None, CapSet::Bounding)
        .map_err(|v| Error::CapabilityFailed(format!("cannot read bounding set: {v}")))?;
    for cap in bounding {
        if !set.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap)
                .map_err(|v| Error::CapabilityFailed(format!("cannot drop {cap}: {v}")))?;
        }
    }
    caps::set(None, CapSet::Inheritable, set)
        .map_err(|v| Error::CapabilityFailed(format!("cannot set inheritable set: {v}")))?;
    caps::set(None, CapSet::Effective, set)
        .map_err(|v| Error::CapabilityFailed(format!("cannot set effective set: {v}")))?;
    caps::set(None, CapSet::Permitted, set)
        .map_err(|v| Error::CapabilityFailed(format!("cannot set permitted set: {v}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_case_insensitive_and_prefix_optional() {
        assert_eq!(
            resolve_capability("net_admin").unwrap(),
            Capability::CAP_NET_ADMIN
        );
        assert_eq!(
            resolve_capability("CAP_SYS_ADMIN").unwrap(),
            Capability::CAP_SYS_ADMIN
        );
        assert_eq!(
            resolve_capability("Chown").unwrap(),
            Capability::CAP_CHOWN
        );
    }

    #[test]
    fn resolve_rejects_unknown_names() {
        assert!(resolve_capability("does_not_exist").is_err());
    }

    #[test]
    fn default_set_with_deltas() {
        let set = compute_set(
            &["net_admin".to_owned()],
            &["mknod".to_owned()],
        )
        .unwrap();
        assert!(set.contains(&Capability::CAP_NET_ADMIN));
        assert!(!set.contains(&Capability::CAP_MKNOD));
        assert!(set.contains(&Capability::CAP_CHOWN));
    }

    #[test]
    fn drop_all_then_add() {
        let set = compute_set(&["chown".to_owned()], &["ALL".to_owned()]).unwrap();
        assert_eq!(set.len(), 1);
        assert!(set.contains(&Capability::CAP_CHOWN));
    }
}
