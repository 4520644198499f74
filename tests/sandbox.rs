use microbox::{FsMode, SandboxOptions, SandboxProcess};

/// Spawning needs root plus namespace and mount privileges. Plain
/// users and seccomp-restricted CI runners skip these tests.
fn spawn_or_skip(options: SandboxOptions) -> Option<SandboxProcess> {
    if !nix::unistd::Uid::effective().is_root() {
        return None;
    }
    options.spawn().ok()
}

#[test]
fn tmpfs_sandbox_propagates_the_exit_code() {
    let options = SandboxOptions::new()
        .fs(FsMode::Tmpfs)
        .command(vec!["/bin/sh".into(), "-c".into(), "exit 42".into()]);
    let mut process = match spawn_or_skip(options) {
        Some(v) => v,
        None => return,
    };
    assert_eq!(process.wait().unwrap(), 42);
}

#[test]
fn signalled_child_maps_to_128_plus_signum() {
    let options = SandboxOptions::new()
        .fs(FsMode::Tmpfs)
        .command(vec!["/bin/sh".into(), "-c".into(), "kill -9 $$".into()]);
    let mut process = match spawn_or_skip(options) {
        Some(v) => v,
        None => return,
    };
    assert_eq!(process.wait().unwrap(), 137);
}

#[test]
fn hostname_is_visible_inside_the_sandbox() {
    let options = SandboxOptions::new()
        .fs(FsMode::Tmpfs)
        .hostname("alpha")
        .command(vec![
            "/bin/sh".into(),
            "-c".into(),
            "test \"$(hostname)\" = alpha".into(),
        ]);
    let mut process = match spawn_or_skip(options) {
        Some(v) => v,
        None => return,
    };
    assert_eq!(process.wait().unwrap(), 0);
}

#[test]
fn denied_syscalls_fail_without_killing_the_program() {
    let options = SandboxOptions::new()
        .fs(FsMode::Tmpfs)
        .command(vec![
            "/bin/sh".into(),
            "-c".into(),
            // mount is denied by default; the shell itself keeps running.
            "mount -t tmpfs none /tmp 2>/dev/null; test $? -ne 0".into(),
        ]);
    let mut process = match spawn_or_skip(options) {
        Some(v) => v,
        None => return,
    };
    assert_eq!(process.wait().unwrap(), 0);
}
