use microbox::{Error, FsMode, SandboxOptions};

#[test]
fn merged_environ_is_order_stable() {
    let options = SandboxOptions::new()
        .command(vec!["/bin/true".into()])
        .env("ZED", "1")
        .env("ALPHA", "2");
    let environ = options.merged_environ();
    assert_eq!(
        environ[0],
        "PATH=/usr/bin:/bin:/usr/sbin:/sbin:/usr/local/bin"
    );
    assert_eq!(environ[1], "HOME=/root");
    assert_eq!(environ[2], "TERM=xterm");
    assert_eq!(environ[3], "LANG=C.UTF-8");
    assert_eq!(environ[4], "ALPHA=2");
    assert_eq!(environ[5], "ZED=1");
    // Merging the same inputs twice yields identical output.
    assert_eq!(environ, options.merged_environ());
}

#[test]
fn user_values_override_baseline_in_place() {
    let options = SandboxOptions::new()
        .command(vec!["/bin/true".into()])
        .env("HOME", "/workspace")
        .env("EXTRA", "x");
    let environ = options.merged_environ();
    assert_eq!(environ[1], "HOME=/workspace");
    assert_eq!(environ[4], "EXTRA=x");
    assert_eq!(environ.len(), 5);
}

#[test]
fn later_env_entries_win() {
    let options = SandboxOptions::new()
        .command(vec!["/bin/true".into()])
        .env("KEY", "first")
        .env("KEY", "second");
    let environ = options.merged_environ();
    assert!(environ.contains(&"KEY=second".to_owned()));
    assert!(!environ.contains(&"KEY=first".to_owned()));
}

#[test]
fn empty_command_is_rejected() {
    let err = SandboxOptions::new().validate().unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)));
}

#[test]
fn host_fs_forbids_binds() {
    let err = SandboxOptions::new()
        .fs(FsMode::Host)
        .mount_ro("/etc", "/etc")
        .command(vec!["/bin/true".into()])
        .validate()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)));
    assert!(err.to_string().contains("host"));
}

#[test]
fn bind_target_must_be_absolute() {
    let err = SandboxOptions::new()
        .mount_rw("/tmp", "relative/path")
        .command(vec!["/bin/true".into()])
        .validate()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)));
}

#[test]
fn cpus_must_be_a_finite_non_negative_number() {
    let base = || SandboxOptions::new().command(vec!["/bin/true".into()]);
    assert!(base().cpus(-1.0).validate().is_err());
    assert!(base().cpus(f64::NAN).validate().is_err());
    assert!(base().cpus(0.0).validate().is_ok());
    assert!(base().cpus(1.5).validate().is_ok());
}

#[test]
fn empty_env_key_is_rejected() {
    let err = SandboxOptions::new()
        .command(vec!["/bin/true".into()])
        .env("", "value")
        .validate()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)));
}

#[test]
fn missing_rootfs_directory_is_rejected() {
    let err = SandboxOptions::new()
        .fs(FsMode::Rootfs("/does/not/exist".into()))
        .command(vec!["/bin/true".into()])
        .validate()
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOption(_)));
}
