use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process;

use clap::{Parser, ValueEnum};
use tracing::error;
use tracing_subscriber::EnvFilter;

use microbox::{Error, FsMode, NetMode, SandboxOptions, UserNsMode};

#[derive(Parser, Debug)]
#[command(
    name = "microbox",
    version,
    about = "Run a command in a lightweight Linux sandbox",
    after_help = "Example: microbox --fs tmpfs --net bridge --memory 64M -- /bin/sh"
)]
struct Cli {
    /// Filesystem mode: host, tmpfs, or a rootfs directory
    #[arg(long, value_name = "MODE", default_value = "tmpfs")]
    fs: String,

    /// Network mode
    #[arg(long, value_enum, default_value_t = NetArg::None)]
    net: NetArg,

    /// Read-only bind mount (repeatable)
    #[arg(long = "mount-ro", value_name = "HOST:DEST", value_parser = parse_bind)]
    mount_ro: Vec<(PathBuf, PathBuf)>,

    /// Read-write bind mount (repeatable)
    #[arg(long = "mount-rw", value_name = "HOST:DEST", value_parser = parse_bind)]
    mount_rw: Vec<(PathBuf, PathBuf)>,

    /// Remount the sandbox root read-only
    #[arg(long)]
    readonly: bool,

    /// Extra environment variable (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env)]
    env: Vec<(String, String)>,

    /// Hostname inside the sandbox
    #[arg(long, value_name = "NAME")]
    hostname: Option<String>,

    /// Fractional CPU cap; 0 means unlimited
    #[arg(long, value_name = "N")]
    cpus: Option<f64>,

    /// Memory cap with K/M/G suffix; 0 means unlimited
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    memory: Option<u64>,

    /// Tmpfs budget for the sandbox root
    #[arg(long, value_name = "SIZE", value_parser = parse_size)]
    storage: Option<u64>,

    /// Nameserver for /etc/resolv.conf (repeatable)
    #[arg(long, value_name = "IP")]
    dns: Vec<Ipv4Addr>,

    /// Remove a syscall from the deny list (repeatable)
    #[arg(long = "allow-syscall", value_name = "NAME")]
    allow_syscall: Vec<String>,

    /// Add a syscall to the deny list (repeatable)
    #[arg(long = "deny-syscall", value_name = "NAME")]
    deny_syscall: Vec<String>,

    /// Grant a capability on top of the default set (repeatable)
    #[arg(long = "cap-add", value_name = "NAME")]
    cap_add: Vec<String>,

    /// Remove a capability; ALL clears the default set (repeatable)
    #[arg(long = "cap-drop", value_name = "NAME")]
    cap_drop: Vec<String>,

    /// User namespace mode
    #[arg(long, value_enum, default_value_t = UserNsArg::Isolated)]
    userns: UserNsArg,

    /// Maximum log level
    #[arg(long, value_enum, default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Command to run inside the sandbox, after --
    #[arg(last = true, value_name = "COMMAND")]
    command: Vec<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NetArg {
    None,
    Host,
    Bridge,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum UserNsArg {
    Isolated,
    Host,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level, cli.log_format);
    match run(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    }
}

fn run(cli: Cli) -> microbox::Result<i32> {
    if cli.command.is_empty() {
        return Err(Error::InvalidOption(
            "missing command; usage: microbox [flags] -- command...".into(),
        ));
    }
    // Sweep leftovers of launchers that died mid-run.
    microbox::collect_stale();
    let mut options = SandboxOptions::new()
        .fs(parse_fs(&cli.fs)?)
        .read_only(cli.readonly)
        .net(match cli.net {
            NetArg::None => NetMode::None,
            NetArg::Host => NetMode::Host,
            NetArg::Bridge => NetMode::Bridge,
        })
        .user_ns(match cli.userns {
            UserNsArg::Isolated => UserNsMode::Isolated,
            UserNsArg::Host => UserNsMode::Host,
        })
        .command(cli.command);
    if let Some(hostname) = cli.hostname {
        options = options.hostname(hostname);
    }
    if let Some(cpus) = cli.cpus {
        options = options.cpus(cpus);
    }
    if let Some(memory) = cli.memory {
        options = options.memory_bytes(memory);
    }
    if let Some(storage) = cli.storage {
        options = options.storage_bytes(storage);
    }
    for (source, target) in cli.mount_ro {
        options = options.mount_ro(source, target);
    }
    for (source, target) in cli.mount_rw {
        options = options.mount_rw(source, target);
    }
    for server in cli.dns {
        options = options.dns(server);
    }
    for name in cli.allow_syscall {
        options = options.allow_syscall(name);
    }
    for name in cli.deny_syscall {
        options = options.deny_syscall(name);
    }
    for name in cli.cap_add {
        options = options.cap_add(name);
    }
    for name in cli.cap_drop {
        options = options.cap_drop(name);
    }
    for (key, value) in cli.env {
        options = options.env(key, value);
    }
    let mut process = options.spawn()?;
    process.wait()
}

fn init_logging(level: LogLevel, format: LogFormat) {
    let filter = EnvFilter::new(match level {
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error => "error",
    });
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn parse_fs(input: &str) -> microbox::Result<FsMode> {
    match input {
        "tmpfs" => Ok(FsMode::Tmpfs),
        "host" => Ok(FsMode::Host),
        path => {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                Ok(FsMode::Rootfs(path))
            } else {
                path.canonicalize().map(FsMode::Rootfs).map_err(|v| {
                    Error::InvalidOption(format!(
                        "--fs expects host, tmpfs or a rootfs directory: {v}"
                    ))
                })
            }
        }
    }
}

/// Decimal bytes with an optional K/M/G suffix, case-insensitive,
/// trailing B or iB tolerated: 64M, 512k, 1GiB.
fn parse_size(input: &str) -> Result<u64, String> {
    let mut text = input.trim().to_ascii_lowercase();
    if let Some(stripped) = text.strip_suffix("ib") {
        text = stripped.to_owned();
    } else if let Some(stripped) = text.strip_suffix('b') {
        text = stripped.to_owned();
    }
    let (number, multiplier) = match text.chars().last() {
        Some('k') => (&text[..text.len() - 1], 1024u64),
        Some('m') => (&text[..text.len() - 1], 1024 * 1024),
        Some('g') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
        _ => (text.as_str(), 1),
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| format!("invalid size: {input}"))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("size overflows: {input}"))
}

fn parse_env(input: &str) -> Result<(String, String), String> {
    match input.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected KEY=VALUE, got {input:?}")),
    }
}

fn parse_bind(input: &str) -> Result<(PathBuf, PathBuf), String> {
    match input.split_once(':') {
        Some((host, dest)) if !host.is_empty() && !dest.is_empty() => {
            Ok((host.into(), dest.into()))
        }
        _ => Err(format!("expected HOST:DEST, got {input:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_follows_the_separator() {
        let cli = Cli::try_parse_from(["microbox", "--", "/bin/sh", "-c", "echo hi"]).unwrap();
        assert_eq!(cli.command, vec!["/bin/sh", "-c", "echo hi"]);
        assert_eq!(cli.fs, "tmpfs");
        assert!(matches!(cli.net, NetArg::None));
    }

    #[test]
    fn repeatable_flags_accumulate() {
        let cli = Cli::try_parse_from([
            "microbox",
            "--mount-ro",
            "/etc:/etc",
            "--mount-rw",
            "/var/tmp:/scratch",
            "--env",
            "A=1",
            "--env",
            "B=2",
            "--dns",
            "1.1.1.1",
            "--dns",
            "9.9.9.9",
            "--",
            "/bin/true",
        ])
        .unwrap();
        assert_eq!(cli.mount_ro.len(), 1);
        assert_eq!(cli.mount_rw.len(), 1);
        assert_eq!(cli.env.len(), 2);
        assert_eq!(cli.dns.len(), 2);
    }

    #[test]
    fn malformed_values_are_parse_errors() {
        assert!(Cli::try_parse_from(["microbox", "--env", "novalue", "--", "/bin/true"]).is_err());
        assert!(Cli::try_parse_from(["microbox", "--memory", "lots", "--", "/bin/true"]).is_err());
        assert!(Cli::try_parse_from(["microbox", "--net", "mesh", "--", "/bin/true"]).is_err());
    }

    #[test]
    fn sizes_with_suffixes() {
        assert_eq!(parse_size("1024").unwrap(), 1024);
        assert_eq!(parse_size("64M").unwrap(), 67108864);
        assert_eq!(parse_size("512k").unwrap(), 524288);
        assert_eq!(parse_size("1G").unwrap(), 1073741824);
        assert_eq!(parse_size("2GiB").unwrap(), 2147483648);
        assert_eq!(parse_size("10MB").unwrap(), 10485760);
    }

    #[test]
    fn sizes_reject_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("12T").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("-1M").is_err());
    }

    #[test]
    fn env_requires_key() {
        assert_eq!(
            parse_env("FOO=bar").unwrap(),
            ("FOO".to_owned(), "bar".to_owned())
        );
        assert_eq!(parse_env("FOO=").unwrap(), ("FOO".to_owned(), String::new()));
        assert!(parse_env("=bar").is_err());
        assert!(parse_env("FOO").is_err());
    }

    #[test]
    fn binds_split_on_first_colon() {
        let (host, dest) = parse_bind("/etc:/mnt/etc").unwrap();
        assert_eq!(host, PathBuf::from("/etc"));
        assert_eq!(dest, PathBuf::from("/mnt/etc"));
        assert!(parse_bind("/etc").is_err());
        assert!(parse_bind(":/mnt").is_err());
    }
}
