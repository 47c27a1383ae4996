//! reliability-check: 加载并校验控制面配置，输出生效配置
//!
//! Usage:
//!   reliability-check [<path>] [--json]
//!
//! The path defaults to `$RELIABILITY_CONFIG`. Exits 1 on a missing,
//! unreadable or invalid config, 2 on bad usage.

use anyhow::{anyhow, Context};
use reliability_plane::config::CONFIG_ENV;
use reliability_plane::{telemetry, ReliabilityConfig, ReliabilityPlane};
use tracing::info;

fn print_usage() {
    println!(
        r#"reliability-check: 可靠性控制面配置检查

USAGE:
    reliability-check [<path>] [--json]

OPTIONS:
    --json        Print the effective config as JSON instead of YAML
    -h, --help    Show this help message

ENVIRONMENT:
    {CONFIG_ENV}    Config path used when <path> is omitted
    RUST_LOG              Log filter (default: info)"#
    );
}

fn run(path: &str, json: bool) -> anyhow::Result<()> {
    let config = ReliabilityConfig::load(path)
        .with_context(|| format!("invalid configuration in {path}"))?;
    // build once, the way service startup would
    ReliabilityPlane::from_config(config.clone()).context("failed to build reliability plane")?;
    info!(path, "configuration is valid");

    let rendered = if json {
        serde_json::to_string_pretty(&config)?
    } else {
        serde_yaml::to_string(&config)?
    };
    println!("{rendered}");
    Ok(())
}

fn main() {
    let mut path = None;
    let mut json = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--json" => json = true,
            "-h" | "--help" => {
                print_usage();
                return;
            }
            other if other.starts_with('-') => {
                eprintln!("Unknown option: {other}");
                print_usage();
                std::process::exit(2);
            }
            other => path = Some(other.to_string()),
        }
    }

    let _ = telemetry::init_tracing();

    let result = match path.or_else(|| std::env::var(CONFIG_ENV).ok()) {
        Some(path) => run(&path, json),
        None => Err(anyhow!("no config path given and {CONFIG_ENV} is not set")),
    };
    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
