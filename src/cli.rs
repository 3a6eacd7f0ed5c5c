use std::{net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Args, Parser, Subcommand};
use owo_colors::OwoColorize;
use serde::Serialize;

use crate::{
    identifier::Ark,
    registry::{self, DEFAULT_REGISTRY_URL, RegistrySettings},
    resolver::ResolverMap,
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the ARK root resolver HTTP service
    Serve {
        /// Address to listen on
        #[arg(long, env = "ARKROOT_BIND", default_value = "0.0.0.0:8000")]
        bind: SocketAddr,
        #[command(flatten)]
        registry: RegistryArgs,
    },
    /// Parse and normalise one or more ARKs
    Parse {
        #[arg(value_name = "ARK", required = true)]
        arks: Vec<String>,
    },
    /// Print where one or more ARKs redirect to
    Resolve {
        #[arg(value_name = "ARK", required = true)]
        arks: Vec<String>,
        #[command(flatten)]
        registry: RegistryArgs,
    },
}

/// Where the NAAN registry comes from and how long a cached copy is trusted.
#[derive(Args, Clone, Debug)]
pub struct RegistryArgs {
    /// URL of the NAAN registry JSON
    #[arg(long, env = "ARKROOT_REGISTRY_URL", default_value = DEFAULT_REGISTRY_URL)]
    pub registry_url: String,
    /// Directory holding downloaded registry snapshots
    #[arg(long, env = "ARKROOT_CACHE_DIR", default_value = "naan_registry_cache")]
    pub cache_dir: PathBuf,
    /// Seconds before the cached registry is downloaded again
    #[arg(
        long,
        env = "ARKROOT_REFRESH_INTERVAL",
        default_value_t = 60 * 60 * 24,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub refresh_interval: u64,
    /// Seconds allowed for a whole registry download
    #[arg(
        long,
        env = "ARKROOT_DOWNLOAD_TIMEOUT",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub download_timeout: u64,
    /// Download the registry even if the cached copy is still fresh
    #[arg(long)]
    pub force_download: bool,
}

impl From<RegistryArgs> for RegistrySettings {
    fn from(args: RegistryArgs) -> Self {
        RegistrySettings {
            url: args.registry_url,
            cache_dir: args.cache_dir,
            max_age: Duration::from_secs(args.refresh_interval),
            force_download: args.force_download,
            timeout: Duration::from_secs(args.download_timeout),
        }
    }
}

#[derive(Serialize)]
struct ParseOutput<'a> {
    #[serde(flatten)]
    ark: &'a Ark<'a>,
    normalized: String,
}

/// Successes and failures of a batch command, reported on stderr when done.
#[derive(Debug, Default)]
struct Tally {
    ok: usize,
    failed: usize,
}

impl Tally {
    fn fail(&mut self, input: &str, err: impl std::fmt::Display) {
        self.failed += 1;
        eprintln!("{} {input}: {err}", "error:".red().bold());
    }

    fn finish(self) -> ExitCode {
        eprintln!(
            "{} {}  {} {}",
            "✓".green().bold(),
            self.ok,
            "✗".red().bold(),
            self.failed
        );
        if self.failed == 0 {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        }
    }
}

pub fn run_parse(arks: &[String]) -> anyhow::Result<ExitCode> {
    let mut tally = Tally::default();
    for input in arks {
        match Ark::parse(input) {
            Ok(ark) => {
                let out = ParseOutput {
                    normalized: ark.to_string(),
                    ark: &ark,
                };
                println!("{}", serde_json::to_string(&out)?);
                tally.ok += 1;
            }
            Err(e) => tally.fail(input, e),
        }
    }
    Ok(tally.finish())
}

pub fn run_resolve(arks: &[String], registry: RegistryArgs) -> anyhow::Result<ExitCode> {
    let loaded = registry::ensure_up_to_date(&registry.into())?;
    let map = ResolverMap::from_records(loaded.document.records());

    let mut tally = Tally::default();
    for input in arks {
        let resolution = Ark::parse(input)
            .map_err(anyhow::Error::from)
            .and_then(|ark| Ok(map.resolve(&ark)?));
        match resolution {
            Ok(r) => {
                println!("{}", r.location);
                tally.ok += 1;
            }
            Err(e) => tally.fail(input, e),
        }
    }
    Ok(tally.finish())
}
