use crate::colors::*;
use crate::config::{default_cache_root, InstallOptions};
use crate::fetch::RegistryFetcher;
use crate::installer::Installer;
use crate::store::Store;
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "packmap",
    version,
    about = "Content-addressed package installer",
    long_about = "packmap — installs packages into a deduplicated content-addressed store\nand writes a project-level .package-map.json instead of a node_modules tree.\n\nExamples:\n  packmap install\n  packmap install --production\n  packmap cache path"
)]
pub struct PackmapCli {
    #[command(subcommand)]
    pub(crate) command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install every dependency from the lockfile into the store
    #[command(alias = "i")]
    Install {
        /// Store root (defaults to the per-user data directory)
        #[arg(long)]
        cache: Option<PathBuf>,
        /// Install prefix (defaults to the current directory)
        #[arg(long)]
        prefix: Option<PathBuf>,
        #[arg(long)]
        global: bool,
        /// Reuse cached package metadata instead of re-extracting
        #[arg(long = "no-restore")]
        no_restore: bool,
        #[arg(long, short = 'D')]
        dev: bool,
        #[arg(long)]
        development: bool,
        #[arg(long)]
        production: bool,
        /// Install only one dependency kind: dev[elopment] or prod[uction]
        #[arg(long)]
        only: Option<String>,
        /// Additionally include a dependency kind
        #[arg(long)]
        also: Option<String>,
        #[arg(long)]
        force: bool,
        #[arg(long)]
        ignore_scripts: bool,
        /// Registry base url
        #[arg(long)]
        registry: Option<String>,
    },
    Cache {
        #[command(subcommand)]
        cmd: CacheCmd,
    },
}

#[derive(Subcommand, Debug)]
pub enum CacheCmd {
    /// Show the store path on this machine
    Path,
    /// Show blob and key counts for the store
    Stats,
}

impl PackmapCli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    pub fn run(&self) -> Result<()> {
        match &self.command {
            Commands::Install {
                cache,
                prefix,
                global,
                no_restore,
                dev,
                development,
                production,
                only,
                also,
                force,
                ignore_scripts,
                registry,
            } => {
                let opts = InstallOptions {
                    cache: cache.clone().unwrap_or_else(default_cache_root),
                    prefix: prefix.clone(),
                    global: *global,
                    restore: !no_restore,
                    dev: *dev,
                    development: *development,
                    production: *production,
                    only: only.clone(),
                    also: also.clone(),
                    force: *force,
                    ignore_scripts: *ignore_scripts,
                    ..Default::default()
                };
                let fetcher = RegistryFetcher::new(registry.clone());
                let mut installer = Installer::new(opts, Box::new(fetcher))?;
                installer.run()?;
                Ok(())
            }
            Commands::Cache { cmd } => match cmd {
                CacheCmd::Path => {
                    println!("{}", default_cache_root().display());
                    Ok(())
                }
                CacheCmd::Stats => {
                    let store = Store::open(default_cache_root())?;
                    let stats = store.stats()?;
                    println!(
                        "{gray}[packmap]{reset} {green}{blobs}{reset} blobs ({bytes} bytes), {keys} package keys",
                        gray = C_GRAY,
                        green = C_GREEN,
                        reset = C_RESET,
                        blobs = stats.blob_count,
                        bytes = stats.total_size,
                        keys = stats.key_count
                    );
                    Ok(())
                }
            },
        }
    }
}
