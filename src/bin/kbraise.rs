use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use kbraise::Kconfig;

/// Load a Kconfig tree, optionally overlay a previous .config, and write
/// the resulting selection back out.
#[derive(Parser)]
#[clap(version)]
struct Opts {
    /// Path to the top-level Kconfig file
    kconfig: PathBuf,

    /// Previous .config to overlay after the default pass
    #[clap(long)]
    config: Option<PathBuf>,

    /// Where to write the resulting configuration
    #[clap(long, default_value = ".config")]
    out: PathBuf,

    /// Tab expansion width used by the reader
    #[clap(long, default_value_t = 4)]
    tab_width: usize,
}

fn main() -> Result<()> {
    env_logger::init();
    let opts = Opts::parse();

    let kconfig = Kconfig::new();
    kconfig.parse_with_tab_width(&opts.kconfig, opts.tab_width)?;
    if let Some(previous) = &opts.config {
        kconfig.read_dot_config(previous)?;
    }
    kconfig.write_dot_config(&opts.out)?;
    Ok(())
}
