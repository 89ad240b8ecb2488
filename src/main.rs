use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use sfiloader::{
    isolation::{Placement, PublishMode},
    IsolationContext, LoaderConfig,
};

/// sfi-load - load a binary into an isolation domain and print its capability table
#[derive(Debug, Parser)]
#[command(name = "sfi-load", version, about, long_about = None)]
struct Cli {
    /// ELF binary to isolate; defaults to the running executable.
    #[arg(value_name = "FILE", default_value = "/proc/self/exe")]
    path: PathBuf,

    /// Fixed base address of the isolated region (hex like 0x100000000000 or decimal).
    #[arg(long, value_name = "ADDRESS", value_parser = parse_number)]
    base: Option<usize>,

    /// Size of the isolated region in bytes (hex or decimal).
    #[arg(long, value_name = "BYTES", value_parser = parse_number)]
    size: Option<usize>,

    /// Number of guard-page slots after the reserved slots.
    #[arg(long, value_name = "N")]
    extra_slots: Option<usize>,

    /// Section placement: va (virtual address) or offset (file offset).
    #[arg(long, value_name = "MODE")]
    placement: Option<Placement>,

    /// Do not add the hidden runtime-support symbol offset to the data slot.
    #[arg(long)]
    no_hidden: bool,

    /// Start from the legacy preset instead of the extended one.
    #[arg(long)]
    legacy: bool,

    /// Where to publish the table base: register or thread-local.
    #[arg(long, value_name = "MODE")]
    publish: Option<PublishMode>,

    /// Enable verbose (debug-level) logging output.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_number(value: &str) -> Result<usize, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|error| format!("invalid number '{}': {}", value, error))
}

impl Cli {
    fn config(&self) -> LoaderConfig {
        let mut config = if self.legacy {
            LoaderConfig::legacy()
        } else {
            LoaderConfig::extended()
        };

        if let Some(base) = self.base {
            config.base_address = base;
        }
        if let Some(size) = self.size {
            config.region_size = size;
        }
        if let Some(extra) = self.extra_slots {
            config.extra_slots = extra;
        }
        if let Some(placement) = self.placement {
            config.placement = placement;
        }
        if let Some(publish) = self.publish {
            config.publish = publish;
        }
        if self.no_hidden {
            config.resolve_hidden_symbols = false;
        }

        config
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // --verbose enables debug; RUST_LOG overrides
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("sfiloader", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    let config = cli.config();
    let mut context = IsolationContext::new(config).context("invalid configuration")?;

    let report = context
        .init(&cli.path)
        .with_context(|| format!("failed to isolate {}", cli.path.display()))?;

    println!("Capability table at {:#x}", report.table_base);
    println!("Hidden offset: {}", report.hidden_offset);
    for placed in &report.materialized {
        println!(
            "  {:<8} {:<20} {:#018x} {:>8} bytes ({})",
            placed.slot.to_string(),
            placed.section,
            placed.address,
            placed.length,
            placed.kind
        );
    }
    for skipped in &report.skipped {
        println!("  skipped  {:<20} {}", skipped.name, skipped.error);
    }
    if !report.skipped_headers.is_empty() {
        println!("  unreadable section headers: {:?}", report.skipped_headers);
    }

    if let Some(table) = context.table() {
        for (index, address) in table.slots().iter().enumerate() {
            println!("  [{:>3}] {:#018x}", index, address);
        }
    }

    context.teardown().context("teardown failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numbers() {
        assert_eq!(parse_number("0x1000"), Ok(0x1000));
        assert_eq!(parse_number("4096"), Ok(4096));
        assert!(parse_number("0xZZ").is_err());
    }

    #[test]
    fn flags_override_preset() {
        let cli = Cli::parse_from([
            "sfi-load",
            "/bin/true",
            "--legacy",
            "--base",
            "0x50000000",
            "--placement",
            "va",
            "--publish",
            "thread-local",
        ]);
        let config = cli.config();
        assert_eq!(config.base_address, 0x5000_0000);
        assert_eq!(config.placement, Placement::VirtualAddress);
        assert_eq!(config.publish, PublishMode::ThreadLocal);
        assert!(config.low_mappings);
        assert!(!config.resolve_hidden_symbols);

        let cli = Cli::parse_from(["sfi-load", "--no-hidden", "--extra-slots", "3"]);
        let config = cli.config();
        assert_eq!(cli.path, PathBuf::from("/proc/self/exe"));
        assert_eq!(config.extra_slots, 3);
        assert!(!config.resolve_hidden_symbols);
        assert_eq!(config.base_address, LoaderConfig::default().base_address);
    }
}
