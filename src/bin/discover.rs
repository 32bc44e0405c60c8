use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use log::{info, warn, LevelFilter};
use micrograph_matching::{
    save_pyramid_annotations, Collection, CollectionDiscovery, CollectionSink, DebugOutputConfig, DiscoveryConfig,
    DiscoveryKind, JsonDirectorySink, MetadataStore,
};

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum KindArg {
    Pyramid,
    ModeGrid,
    All,
}

impl From<KindArg> for DiscoveryKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Pyramid => DiscoveryKind::Pyramid,
            KindArg::ModeGrid => DiscoveryKind::ModeGrid,
            KindArg::All => DiscoveryKind::All,
        }
    }
}

/// Discover magnification pyramids and detector-mode grids in a set of micrographs.
#[derive(Parser, Debug)]
#[command(version)]
struct Opts {
    /// Metadata records as JSON (a list, or an object keyed by image path)
    #[arg(short, long, value_name = "FILE")]
    metadata: PathBuf,
    /// Discovery configuration JSON; defaults are used when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Directory receiving one collection_<id>.json per collection
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    /// Which collections to look for
    #[arg(long, value_enum, default_value_t = KindArg::All)]
    kind: KindArg,
    /// Write pyramid match rectangles drawn onto the parent images here
    #[arg(long, value_name = "DIR")]
    debug_dir: Option<PathBuf>,
    /// Sample identifier used in printed captions
    #[arg(long, value_name = "ID")]
    sample_id: Option<String>,
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    let level = match opts.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    let config = match &opts.config {
        Some(path) => DiscoveryConfig::load(path)
            .with_context(|| format!("failed to load configuration {}", path.display()))?,
        None => DiscoveryConfig::default(),
    };
    let store = MetadataStore::load_json(&opts.metadata)
        .with_context(|| format!("failed to load metadata {}", opts.metadata.display()))?;

    let discovery = CollectionDiscovery::new(&config);
    let mut sink: Box<dyn CollectionSink> = match &opts.output {
        Some(dir) => Box::new(
            JsonDirectorySink::new(dir)
                .with_context(|| format!("failed to create output directory {}", dir.display()))?,
        ),
        None => Box::new(Vec::<Collection>::new()),
    };
    let collections = discovery.discover_into(&store, opts.kind.into(), sink.as_mut());

    if let Some(dir) = &opts.debug_dir {
        let debug = DebugOutputConfig::in_dir(dir);
        for collection in &collections {
            match save_pyramid_annotations(collection, &debug) {
                Ok(written) if !written.is_empty() => {
                    info!("{}: {} debug images", collection.id, written.len())
                }
                Ok(_) => {}
                Err(err) => warn!("Failed to annotate {}: {}", collection.id, err),
            }
        }
    }

    for collection in &collections {
        println!(
            "{}\t{}\t{} members\t{}",
            collection.id,
            collection.kind,
            collection.len(),
            collection
                .members
                .iter()
                .map(|m| m.display_name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        if let Some(sample_id) = &opts.sample_id {
            for line in collection.caption(sample_id).lines() {
                println!("\t{line}");
            }
        }
    }
    println!("{} collections", collections.len());

    Ok(())
}
