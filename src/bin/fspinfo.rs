//! fspinfo
//!
//! Inspect a tablespace file: header counters, free lists, extent
//! descriptors, and an optional consistency check.

use anyhow::{bail, Context};
use clap::Parser;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tablespace_rs::tablespace::redo_path;
use tablespace_rs::{
    CorruptionPolicy, ExtentInfo, RedoLog, SpaceConfig, SpaceFile, SpaceHeaderInfo, SpaceList,
    SpaceStats, Tablespace, ValidationReport,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "fspinfo")]
#[command(about = "Inspect the free space structures of a tablespace file")]
struct Args {
    /// Tablespace file
    path: PathBuf,

    /// TOML configuration (page size and space id are read from the file
    /// when not given)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Page size in bytes [default: from the tablespace flags]
    #[arg(long)]
    page_size: Option<u32>,

    /// Tablespace id [default: from page 0]
    #[arg(long)]
    space_id: Option<u32>,

    /// Replay the redo log before inspecting
    #[arg(long)]
    recover: bool,

    /// Check every list against the extent descriptors
    #[arg(long)]
    validate: bool,

    /// Describe the extent containing this page
    #[arg(long)]
    extent: Option<u32>,

    /// Print the extents on each tablespace list
    #[arg(long)]
    lists: bool,

    /// Emit JSON instead of text
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    stats: SpaceStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    lists: Option<Vec<(SpaceList, Vec<u32>)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    extent: Option<ExtentInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    validation: Option<ValidationReport>,
}

/// Header fields of page 0, read without knowing the page size
fn peek_header(path: &PathBuf) -> anyhow::Result<SpaceHeaderInfo> {
    let mut buf = [0u8; 512];
    File::open(path)
        .with_context(|| format!("opening {:?}", path))?
        .read_exact(&mut buf)
        .with_context(|| format!("reading page 0 of {:?}", path))?;
    Ok(SpaceHeaderInfo::from_page_bytes(&buf))
}

fn build_config(args: &Args) -> anyhow::Result<SpaceConfig> {
    let mut config = match &args.config {
        Some(path) => SpaceConfig::load(path).with_context(|| format!("loading {:?}", path))?,
        None => SpaceConfig::default(),
    };

    let header = peek_header(&args.path)?;
    config.page_size = match (args.page_size, header.page_size) {
        (Some(size), _) => size,
        (None, Some(size)) => size,
        (None, None) => bail!(
            "cannot detect the page size from flags {:#x}; pass --page-size",
            header.flags
        ),
    };
    config.space_id = args.space_id.unwrap_or(header.space_id);
    config.initial_size = header.size.max(1);
    if let Some(max) = config.max_size {
        config.max_size = Some(max.max(config.initial_size));
    }

    // Report corruption instead of aborting the inspector
    config.on_corruption = CorruptionPolicy::Propagate;
    Ok(config)
}

fn print_text(report: &Report) {
    let s = &report.stats;
    println!("Tablespace {}", s.space_id);
    println!("  page size          {}", s.page_size);
    println!("  size               {} pages", s.size);
    println!("  free limit         {}", s.free_limit);
    println!("  fragment pages     {} used", s.frag_n_used);
    println!(
        "  extents            {} free, {} free-frag, {} full-frag",
        s.free_extents, s.free_frag_extents, s.full_frag_extents
    );
    println!(
        "  inode pages        {} full, {} with free slots",
        s.inode_pages_full, s.inode_pages_free
    );
    println!("  next segment id    {}", s.next_segment_id);
    println!("  available          {} KiB", s.available_kib);

    if let Some(lists) = &report.lists {
        for (list, pages) in lists {
            println!("  {:?}: {:?}", list, pages);
        }
    }

    if let Some(extent) = &report.extent {
        println!(
            "Extent {}: {:?}, segment {}, {} used, free offsets {:?}",
            extent.first_page, extent.state, extent.segment_id, extent.n_used, extent.free_offsets
        );
    }

    if let Some(validation) = &report.validation {
        println!(
            "Validation: {} extents, {} segments checked",
            validation.extents_checked, validation.segments_checked
        );
        if validation.is_ok() {
            println!("  OK");
        }
        for problem in &validation.problems {
            println!("  {}", problem);
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;
    info!("Inspecting {:?} with {:?}", args.path, config);

    let space = if args.recover {
        let storage = Arc::new(SpaceFile::open(&args.path, config.page_size)?);
        let redo = Arc::new(RedoLog::open(redo_path(&args.path))?);
        let space = Tablespace::recover(config, storage, redo)?;
        space.flush()?;
        space
    } else {
        Tablespace::open_file(&args.path, config)?
    };

    let lists = if args.lists {
        let mut lists = Vec::new();
        for list in SpaceList::ALL {
            lists.push((list, space.space_list_extents(list)?));
        }
        Some(lists)
    } else {
        None
    };

    let extent = match args.extent {
        Some(page_no) => match space.describe_extent(page_no)? {
            Some(info) => Some(info),
            None => bail!("page {} is beyond the initialized part of the tablespace", page_no),
        },
        None => None,
    };

    let validation = if args.validate {
        Some(space.validate()?)
    } else {
        None
    };

    let report = Report {
        stats: space.stats()?,
        lists,
        extent,
        validation,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_text(&report);
    }

    if report.validation.as_ref().is_some_and(|v| !v.is_ok()) {
        std::process::exit(2);
    }
    Ok(())
}
