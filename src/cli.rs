//! Thin CLI surface (spec §6 "CLI surface"): a `clap`-derived argument
//! struct plus a dispatcher wiring it to the maintenance engine. Parsing
//! the bespoke arkimet `.conf` section-file grammar is out of scope (spec
//! §1); dataset configuration here is read as JSON, one [`DatasetConfig`]
//! object per `-C` file, matching the corpus' own preference for `serde`
//! over a hand-rolled grammar (see `config.rs`).

use std::path::{Path, PathBuf};

use clap::Parser;

use crate::config::DatasetConfig;
use crate::error::Result;
use crate::index::Index;
use crate::maintenance::check::{CheckAgent, Mode as CheckMode};
use crate::maintenance::repack::{Mode as RepackMode, RepackAgent};
use crate::maintenance::{self, MaintenanceReport};
use crate::scanner::ScannerRegistry;

/// `ark-check`: the maintenance-engine CLI wrapper named in spec §6.
#[derive(Parser, Debug)]
#[clap(name = "ark-check", about = "Classify and repair dataset segments")]
pub struct ArkCheckArgs {
    /// Actually mutate the on-disk/index state rather than only report
    /// what would happen.
    #[clap(long)]
    pub fix: bool,

    /// Run each format's real validator during classification instead of
    /// the quick framing-only check.
    #[clap(long)]
    pub accurate: bool,

    /// After checking, also run a repack pass (pack/archive/delete/orphan
    /// cleanup) over the resulting classification.
    #[clap(long)]
    pub repack: bool,

    /// Remove every `.metadata`/`.summary` sidecar under each restricted
    /// dataset, forcing a full rescan on the next `--fix` run.
    #[clap(long = "remove-all")]
    pub remove_all: bool,

    /// Remove one named sidecar file (relative to the dataset root) before
    /// classifying.
    #[clap(long)]
    pub remove: Option<String>,

    /// Re-run `scan_test` diagnostics on message index `N` of every
    /// segment.
    #[clap(long)]
    pub scantest: Option<usize>,

    /// Comma-separated list of dataset names to restrict the run to;
    /// absent means "all loaded datasets".
    #[clap(long)]
    pub restrict: Option<String>,

    /// Dataset configuration file(s), each a JSON-encoded `DatasetConfig`.
    #[clap(short = 'C', long = "config", multiple_occurrences = true)]
    pub config: Vec<PathBuf>,
}

/// Loads one [`DatasetConfig`] per `-C` path (spec §6: configuration
/// parsing beyond this crate's typed surface is an external collaborator;
/// here the typed surface is fed via JSON rather than the native grammar).
pub fn load_datasets(paths: &[PathBuf]) -> Result<Vec<DatasetConfig>> {
    let mut datasets = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(path)?;
        let config: DatasetConfig = serde_json::from_str(&text)
            .map_err(|e| crate::error::ArkError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        datasets.push(config);
    }
    Ok(datasets)
}

fn restrict_filter<'a>(datasets: &'a [DatasetConfig], restrict: &Option<String>) -> Vec<&'a DatasetConfig> {
    match restrict {
        None => datasets.iter().collect(),
        Some(names) => {
            let wanted: Vec<&str> = names.split(',').map(str::trim).collect();
            datasets
                .iter()
                .filter(|d| wanted.contains(&d.name.as_str()))
                .collect()
        }
    }
}

/// Removes sidecar files ahead of classification (spec §6 `--remove-all`
/// / `--remove=<metafile>`): the next `--fix` run sees the affected
/// segments as `needs-rescan` since their `.metadata`/`.summary` are gone.
fn apply_remove_flags(root: &Path, args: &ArkCheckArgs) -> Result<()> {
    if let Some(relpath) = &args.remove {
        let path = root.join(relpath);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        return Ok(());
    }
    if args.remove_all {
        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if name.ends_with(".metadata") || name.ends_with(".summary") {
                let _ = std::fs::remove_file(entry.path());
            }
        }
    }
    Ok(())
}

/// Runs the `check` CLI dispatch (spec §6) over every restricted dataset,
/// returning one [`MaintenanceReport`] per dataset plus the process exit
/// code ("0 on success, 1 on any reported error"). Datasets of a
/// non-local `type` (spec §7 `Skip`) are reported and skipped rather than
/// aborting the batch.
pub fn run_check(args: &ArkCheckArgs, datasets: &[DatasetConfig]) -> Result<(Vec<MaintenanceReport>, i32)> {
    let restricted = restrict_filter(datasets, &args.restrict);
    let scanners = ScannerRegistry::new();
    let mut reports = Vec::with_capacity(restricted.len());
    let mut any_error = false;

    for config in restricted {
        let root = config.path.clone();
        if !matches!(
            config.kind,
            crate::config::DatasetType::Local | crate::config::DatasetType::Ondisk2 | crate::config::DatasetType::Simple
        ) {
            let mut report = MaintenanceReport::new(config.name.clone());
            report.warning(&config.name, "non-local dataset type, skipping");
            reports.push(report);
            continue;
        }

        apply_remove_flags(&root, args)?;

        let index = Index::open(&root, config.index_type)?;
        let check_scanners = if args.accurate { Some(&scanners) } else { None };
        let classifications = maintenance::classify(&root, config, &index, check_scanners)?;

        let check_mode = if args.fix { CheckMode::Real } else { CheckMode::Mock };
        let check_agent = CheckAgent::new(&root, config, &index, &scanners, check_mode);
        let mut report = check_agent.run(&classifications)?;

        if args.repack {
            let repack_mode = if args.fix { RepackMode::Real } else { RepackMode::Mock };
            let mut archives = crate::archive::Archives::open_with(root.clone(), config.segments, config.index_type)?;
            let classifications = maintenance::classify(&root, config, &index, check_scanners)?;
            let mut repack_agent = RepackAgent::new(&root, config, &index, repack_mode).with_archives(&mut archives);
            let repack_report = repack_agent.run(&classifications)?;
            report.lines.extend(repack_report.lines);
            if repack_report.has_errors() {
                any_error = true;
            }
        }

        if let Some(n) = args.scantest {
            let reader = crate::reader::Reader::open(root.clone(), config.clone())?;
            let all = crate::index::Filter::match_all();
            for format in crate::metadata::Format::ALL.iter().copied() {
                reader.scan_test(n, &scanners, format, &all, |row, valid| {
                    report.warning(&row.segment_relpath, if valid { "filter mismatch" } else { "validation failed" });
                    Ok(())
                })?;
            }
        }

        if report.has_errors() {
            any_error = true;
        }
        reports.push(report);
    }

    Ok((reports, if any_error { 1 } else { 0 }))
}
