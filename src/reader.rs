//! Reader: translates filters into index queries and resolves the results
//! to message bytes (spec §4.4).

use std::io::Write;
use std::path::PathBuf;

use crate::archive::Archives;
use crate::config::DatasetConfig;
use crate::error::Result;
use crate::index::{Filter, Index, Row};
use crate::metadata::{Format, Message, Metadata};
use crate::postprocess;
use crate::scanner::ScannerRegistry;
use crate::segment;

/// Controls how [`Reader::query_bytes`] emits the resolved byte stream
/// (spec §4.4 `query_bytes` `mode`).
pub enum ByteMode<'a> {
    /// Each message is prefixed by its metadata envelope, then streamed raw.
    Inline,
    /// The concatenated stream is piped through an external postprocessor.
    Postprocess {
        program: &'a str,
        args: &'a [String],
    },
    /// Only a one-line report is produced (no data bytes).
    ReportMd,
    ReportSummary,
}

/// Instructs [`Reader::query_data`]/[`Reader::query_bytes`] whether to
/// continue streaming or stop after the current item (spec §5
/// "Cancellation/timeouts": "cancellable at the message-emission
/// boundary").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One resolved message, as handed to a [`Reader::query_data`] callback.
pub struct Resolved {
    pub row: Row,
    pub metadata: Metadata,
    pub data: Vec<u8>,
}

/// Read-only access to one dataset: the live area plus its [`Archives`]
/// (spec §4.4, §4.6 "queried transparently beneath the live index").
pub struct Reader {
    root: PathBuf,
    config: DatasetConfig,
    index: Index,
    archives: Archives,
}

impl Reader {
    pub fn open(root: PathBuf, config: DatasetConfig) -> Result<Self> {
        config.validate()?;
        let index = Index::open(&root, config.index_type)?;
        let archives = Archives::open_with(root.clone(), config.segments, config.index_type)?;
        Ok(Self {
            root,
            config,
            index,
            archives,
        })
    }

    fn resolve(&self, row: &Row) -> Result<Vec<u8>> {
        let segment = segment::open(&self.root, &row.segment_relpath, self.config.segments)?;
        segment.read(row.offset, row.size)
    }

    /// Streams messages matching `filter` through `callback`, live rows
    /// first then archived ones, stopping early if the callback returns
    /// [`Flow::Stop`] (spec §4.4 `query_data`).
    pub fn query_data(
        &self,
        filter: &Filter,
        mut callback: impl FnMut(Resolved) -> Result<Flow>,
    ) -> Result<()> {
        for row in self.index.query(filter)? {
            let data = self.resolve(&row)?;
            let metadata = self.row_metadata(&row);
            if callback(Resolved {
                row,
                metadata,
                data,
            })? == Flow::Stop
            {
                return Ok(());
            }
        }
        for row in self.archives.query(filter)? {
            let data = self.archives.resolve(&row)?;
            let metadata = self.row_metadata(&row);
            if callback(Resolved {
                row,
                metadata,
                data,
            })? == Flow::Stop
            {
                return Ok(());
            }
        }
        Ok(())
    }

    /// `attributes` only carry the dataset's `index`-configured subset
    /// (spec §3 "Index row"); the fingerprint items are folded in too so
    /// a caller sees the full decoded identity of the row.
    fn row_metadata(&self, row: &Row) -> Metadata {
        let mut md = Metadata::new();
        for item in row.fingerprint.items() {
            md.set(item.clone());
        }
        for item in row.attributes.iter() {
            md.set(item.clone());
        }
        md
    }

    /// Streams raw bytes to `sink` (spec §4.4 `query_bytes`). `Inline`
    /// prefixes each message with its metadata envelope; `Postprocess`
    /// pipes the concatenated stream through an external program (spec §9
    /// "Postprocessor streams": failure is reported only after whatever
    /// bytes were already emitted).
    pub fn query_bytes(
        &self,
        filter: &Filter,
        sink: &mut dyn Write,
        mode: ByteMode<'_>,
    ) -> Result<()> {
        match mode {
            ByteMode::Inline => {
                self.query_data(filter, |resolved| {
                    let items: Vec<crate::value::Value> = resolved.metadata.iter().cloned().collect();
                    crate::envelope::write_envelope(
                        sink,
                        crate::envelope::METADATA_SIGNATURE,
                        &crate::envelope::encode_value_list(&items),
                    )?;
                    sink.write_all(&resolved.data)?;
                    Ok(Flow::Continue)
                })
            }
            ByteMode::Postprocess { program, args } => {
                let mut pipe = postprocess::Pipe::spawn(program, args, &self.config.postprocess)?;
                let feed_result = self.query_data(filter, |resolved| {
                    pipe.send(&resolved.data)?;
                    pipe.drain_ready(sink)?;
                    Ok(Flow::Continue)
                });
                feed_result?;
                pipe.finish(sink)
            }
            ByteMode::ReportMd | ByteMode::ReportSummary => {
                let summary = self.query_summary(filter)?;
                writeln!(
                    sink,
                    "{}: {} messages, {} bytes",
                    self.config.name,
                    summary.total_count(),
                    summary.total_size()
                )?;
                Ok(())
            }
        }
    }

    /// Populates a combined summary from the live index and the archive
    /// layer (spec §4.4 `query_summary`). An unfiltered (match-all) query
    /// against the live index is itself cached at `.summaries/all.summary`
    /// (spec §6 "Summary cache files"), invalidated by every writer and
    /// maintenance operation that mutates index rows.
    pub fn query_summary(&self, filter: &Filter) -> Result<crate::summary::Summary> {
        let use_cache =
            filter.reftime_min.is_none() && filter.reftime_max.is_none() && filter.predicates.is_empty();
        let cache_path = crate::summary::live_cache_path(&self.root);
        let mut summary = if use_cache && cache_path.exists() {
            crate::summary::Summary::load(&cache_path)?
        } else {
            let fresh = self.index.query_summary(filter)?;
            if use_cache {
                fresh.save(&cache_path)?;
            }
            fresh
        };
        summary.merge_from(&self.archives.query_summary(filter)?);
        Ok(summary)
    }

    /// Emits the nth message (0-based) of every live segment, used for
    /// sampling/diagnostics (spec §4.4 `produce_nth`).
    pub fn produce_nth(&self, n: usize, mut callback: impl FnMut(Resolved) -> Result<()>) -> Result<()> {
        for (relpath, rows) in self.index.scan_files()? {
            let mut sorted = rows;
            sorted.sort_by_key(|r| r.offset);
            if let Some(row) = sorted.into_iter().nth(n) {
                let _ = &relpath;
                let data = self.resolve(&row)?;
                let metadata = self.row_metadata(&row);
                callback(Resolved {
                    row,
                    metadata,
                    data,
                })?;
            }
        }
        Ok(())
    }

    /// Diagnostic: for each segment, re-runs the format-specific validator
    /// on the nth message and tests it against `filter`; emits only the
    /// ones that fail validation or don't match, for operator review (spec
    /// §4.4 `scan_test`).
    pub fn scan_test(
        &self,
        n: usize,
        registry: &ScannerRegistry,
        format: Format,
        filter: &Filter,
        mut callback: impl FnMut(&Row, bool) -> Result<()>,
    ) -> Result<()> {
        for (_relpath, rows) in self.index.scan_files()? {
            let mut sorted = rows;
            sorted.sort_by_key(|r| r.offset);
            if let Some(row) = sorted.into_iter().nth(n) {
                let data = self.resolve(&row)?;
                let valid = registry.get(format).validate(&data).is_ok();
                let matches = filter.matches(&row);
                if !valid || !matches {
                    callback(&row, valid)?;
                }
            }
        }
        Ok(())
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn archives(&self) -> &Archives {
        &self.archives
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }
}
