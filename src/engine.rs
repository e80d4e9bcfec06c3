//! Orchestrates a conversion run: enumerates tables, emits DDL, then
//! streams records into batched SQLite inserts under governor control.
//!
//! Per source file the engine makes one cataloguing pass (definitions,
//! table names, record counts, corrupt-page census) and then one streaming
//! pass per table.  All DDL for a file is emitted before any of its DML.
//! Record- and page-local failures are absorbed and counted; table-local
//! failures end one table; structural failures end the run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Instant;

use rusqlite::Connection;
use serde::Serialize;

use crate::arrays::{self, ArrayFieldInfo};
use crate::codepage::CodePage;
use crate::config::{Config, OnRowError, Profile};
use crate::decoder::RecordDecoder;
use crate::governor::{self, Governor};
use crate::pager::PageReader;
use crate::record::{RawRecords, RecordKind};
use crate::schema::{self, Projection};
use crate::table_def::{self, TableDef};
use crate::value::Value;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Cannot open source file {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: crate::pager::Error,
    },
    #[error("Cannot open the output database: {0}")]
    SqliteOpen(#[source] rusqlite::Error),
    #[error("The output device is full.")]
    DiskFull,
    #[error("Memory limit exceeded after remediation.")]
    MemoryExhausted,
    #[error("Unknown code page: {0}")]
    CodePage(#[from] crate::codepage::Error),
    #[error("SQLite failure outside any table: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Cooperative cancellation flag, polled between batches.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableStatus {
    Ok,
    Partial,
    Failed,
}

/// Per-table outcome, retrievable by the CLI collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct TableOutcome {
    pub table_name: String,
    pub status: TableStatus,
    pub rows_written: u64,
    pub rows_skipped: u64,
}

/// Returned to the caller when a run finishes, is cancelled, or fails a
/// table.  Serializes to JSON for reporting tools.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversionReport {
    pub tables_total: u32,
    pub tables_ok: u32,
    pub tables_partial: u32,
    pub tables_failed: u32,
    pub rows_written: u64,
    pub rows_skipped: u64,
    pub pages_total: u32,
    pub corrupt_pages: u32,
    pub elapsed_seconds: f64,
    pub cancelled: bool,
    pub table_outcomes: Vec<TableOutcome>,
}

impl ConversionReport {
    fn absorb(&mut self, outcome: TableOutcome) {
        match outcome.status {
            TableStatus::Ok => self.tables_ok += 1,
            TableStatus::Partial => self.tables_partial += 1,
            TableStatus::Failed => self.tables_failed += 1,
        }
        self.rows_written += outcome.rows_written;
        self.rows_skipped += outcome.rows_skipped;
        self.table_outcomes.push(outcome);
    }
}

/// Converts TopSpeed files into one SQLite database.
pub fn convert(
    sources: &[PathBuf],
    sqlite_path: &Path,
    config: Config,
) -> Result<ConversionReport, Error> {
    ConversionEngine::new(config).convert(sources, sqlite_path)
}

/// Name prefix by source context: `.phd` and `.mod` carry their extension
/// as a namespace, anything else is unprefixed.
fn prefix_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
    {
        Some(e) if e == "phd" => "phd_",
        Some(e) if e == "mod" => "mod_",
        _ => "",
    }
}

fn is_disk_full(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::DiskFull
    )
}

/// Everything the cataloguing pass learns about one source file.
#[derive(Default)]
struct Catalog {
    /// table number -> definition block ordinal -> block bytes
    defs: BTreeMap<u8, BTreeMap<u16, Vec<u8>>>,
    /// table number -> registered name from metadata records
    names: HashMap<u8, String>,
    data_counts: HashMap<u8, u64>,
    data_bytes: HashMap<u8, u64>,
    pages_total: u32,
    corrupt_pages: u32,
}

fn scan_catalog<R: Read + Seek>(reader: &mut PageReader<R>) -> Catalog {
    let mut cat = Catalog::default();
    let mut records = RawRecords::new(reader);
    for rec in &mut records {
        match rec.kind {
            RecordKind::TableDefinition { block } => {
                cat.defs
                    .entry(rec.table_number)
                    .or_default()
                    .insert(block, rec.payload);
            }
            RecordKind::Metadata => {
                let end = rec
                    .payload
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(rec.payload.len());
                let name = String::from_utf8_lossy(&rec.payload[..end]).into_owned();
                if !name.is_empty() {
                    cat.names.insert(rec.table_number, name);
                }
            }
            RecordKind::Data { .. } => {
                *cat.data_counts.entry(rec.table_number).or_default() += 1;
                *cat.data_bytes.entry(rec.table_number).or_default() += rec.payload.len() as u64;
            }
            RecordKind::Memo { .. } | RecordKind::Index { .. } => {}
        }
    }
    cat.pages_total = records.pages_seen();
    cat.corrupt_pages = records.corrupt_pages();
    cat
}

/// Memo payloads for one table, keyed by record number and memo ordinal.
/// Chunked memos concatenate in sequence order.
fn collect_memos<R: Read + Seek>(
    reader: &mut PageReader<R>,
    table_number: u8,
) -> HashMap<(u32, u8), Vec<u8>> {
    let mut chunks: BTreeMap<(u32, u8), BTreeMap<u16, Vec<u8>>> = BTreeMap::new();
    for rec in RawRecords::new(reader) {
        if rec.table_number != table_number {
            continue;
        }
        if let RecordKind::Memo {
            record_number,
            memo_index,
            sequence,
        } = rec.kind
        {
            chunks
                .entry((record_number, memo_index))
                .or_default()
                .insert(sequence, rec.payload);
        }
    }
    chunks
        .into_iter()
        .map(|(k, parts)| (k, parts.into_values().flatten().collect()))
        .collect()
}

/// One table's immutable conversion plan.
struct TableTask {
    table_number: u8,
    def: TableDef,
    arrays: Vec<ArrayFieldInfo>,
    projection: Projection,
    est_bytes: u64,
    resume_from: Option<u32>,
    has_memos: bool,
}

/// How one table's streaming pass ended.
enum TableRun {
    Done {
        written: u64,
        skipped: u64,
        row_errors: u64,
        aborted: bool,
    },
    Cancelled {
        written: u64,
        skipped: u64,
    },
    Failed {
        written: u64,
        skipped: u64,
    },
}

pub struct ConversionEngine {
    config: Config,
    cancel: CancelToken,
}

impl ConversionEngine {
    pub fn new(config: Config) -> ConversionEngine {
        ConversionEngine {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token for cancelling this engine's runs from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Runs the conversion.  Source files are processed in the given
    /// order; tables within a file by table number.
    pub fn convert(
        &self,
        sources: &[PathBuf],
        sqlite_path: &Path,
    ) -> Result<ConversionReport, Error> {
        let started = Instant::now();
        let code_page = CodePage::from_label(&self.config.code_page)?;
        let mut conn = Connection::open(sqlite_path).map_err(Error::SqliteOpen)?;
        self.apply_pragmas(&conn)?;
        conn.execute(schema::SCHEMA_TABLE_DDL, [])?;

        let resume_points = if self.config.resume {
            load_resume_points(&conn)?
        } else {
            HashMap::new()
        };

        let mut report = ConversionReport::default();
        let mut used_names: HashSet<String> = HashSet::new();
        // Highest committed record number per converted table, for resume
        // markers.
        let mut committed: BTreeMap<String, u32> = BTreeMap::new();

        for src in sources {
            let prefix = prefix_for(src);
            let mut reader = PageReader::open(src).map_err(|e| Error::Source {
                path: src.clone(),
                source: e,
            })?;
            let catalog = scan_catalog(&mut reader);
            report.pages_total += catalog.pages_total;
            report.corrupt_pages += catalog.corrupt_pages;
            drop(reader);

            let tasks = self.build_tasks(&catalog, prefix, &resume_points, &mut used_names, &mut report);
            report.tables_total += tasks.len() as u32;

            // DDL for every table of this file precedes any DML.
            let mut ddl_failed: HashSet<usize> = HashSet::new();
            for (i, task) in tasks.iter().enumerate() {
                if let Err(e) = self.emit_ddl(&conn, task, prefix) {
                    if is_disk_full(&e) {
                        return Err(Error::DiskFull);
                    }
                    log::warn!("DDL failed for table {}: {}", task.projection.table_name, e);
                    ddl_failed.insert(i);
                }
            }

            let parallel_workers = self.parallel_workers(&tasks);
            let cancelled = if parallel_workers > 1 {
                self.run_tables_parallel(
                    &mut conn,
                    src,
                    &tasks,
                    &ddl_failed,
                    code_page,
                    parallel_workers,
                    &mut committed,
                    &mut report,
                )?
            } else {
                self.run_tables_sequential(
                    &mut conn,
                    src,
                    &tasks,
                    &ddl_failed,
                    code_page,
                    &mut committed,
                    &mut report,
                )?
            };

            if cancelled {
                write_resume_markers(&mut conn, &committed)?;
                report.cancelled = true;
                report.elapsed_seconds = started.elapsed().as_secs_f64();
                return Ok(report);
            }
        }

        // A clean finish invalidates any resume markers.
        conn.execute("DROP TABLE IF EXISTS _resume", [])?;
        report.elapsed_seconds = started.elapsed().as_secs_f64();
        Ok(report)
    }

    fn apply_pragmas(&self, conn: &Connection) -> Result<(), Error> {
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.pragma_update(None, "temp_store", "MEMORY")?;
        // Page cache gets a quarter of the memory budget; negative values
        // are KiB in SQLite.
        let budget = self.config.memory_limit_bytes.unwrap_or(500 * 1024 * 1024);
        let cache_kib = (budget / 4 / 1024).max(2048);
        conn.pragma_update(None, "cache_size", -(cache_kib as i64))?;
        Ok(())
    }

    fn build_tasks(
        &self,
        catalog: &Catalog,
        prefix: &str,
        resume_points: &HashMap<String, u32>,
        used_names: &mut HashSet<String>,
        report: &mut ConversionReport,
    ) -> Vec<TableTask> {
        let mut tasks = Vec::new();
        for (&table_number, blocks) in &catalog.defs {
            let raw: Vec<u8> = blocks.values().flat_map(|b| b.iter().copied()).collect();
            let def = match table_def::parse(table_number, &raw) {
                Ok(def) => def,
                Err(e) => {
                    log::warn!("table {}: definition unrecoverable: {}", table_number, e);
                    report.tables_total += 1;
                    report.absorb(TableOutcome {
                        table_name: format!("{}table_{}", prefix, table_number),
                        status: TableStatus::Failed,
                        rows_written: 0,
                        rows_skipped: *catalog.data_counts.get(&table_number).unwrap_or(&0),
                    });
                    continue;
                }
            };
            let infos = arrays::analyze(&def);
            let base_name = catalog
                .names
                .get(&table_number)
                .cloned()
                .unwrap_or_else(|| format!("table_{}", table_number));

            // Prefixed names must stay unique across the whole run.
            let mut projection = schema::project(&def, &infos, &base_name, prefix);
            let mut attempt = 2;
            while !used_names.insert(projection.table_name.clone()) {
                projection =
                    schema::project(&def, &infos, &format!("{}_{}", base_name, attempt), prefix);
                attempt += 1;
            }

            let count = *catalog.data_counts.get(&table_number).unwrap_or(&0);
            let bytes = *catalog.data_bytes.get(&table_number).unwrap_or(&0);
            let est_bytes = bytes.max(count * def.record_length as u64);
            let resume_from = resume_points.get(&projection.table_name).copied();
            let has_memos = !def.memos.is_empty();
            tasks.push(TableTask {
                table_number,
                def,
                arrays: infos,
                projection,
                est_bytes,
                resume_from,
                has_memos,
            });
        }
        tasks
    }

    fn emit_ddl(
        &self,
        conn: &Connection,
        task: &TableTask,
        prefix: &str,
    ) -> Result<(), rusqlite::Error> {
        conn.execute(&task.projection.create_table, [])?;
        for ddl in &task.projection.create_indexes {
            conn.execute(ddl, [])?;
        }
        let array_json = serde_json::to_string(&task.arrays).unwrap_or_else(|_| "[]".to_string());
        conn.execute(
            "INSERT OR REPLACE INTO _schema (table_name, array_fields, source_prefix) \
             VALUES (?, ?, ?)",
            rusqlite::params![task.projection.table_name, array_json, prefix],
        )?;
        Ok(())
    }

    /// Worker count for this file's tables.  Table-parallel decoding is
    /// honored only when a table classifies as enterprise.
    fn parallel_workers(&self, tasks: &[TableTask]) -> usize {
        if self.config.parallel_tables <= 1 || tasks.len() < 2 {
            return 1;
        }
        let enterprise = tasks.iter().any(|t| {
            governor::classify(self.config.profile, t.est_bytes).profile == Profile::Enterprise
        });
        if enterprise {
            self.config.parallel_tables.min(tasks.len())
        } else {
            1
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_tables_sequential(
        &self,
        conn: &mut Connection,
        src: &Path,
        tasks: &[TableTask],
        ddl_failed: &HashSet<usize>,
        code_page: CodePage,
        committed: &mut BTreeMap<String, u32>,
        report: &mut ConversionReport,
    ) -> Result<bool, Error> {
        for (i, task) in tasks.iter().enumerate() {
            if ddl_failed.contains(&i) {
                report.absorb(TableOutcome {
                    table_name: task.projection.table_name.clone(),
                    status: TableStatus::Failed,
                    rows_written: 0,
                    rows_skipped: 0,
                });
                continue;
            }
            let run = self.convert_one_table(conn, src, task, code_page, committed)?;
            match run {
                TableRun::Done {
                    written,
                    skipped,
                    row_errors,
                    aborted,
                } => {
                    let status = if aborted || row_errors > 0 {
                        TableStatus::Partial
                    } else {
                        TableStatus::Ok
                    };
                    report.absorb(TableOutcome {
                        table_name: task.projection.table_name.clone(),
                        status,
                        rows_written: written,
                        rows_skipped: skipped,
                    });
                }
                TableRun::Failed { written, skipped } => {
                    report.absorb(TableOutcome {
                        table_name: task.projection.table_name.clone(),
                        status: TableStatus::Failed,
                        rows_written: written,
                        rows_skipped: skipped,
                    });
                }
                TableRun::Cancelled { written, skipped } => {
                    report.absorb(TableOutcome {
                        table_name: task.projection.table_name.clone(),
                        status: TableStatus::Partial,
                        rows_written: written,
                        rows_skipped: skipped,
                    });
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Streams one table's records into batched inserts.  Returns `Err`
    /// only for run-fatal conditions.
    fn convert_one_table(
        &self,
        conn: &mut Connection,
        src: &Path,
        task: &TableTask,
        code_page: CodePage,
        committed: &mut BTreeMap<String, u32>,
    ) -> Result<TableRun, Error> {
        let settings = governor::classify(self.config.profile, task.est_bytes);
        let mut gov = Governor::new(
            settings,
            self.config.memory_limit_bytes,
            governor::default_probe(),
        );

        let memo_map = if task.has_memos {
            let mut reader = PageReader::open(src).map_err(|e| Error::Source {
                path: src.to_path_buf(),
                source: e,
            })?;
            collect_memos(&mut reader, task.table_number)
        } else {
            HashMap::new()
        };

        let mut reader = PageReader::open(src).map_err(|e| Error::Source {
            path: src.to_path_buf(),
            source: e,
        })?;
        let decoder = RecordDecoder::new(
            &task.def,
            &task.arrays,
            &task.projection.columns,
            code_page,
        );

        let mut written = 0_u64;
        let mut skipped = 0_u64;
        let mut row_errors = 0_u64;
        let mut aborted = false;
        let mut batch: Vec<Vec<Value>> = Vec::new();
        let mut last_in_batch: Option<u32> = None;

        let mut records = reader.records_for_table(task.table_number);
        for rec in &mut records {
            if let Some(from) = task.resume_from {
                if rec.record_number <= from {
                    continue;
                }
            }
            let memos: Vec<Option<Vec<u8>>> = (0..task.def.memos.len())
                .map(|mi| memo_map.get(&(rec.record_number, mi as u8)).cloned())
                .collect();
            match self.decode_row(&decoder, &rec.payload, &memos, src, task, rec.record_number) {
                RowAction::Insert(row) => {
                    batch.push(row);
                    last_in_batch = Some(rec.record_number);
                }
                RowAction::InsertPartial(row, errs) => {
                    row_errors += errs;
                    batch.push(row);
                    last_in_batch = Some(rec.record_number);
                }
                RowAction::Skip => {
                    row_errors += 1;
                    skipped += 1;
                }
                RowAction::AbortTable => {
                    row_errors += 1;
                    skipped += 1;
                    aborted = true;
                    break;
                }
            }

            if batch.len() >= gov.batch_size() {
                let n = match flush_batch(conn, &task.projection.insert_sql, &mut batch) {
                    Ok(n) => n,
                    Err(e) if is_disk_full(&e) => return Err(Error::DiskFull),
                    Err(e) => {
                        log::warn!(
                            "write failed for table {}: {}; aborting table",
                            task.projection.table_name,
                            e
                        );
                        return Ok(TableRun::Failed { written, skipped });
                    }
                };
                written += n as u64;
                if let Some(r) = last_in_batch.take() {
                    committed.insert(task.projection.table_name.clone(), r);
                }
                let advice = gov.after_batch(n, 0);
                if advice.release_memory || gov.release_due() {
                    let _ = conn.execute_batch("PRAGMA shrink_memory");
                }
                if advice.over_limit {
                    return Err(Error::MemoryExhausted);
                }
                if self.cancel.is_cancelled() {
                    return Ok(TableRun::Cancelled { written, skipped });
                }
            }
        }

        // Final partial batch.
        match flush_batch(conn, &task.projection.insert_sql, &mut batch) {
            Ok(n) => {
                written += n as u64;
                if let Some(r) = last_in_batch.take() {
                    committed.insert(task.projection.table_name.clone(), r);
                }
            }
            Err(e) if is_disk_full(&e) => return Err(Error::DiskFull),
            Err(e) => {
                log::warn!(
                    "write failed for table {}: {}; aborting table",
                    task.projection.table_name,
                    e
                );
                return Ok(TableRun::Failed { written, skipped });
            }
        }
        if self.cancel.is_cancelled() {
            return Ok(TableRun::Cancelled { written, skipped });
        }
        Ok(TableRun::Done {
            written,
            skipped,
            row_errors,
            aborted,
        })
    }

    fn decode_row(
        &self,
        decoder: &RecordDecoder<'_>,
        payload: &[u8],
        memos: &[Option<Vec<u8>>],
        src: &Path,
        task: &TableTask,
        record_number: u32,
    ) -> RowAction {
        match self.config.on_row_error {
            OnRowError::Partial => {
                let (row, errors) = decoder.decode_partial(payload, memos);
                for e in &errors {
                    log::warn!(
                        "{}: table {} record {}: {}",
                        src.display(),
                        task.projection.table_name,
                        record_number,
                        e
                    );
                }
                RowAction::InsertPartial(row, errors.len() as u64)
            }
            policy => match decoder.decode(payload, memos) {
                Ok(row) => RowAction::Insert(row),
                Err(e) => {
                    log::warn!(
                        "{}: table {} record {}: {}",
                        src.display(),
                        task.projection.table_name,
                        record_number,
                        e
                    );
                    if policy == OnRowError::Abort {
                        RowAction::AbortTable
                    } else {
                        RowAction::Skip
                    }
                }
            },
        }
    }

    /// Table-parallel decoding: workers decode whole tables and queue
    /// pre-decoded batches to this thread, which owns the connection.
    /// Within one table decoding stays sequential; DML order across
    /// tables is unspecified.
    #[allow(clippy::too_many_arguments)]
    fn run_tables_parallel(
        &self,
        conn: &mut Connection,
        src: &Path,
        tasks: &[TableTask],
        ddl_failed: &HashSet<usize>,
        code_page: CodePage,
        workers: usize,
        committed: &mut BTreeMap<String, u32>,
        report: &mut ConversionReport,
    ) -> Result<bool, Error> {
        let queue: Mutex<Vec<usize>> = Mutex::new(
            (0..tasks.len())
                .rev()
                .filter(|i| !ddl_failed.contains(i))
                .collect(),
        );
        for &i in ddl_failed {
            report.absorb(TableOutcome {
                table_name: tasks[i].projection.table_name.clone(),
                status: TableStatus::Failed,
                rows_written: 0,
                rows_skipped: 0,
            });
        }

        let (tx, rx) = mpsc::channel::<WorkerMsg>();
        let mut fatal: Option<Error> = None;
        let mut cancelled = false;
        // Tables that hit a write failure; later batches are discarded.
        let mut write_failed: HashSet<usize> = HashSet::new();
        let mut written_per_task: HashMap<usize, u64> = HashMap::new();

        std::thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    loop {
                        let next = queue.lock().ok().and_then(|mut q| q.pop());
                        let Some(task_idx) = next else { break };
                        decode_table_worker(
                            src,
                            tasks,
                            task_idx,
                            code_page,
                            &self.config,
                            &self.cancel,
                            &tx,
                        );
                    }
                });
            }
            drop(tx);

            for msg in rx {
                match msg {
                    WorkerMsg::Batch {
                        task_idx,
                        mut rows,
                        last_recno,
                    } => {
                        if fatal.is_some() || write_failed.contains(&task_idx) {
                            continue;
                        }
                        let task = &tasks[task_idx];
                        match flush_batch(conn, &task.projection.insert_sql, &mut rows) {
                            Ok(n) => {
                                *written_per_task.entry(task_idx).or_default() += n as u64;
                                committed
                                    .insert(task.projection.table_name.clone(), last_recno);
                            }
                            Err(e) if is_disk_full(&e) => {
                                fatal = Some(Error::DiskFull);
                                self.cancel.cancel();
                            }
                            Err(e) => {
                                log::warn!(
                                    "write failed for table {}: {}; aborting table",
                                    task.projection.table_name,
                                    e
                                );
                                write_failed.insert(task_idx);
                            }
                        }
                    }
                    WorkerMsg::TableDone {
                        task_idx,
                        skipped,
                        row_errors,
                        aborted,
                        cancelled: table_cancelled,
                        memory_fatal,
                    } => {
                        let task = &tasks[task_idx];
                        let written = *written_per_task.get(&task_idx).unwrap_or(&0);
                        if memory_fatal && fatal.is_none() {
                            fatal = Some(Error::MemoryExhausted);
                            self.cancel.cancel();
                        }
                        cancelled |= table_cancelled;
                        let status = if write_failed.contains(&task_idx) {
                            TableStatus::Failed
                        } else if table_cancelled || aborted || row_errors > 0 {
                            TableStatus::Partial
                        } else {
                            TableStatus::Ok
                        };
                        report.absorb(TableOutcome {
                            table_name: task.projection.table_name.clone(),
                            status,
                            rows_written: written,
                            rows_skipped: skipped,
                        });
                    }
                    WorkerMsg::SourceFailed { task_idx } => {
                        report.absorb(TableOutcome {
                            table_name: tasks[task_idx].projection.table_name.clone(),
                            status: TableStatus::Failed,
                            rows_written: 0,
                            rows_skipped: 0,
                        });
                    }
                }
            }
        });

        if let Some(e) = fatal {
            return Err(e);
        }
        Ok(cancelled)
    }
}

enum RowAction {
    Insert(Vec<Value>),
    InsertPartial(Vec<Value>, u64),
    Skip,
    AbortTable,
}

enum WorkerMsg {
    Batch {
        task_idx: usize,
        rows: Vec<Vec<Value>>,
        last_recno: u32,
    },
    TableDone {
        task_idx: usize,
        skipped: u64,
        row_errors: u64,
        aborted: bool,
        cancelled: bool,
        memory_fatal: bool,
    },
    SourceFailed {
        task_idx: usize,
    },
}

/// Decodes one table on a worker thread.  Each worker opens its own file
/// handle; the SQLite connection stays with the writer.
fn decode_table_worker(
    src: &Path,
    tasks: &[TableTask],
    task_idx: usize,
    code_page: CodePage,
    config: &Config,
    cancel: &CancelToken,
    tx: &mpsc::Sender<WorkerMsg>,
) {
    let task = &tasks[task_idx];
    let settings = governor::classify(config.profile, task.est_bytes);
    let mut gov = Governor::new(settings, config.memory_limit_bytes, governor::default_probe());

    let memo_map = if task.has_memos {
        match PageReader::open(src) {
            Ok(mut reader) => collect_memos(&mut reader, task.table_number),
            Err(_) => {
                let _ = tx.send(WorkerMsg::SourceFailed { task_idx });
                return;
            }
        }
    } else {
        HashMap::new()
    };
    let mut reader = match PageReader::open(src) {
        Ok(r) => r,
        Err(_) => {
            let _ = tx.send(WorkerMsg::SourceFailed { task_idx });
            return;
        }
    };

    let decoder = RecordDecoder::new(
        &task.def,
        &task.arrays,
        &task.projection.columns,
        code_page,
    );
    let mut skipped = 0_u64;
    let mut row_errors = 0_u64;
    let mut aborted = false;
    let mut was_cancelled = false;
    let mut memory_fatal = false;
    let mut batch: Vec<Vec<Value>> = Vec::new();
    let mut last_in_batch: Option<u32> = None;

    let mut records = reader.records_for_table(task.table_number);
    for rec in &mut records {
        if let Some(from) = task.resume_from {
            if rec.record_number <= from {
                continue;
            }
        }
        let memos: Vec<Option<Vec<u8>>> = (0..task.def.memos.len())
            .map(|mi| memo_map.get(&(rec.record_number, mi as u8)).cloned())
            .collect();
        match config.on_row_error {
            OnRowError::Partial => {
                let (row, errors) = decoder.decode_partial(&rec.payload, &memos);
                row_errors += errors.len() as u64;
                batch.push(row);
                last_in_batch = Some(rec.record_number);
            }
            policy => match decoder.decode(&rec.payload, &memos) {
                Ok(row) => {
                    batch.push(row);
                    last_in_batch = Some(rec.record_number);
                }
                Err(e) => {
                    log::warn!(
                        "{}: table {} record {}: {}",
                        src.display(),
                        task.projection.table_name,
                        rec.record_number,
                        e
                    );
                    row_errors += 1;
                    skipped += 1;
                    if policy == OnRowError::Abort {
                        aborted = true;
                        break;
                    }
                }
            },
        }

        if batch.len() >= gov.batch_size() {
            let rows = std::mem::take(&mut batch);
            let sent_rows = rows.len();
            let last_recno = last_in_batch.take().unwrap_or(rec.record_number);
            if tx
                .send(WorkerMsg::Batch {
                    task_idx,
                    rows,
                    last_recno,
                })
                .is_err()
            {
                return; // writer has gone away
            }
            let advice = gov.after_batch(sent_rows, 0);
            if advice.over_limit {
                memory_fatal = true;
                break;
            }
            if cancel.is_cancelled() {
                was_cancelled = true;
                break;
            }
        }
    }

    if !batch.is_empty() && !memory_fatal {
        let last_recno = last_in_batch.take();
        if let Some(last_recno) = last_recno {
            let _ = tx.send(WorkerMsg::Batch {
                task_idx,
                rows: std::mem::take(&mut batch),
                last_recno,
            });
        }
    }
    let _ = tx.send(WorkerMsg::TableDone {
        task_idx,
        skipped,
        row_errors,
        aborted,
        cancelled: was_cancelled,
        memory_fatal,
    });
}

/// Writes one batch inside its own transaction.  The batch vector is
/// cleared on success and left intact on failure (the transaction rolled
/// back, nothing half-written).
fn flush_batch(
    conn: &mut Connection,
    insert_sql: &str,
    batch: &mut Vec<Vec<Value>>,
) -> Result<usize, rusqlite::Error> {
    if batch.is_empty() {
        return Ok(0);
    }
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(insert_sql)?;
        for row in batch.iter() {
            stmt.execute(rusqlite::params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    let n = batch.len();
    batch.clear();
    Ok(n)
}

fn load_resume_points(conn: &Connection) -> Result<HashMap<String, u32>, rusqlite::Error> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = '_resume'",
        [],
        |r| r.get::<_, i64>(0).map(|n| n > 0),
    )?;
    if !exists {
        return Ok(HashMap::new());
    }
    let mut points = HashMap::new();
    let mut stmt = conn.prepare("SELECT table_name, last_record FROM _resume")?;
    let rows = stmt.query_map([], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as u32))
    })?;
    for row in rows {
        let (name, recno) = row?;
        points.insert(name, recno);
    }
    Ok(points)
}

fn write_resume_markers(
    conn: &mut Connection,
    committed: &BTreeMap<String, u32>,
) -> Result<(), rusqlite::Error> {
    conn.execute(schema::RESUME_TABLE_DDL, [])?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR REPLACE INTO _resume (table_name, last_record) VALUES (?, ?)",
        )?;
        for (name, recno) in committed {
            stmt.execute(rusqlite::params![name, *recno as i64])?;
        }
    }
    tx.commit()
}
