//! Multi-condition query orchestration, row normalization, and dedup.
//!
//! The orchestrator runs the configured search conditions sequentially
//! against one fetch session, normalizes every result row into a
//! [`TenderRecord`], merges records into an insertion-ordered dedup store
//! keyed by tender number, and assembles one unified report with a
//! diagnostic per condition. A failing condition never aborts the run;
//! only losing the fetch capability itself does, and even then partial
//! results are returned.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use dptf_core::{
    build_query, default_conditions, validate_conditions, ConditionDiagnostic, ConfigError,
    SearchCondition, TenderRecord, TenderReport, SOURCE_BASE_ORIGIN, TENDER_NO_SENTINEL,
    TITLE_SENTINEL,
};
use dptf_fetch::{RawRow, TableFetcher, TableSession, MIN_ROW_CELLS};
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "dptf-engine";

const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Process-wide engine configuration, read once at startup and read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub conditions: Vec<SearchCondition>,
    pub fetch_timeout: Duration,
}

impl EngineConfig {
    /// Default condition list plus environment overrides. Condition
    /// validation failures are fatal here, before any request is served.
    pub fn from_env() -> Result<Self, ConfigError> {
        let conditions = default_conditions();
        validate_conditions(&conditions)?;
        let fetch_timeout = std::env::var("DPTF_FETCH_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS));
        Ok(Self {
            conditions,
            fetch_timeout,
        })
    }

    pub fn with_conditions(conditions: Vec<SearchCondition>) -> Result<Self, ConfigError> {
        validate_conditions(&conditions)?;
        Ok(Self {
            conditions,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        })
    }
}

/// A field that fell back to a sentinel or empty value during extraction.
/// Kept out of the report; surfaced to logs so degradation stays visible
/// without changing the success path's shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldNote {
    pub field: &'static str,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub record: TenderRecord,
    pub notes: Vec<FieldNote>,
}

/// Normalizes one raw row into a canonical record. Total for any row that
/// meets the cell minimum: missing sub-elements degrade to sentinels (title,
/// tender number) or empty strings (non-identifying fields) instead of
/// failing. Returns `None` only when the row is below the cell minimum,
/// which the caller counts as a skipped row.
pub fn extract_record(row: &RawRow, source_condition: &str) -> Option<Extraction> {
    if row.cells.len() < MIN_ROW_CELLS {
        return None;
    }

    let mut notes = Vec::new();

    let (title, detail_link) = match &row.title_link {
        Some(link) => {
            let title = link.text.trim();
            let title = if title.is_empty() {
                notes.push(FieldNote {
                    field: "title",
                    note: "title anchor empty".to_string(),
                });
                TITLE_SENTINEL.to_string()
            } else {
                title.to_string()
            };
            (title, absolutize_link(link.href.trim()))
        }
        None => {
            notes.push(FieldNote {
                field: "title",
                note: "title anchor missing".to_string(),
            });
            (TITLE_SENTINEL.to_string(), String::new())
        }
    };

    // The tender number is the first line of the multi-line title cell.
    let tender_number = row.cells[0]
        .lines()
        .next()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| {
            notes.push(FieldNote {
                field: "tender_number",
                note: "title cell has no first line".to_string(),
            });
            TENDER_NO_SENTINEL.to_string()
        });

    let positional = |index: usize| {
        row.cells
            .get(index)
            .map(|cell| cell.trim().to_string())
            .unwrap_or_default()
    };

    Some(Extraction {
        record: TenderRecord {
            title,
            detail_link,
            tender_number,
            agency: positional(1),
            category: positional(4),
            announce_date: positional(6),
            deadline_date: positional(7),
            budget: positional(8),
            source_condition: source_condition.to_string(),
        },
        notes,
    })
}

fn absolutize_link(href: &str) -> String {
    if href.is_empty() || href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else {
        format!("{SOURCE_BASE_ORIGIN}{href}")
    }
}

/// Insertion-ordered tender-number → record map. First insert wins; later
/// duplicates are dropped, not merged. Ordering is explicit (vector plus
/// index) so the report stays deterministic for a deterministic row stream.
#[derive(Debug, Default)]
pub struct DedupStore {
    index: HashMap<String, usize>,
    records: Vec<TenderRecord>,
}

impl DedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_if_absent(&mut self, record: TenderRecord) -> bool {
        if self.index.contains_key(&record.tender_number) {
            return false;
        }
        self.index
            .insert(record.tender_number.clone(), self.records.len());
        self.records.push(record);
        true
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[TenderRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<TenderRecord> {
        self.records
    }
}

/// Runs one search condition end-to-end: build query, fetch rows, extract
/// and merge each row. Any fetch failure is captured in the diagnostic and
/// isolated from the rest of the run.
pub async fn run_condition(
    session: &mut dyn TableSession,
    condition: &SearchCondition,
    target_date: NaiveDate,
    fetch_timeout: Duration,
    store: &mut DedupStore,
) -> ConditionDiagnostic {
    info!(
        code = %condition.classification_code,
        description = %condition.description,
        "running search condition"
    );

    let query = build_query(condition, target_date);
    let mut diagnostic = ConditionDiagnostic {
        code: condition.classification_code.clone(),
        hierarchy_position: condition.hierarchy_position,
        description: condition.description.clone(),
        row_count: 0,
        skipped_row_count: 0,
        succeeded: false,
        message: String::new(),
    };

    let rows = match session.fetch_rows(&query, fetch_timeout).await {
        Ok(rows) => rows,
        Err(err) => {
            warn!(
                code = %condition.classification_code,
                error = %err,
                "search condition failed"
            );
            diagnostic.message = format!("search failed: {err}");
            return diagnostic;
        }
    };

    if rows.is_empty() {
        diagnostic.succeeded = true;
        diagnostic.message = "no tenders matched the condition".to_string();
        return diagnostic;
    }

    diagnostic.row_count = rows.len();
    for row in &rows {
        match extract_record(row, &condition.description) {
            Some(extraction) => {
                for note in &extraction.notes {
                    warn!(
                        code = %condition.classification_code,
                        field = note.field,
                        note = %note.note,
                        "degraded field during extraction"
                    );
                }
                store.insert_if_absent(extraction.record);
            }
            None => {
                warn!(
                    code = %condition.classification_code,
                    cells = row.cells.len(),
                    "row below minimum cell count, skipping"
                );
                diagnostic.skipped_row_count += 1;
            }
        }
    }

    diagnostic.succeeded = true;
    diagnostic.message = format!("fetched {} result rows", diagnostic.row_count);
    diagnostic
}

/// Runs every configured condition in order and assembles the final report.
/// The fetch session is scoped to this run and closed on every exit path.
pub async fn run_report(
    fetcher: &dyn TableFetcher,
    config: &EngineConfig,
    target_date: NaiveDate,
) -> TenderReport {
    let run_id = Uuid::new_v4();
    let timestamp = Utc::now();
    let mut store = DedupStore::new();
    let mut diagnostics = Vec::with_capacity(config.conditions.len());

    info!(%run_id, %target_date, conditions = config.conditions.len(), "starting tender run");

    let mut session = match fetcher.open_session().await {
        Ok(session) => session,
        Err(err) => {
            error!(%run_id, error = %err, "could not open fetch session");
            return assemble_report(
                run_id,
                target_date,
                timestamp,
                false,
                Some(format!("run failed: {err}")),
                store,
                diagnostics,
            );
        }
    };

    for condition in &config.conditions {
        let diagnostic = run_condition(
            session.as_mut(),
            condition,
            target_date,
            config.fetch_timeout,
            &mut store,
        )
        .await;
        diagnostics.push(diagnostic);
    }

    session.close().await;

    info!(
        %run_id,
        unique_records = store.len(),
        "tender run complete"
    );
    assemble_report(run_id, target_date, timestamp, true, None, store, diagnostics)
}

fn assemble_report(
    run_id: Uuid,
    target_date: NaiveDate,
    timestamp: chrono::DateTime<Utc>,
    succeeded: bool,
    failure_message: Option<String>,
    store: DedupStore,
    diagnostics: Vec<ConditionDiagnostic>,
) -> TenderReport {
    let records = store.into_records();
    let unique_agency_count = records
        .iter()
        .map(|record| record.agency.as_str())
        .collect::<HashSet<_>>()
        .len();
    TenderReport {
        run_id,
        succeeded,
        target_date,
        timestamp,
        total_record_count: records.len(),
        unique_agency_count,
        failure_message,
        records,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use dptf_core::HierarchyPosition;
    use dptf_fetch::{FetchError, RawLink};

    fn mk_row(tender_no: &str, title: &str, agency: &str) -> RawRow {
        let cells = vec![
            format!("{tender_no}\ncorrection notice"),
            agency.to_string(),
            "unit".to_string(),
            "type".to_string(),
            "open tender".to_string(),
            "first".to_string(),
            "115/03/05".to_string(),
            "115/03/19".to_string(),
            "1,000,000".to_string(),
        ];
        RawRow {
            cells,
            title_link: Some(RawLink {
                text: title.to_string(),
                href: format!("/tps/detail?pk={tender_no}"),
            }),
        }
    }

    fn mk_condition(code: &str, description: &str) -> SearchCondition {
        SearchCondition::new(code, HierarchyPosition::Level3, description)
    }

    fn target_date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 5).unwrap()
    }

    enum Scripted {
        Rows(Vec<RawRow>),
        Fail(String),
    }

    struct ScriptedFetcher {
        script: Mutex<Option<VecDeque<Scripted>>>,
        fail_open: bool,
        closed: Arc<AtomicBool>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(Some(script.into())),
                fail_open: false,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn failing_open() -> Self {
            Self {
                script: Mutex::new(Some(VecDeque::new())),
                fail_open: true,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl TableFetcher for ScriptedFetcher {
        async fn open_session(&self) -> Result<Box<dyn TableSession>, FetchError> {
            if self.fail_open {
                return Err(FetchError::SessionUnavailable(
                    "browser mechanism did not start".to_string(),
                ));
            }
            let script = self
                .script
                .lock()
                .unwrap()
                .take()
                .expect("session opened once");
            Ok(Box::new(ScriptedSession {
                script,
                closed: Arc::clone(&self.closed),
            }))
        }
    }

    struct ScriptedSession {
        script: VecDeque<Scripted>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TableSession for ScriptedSession {
        async fn fetch_rows(
            &mut self,
            _query: &dptf_core::TenderQuery,
            _timeout: Duration,
        ) -> Result<Vec<RawRow>, FetchError> {
            match self.script.pop_front() {
                Some(Scripted::Rows(rows)) => Ok(rows),
                Some(Scripted::Fail(message)) => Err(FetchError::Message(message)),
                None => Ok(Vec::new()),
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn config_for(conditions: Vec<SearchCondition>) -> EngineConfig {
        EngineConfig {
            conditions,
            fetch_timeout: Duration::from_millis(50),
        }
    }

    #[test]
    fn extraction_reads_positional_cells_and_first_line_tender_number() {
        let row = mk_row("NO-2026-001", "Cloud platform maintenance", "Ministry of Examples");
        let extraction = extract_record(&row, "842 software implementation services").unwrap();
        let record = extraction.record;

        assert_eq!(record.tender_number, "NO-2026-001");
        assert_eq!(record.title, "Cloud platform maintenance");
        assert_eq!(
            record.detail_link,
            "https://web.pcc.gov.tw/tps/detail?pk=NO-2026-001"
        );
        assert_eq!(record.agency, "Ministry of Examples");
        assert_eq!(record.category, "open tender");
        assert_eq!(record.announce_date, "115/03/05");
        assert_eq!(record.deadline_date, "115/03/19");
        assert_eq!(record.budget, "1,000,000");
        assert_eq!(record.source_condition, "842 software implementation services");
        assert!(extraction.notes.is_empty());
    }

    #[test]
    fn extraction_keeps_absolute_links_untouched() {
        let mut row = mk_row("NO-1", "t", "a");
        row.title_link = Some(RawLink {
            text: "t".to_string(),
            href: "https://elsewhere.example/detail".to_string(),
        });
        let record = extract_record(&row, "c").unwrap().record;
        assert_eq!(record.detail_link, "https://elsewhere.example/detail");
    }

    #[test]
    fn row_below_cell_minimum_is_rejected() {
        let mut row = mk_row("NO-1", "t", "a");
        row.cells.truncate(6);
        assert!(extract_record(&row, "c").is_none());
    }

    #[test]
    fn empty_title_cell_degrades_to_sentinels_with_notes() {
        let mut row = mk_row("NO-1", "t", "a");
        row.title_link = None;
        row.cells[0] = "   ".to_string();

        let extraction = extract_record(&row, "c").unwrap();
        assert_eq!(extraction.record.title, TITLE_SENTINEL);
        assert_eq!(extraction.record.tender_number, TENDER_NO_SENTINEL);
        assert_eq!(extraction.record.detail_link, "");
        let noted: Vec<_> = extraction.notes.iter().map(|n| n.field).collect();
        assert_eq!(noted, vec!["title", "tender_number"]);
    }

    #[test]
    fn dedup_store_keeps_first_record_and_insertion_order() {
        let mut store = DedupStore::new();
        let first = extract_record(&mk_row("T1", "first", "A"), "X").unwrap().record;
        let dup = extract_record(&mk_row("T1", "second", "B"), "Y").unwrap().record;
        let other = extract_record(&mk_row("T2", "third", "C"), "Y").unwrap().record;

        assert!(store.insert_if_absent(first));
        assert!(!store.insert_if_absent(dup));
        assert!(store.insert_if_absent(other));

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].tender_number, "T1");
        assert_eq!(records[0].title, "first");
        assert_eq!(records[0].source_condition, "X");
        assert_eq!(records[1].tender_number, "T2");
    }

    #[tokio::test]
    async fn two_condition_scenario_dedups_across_conditions() {
        let fetcher = ScriptedFetcher::new(vec![
            Scripted::Rows(vec![
                mk_row("T1", "row a", "Agency A"),
                mk_row("T1", "row b", "Agency B"),
            ]),
            Scripted::Rows(vec![mk_row("T2", "row c", "Agency C")]),
        ]);
        let config = config_for(vec![mk_condition("1001", "X"), mk_condition("1002", "Y")]);

        let report = run_report(&fetcher, &config, target_date()).await;

        assert!(report.succeeded);
        assert_eq!(report.total_record_count, 2);
        assert_eq!(report.records[0].tender_number, "T1");
        assert_eq!(report.records[0].title, "row a");
        assert_eq!(report.records[0].source_condition, "X");
        assert_eq!(report.records[1].tender_number, "T2");
        assert_eq!(report.records[1].source_condition, "Y");

        assert_eq!(report.diagnostics.len(), 2);
        assert!(report.diagnostics[0].succeeded);
        assert_eq!(report.diagnostics[0].row_count, 2);
        assert!(report.diagnostics[1].succeeded);
        assert_eq!(report.diagnostics[1].row_count, 1);

        assert!(fetcher.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn failing_condition_is_isolated_and_diagnostics_stay_complete() {
        let fetcher = ScriptedFetcher::new(vec![
            Scripted::Rows(vec![mk_row("T1", "a", "A")]),
            Scripted::Fail("connection reset".to_string()),
            Scripted::Rows(vec![mk_row("T2", "b", "B")]),
            Scripted::Rows(vec![]),
            Scripted::Rows(vec![mk_row("T3", "c", "C")]),
        ]);
        let config = config_for(
            (1..=5)
                .map(|i| mk_condition(&format!("100{i}"), &format!("condition {i}")))
                .collect(),
        );

        let report = run_report(&fetcher, &config, target_date()).await;

        assert!(report.succeeded, "condition failure must not fail the run");
        assert_eq!(report.diagnostics.len(), 5);
        assert!(!report.diagnostics[1].succeeded);
        assert!(report.diagnostics[1].message.contains("connection reset"));
        for index in [0, 2, 3, 4] {
            assert!(report.diagnostics[index].succeeded, "diagnostic {index}");
        }
        assert_eq!(report.total_record_count, 3);
        assert!(fetcher.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn empty_result_is_success_with_explanatory_message() {
        let fetcher = ScriptedFetcher::new(vec![Scripted::Rows(vec![])]);
        let config = config_for(vec![mk_condition("1001", "X")]);

        let report = run_report(&fetcher, &config, target_date()).await;

        assert!(report.succeeded);
        let diagnostic = &report.diagnostics[0];
        assert!(diagnostic.succeeded);
        assert_eq!(diagnostic.row_count, 0);
        assert_eq!(diagnostic.message, "no tenders matched the condition");
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn malformed_rows_are_counted_as_skipped() {
        let mut short = mk_row("T9", "short", "A");
        short.cells.truncate(6);
        let fetcher = ScriptedFetcher::new(vec![Scripted::Rows(vec![
            short,
            mk_row("T1", "a", "A"),
        ])]);
        let config = config_for(vec![mk_condition("1001", "X")]);

        let report = run_report(&fetcher, &config, target_date()).await;

        let diagnostic = &report.diagnostics[0];
        assert!(diagnostic.succeeded);
        assert_eq!(diagnostic.row_count, 2);
        assert_eq!(diagnostic.skipped_row_count, 1);
        assert_eq!(report.total_record_count, 1);
    }

    #[tokio::test]
    async fn unique_agency_count_ignores_duplicate_agencies() {
        let fetcher = ScriptedFetcher::new(vec![Scripted::Rows(vec![
            mk_row("T1", "a", "A"),
            mk_row("T2", "b", "B"),
            mk_row("T3", "c", "A"),
            mk_row("T4", "d", "C"),
        ])]);
        let config = config_for(vec![mk_condition("1001", "X")]);

        let report = run_report(&fetcher, &config, target_date()).await;

        assert_eq!(report.total_record_count, 4);
        assert_eq!(report.unique_agency_count, 3);
    }

    #[tokio::test]
    async fn session_open_failure_is_catastrophic_but_partial_report_returns() {
        let fetcher = ScriptedFetcher::failing_open();
        let config = config_for(vec![mk_condition("1001", "X"), mk_condition("1002", "Y")]);

        let report = run_report(&fetcher, &config, target_date()).await;

        assert!(!report.succeeded);
        let message = report.failure_message.as_deref().unwrap();
        assert!(message.contains("browser mechanism did not start"));
        assert!(report.records.is_empty());
        assert!(report.diagnostics.is_empty());
        assert_eq!(report.total_record_count, 0);
        assert_eq!(report.unique_agency_count, 0);
    }

    #[tokio::test]
    async fn sequential_runs_are_deterministic() {
        let script = || {
            ScriptedFetcher::new(vec![
                Scripted::Rows(vec![mk_row("T2", "b", "B"), mk_row("T1", "a", "A")]),
                Scripted::Rows(vec![mk_row("T3", "c", "C")]),
            ])
        };
        let config = config_for(vec![mk_condition("1001", "X"), mk_condition("1002", "Y")]);

        let first = run_report(&script(), &config, target_date()).await;
        let second = run_report(&script(), &config, target_date()).await;

        let keys = |report: &TenderReport| {
            report
                .records
                .iter()
                .map(|r| r.tender_number.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(keys(&first), vec!["T2", "T1", "T3"]);
        assert_eq!(keys(&first), keys(&second));
        assert_eq!(
            first.diagnostics.iter().map(|d| &d.code).collect::<Vec<_>>(),
            second.diagnostics.iter().map(|d| &d.code).collect::<Vec<_>>()
        );
    }
}
