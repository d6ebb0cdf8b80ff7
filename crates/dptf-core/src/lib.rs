//! Core domain model for the daily procurement tender report.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "dptf-core";

/// Origin prepended to relative detail links found in result rows.
pub const SOURCE_BASE_ORIGIN: &str = "https://web.pcc.gov.tw";

/// Search endpoint of the external procurement source.
pub const SEARCH_ENDPOINT: &str =
    "https://web.pcc.gov.tw/prkms/tender/common/proctrg/readTenderProctrg";

/// Sentinel stored when a row's title cell is missing or empty.
pub const TITLE_SENTINEL: &str = "[no title]";

/// Sentinel stored when no tender number can be read from a row.
/// Counts as a valid natural key; duplicate sentinel rows collapse together.
pub const TENDER_NO_SENTINEL: &str = "[no tender number]";

/// Which level of the procurement classification taxonomy a code belongs to.
/// Determines the query parameter slot the code occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HierarchyPosition {
    Level2,
    Level3,
}

/// One fixed classification filter used to query the external source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCondition {
    pub classification_code: String,
    pub hierarchy_position: HierarchyPosition,
    pub description: String,
}

impl SearchCondition {
    pub fn new(
        classification_code: impl Into<String>,
        hierarchy_position: HierarchyPosition,
        description: impl Into<String>,
    ) -> Self {
        Self {
            classification_code: classification_code.into(),
            hierarchy_position,
            description: description.into(),
        }
    }
}

/// The five classification filters queried on every run.
pub fn default_conditions() -> Vec<SearchCondition> {
    vec![
        SearchCondition::new(
            "50003065",
            HierarchyPosition::Level3,
            "842 software implementation services",
        ),
        SearchCondition::new(
            "50003066",
            HierarchyPosition::Level3,
            "843 data processing services",
        ),
        SearchCondition::new("50003067", HierarchyPosition::Level3, "844 database services"),
        SearchCondition::new(
            "50003069",
            HierarchyPosition::Level3,
            "849 other computer services",
        ),
        SearchCondition::new(
            "128",
            HierarchyPosition::Level2,
            "452 computers, parts and accessories",
        ),
    ]
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("search condition list is empty")]
    NoConditions,
    #[error("search condition {index} has an empty classification code")]
    EmptyCode { index: usize },
    #[error("search condition {index} has a non-numeric classification code: {code:?}")]
    NonNumericCode { index: usize, code: String },
}

/// Startup validation of the configured condition list. Fatal before any
/// request is served; per-request query building cannot fail afterwards.
pub fn validate_conditions(conditions: &[SearchCondition]) -> Result<(), ConfigError> {
    if conditions.is_empty() {
        return Err(ConfigError::NoConditions);
    }
    for (index, condition) in conditions.iter().enumerate() {
        if condition.classification_code.is_empty() {
            return Err(ConfigError::EmptyCode { index });
        }
        if !condition
            .classification_code
            .chars()
            .all(|c| c.is_ascii_digit())
        {
            return Err(ConfigError::NonNumericCode {
                index,
                code: condition.classification_code.clone(),
            });
        }
    }
    Ok(())
}

/// Fully-specified query against the external source for one condition
/// and one target day. Parameter order is preserved and empty values are
/// significant: the source distinguishes an absent slot from an empty one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenderQuery {
    pub endpoint: String,
    pub params: Vec<(String, String)>,
}

impl TenderQuery {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// Builds the query for one condition. Pure; cannot fail for a validated
/// condition. The target date is encoded as a single-day range.
pub fn build_query(condition: &SearchCondition, target_date: NaiveDate) -> TenderQuery {
    let mut params: Vec<(String, String)> = vec![
        ("pageSize".into(), "100".into()),
        ("firstSearch".into(), "false".into()),
        ("searchType".into(), "tpam".into()),
        ("isBinding".into(), "N".into()),
        ("isLogIn".into(), "N".into()),
        ("level_1".into(), "on".into()),
        ("tenderStatus".into(), "TENDER_STATUS_0".into()),
        ("tenderWay".into(), "TENDER_WAY_ALL_DECLARATION".into()),
    ];

    match condition.hierarchy_position {
        HierarchyPosition::Level3 => {
            params.push(("proctrgCode1".into(), String::new()));
            params.push(("proctrgCode2".into(), String::new()));
            params.push(("radProctrgCate".into(), "RAD_PROCTRG_CATE_3".into()));
            params.push(("proctrgCode3".into(), condition.classification_code.clone()));
        }
        HierarchyPosition::Level2 => {
            params.push(("proctrgCode1".into(), String::new()));
            params.push(("radProctrgCate".into(), "RAD_PROCTRG_CATE_2".into()));
            params.push(("proctrgCode2".into(), condition.classification_code.clone()));
            params.push(("proctrgCode3".into(), String::new()));
        }
    }

    let day = target_date.format("%Y/%m/%d").to_string();
    params.push(("dateType".into(), "isDate".into()));
    params.push(("tenderStartDate".into(), day.clone()));
    params.push(("tenderEndDate".into(), day));

    TenderQuery {
        endpoint: SEARCH_ENDPOINT.to_string(),
        params,
    }
}

/// Canonical extracted tender. All fields are whitespace-trimmed strings;
/// the source values are free-form, so no numeric or date parsing happens
/// here. `tender_number` is the sole identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderRecord {
    pub title: String,
    pub detail_link: String,
    pub tender_number: String,
    pub agency: String,
    pub category: String,
    pub announce_date: String,
    pub deadline_date: String,
    pub budget: String,
    pub source_condition: String,
}

/// Per-condition execution outcome, one per configured condition in
/// configuration order. `row_count` counts raw rows seen before dedup;
/// `skipped_row_count` counts rows rejected for missing the cell minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionDiagnostic {
    pub code: String,
    pub hierarchy_position: HierarchyPosition,
    pub description: String,
    pub row_count: usize,
    pub skipped_row_count: usize,
    pub succeeded: bool,
    pub message: String,
}

/// Final unified report for one orchestrator run. Individual condition
/// failures never flip `succeeded`; only a catastrophic run failure does,
/// and even then partial records and diagnostics are preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenderReport {
    pub run_id: Uuid,
    pub succeeded: bool,
    pub target_date: NaiveDate,
    pub timestamp: DateTime<Utc>,
    pub total_record_count: usize,
    pub unique_agency_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_message: Option<String>,
    pub records: Vec<TenderRecord>,
    pub diagnostics: Vec<ConditionDiagnostic>,
}
