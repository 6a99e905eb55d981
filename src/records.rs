// 📄 Claim Records - Input boundary of the graph model builder
//
// A ClaimRecord is one directed (source → target, relation) observation
// with its measures. Medicaid provider-spending rows expand into one or
// two records (billed_for, plus referred_to when servicing differs).

use crate::entities::{NodeKey, RelationType};
use crate::error::{GraphError, GraphResult};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

// ============================================================================
// MALFORMED REASONS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedReason {
    EmptySourceKey,
    EmptyTargetKey,
    /// Key contains control characters
    InvalidKey,
    /// Source and target resolve to the same node
    SelfLoop,
    ZeroClaims,
    /// Paid amount is NaN or infinite
    InvalidMeasure,
    /// CSV row could not be interpreted at all
    UnparsableRow,
}

impl MalformedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            MalformedReason::EmptySourceKey => "empty_source_key",
            MalformedReason::EmptyTargetKey => "empty_target_key",
            MalformedReason::InvalidKey => "invalid_key",
            MalformedReason::SelfLoop => "self_loop",
            MalformedReason::ZeroClaims => "zero_claims",
            MalformedReason::InvalidMeasure => "invalid_measure",
            MalformedReason::UnparsableRow => "unparsable_row",
        }
    }
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// CLAIM RECORD
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// Source natural key (always a provider NPI)
    pub source_key: String,

    /// Target natural key (procedure code or provider NPI, per relation)
    pub target_key: String,

    pub relation: RelationType,

    /// Claim count (becomes the edge weight)
    pub claims: u64,

    pub paid: f64,

    pub beneficiaries: u64,

    /// First day of the service month, when known
    #[serde(default)]
    pub service_month: Option<NaiveDate>,
}

impl ClaimRecord {
    pub fn new(source_key: &str, target_key: &str, relation: RelationType, claims: u64) -> Self {
        ClaimRecord {
            source_key: source_key.to_string(),
            target_key: target_key.to_string(),
            relation,
            claims,
            paid: 0.0,
            beneficiaries: 0,
            service_month: None,
        }
    }

    pub fn billed_for(provider: &str, procedure: &str, claims: u64) -> Self {
        ClaimRecord::new(provider, procedure, RelationType::BilledFor, claims)
    }

    pub fn referred_to(billing: &str, servicing: &str, claims: u64) -> Self {
        ClaimRecord::new(billing, servicing, RelationType::ReferredTo, claims)
    }

    pub fn with_paid(mut self, paid: f64) -> Self {
        self.paid = paid;
        self
    }

    pub fn with_month(mut self, month: NaiveDate) -> Self {
        self.service_month = Some(month);
        self
    }

    pub fn source_node(&self) -> NodeKey {
        let (source_kind, _) = self.relation.endpoint_kinds();
        NodeKey::new(source_kind, &self.source_key)
    }

    pub fn target_node(&self) -> NodeKey {
        let (_, target_kind) = self.relation.endpoint_kinds();
        NodeKey::new(target_kind, &self.target_key)
    }

    /// Check the record can be folded into the graph
    pub fn validate(&self) -> GraphResult<()> {
        let source = self.source_key.trim();
        let target = self.target_key.trim();

        if source.is_empty() {
            return Err(GraphError::MalformedRecord(MalformedReason::EmptySourceKey));
        }
        if target.is_empty() {
            return Err(GraphError::MalformedRecord(MalformedReason::EmptyTargetKey));
        }
        if source.chars().any(char::is_control) || target.chars().any(char::is_control) {
            return Err(GraphError::MalformedRecord(MalformedReason::InvalidKey));
        }
        if self.source_node() == self.target_node() {
            return Err(GraphError::MalformedRecord(MalformedReason::SelfLoop));
        }
        if self.claims == 0 {
            return Err(GraphError::MalformedRecord(MalformedReason::ZeroClaims));
        }
        if !self.paid.is_finite() {
            return Err(GraphError::MalformedRecord(MalformedReason::InvalidMeasure));
        }
        Ok(())
    }
}

// ============================================================================
// MEDICAID CSV ROWS
// ============================================================================

/// Raw row of the provider spending CSV. Everything stays textual here so a
/// single bad cell rejects one row instead of the whole file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRow {
    #[serde(rename = "BILLING_PROVIDER_NPI_NUM", default)]
    pub billing_npi: String,

    #[serde(rename = "SERVICING_PROVIDER_NPI_NUM", default)]
    pub servicing_npi: String,

    #[serde(rename = "HCPCS_CODE", default)]
    pub hcpcs_code: String,

    #[serde(rename = "CLAIM_FROM_MONTH", default)]
    pub claim_month: String,

    #[serde(rename = "TOTAL_UNIQUE_BENEFICIARIES", default)]
    pub beneficiaries: String,

    #[serde(rename = "TOTAL_CLAIMS", default)]
    pub claims: String,

    #[serde(rename = "TOTAL_PAID", default)]
    pub paid: String,
}

impl ClaimRow {
    /// Expand into graph records. `None` when a measure cell is unreadable.
    pub fn into_records(self) -> Option<Vec<ClaimRecord>> {
        let claims = parse_count(&self.claims)?;
        let beneficiaries = parse_count(&self.beneficiaries)?;
        let paid = parse_amount(&self.paid)?;
        let month = parse_month(&self.claim_month);

        let billing = self.billing_npi.trim();
        let servicing = self.servicing_npi.trim();

        let mut records = vec![ClaimRecord {
            source_key: billing.to_string(),
            target_key: self.hcpcs_code.trim().to_string(),
            relation: RelationType::BilledFor,
            claims,
            paid,
            beneficiaries,
            service_month: month,
        }];

        if !servicing.is_empty() && servicing != billing {
            records.push(ClaimRecord {
                source_key: billing.to_string(),
                target_key: servicing.to_string(),
                relation: RelationType::ReferredTo,
                claims,
                paid,
                beneficiaries,
                service_month: month,
            });
        }

        Some(records)
    }
}

fn parse_count(value: &str) -> Option<u64> {
    let cleaned = value.trim().replace(',', "");
    if cleaned.is_empty() {
        return Some(0);
    }
    if let Ok(n) = cleaned.parse::<u64>() {
        return Some(n);
    }
    // Some exports write counts as "12.0"
    let float = cleaned.parse::<f64>().ok()?;
    if float.is_finite() && float >= 0.0 && float.fract() == 0.0 {
        Some(float as u64)
    } else {
        None
    }
}

fn parse_amount(value: &str) -> Option<f64> {
    let cleaned: String = value
        .trim()
        .chars()
        .filter(|c| *c != ',' && *c != '$')
        .collect();
    if cleaned.is_empty() {
        return Some(0.0);
    }
    cleaned.parse::<f64>().ok()
}

/// Accepts `YYYY-MM-DD` or `YYYY-MM`; anything else means "no month"
pub fn parse_month(value: &str) -> Option<NaiveDate> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{}-01", trimmed), "%Y-%m-%d"))
        .ok()
}

// ============================================================================
// CSV LOADER
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadReport {
    pub rows_read: u64,
    pub rows_rejected: u64,
    pub records_emitted: u64,
}

/// Load the Medicaid provider spending CSV into claim records.
/// Rows that cannot be read are skipped and counted in the report.
pub fn load_claims_csv(csv_path: &Path) -> Result<(Vec<ClaimRecord>, LoadReport)> {
    let mut rdr = csv::Reader::from_path(csv_path)
        .with_context(|| format!("Failed to open claims CSV: {}", csv_path.display()))?;

    let mut records = Vec::new();
    let mut report = LoadReport::default();

    for (line, result) in rdr.deserialize::<ClaimRow>().enumerate() {
        report.rows_read += 1;

        let expanded = match result {
            Ok(row) => row.into_records(),
            Err(e) => {
                warn!(line = line + 2, error = %e, "Skipping unreadable claims row");
                None
            }
        };

        match expanded {
            Some(rows) => {
                report.records_emitted += rows.len() as u64;
                records.extend(rows);
            }
            None => report.rows_rejected += 1,
        }
    }

    info!(
        path = %csv_path.display(),
        rows = report.rows_read,
        rejected = report.rows_rejected,
        records = report.records_emitted,
        "Loaded claims CSV"
    );

    Ok((records, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn create_test_row(billing: &str, servicing: &str, claims: &str) -> ClaimRow {
        ClaimRow {
            billing_npi: billing.to_string(),
            servicing_npi: servicing.to_string(),
            hcpcs_code: "99213".to_string(),
            claim_month: "2024-01-01".to_string(),
            beneficiaries: "4".to_string(),
            claims: claims.to_string(),
            paid: "1,250.50".to_string(),
        }
    }

    #[test]
    fn test_row_expands_to_referral_when_servicing_differs() {
        let records = create_test_row("111", "222", "12").into_records().unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].relation, RelationType::BilledFor);
        assert_eq!(records[0].target_key, "99213");
        assert_eq!(records[0].paid, 1250.50);
        assert_eq!(records[1].relation, RelationType::ReferredTo);
        assert_eq!(records[1].target_key, "222");
        assert_eq!(records[1].claims, 12);
    }

    #[test]
    fn test_row_without_distinct_servicing_is_billing_only() {
        assert_eq!(create_test_row("111", "111", "3").into_records().unwrap().len(), 1);
        assert_eq!(create_test_row("111", "", "3").into_records().unwrap().len(), 1);
    }

    #[test]
    fn test_row_with_bad_measure_is_rejected() {
        assert!(create_test_row("111", "222", "many").into_records().is_none());
    }

    #[test]
    fn test_parse_month_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 7, 1);
        assert_eq!(parse_month("2024-07-01"), expected);
        assert_eq!(parse_month("2024-07"), expected);
        assert_eq!(parse_month("July"), None);
        assert_eq!(parse_month(""), None);
    }

    #[test]
    fn test_validate_reasons() {
        let reason = |record: ClaimRecord| match record.validate() {
            Err(GraphError::MalformedRecord(reason)) => Some(reason),
            _ => None,
        };

        assert_eq!(reason(ClaimRecord::billed_for("P1", "X", 3)), None);
        assert_eq!(
            reason(ClaimRecord::billed_for("  ", "X", 3)),
            Some(MalformedReason::EmptySourceKey)
        );
        assert_eq!(
            reason(ClaimRecord::billed_for("P1", "", 3)),
            Some(MalformedReason::EmptyTargetKey)
        );
        assert_eq!(
            reason(ClaimRecord::billed_for("P\u{7}1", "X", 3)),
            Some(MalformedReason::InvalidKey)
        );
        assert_eq!(
            reason(ClaimRecord::referred_to("P1", " P1", 3)),
            Some(MalformedReason::SelfLoop)
        );
        assert_eq!(
            reason(ClaimRecord::billed_for("P1", "X", 0)),
            Some(MalformedReason::ZeroClaims)
        );
        assert_eq!(
            reason(ClaimRecord::billed_for("P1", "X", 3).with_paid(f64::NAN)),
            Some(MalformedReason::InvalidMeasure)
        );
    }

    #[test]
    fn test_same_key_different_kinds_is_not_a_self_loop() {
        // provider "99213" billing procedure "99213" links two different nodes
        assert!(ClaimRecord::billed_for("99213", "99213", 1).validate().is_ok());
    }

    #[test]
    fn test_load_claims_csv_counts_rejected_rows() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "BILLING_PROVIDER_NPI_NUM,SERVICING_PROVIDER_NPI_NUM,HCPCS_CODE,CLAIM_FROM_MONTH,TOTAL_UNIQUE_BENEFICIARIES,TOTAL_CLAIMS,TOTAL_PAID"
        )
        .unwrap();
        writeln!(file, "111,222,99213,2024-01-01,4,10,100.00").unwrap();
        writeln!(file, "111,111,J1100,2024-02,2,5,50.00").unwrap();
        writeln!(file, "333,,99213,2024-02-01,1,oops,10.00").unwrap();
        file.flush().unwrap();

        let (records, report) = load_claims_csv(file.path()).unwrap();

        assert_eq!(report.rows_read, 3);
        assert_eq!(report.rows_rejected, 1);
        assert_eq!(report.records_emitted, 3);
        assert_eq!(records.len(), 3);

        assert!(records.iter().all(|r| r.source_node() == NodeKey::provider("111")));

        println!("✅ Claims CSV loader PASSED");
    }
}
