// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Collection of per-item outcomes into a final report.

use {
    crate::{
        code_item::{CodeItem, CodeItemKind},
        error::{FailureKind, SigningFailure},
        policy::{Action, PlanEntry},
        walker::InspectionFailure,
    },
    serde::{Deserialize, Serialize},
    std::path::PathBuf,
};

/// Result of processing one item.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Outcome {
    Success,
    Failure,
    /// The run was cancelled before the item was reached.
    NotAttempted,
}

/// The outcome of one item.
#[derive(Clone, Debug, Serialize)]
pub struct ExecutionRecord {
    pub path: PathBuf,
    pub relative_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<CodeItemKind>,
    /// Absent when the item failed before an action could be decided.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    pub result: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(skip)]
    pub is_root: bool,
}

impl ExecutionRecord {
    fn for_entry(item: &CodeItem, entry: &PlanEntry, result: Outcome) -> Self {
        Self {
            path: item.path.clone(),
            relative_path: entry.path.clone(),
            kind: Some(item.kind),
            action: Some(entry.action),
            result,
            error_detail: None,
            failure_kind: None,
            warnings: entry.warnings.clone(),
            is_root: item.parent.is_none(),
        }
    }

    pub fn success(item: &CodeItem, entry: &PlanEntry) -> Self {
        Self::for_entry(item, entry, Outcome::Success)
    }

    pub fn failure(item: &CodeItem, entry: &PlanEntry, failure: SigningFailure) -> Self {
        Self {
            error_detail: Some(failure.diagnostic),
            failure_kind: Some(failure.kind),
            ..Self::for_entry(item, entry, Outcome::Failure)
        }
    }

    pub fn not_attempted(item: &CodeItem, entry: &PlanEntry) -> Self {
        Self::for_entry(item, entry, Outcome::NotAttempted)
    }

    pub fn inspection_failure(failure: &InspectionFailure) -> Self {
        Self {
            path: failure.path.clone(),
            relative_path: failure.relative_path.clone(),
            kind: None,
            action: None,
            result: Outcome::Failure,
            error_detail: Some(failure.error.to_string()),
            failure_kind: None,
            warnings: vec![],
            is_root: failure.relative_path.is_empty(),
        }
    }
}

/// Overall result of signing one root.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverallStatus {
    FullySigned,
    PartiallySigned,
    Failed,
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::FullySigned => "fully signed",
            Self::PartiallySigned => "partially signed",
            Self::Failed => "failed",
        })
    }
}

/// Accumulates [ExecutionRecord]s for one root.
pub struct ReportAggregator {
    root: PathBuf,
    records: Vec<ExecutionRecord>,
    cancelled: bool,
}

impl ReportAggregator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            records: vec![],
            cancelled: false,
        }
    }

    pub fn record(&mut self, record: ExecutionRecord) {
        self.records.push(record);
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    /// Compute the overall status and freeze the records.
    pub fn finish(self) -> Report {
        let successes = self
            .records
            .iter()
            .filter(|r| r.result == Outcome::Success)
            .count();
        let all_succeeded = successes == self.records.len();
        let root_failed = self
            .records
            .iter()
            .any(|r| r.is_root && r.result != Outcome::Success);

        let status = if all_succeeded {
            OverallStatus::FullySigned
        } else if self.cancelled {
            if successes > 0 {
                OverallStatus::PartiallySigned
            } else {
                OverallStatus::Failed
            }
        } else if root_failed || successes == 0 {
            OverallStatus::Failed
        } else {
            OverallStatus::PartiallySigned
        };

        Report {
            root: self.root,
            status,
            cancelled: self.cancelled,
            records: self.records,
        }
    }
}

/// The final, immutable outcome of signing one root.
#[derive(Clone, Debug, Serialize)]
pub struct Report {
    pub root: PathBuf,
    pub status: OverallStatus,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
    pub records: Vec<ExecutionRecord>,
}

impl Report {
    pub fn records(&self) -> &[ExecutionRecord] {
        &self.records
    }

    pub fn count(&self, outcome: Outcome) -> usize {
        self.records.iter().filter(|r| r.result == outcome).count()
    }

    /// Number of items whose signature was actually written.
    pub fn signed_count(&self) -> usize {
        self.records
            .iter()
            .filter(|r| r.result == Outcome::Success && r.action.map(|a| a.writes()).unwrap_or(false))
            .count()
    }

    pub fn is_fully_signed(&self) -> bool {
        self.status == OverallStatus::FullySigned
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "{}: {} ({} signed, {} skipped, {} failed{})",
            self.root.display(),
            self.status,
            self.signed_count(),
            self.records
                .iter()
                .filter(|r| r.action == Some(Action::SkipAlreadyValid))
                .count(),
            self.count(Outcome::Failure),
            if self.cancelled {
                format!(", {} not attempted", self.count(Outcome::NotAttempted))
            } else {
                String::new()
            }
        )?;

        for record in &self.records {
            let label = match (record.result, record.action) {
                (Outcome::Success, Some(Action::SkipAlreadyValid)) => "skipped",
                (Outcome::Success, _) => "signed",
                (Outcome::Failure, _) => "FAILED",
                (Outcome::NotAttempted, _) => "not attempted",
            };

            write!(f, "  {:<14} {}", label, record.relative_path)?;
            if let Some(detail) = &record.error_detail {
                write!(f, ": {}", detail.trim())?;
            }
            writeln!(f)?;

            for warning in &record.warnings {
                writeln!(f, "  {:<14}   warning: {}", "", warning)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::{
            code_item::{testutil::item, SignatureState},
            error::InspectionError,
        },
    };

    fn entry(item: &CodeItem, action: Action) -> PlanEntry {
        PlanEntry {
            item: 0,
            path: item.display_name(),
            kind: item.kind,
            action,
            warnings: vec![],
        }
    }

    fn root() -> CodeItem {
        item("Foo.app", CodeItemKind::ApplicationBundle, SignatureState::Absent)
    }

    fn helper() -> CodeItem {
        let mut item = item(
            "Foo.app/Contents/Helpers/Helper.app",
            CodeItemKind::ApplicationBundle,
            SignatureState::Absent,
        );
        item.parent = Some(0);
        item
    }

    #[test]
    fn fully_signed() {
        let root = root();
        let helper = helper();

        let mut aggregator = ReportAggregator::new("Foo.app");
        aggregator.record(ExecutionRecord::success(
            &helper,
            &entry(&helper, Action::SkipAlreadyValid),
        ));
        aggregator.record(ExecutionRecord::success(
            &root,
            &entry(&root, Action::SignWithTargetIdentity),
        ));
        let report = aggregator.finish();

        assert_eq!(report.status, OverallStatus::FullySigned);
        assert_eq!(report.signed_count(), 1);
        assert_eq!(
            report.to_string(),
            "Foo.app: fully signed (1 signed, 1 skipped, 0 failed)\n  \
             skipped        Contents/Helpers/Helper.app\n  \
             signed         Foo.app\n"
        );
    }

    #[test]
    fn partial_and_failed() {
        let root = root();
        let helper = helper();
        let failure = SigningFailure::from_diagnostic(
            "Helper.app: resource fork, Finder information, or similar detritus not allowed",
        );

        let mut aggregator = ReportAggregator::new("Foo.app");
        aggregator.record(ExecutionRecord::failure(
            &helper,
            &entry(&helper, Action::SignWithTargetIdentity),
            failure.clone(),
        ));
        aggregator.record(ExecutionRecord::success(
            &root,
            &entry(&root, Action::SignWithTargetIdentity),
        ));
        let report = aggregator.finish();
        assert_eq!(report.status, OverallStatus::PartiallySigned);
        assert_eq!(report.records()[0].failure_kind, Some(FailureKind::Detritus));
        assert_eq!(
            report.records()[0].error_detail.as_deref(),
            Some(failure.diagnostic.as_str())
        );

        let mut aggregator = ReportAggregator::new("Foo.app");
        aggregator.record(ExecutionRecord::success(
            &helper,
            &entry(&helper, Action::SignWithTargetIdentity),
        ));
        aggregator.record(ExecutionRecord::failure(
            &root,
            &entry(&root, Action::SignWithTargetIdentity),
            failure,
        ));
        assert_eq!(aggregator.finish().status, OverallStatus::Failed);
    }

    #[test]
    fn root_inspection_failure() {
        let mut aggregator = ReportAggregator::new("Foo.app");
        aggregator.record(ExecutionRecord::inspection_failure(&InspectionFailure {
            path: "Foo.app".into(),
            relative_path: String::new(),
            error: InspectionError::Tool("boom".into()),
        }));

        let report = aggregator.finish();
        assert_eq!(report.status, OverallStatus::Failed);
        assert_eq!(report.records()[0].action, None);
    }

    #[test]
    fn cancelled() {
        let root = root();
        let helper = helper();

        let mut aggregator = ReportAggregator::new("Foo.app");
        aggregator.record(ExecutionRecord::success(
            &helper,
            &entry(&helper, Action::SignWithTargetIdentity),
        ));
        aggregator.record(ExecutionRecord::not_attempted(
            &root,
            &entry(&root, Action::SignWithTargetIdentity),
        ));
        aggregator.mark_cancelled();
        let report = aggregator.finish();

        assert_eq!(report.status, OverallStatus::PartiallySigned);
        assert_eq!(report.count(Outcome::NotAttempted), 1);

        let yaml = serde_yaml::to_string(&report).unwrap();
        assert!(yaml.contains("status: partially-signed"));
        assert!(yaml.contains("cancelled: true"));
        assert!(yaml.contains("result: not-attempted"));
    }
}
