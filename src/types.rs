use std::fmt::Display;
use std::str::FromStr;

use garde::Validate;
use serde::Deserialize;
use serde::Serialize;

use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Vm,
    Database,
    Storage,
    Container,
    Function,
    Application,
}

impl ResourceKind {
    /// Best guess of the resource kind from a provider service label, e.g. `EC2` or `Azure SQL Database`.
    pub fn infer_from_service(service: &str) -> Self {
        let service = service.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| service.contains(w));

        if has(&["lambda", "function"]) {
            Self::Function
        }
        else if has(&["eks", "ecs", "aks", "fargate", "kubernetes", "container"]) {
            Self::Container
        }
        else if has(&["rds", "sql", "dynamo", "cosmos", "database", "aurora", "redis"]) {
            Self::Database
        }
        else if has(&["s3", "blob", "storage", "ebs", "efs", "glacier", "disk"]) {
            Self::Storage
        }
        else if has(&["ec2", "virtual machine", "vm", "compute"]) {
            Self::Vm
        }
        else {
            Self::Application
        }
    }
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Vm => "vm",
            Self::Database => "database",
            Self::Storage => "storage",
            Self::Container => "container",
            Self::Function => "function",
            Self::Application => "application",
        };
        f.write_str(name)
    }
}

impl FromStr for ResourceKind {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_lowercase().as_str() {
            "vm" | "virtual machine" | "instance" => Self::Vm,
            "database" | "db" => Self::Database,
            "storage" => Self::Storage,
            "container" => Self::Container,
            "function" | "serverless" => Self::Function,
            "application" | "app" => Self::Application,
            other => return Err(StoreError::Validation(format!("unknown resource kind '{other}'"))),
        })
    }
}

/// The billing system a record was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    Aws,
    Azure,
}

impl Display for SourceSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aws => f.write_str("aws"),
            Self::Azure => f.write_str("azure"),
        }
    }
}

impl FromStr for SourceSystem {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aws" | "provider-a" => Ok(Self::Aws),
            "azure" | "provider-b" => Ok(Self::Azure),
            other => Err(StoreError::Validation(format!("unknown source system '{other}'"))),
        }
    }
}

/// Monthly monetary amount. Serialized flat into the owning record as `monthlyCost` and `currency`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct Money {
    #[serde(rename = "monthlyCost")]
    #[garde(range(min = 0.0), custom(finite))]
    pub amount:   f64,
    #[garde(length(min = 1))]
    pub currency: String,
}

impl Money {
    pub fn new<S: Into<String>>(amount: f64, currency: S) -> Self {
        Self {
            amount,
            currency: currency.into(),
        }
    }
}

pub(crate) fn finite(value: &f64, _ctx: &()) -> garde::Result {
    if value.is_finite() {
        Ok(())
    }
    else {
        Err(garde::Error::new(format!("{value} is not a finite number")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressStatus {
    Loading,
    Processing,
    Persisting,
    Complete,
}

impl Display for ProgressStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Loading => f.write_str("loading"),
            Self::Processing => f.write_str("processing"),
            Self::Persisting => f.write_str("persisting"),
            Self::Complete => f.write_str("complete"),
        }
    }
}

/// Ingestion progress as reported to the caller's callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub current:      usize,
    pub total:        usize,
    pub current_item: String,
    pub percent:      f64,
    pub status:       ProgressStatus,
}

impl Progress {
    pub fn new<S: Into<String>>(current: usize, total: usize, current_item: S, status: ProgressStatus) -> Self {
        let percent = if total == 0 {
            100.0
        }
        else {
            (current as f64 / total as f64 * 100.0).min(100.0)
        };
        Self {
            current,
            total,
            current_item: current_item.into(),
            percent,
            status,
        }
    }
}

/// Aggregate outcome of one ingestion run.
///
/// Merging is additive: ingesting the same resource twice, in one run or in two, sums the monthly costs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    /// Records created by this run.
    pub new_count:       usize,
    /// Previously stored records whose cost changed.
    pub updated_count:   usize,
    /// Distinct dedupe keys seen.
    pub unique_count:    usize,
    /// Matches whose cost delta stayed within the epsilon and were not written.
    pub unchanged_count: usize,
    /// Candidates dropped for a missing key or invalid fields.
    pub skipped_count:   usize,
    /// Staged records whose immediate write failed; they stay dirty for the coalescer.
    pub failed_writes:   usize,
}

impl IngestSummary {
    /// Records accepted into the store, new or merged.
    pub fn imported(&self) -> usize {
        self.new_count + self.updated_count + self.unchanged_count
    }
}

/// Outcome of a forced flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub written: usize,
    pub deleted: usize,
    pub failed:  usize,
    pub rounds:  usize,
}

impl FlushReport {
    pub(crate) fn absorb(&mut self, other: FlushReport) {
        self.written += other.written;
        self.deleted += other.deleted;
        self.failed += other.failed;
        self.rounds += other.rounds;
    }
}
