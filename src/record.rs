//! The persisted unit of the store.
//!
//! A [`Record`] is an immutable value: it is validated when built from a [`RecordDraft`] or from a stored attribute
//! map, and every change produces a new record through one of the `with_*` methods.

use std::collections::BTreeSet;

use garde::Validate;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::error::StoreError;
use crate::types::finite;
use crate::types::Money;
use crate::types::ResourceKind;
use crate::types::SourceSystem;

pub const DEFAULT_REGION: &str = "unknown";
pub const DEFAULT_OPERATING_SYSTEM: &str = "unknown";
pub const DEFAULT_CURRENCY: &str = "USD";

/// Normalized composite identity of a resource: resource id, service label and region, trimmed, lower-cased and
/// joined with `|`. Returns `None` when the resource id is blank.
pub fn dedupe_key(resource_id: &str, service: &str, region: &str) -> Option<String> {
    let resource_id = resource_id.trim();
    if resource_id.is_empty() {
        return None;
    }
    Some(format!(
        "{}|{}|{}",
        resource_id.to_lowercase(),
        service.trim().to_lowercase(),
        region.trim().to_lowercase()
    ))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    #[garde(length(min = 1), custom(not_blank))]
    id:                  String,
    #[garde(length(min = 1), custom(not_blank))]
    resource_id:         String,
    #[garde(skip)]
    name:                String,
    #[garde(skip)]
    service_label:       String,
    #[garde(skip)]
    resource_kind:       ResourceKind,
    #[garde(skip)]
    source_system:       SourceSystem,
    #[garde(range(min = 0.0), custom(finite))]
    cpu_cores:           f64,
    #[serde(rename = "memoryGiB")]
    #[garde(range(min = 0.0), custom(finite))]
    memory_gib:          f64,
    #[serde(rename = "storageGiB")]
    #[garde(range(min = 0.0), custom(finite))]
    storage_gib:         f64,
    #[serde(flatten)]
    #[garde(dive)]
    monthly_cost:        Money,
    #[garde(skip)]
    region:              String,
    #[garde(skip)]
    operating_system:    String,
    #[serde(rename = "monthlyTrafficGiB")]
    #[garde(range(min = 0.0), custom(finite))]
    monthly_traffic_gib: f64,
    #[serde(default)]
    #[garde(skip)]
    dependency_ids:      BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    assessment:          Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    strategy:            Option<Value>,
}

fn not_blank(value: &str, _ctx: &()) -> garde::Result {
    if value.trim().is_empty() {
        Err(garde::Error::new("must not be blank"))
    }
    else {
        Ok(())
    }
}

/// Mutable field set a [`Record`] is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordDraft {
    pub id:                  String,
    pub resource_id:         String,
    pub name:                String,
    pub service_label:       String,
    pub resource_kind:       ResourceKind,
    pub source_system:       SourceSystem,
    pub cpu_cores:           f64,
    pub memory_gib:          f64,
    pub storage_gib:         f64,
    pub monthly_cost:        Money,
    pub region:              String,
    pub operating_system:    String,
    pub monthly_traffic_gib: f64,
    pub dependency_ids:      BTreeSet<String>,
}

impl RecordDraft {
    /// A draft with every optional field defaulted. `id` and `resource_id` start out equal.
    pub fn new<S: Into<String>>(id: S, source_system: SourceSystem) -> Self {
        let id = id.into();
        Self {
            resource_id: id.clone(),
            name: id.clone(),
            id,
            service_label: String::new(),
            resource_kind: ResourceKind::Application,
            source_system,
            cpu_cores: 0.0,
            memory_gib: 0.0,
            storage_gib: 0.0,
            monthly_cost: Money::new(0.0, DEFAULT_CURRENCY),
            region: DEFAULT_REGION.to_string(),
            operating_system: DEFAULT_OPERATING_SYSTEM.to_string(),
            monthly_traffic_gib: 0.0,
            dependency_ids: BTreeSet::new(),
        }
    }

    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service_label = service.into();
        self
    }

    pub fn region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = region.into();
        self
    }

    pub fn cost(mut self, amount: f64) -> Self {
        self.monthly_cost.amount = amount;
        self
    }

    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.resource_kind = kind;
        self
    }

    pub fn build(self) -> Result<Record> {
        Record::new(self)
    }
}

impl Record {
    pub fn new(draft: RecordDraft) -> Result<Self> {
        let record = Self {
            id:                  draft.id,
            resource_id:         draft.resource_id,
            name:                draft.name,
            service_label:       draft.service_label,
            resource_kind:       draft.resource_kind,
            source_system:       draft.source_system,
            cpu_cores:           draft.cpu_cores,
            memory_gib:          draft.memory_gib,
            storage_gib:         draft.storage_gib,
            monthly_cost:        draft.monthly_cost,
            region:              draft.region,
            operating_system:    draft.operating_system,
            monthly_traffic_gib: draft.monthly_traffic_gib,
            dependency_ids:      draft.dependency_ids,
            assessment:          None,
            strategy:            None,
        };
        record.check()?;
        Ok(record)
    }

    /// Rebuild a record from the plain attribute map it was stored as.
    pub fn from_attributes(attributes: Value) -> Result<Self> {
        let record: Self = serde_json::from_value(attributes)?;
        record.check()?;
        Ok(record)
    }

    /// Plain attribute map with the monthly cost as a bare number.
    pub fn to_attributes(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|report| StoreError::Validation(format!("record '{}': {report}", self.id)))
    }

    pub fn dedupe_key(&self) -> Option<String> {
        dedupe_key(&self.resource_id, &self.service_label, &self.region)
    }

    /// Copy of the record with `delta` added to its monthly cost.
    pub fn with_added_cost(&self, delta: f64) -> Result<Self> {
        let mut merged = self.clone();
        merged.monthly_cost.amount += delta;
        merged.check()?;
        Ok(merged)
    }

    pub fn with_assessment(&self, assessment: Value) -> Self {
        let mut record = self.clone();
        record.assessment = Some(assessment);
        record
    }

    pub fn with_strategy(&self, strategy: Value) -> Self {
        let mut record = self.clone();
        record.strategy = Some(strategy);
        record
    }

    pub fn with_dependencies<I, S>(&self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut record = self.clone();
        record.dependency_ids = dependencies.into_iter().map(Into::into).collect();
        record
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_label(&self) -> &str {
        &self.service_label
    }

    pub fn resource_kind(&self) -> ResourceKind {
        self.resource_kind
    }

    pub fn source_system(&self) -> SourceSystem {
        self.source_system
    }

    pub fn cpu_cores(&self) -> f64 {
        self.cpu_cores
    }

    pub fn memory_gib(&self) -> f64 {
        self.memory_gib
    }

    pub fn storage_gib(&self) -> f64 {
        self.storage_gib
    }

    pub fn monthly_cost(&self) -> f64 {
        self.monthly_cost.amount
    }

    pub fn currency(&self) -> &str {
        &self.monthly_cost.currency
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn operating_system(&self) -> &str {
        &self.operating_system
    }

    pub fn monthly_traffic_gib(&self) -> f64 {
        self.monthly_traffic_gib
    }

    pub fn dependency_ids(&self) -> &BTreeSet<String> {
        &self.dependency_ids
    }

    pub fn assessment(&self) -> Option<&Value> {
        self.assessment.as_ref()
    }

    pub fn strategy(&self) -> Option<&Value> {
        self.strategy.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn sample() -> Record {
        RecordDraft::new("i-0abc", SourceSystem::Aws)
            .service("EC2")
            .region("us-east-1")
            .cost(42.5)
            .kind(ResourceKind::Vm)
            .build()
            .unwrap()
    }

    #[test]
    fn dedupe_key_is_normalized() {
        assert_eq!(
            dedupe_key(" R1 ", "EC2", "US-East-1").as_deref(),
            Some("r1|ec2|us-east-1")
        );
        assert_eq!(dedupe_key("  ", "EC2", "us-east-1"), None);
        assert_eq!(sample().dedupe_key().as_deref(), Some("i-0abc|ec2|us-east-1"));
    }

    #[test]
    fn attributes_keep_cost_as_plain_number() {
        let record = sample()
            .with_dependencies(["db-1", "queue-7"])
            .with_assessment(json!({"complexity": 3}));
        let attrs = record.to_attributes().unwrap();

        assert_eq!(attrs["monthlyCost"], json!(42.5));
        assert_eq!(attrs["currency"], json!("USD"));
        assert_eq!(attrs["resourceKind"], json!("vm"));
        assert_eq!(attrs["memoryGiB"], json!(0.0));
        assert!(attrs.get("strategy").is_none());

        let restored = Record::from_attributes(attrs).unwrap();
        assert_eq!(restored, record);
    }

    #[test]
    fn rejects_malformed_fields() {
        let blank = RecordDraft::new("", SourceSystem::Azure).build();
        assert!(matches!(blank, Err(StoreError::Validation(_))));

        let negative = RecordDraft::new("vm-1", SourceSystem::Azure).cost(-1.0).build();
        assert!(matches!(negative, Err(StoreError::Validation(_))));

        let mut draft = RecordDraft::new("vm-1", SourceSystem::Azure);
        draft.cpu_cores = f64::NAN;
        assert!(matches!(draft.build(), Err(StoreError::Validation(_))));
    }

    #[test]
    fn rejects_stored_attributes_that_fail_validation() {
        let mut attrs = sample().to_attributes().unwrap();
        attrs["storageGiB"] = json!(-5.0);
        assert!(matches!(Record::from_attributes(attrs), Err(StoreError::Validation(_))));

        let garbage = json!({"id": "x"});
        assert!(matches!(
            Record::from_attributes(garbage),
            Err(StoreError::Serialization(_))
        ));
    }

    #[test]
    fn merging_cost_returns_new_value() {
        let record = sample();
        let merged = record.with_added_cost(7.5).unwrap();
        assert_eq!(record.monthly_cost(), 42.5);
        assert_eq!(merged.monthly_cost(), 50.0);
        assert!(record.with_added_cost(-100.0).is_err());
    }
}
