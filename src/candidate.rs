use std::collections::BTreeSet;

use serde::Deserialize;

use crate::error::Result;
use crate::record::dedupe_key;
use crate::record::Record;
use crate::record::RecordDraft;
use crate::record::DEFAULT_CURRENCY;
use crate::record::DEFAULT_OPERATING_SYSTEM;
use crate::record::DEFAULT_REGION;
use crate::types::Money;
use crate::types::ResourceKind;
use crate::types::SourceSystem;

/// A freshly parsed row handed over by a billing/inventory parser. Every field is optional; defaults are applied when
/// the candidate becomes a [`Record`].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CandidateRecord {
    #[serde(alias = "resourceId", alias = "resource_id")]
    pub id:                  Option<String>,
    pub name:                Option<String>,
    #[serde(alias = "service", alias = "service_label")]
    pub service_label:       Option<String>,
    #[serde(alias = "resource_kind", alias = "type")]
    pub resource_kind:       Option<String>,
    #[serde(alias = "source_system", alias = "source")]
    pub source_system:       Option<SourceSystem>,
    #[serde(alias = "cpu", alias = "cpu_cores")]
    pub cpu_cores:           Option<f64>,
    #[serde(rename = "memoryGiB", alias = "memory", alias = "memory_gib")]
    pub memory_gib:          Option<f64>,
    #[serde(rename = "storageGiB", alias = "storage", alias = "storage_gib")]
    pub storage_gib:         Option<f64>,
    #[serde(alias = "cost", alias = "monthly_cost")]
    pub monthly_cost:        Option<f64>,
    pub currency:            Option<String>,
    pub region:              Option<String>,
    #[serde(alias = "os", alias = "operating_system")]
    pub operating_system:    Option<String>,
    #[serde(rename = "monthlyTrafficGiB", alias = "traffic", alias = "monthly_traffic_gib")]
    pub monthly_traffic_gib: Option<f64>,
    #[serde(alias = "dependencies", alias = "dependency_ids")]
    pub dependency_ids:      Option<Vec<String>>,
}

impl CandidateRecord {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self {
            id: Some(id.into()),
            ..Default::default()
        }
    }

    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service_label = Some(service.into());
        self
    }

    pub fn region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = Some(region.into());
        self
    }

    pub fn cost(mut self, amount: f64) -> Self {
        self.monthly_cost = Some(amount);
        self
    }

    pub fn source(mut self, source: SourceSystem) -> Self {
        self.source_system = Some(source);
        self
    }

    fn region_or_default(&self) -> &str {
        self.region
            .as_deref()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or(DEFAULT_REGION)
    }

    /// The dedupe key this candidate merges under, with the default region applied.
    pub fn dedupe_key(&self) -> Option<String> {
        dedupe_key(
            self.id.as_deref().unwrap_or_default(),
            self.service_label.as_deref().unwrap_or_default(),
            self.region_or_default(),
        )
    }

    /// The cost contribution of this candidate when merged into an existing record.
    pub fn cost_delta(&self) -> f64 {
        self.monthly_cost.unwrap_or(0.0)
    }

    /// Build a new record identified by `key`, filling in defaults for missing fields.
    pub fn to_record(&self, key: String, fallback_source: SourceSystem) -> Result<Record> {
        let resource_id = self.id.as_deref().unwrap_or_default().trim().to_string();
        let service = self.service_label.clone().unwrap_or_default();
        let resource_kind = match self.resource_kind.as_deref() {
            Some(kind) => kind.parse()?,
            None => ResourceKind::infer_from_service(&service),
        };

        Record::new(RecordDraft {
            id: key,
            name: self.name.clone().unwrap_or_else(|| resource_id.clone()),
            resource_id,
            service_label: service,
            resource_kind,
            source_system: self.source_system.unwrap_or(fallback_source),
            cpu_cores: self.cpu_cores.unwrap_or(0.0),
            memory_gib: self.memory_gib.unwrap_or(0.0),
            storage_gib: self.storage_gib.unwrap_or(0.0),
            monthly_cost: Money::new(
                self.cost_delta(),
                self.currency.clone().unwrap_or_else(|| DEFAULT_CURRENCY.to_string()),
            ),
            region: self.region_or_default().to_string(),
            operating_system: self
                .operating_system
                .clone()
                .unwrap_or_else(|| DEFAULT_OPERATING_SYSTEM.to_string()),
            monthly_traffic_gib: self.monthly_traffic_gib.unwrap_or(0.0),
            dependency_ids: self
                .dependency_ids
                .clone()
                .map(|deps| deps.into_iter().collect())
                .unwrap_or_else(BTreeSet::new),
        })
    }
}

/// Candidates parsed out of a single source file.
#[derive(Debug, Clone, Default)]
pub struct SourceFile {
    pub name:          String,
    /// Source system for candidates that don't name one themselves.
    pub source_system: Option<SourceSystem>,
    pub candidates:    Vec<CandidateRecord>,
}

impl SourceFile {
    pub fn new<S: Into<String>>(name: S, candidates: Vec<CandidateRecord>) -> Self {
        Self {
            name: name.into(),
            source_system: None,
            candidates,
        }
    }

    pub fn with_source_system(mut self, source_system: SourceSystem) -> Self {
        self.source_system = Some(source_system);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_parser_aliases() {
        let candidate: CandidateRecord = serde_json::from_str(
            r#"{"resourceId": "r1", "service": "EC2", "region": "us-east-1", "cost": 40, "source": "aws", "os": "Ubuntu"}"#,
        )
        .unwrap();
        assert_eq!(candidate.id.as_deref(), Some("r1"));
        assert_eq!(candidate.service_label.as_deref(), Some("EC2"));
        assert_eq!(candidate.monthly_cost, Some(40.0));
        assert_eq!(candidate.source_system, Some(SourceSystem::Aws));
        assert_eq!(candidate.operating_system.as_deref(), Some("Ubuntu"));
    }

    #[test]
    fn applies_defaults_when_building_record() {
        let candidate = CandidateRecord::new("vm-9").service("Virtual Machines").cost(12.0);
        let key = candidate.dedupe_key().unwrap();
        assert_eq!(key, "vm-9|virtual machines|unknown");

        let record = candidate.to_record(key.clone(), SourceSystem::Azure).unwrap();
        assert_eq!(record.id(), key);
        assert_eq!(record.resource_id(), "vm-9");
        assert_eq!(record.region(), DEFAULT_REGION);
        assert_eq!(record.operating_system(), DEFAULT_OPERATING_SYSTEM);
        assert_eq!(record.currency(), DEFAULT_CURRENCY);
        assert_eq!(record.resource_kind(), ResourceKind::Vm);
        assert_eq!(record.source_system(), SourceSystem::Azure);
    }

    #[test]
    fn missing_id_has_no_key() {
        assert_eq!(CandidateRecord::default().service("EC2").dedupe_key(), None);
    }

    #[test]
    fn invalid_fields_fail_construction() {
        let mut candidate = CandidateRecord::new("r1").cost(-3.0);
        assert!(candidate.to_record("k".into(), SourceSystem::Aws).is_err());

        candidate.monthly_cost = Some(3.0);
        candidate.resource_kind = Some("spaceship".into());
        assert!(candidate.to_record("k".into(), SourceSystem::Aws).is_err());
    }
}
