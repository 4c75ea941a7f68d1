use std::collections::{HashMap, HashSet};
use chrono::{DateTime, Utc};
use shared::types::ServiceRecord;

/// Result of probing one service
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    /// `None` when the model list could not be fetched
    pub models: Option<Vec<String>>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthTransition {
    BecameHealthy,
    BecameUnhealthy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// The authoritative name → record map. Owned by the registry actor.
#[derive(Debug, Default)]
pub struct ServiceStore {
    services: HashMap<String, ServiceRecord>,
}

impl ServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new record as given, or overwrite the location fields of a
    /// known one. Health state of a known record is left untouched.
    pub fn upsert(&mut self, record: ServiceRecord) -> UpsertOutcome {
        match self.services.get_mut(&record.name) {
            Some(existing) => {
                let changed = location_changed(existing, &record);
                existing.service_type = record.service_type;
                existing.address = record.address;
                existing.port = record.port;
                existing.priority = record.priority;
                existing.version = record.version;
                existing.api = record.api;
                existing.properties = record.properties;
                existing.last_seen = record.last_seen;
                if changed {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Unchanged
                }
            }
            None => {
                let mut record = record;
                record.available_models = dedup_models(record.available_models);
                self.services.insert(record.name.clone(), record);
                UpsertOutcome::Inserted
            }
        }
    }

    /// Returns true if the service was known
    pub fn remove(&mut self, name: &str) -> bool {
        self.services.remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.services.get(name).cloned()
    }

    /// Deep copy of every record, ordered by name
    pub fn snapshot(&self) -> Vec<ServiceRecord> {
        let mut records: Vec<ServiceRecord> = self.services.values().cloned().collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Apply a probe result. Results for unknown names are dropped so a
    /// removed service is never brought back by an in-flight probe.
    ///
    /// Returns `None` for unknown names. Otherwise returns the transition to
    /// report, which is only present once the record has been probed before.
    pub fn apply_probe(
        &mut self,
        name: &str,
        result: ProbeResult,
    ) -> Option<Option<HealthTransition>> {
        let record = self.services.get_mut(name)?;

        let was_healthy = record.is_healthy;
        record.is_healthy = result.healthy;
        record.last_seen = result.checked_at;

        if result.healthy {
            if let Some(models) = result.models {
                record.available_models = dedup_models(models);
            }
        }

        let transition = if record.first_probe_complete && was_healthy != result.healthy {
            Some(if result.healthy {
                HealthTransition::BecameHealthy
            } else {
                HealthTransition::BecameUnhealthy
            })
        } else {
            None
        };
        record.first_probe_complete = true;

        Some(transition)
    }
}

fn location_changed(old: &ServiceRecord, new: &ServiceRecord) -> bool {
    old.service_type != new.service_type
        || old.address != new.address
        || old.port != new.port
        || old.priority != new.priority
        || old.version != new.version
        || old.api != new.api
        || old.properties != new.properties
}

/// Keep first occurrence of each model id
fn dedup_models(models: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    models.into_iter().filter(|m| seen.insert(m.clone())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn test_record(name: &str, priority: u16) -> ServiceRecord {
        ServiceRecord::new(name, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 10)), 8080, priority)
    }

    fn probe(healthy: bool, models: Option<&[&str]>) -> ProbeResult {
        ProbeResult {
            healthy,
            models: models.map(|m| m.iter().map(|s| s.to_string()).collect()),
            checked_at: Utc::now(),
        }
    }

    #[test]
    fn test_upsert_insert_then_update() {
        let mut store = ServiceStore::new();
        assert_eq!(store.upsert(test_record("a", 10)), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(test_record("a", 10)), UpsertOutcome::Unchanged);
        assert_eq!(store.upsert(test_record("a", 20)), UpsertOutcome::Updated);
        assert_eq!(store.get("a").unwrap().priority, 20);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_upsert_keeps_health_of_known_record() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("a", 10));
        store.apply_probe("a", probe(true, Some(&["m1"])));

        let mut moved = test_record("a", 10);
        moved.port = 9090;
        store.upsert(moved);

        let record = store.get("a").unwrap();
        assert_eq!(record.port, 9090);
        assert!(record.is_healthy, "rediscovery must not reset health");
        assert_eq!(record.available_models, vec!["m1".to_string()]);
        assert!(record.first_probe_complete);
    }

    #[test]
    fn test_remove_healthy_service() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("a", 10));
        store.apply_probe("a", probe(true, Some(&["m1"])));

        assert!(store.remove("a"));
        assert!(store.get("a").is_none());
        assert!(store.snapshot().is_empty());
        assert!(!store.remove("a"));
    }

    #[test]
    fn test_probe_for_removed_service_is_dropped() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("a", 10));
        store.remove("a");

        assert_eq!(store.apply_probe("a", probe(true, Some(&["m1"]))), None);
        assert!(store.get("a").is_none());
    }

    #[test]
    fn test_first_probe_reports_no_transition() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("a", 10));

        // false -> true on the very first probe is not a transition
        assert_eq!(store.apply_probe("a", probe(true, Some(&["m1"]))), Some(None));
        assert_eq!(
            store.apply_probe("a", probe(false, None)),
            Some(Some(HealthTransition::BecameUnhealthy))
        );
        assert_eq!(store.apply_probe("a", probe(false, None)), Some(None));
        assert_eq!(
            store.apply_probe("a", probe(true, None)),
            Some(Some(HealthTransition::BecameHealthy))
        );
    }

    #[test]
    fn test_failed_probe_keeps_last_models() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("a", 10));
        store.apply_probe("a", probe(true, Some(&["m1", "m2"])));

        store.apply_probe("a", probe(false, Some(&[])));
        let record = store.get("a").unwrap();
        assert!(!record.is_healthy);
        assert_eq!(record.available_models.len(), 2);

        // healthy but the model fetch failed
        store.apply_probe("a", probe(true, None));
        assert_eq!(store.get("a").unwrap().available_models.len(), 2);
    }

    #[test]
    fn test_models_are_deduplicated_in_order() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("a", 10));
        store.apply_probe("a", probe(true, Some(&["m2", "m1", "m2"])));
        assert_eq!(
            store.get("a").unwrap().available_models,
            vec!["m2".to_string(), "m1".to_string()]
        );
    }

    #[test]
    fn test_snapshot_is_sorted_copy() {
        let mut store = ServiceStore::new();
        store.upsert(test_record("b", 10));
        store.upsert(test_record("a", 20));

        let mut snapshot = store.snapshot();
        assert_eq!(snapshot[0].name, "a");
        assert_eq!(snapshot[1].name, "b");

        snapshot[0].priority = 99;
        assert_eq!(store.get("a").unwrap().priority, 20);
    }
}
