use sha2::{Sha256, Digest};
use shared::types::ServiceRecord;

/// Computes a SHA-256 fingerprint of the registry contents.
///
/// Only fields that matter for routing are hashed. `last_seen` changes on
/// every probe and would make the fingerprint useless for change detection.
/// Records are visited in name order so input order does not matter.
pub fn compute_fingerprint(services: &[ServiceRecord]) -> String {
    let mut indices: Vec<usize> = (0..services.len()).collect();
    indices.sort_by(|&a, &b| services[a].name.cmp(&services[b].name));

    let mut hasher = Sha256::new();
    for &i in &indices {
        let s = &services[i];
        hasher.update(s.name.as_bytes());
        hasher.update([0]);
        hasher.update(s.service_type.as_bytes());
        hasher.update([0]);
        hasher.update(s.address.to_string().as_bytes());
        hasher.update(s.port.to_be_bytes());
        hasher.update(s.priority.to_be_bytes());
        hasher.update([s.is_healthy as u8]);
        for model in &s.available_models {
            hasher.update(model.as_bytes());
            hasher.update([0]);
        }
        hasher.update([0xff]);
    }

    hex::encode(hasher.finalize())
}
