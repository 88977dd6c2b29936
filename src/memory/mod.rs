//! Pattern Memory
//!
//! Long-term store of previously confirmed risk signatures and of per-entity
//! reputation. Injected into the orchestrator; absence or failure never
//! blocks a session.

pub mod postgres;

pub use postgres::PostgresPatternMemory;

use crate::audit::compute_digest;
use crate::models::SpecialistKind;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Smoothing factor for success-rate updates
const SUCCESS_RATE_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternMetadata {
    pub kind: Option<SpecialistKind>,
    pub confidence: f64,
    pub success_rate: f64,
    pub detection_count: u64,
    pub last_seen: DateTime<Utc>,
}

impl PatternMetadata {
    /// Metadata for a signature seen for the first time
    pub fn confirmed(kind: Option<SpecialistKind>) -> Self {
        Self {
            kind,
            confidence: 0.8,
            success_rate: 0.9,
            detection_count: 1,
            last_seen: Utc::now(),
        }
    }

    /// Fold another detection into the running statistics
    pub fn observe(&mut self, success: bool) {
        let outcome = if success { 1.0 } else { 0.0 };
        self.success_rate =
            SUCCESS_RATE_ALPHA * outcome + (1.0 - SUCCESS_RATE_ALPHA) * self.success_rate;
        self.confidence = self.success_rate.clamp(0.01, 0.99);
        self.detection_count += 1;
        self.last_seen = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRecord {
    pub key: String,
    pub value: serde_json::Value,
    pub metadata: PatternMetadata,
}

/// What past investigations concluded about a named entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityReputation {
    pub entity_name: String,
    pub risk_score: f64,
    pub sanctions_status: String,
    pub adverse_media: String,
    pub investigation_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl EntityReputation {
    pub fn new(entity_name: &str, risk_score: f64) -> Self {
        Self {
            entity_name: entity_name.trim().to_string(),
            risk_score,
            sanctions_status: "unknown".to_string(),
            adverse_media: "none".to_string(),
            investigation_count: 1,
            last_updated: Utc::now(),
        }
    }

    /// Fold in another investigation; the latest score wins
    pub fn observe(&mut self, risk_score: f64) {
        self.risk_score = risk_score;
        self.investigation_count += 1;
        self.last_updated = Utc::now();
    }
}

/// Lookup key for an entity; names are case-insensitive
pub fn entity_key(entity_name: &str) -> String {
    entity_name.trim().to_lowercase()
}

/// Narrow key-value contract for the pattern store
#[async_trait::async_trait]
pub trait PatternMemory: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<PatternRecord>>;
    async fn set(&self, key: &str, value: serde_json::Value, metadata: PatternMetadata) -> Result<()>;
    async fn search(&self, query: &str) -> Result<Vec<String>>;

    async fn entity(&self, entity_name: &str) -> Result<Option<EntityReputation>>;
    async fn set_entity(&self, reputation: EntityReputation) -> Result<()>;
}

/// True when any segment of the key equals a word of the query.
///
/// Keys look like `pattern:<kind>:<label>`; labels are dash-separated.
/// An empty query matches everything.
pub fn key_matches(key: &str, query: &str) -> bool {
    let query = query.to_lowercase();
    let words: Vec<&str> = query
        .split(|c: char| !c.is_alphanumeric() && c != '-')
        .filter(|w| w.len() > 2)
        .collect();

    if query.trim().is_empty() {
        return true;
    }

    let key = key.to_lowercase();
    let mut segments = key.split(|c| c == ':' || c == '-');
    segments.any(|seg| !seg.is_empty() && seg != "pattern" && words.iter().any(|w| *w == seg))
        || words.iter().any(|w| *w == key)
}

/// Key for a confirmed signature: `pattern:<kind>:<terms>-<digest>`.
///
/// The terms keep the key searchable from future session text; the digest of
/// the findings keeps distinct signatures apart.
pub fn signature_key(kind: SpecialistKind, terms: &[&str], findings: &[String]) -> String {
    let words = signature_terms(terms);
    let digest = compute_digest(&(kind, findings));
    let short = digest.get(..12).unwrap_or(digest.as_str());

    if words.is_empty() {
        format!("pattern:{}:{}", kind.as_str(), short)
    } else {
        format!("pattern:{}:{}-{}", kind.as_str(), words.join("-"), short)
    }
}

/// Searchable words of the given terms, sorted and deduplicated
pub fn signature_terms(terms: &[&str]) -> Vec<String> {
    let mut words: Vec<String> = terms
        .iter()
        .flat_map(|t| t.split(|c: char| !c.is_alphanumeric()))
        .filter(|w| w.len() > 2 && w.chars().any(|c| c.is_alphabetic()))
        .map(|w| w.to_lowercase())
        .collect();
    words.sort();
    words.dedup();
    words
}

/// In-memory pattern store for development and tests
pub struct InMemoryPatternMemory {
    records: Arc<RwLock<HashMap<String, PatternRecord>>>,
    entities: Arc<RwLock<HashMap<String, EntityReputation>>>,
}

impl InMemoryPatternMemory {
    pub fn new() -> Self {
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            entities: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryPatternMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PatternMemory for InMemoryPatternMemory {
    async fn get(&self, key: &str) -> Result<Option<PatternRecord>> {
        let records = self.records.read().await;
        Ok(records.get(key).cloned())
    }

    async fn set(&self, key: &str, value: serde_json::Value, metadata: PatternMetadata) -> Result<()> {
        let mut records = self.records.write().await;
        records.insert(
            key.to_string(),
            PatternRecord {
                key: key.to_string(),
                value,
                metadata,
            },
        );
        Ok(())
    }

    async fn search(&self, query: &str) -> Result<Vec<String>> {
        let records = self.records.read().await;

        let mut matched: Vec<&PatternRecord> = records
            .values()
            .filter(|r| key_matches(&r.key, query))
            .collect();

        // strongest signatures first, key as tiebreak for stable output
        matched.sort_by(|a, b| {
            b.metadata
                .confidence
                .partial_cmp(&a.metadata.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });

        Ok(matched.into_iter().map(|r| r.key.clone()).collect())
    }

    async fn entity(&self, entity_name: &str) -> Result<Option<EntityReputation>> {
        let entities = self.entities.read().await;
        Ok(entities.get(&entity_key(entity_name)).cloned())
    }

    async fn set_entity(&self, reputation: EntityReputation) -> Result<()> {
        let mut entities = self.entities.write().await;
        entities.insert(entity_key(&reputation.entity_name), reputation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_matching() {
        assert!(key_matches("pattern:route:cayman-routing", "wire sent to the Cayman islands"));
        assert!(!key_matches("pattern:route:cayman-routing", "domestic cash deposit"));
        assert!(key_matches("pattern:route:cayman-routing", ""));
        assert!(!key_matches("pattern:route:cayman-routing", "pattern"));
    }

    #[test]
    fn test_signature_key_shape() {
        let findings = vec!["Offshore layering route detected".to_string()];
        let key = signature_key(SpecialistKind::GeographicRouting, &["wire", "cayman", "0x"], &findings);
        assert!(key.starts_with("pattern:geographic-routing:cayman-wire-"));
        assert_eq!(key, signature_key(SpecialistKind::GeographicRouting, &["cayman", "wire"], &findings));
        assert!(key_matches(&key, "second wire to cayman"));

        let amounts = signature_key(SpecialistKind::TransactionPattern, &["$10,000", "cash"], &findings);
        assert!(amounts.starts_with("pattern:transaction-pattern:cash-"));

        let bare = signature_key(SpecialistKind::ChainTracing, &[], &findings);
        assert_eq!(bare.split(':').count(), 3);
    }

    #[test]
    fn test_observe_moves_success_rate() {
        let mut meta = PatternMetadata::confirmed(None);
        meta.observe(true);
        assert_eq!(meta.detection_count, 2);
        assert!((meta.success_rate - 0.91).abs() < 1e-9);

        meta.observe(false);
        assert!(meta.success_rate < 0.91);
        assert!(meta.confidence <= 0.99 && meta.confidence >= 0.01);
    }

    #[tokio::test]
    async fn test_in_memory_round_trip_and_search() {
        let memory = InMemoryPatternMemory::new();
        memory
            .set(
                "pattern:route:cayman-routing",
                serde_json::json!({"description": "Offshore routing through Cayman"}),
                PatternMetadata::confirmed(Some(SpecialistKind::GeographicRouting)),
            )
            .await
            .unwrap();

        let mut weak = PatternMetadata::confirmed(Some(SpecialistKind::TransactionPattern));
        weak.confidence = 0.4;
        memory
            .set("pattern:structuring:cayman-threshold", serde_json::json!({}), weak)
            .await
            .unwrap();

        let record = memory.get("pattern:route:cayman-routing").await.unwrap().unwrap();
        assert_eq!(record.metadata.kind, Some(SpecialistKind::GeographicRouting));

        let keys = memory.search("wire to cayman").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "pattern:route:cayman-routing".to_string(),
                "pattern:structuring:cayman-threshold".to_string(),
            ]
        );

        assert!(memory.get("pattern:missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entity_reputation_is_case_insensitive() {
        let memory = InMemoryPatternMemory::new();
        memory
            .set_entity(EntityReputation::new("Acme Holdings Ltd", 72.5))
            .await
            .unwrap();

        let mut stored = memory.entity("  acme holdings LTD ").await.unwrap().unwrap();
        assert_eq!(stored.entity_name, "Acme Holdings Ltd");
        assert_eq!(stored.investigation_count, 1);
        assert_eq!(stored.sanctions_status, "unknown");

        stored.observe(40.0);
        memory.set_entity(stored).await.unwrap();

        let updated = memory.entity("ACME HOLDINGS LTD").await.unwrap().unwrap();
        assert_eq!(updated.investigation_count, 2);
        assert_eq!(updated.risk_score, 40.0);
        assert!(memory.entity("globex").await.unwrap().is_none());
    }
}
