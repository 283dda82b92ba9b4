//! Rule persistence.
//!
//! [`RuleRepository`] is the single write path for business rules. It checks
//! condition syntax before anything reaches the store and invalidates the
//! dataset's cached listings on every write.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::cache::RuleCache;
use super::condition::validate_condition;
use super::model::{BusinessRule, RuleGenerationBatch};
use crate::dataset::DatasetId;
use crate::error::ConditionError;

/// Errors raised by rule storage.
#[derive(Debug, Error)]
pub enum RuleStoreError {
    #[error("Rule {0} not found")]
    NotFound(Uuid),

    #[error("Rule {0} already exists")]
    Duplicate(Uuid),

    #[error("Invalid condition for rule '{name}': {source}")]
    InvalidCondition {
        name: String,
        #[source]
        source: ConditionError,
    },

    #[error("Rule store backend error: {0}")]
    Backend(String),
}

/// Storage backend for rules.
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn insert(&self, rule: &BusinessRule) -> Result<(), RuleStoreError>;
    /// Inserts every rule or none of them.
    async fn insert_batch(&self, rules: &[BusinessRule]) -> Result<(), RuleStoreError>;
    async fn get(&self, id: Uuid) -> Result<Option<BusinessRule>, RuleStoreError>;
    async fn update(&self, rule: &BusinessRule) -> Result<(), RuleStoreError>;
    /// Returns whether a rule was removed.
    async fn delete(&self, id: Uuid) -> Result<bool, RuleStoreError>;
    /// Rules for a dataset ordered by creation time.
    async fn list(&self, dataset_id: DatasetId, active_only: bool) -> Result<Vec<BusinessRule>, RuleStoreError>;
}

/// In-memory [`RuleStore`].
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<Uuid, BusinessRule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn insert(&self, rule: &BusinessRule) -> Result<(), RuleStoreError> {
        let mut rules = self.rules.write().await;
        if rules.contains_key(&rule.id) {
            return Err(RuleStoreError::Duplicate(rule.id));
        }
        rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn insert_batch(&self, batch: &[BusinessRule]) -> Result<(), RuleStoreError> {
        let mut rules = self.rules.write().await;
        let mut incoming = HashSet::with_capacity(batch.len());
        for rule in batch {
            if rules.contains_key(&rule.id) || !incoming.insert(rule.id) {
                return Err(RuleStoreError::Duplicate(rule.id));
            }
        }
        rules.extend(batch.iter().map(|r| (r.id, r.clone())));
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<BusinessRule>, RuleStoreError> {
        Ok(self.rules.read().await.get(&id).cloned())
    }

    async fn update(&self, rule: &BusinessRule) -> Result<(), RuleStoreError> {
        match self.rules.write().await.get_mut(&rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(RuleStoreError::NotFound(rule.id)),
        }
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RuleStoreError> {
        Ok(self.rules.write().await.remove(&id).is_some())
    }

    async fn list(&self, dataset_id: DatasetId, active_only: bool) -> Result<Vec<BusinessRule>, RuleStoreError> {
        let mut rules: Vec<BusinessRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.dataset_id == dataset_id && (!active_only || r.active))
            .cloned()
            .collect();
        rules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(rules)
    }
}

/// Validating, cache-aware facade over a [`RuleStore`].
pub struct RuleRepository {
    store: Arc<dyn RuleStore>,
    cache: Arc<RuleCache>,
}

impl RuleRepository {
    pub fn new(store: Arc<dyn RuleStore>, cache: Arc<RuleCache>) -> Self {
        Self { store, cache }
    }

    /// Repository over an in-memory store with a default cache.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryRuleStore::new()), Arc::new(RuleCache::default()))
    }

    pub fn cache(&self) -> &RuleCache {
        &self.cache
    }

    fn validate(rule: &BusinessRule) -> Result<(), RuleStoreError> {
        validate_condition(&rule.condition, None).map_err(|source| RuleStoreError::InvalidCondition {
            name: rule.name.clone(),
            source,
        })
    }

    /// Persists a new rule after checking its condition syntax.
    pub async fn create(&self, rule: BusinessRule) -> Result<BusinessRule, RuleStoreError> {
        Self::validate(&rule)?;
        self.store.insert(&rule).await?;
        self.cache.invalidate(rule.dataset_id);
        info!(rule_id = %rule.id, dataset_id = rule.dataset_id, source = %rule.source, "Rule created");
        Ok(rule)
    }

    pub async fn get(&self, id: Uuid) -> Result<BusinessRule, RuleStoreError> {
        self.store.get(id).await?.ok_or(RuleStoreError::NotFound(id))
    }

    /// Replaces a stored rule, bumping `updated_at`.
    pub async fn update(&self, mut rule: BusinessRule) -> Result<BusinessRule, RuleStoreError> {
        Self::validate(&rule)?;
        let previous = self.get(rule.id).await?;
        rule.created_at = previous.created_at;
        rule.updated_at = Utc::now();
        self.store.update(&rule).await?;
        self.cache.invalidate(previous.dataset_id);
        if previous.dataset_id != rule.dataset_id {
            self.cache.invalidate(rule.dataset_id);
        }
        debug!(rule_id = %rule.id, "Rule updated");
        Ok(rule)
    }

    pub async fn delete(&self, id: Uuid) -> Result<(), RuleStoreError> {
        let rule = self.get(id).await?;
        self.store.delete(id).await?;
        self.cache.invalidate(rule.dataset_id);
        debug!(rule_id = %id, "Rule deleted");
        Ok(())
    }

    /// Lists a dataset's rules, served from the cache when fresh.
    pub async fn list_for_dataset(
        &self,
        dataset_id: DatasetId,
        active_only: bool,
    ) -> Result<Vec<BusinessRule>, RuleStoreError> {
        if let Some(rules) = self.cache.get(dataset_id, active_only) {
            return Ok(rules);
        }
        let generation = self.cache.generation(dataset_id);
        let rules = self.store.list(dataset_id, active_only).await?;
        self.cache.put_if_current(dataset_id, active_only, generation, rules.clone());
        Ok(rules)
    }

    /// Persists every accepted rule of a generation batch.
    ///
    /// All conditions are checked before the first write and the insert is
    /// all-or-nothing, so a rejected batch leaves the store untouched.
    pub async fn accept_batch(&self, batch: &RuleGenerationBatch) -> Result<Vec<Uuid>, RuleStoreError> {
        for rule in &batch.rules {
            Self::validate(rule)?;
        }
        let inserted = self.store.insert_batch(&batch.rules).await;
        // Invalidate even on failure; a backend may have committed before reporting an error.
        self.cache.invalidate(batch.dataset_id);
        inserted?;
        let ids: Vec<Uuid> = batch.rules.iter().map(|r| r.id).collect();
        info!(
            dataset_id = batch.dataset_id,
            engine = %batch.engine_used,
            accepted = ids.len(),
            "Accepted generated rules"
        );
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::model::Severity;

    #[tokio::test]
    async fn test_round_trip_keeps_condition_text() {
        let repo = RuleRepository::in_memory();
        let rule = BusinessRule::new(7, "non-negative", "col_x >= 0").with_severity(Severity::High);
        let id = repo.create(rule).await.unwrap().id;

        let fetched = repo.get(id).await.unwrap();
        assert_eq!(fetched.condition, "col_x >= 0");
        assert_eq!(fetched.severity, Severity::High);
    }

    #[tokio::test]
    async fn test_invalid_condition_never_reaches_store() {
        let repo = RuleRepository::in_memory();
        let rule = BusinessRule::new(7, "broken", "col_x >= ");
        assert!(matches!(
            repo.create(rule).await,
            Err(RuleStoreError::InvalidCondition { .. })
        ));
        assert!(repo.list_for_dataset(7, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_writes_invalidate_cache() {
        let repo = RuleRepository::in_memory();
        repo.create(BusinessRule::new(7, "a", "x > 0")).await.unwrap();
        assert_eq!(repo.list_for_dataset(7, true).await.unwrap().len(), 1);
        assert_eq!(repo.cache().len(), 1);

        let b = repo
            .create(BusinessRule::new(7, "b", "x < 10").with_active(false))
            .await
            .unwrap();
        assert!(repo.cache().is_empty());
        assert_eq!(repo.list_for_dataset(7, true).await.unwrap().len(), 1);
        assert_eq!(repo.list_for_dataset(7, false).await.unwrap().len(), 2);

        repo.delete(b.id).await.unwrap();
        assert_eq!(repo.list_for_dataset(7, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_validates_and_bumps_timestamp() {
        let repo = RuleRepository::in_memory();
        let rule = repo.create(BusinessRule::new(7, "a", "x > 0")).await.unwrap();

        let mut bad = rule.clone();
        bad.condition = "x >".into();
        assert!(repo.update(bad).await.is_err());

        let mut good = rule.clone();
        good.condition = "x > 1".into();
        let updated = repo.update(good).await.unwrap();
        assert!(updated.updated_at >= rule.updated_at);
        assert_eq!(repo.get(rule.id).await.unwrap().condition, "x > 1");
    }

    fn batch_of(dataset_id: DatasetId, rules: Vec<BusinessRule>) -> RuleGenerationBatch {
        RuleGenerationBatch {
            dataset_id,
            engine_used: "statistical".into(),
            initial_rules_count: rules.len(),
            failed_rules_count: 0,
            corrected_rules_count: 0,
            rules,
            failed_rules: Vec::new(),
            corrected_rules: Vec::new(),
            execution_time_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing_and_listing_stays_true() {
        let repo = RuleRepository::in_memory();
        let existing = repo.create(BusinessRule::new(7, "a", "x > 0")).await.unwrap();
        assert_eq!(repo.list_for_dataset(7, false).await.unwrap().len(), 1);

        let fresh = BusinessRule::new(7, "b", "x < 10");
        let fresh_id = fresh.id;
        let batch = batch_of(7, vec![fresh, existing.clone()]);
        assert!(matches!(
            repo.accept_batch(&batch).await,
            Err(RuleStoreError::Duplicate(id)) if id == existing.id
        ));

        assert!(matches!(repo.get(fresh_id).await, Err(RuleStoreError::NotFound(_))));
        assert_eq!(repo.list_for_dataset(7, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_ids_within_batch_rejected() {
        let repo = RuleRepository::in_memory();
        let rule = BusinessRule::new(7, "a", "x > 0");
        let batch = batch_of(7, vec![rule.clone(), rule]);
        assert!(repo.accept_batch(&batch).await.is_err());
        assert!(repo.list_for_dataset(7, false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_accepted_batch_visible_after_cached_listing() {
        let repo = RuleRepository::in_memory();
        assert!(repo.list_for_dataset(7, false).await.unwrap().is_empty());
        let batch = batch_of(
            7,
            vec![BusinessRule::new(7, "a", "x > 0"), BusinessRule::new(7, "b", "x < 10")],
        );
        assert_eq!(repo.accept_batch(&batch).await.unwrap().len(), 2);
        assert_eq!(repo.list_for_dataset(7, false).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_missing_rule() {
        let repo = RuleRepository::in_memory();
        let id = Uuid::new_v4();
        assert!(matches!(repo.get(id).await, Err(RuleStoreError::NotFound(_))));
        assert!(matches!(repo.delete(id).await, Err(RuleStoreError::NotFound(_))));
    }
}
