//! The monitored-entity registry, mirrored in memory and persisted in SQLite.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;

use rusqlite::params;
use tracing::info;

use crate::detect::DetectError;
use crate::storage::{blocking, Pool};

use super::{Entity, EntityKind, Priority};

pub struct EntityRegistry {
    pool: Pool,
    entities: RwLock<BTreeMap<String, Entity>>,
    ignored: RwLock<BTreeSet<String>>,
}

impl EntityRegistry {
    /// Open the registry and load every persisted entity.
    pub async fn open(pool: Pool) -> Result<Self, DetectError> {
        let (entities, ignored) = blocking(&pool, |conn| {
            let mut stmt = conn.prepare(
                "SELECT entity_id, kind, priority, enabled, origin, unsuitable FROM entities ORDER BY entity_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, bool>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?;

            let mut entities = BTreeMap::new();
            for row in rows {
                let (id, kind, priority, enabled, origin, unsuitable) = row?;
                let entity = Entity {
                    kind: kind.parse()?,
                    priority: priority.parse()?,
                    enabled,
                    origin: origin.parse()?,
                    unsuitable,
                    id: id.clone(),
                };
                entities.insert(id, entity);
            }

            let mut stmt = conn.prepare("SELECT entity_id FROM ignored_entities")?;
            let ignored = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<BTreeSet<_>>>()?;
            Ok((entities, ignored))
        })
        .await?;

        info!(entities = entities.len(), ignored = ignored.len(), "entity registry loaded");
        Ok(Self {
            pool,
            entities: RwLock::new(entities),
            ignored: RwLock::new(ignored),
        })
    }

    async fn save(&self, entity: &Entity) -> Result<(), DetectError> {
        let e = entity.clone();
        blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO entities (entity_id, kind, priority, enabled, origin, unsuitable, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now'))
                 ON CONFLICT(entity_id) DO UPDATE SET
                    kind = excluded.kind,
                    priority = excluded.priority,
                    enabled = excluded.enabled,
                    origin = excluded.origin,
                    unsuitable = excluded.unsuitable,
                    updated_at = excluded.updated_at",
                params![
                    e.id,
                    e.kind.to_string(),
                    e.priority.to_string(),
                    e.enabled,
                    e.origin.to_string(),
                    e.unsuitable
                ],
            )?;
            conn.execute("DELETE FROM ignored_entities WHERE entity_id = ?1", params![e.id])?;
            Ok(())
        })
        .await?;

        self.ignored
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&entity.id);
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    /// Insert or replace an entity. Adding an ignored entity lifts the ignore.
    pub async fn upsert(&self, entity: Entity) -> Result<(), DetectError> {
        self.save(&entity).await
    }

    pub async fn remove(&self, entity_id: &str) -> Result<Option<Entity>, DetectError> {
        let id = entity_id.to_string();
        blocking(&self.pool, move |conn| {
            conn.execute("DELETE FROM entities WHERE entity_id = ?1", params![id])?;
            Ok(())
        })
        .await?;
        Ok(self
            .entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id))
    }

    /// Remove an entity and keep it from coming back through configuration.
    pub async fn ignore(&self, entity_id: &str) -> Result<(), DetectError> {
        let id = entity_id.to_string();
        blocking(&self.pool, move |conn| {
            conn.execute("DELETE FROM entities WHERE entity_id = ?1", params![id])?;
            conn.execute(
                "INSERT OR IGNORE INTO ignored_entities (entity_id) VALUES (?1)",
                params![id],
            )?;
            Ok(())
        })
        .await?;

        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(entity_id);
        self.ignored
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entity_id.to_string());
        Ok(())
    }

    pub fn is_ignored(&self, entity_id: &str) -> bool {
        self.ignored
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(entity_id)
    }

    pub fn ignored(&self) -> Vec<String> {
        self.ignored
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    async fn update(
        &self,
        entity_id: &str,
        change: impl FnOnce(&mut Entity),
    ) -> Result<Entity, DetectError> {
        let mut entity = self
            .get(entity_id)
            .ok_or_else(|| DetectError::UnknownEntity(entity_id.to_string()))?;
        change(&mut entity);
        self.save(&entity).await?;
        Ok(entity)
    }

    pub async fn set_enabled(&self, entity_id: &str, enabled: bool) -> Result<Entity, DetectError> {
        self.update(entity_id, |e| e.enabled = enabled).await
    }

    pub async fn set_unsuitable(
        &self,
        entity_id: &str,
        reason: Option<String>,
    ) -> Result<Entity, DetectError> {
        self.update(entity_id, |e| e.unsuitable = reason).await
    }

    /// Replace the kind. Only reclassification should call this.
    pub async fn set_kind(&self, entity_id: &str, kind: EntityKind) -> Result<Entity, DetectError> {
        self.update(entity_id, |e| {
            e.kind = kind;
            e.unsuitable = None;
        })
        .await
    }

    pub fn get(&self, entity_id: &str) -> Option<Entity> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(entity_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Entity> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Entities a tier should evaluate: matching priority, enabled, modelable.
    pub fn for_priority(&self, priority: Priority) -> Vec<Entity> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|e| e.priority == priority && e.enabled && e.is_modelable())
            .cloned()
            .collect()
    }

    /// Drop every entity not in `present`. Returns the removed ids.
    pub async fn prune_missing(&self, present: &BTreeSet<String>) -> Result<Vec<String>, DetectError> {
        let stale: Vec<String> = self
            .entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|id| !present.contains(*id))
            .cloned()
            .collect();

        for id in &stale {
            self.remove(id).await?;
            info!(entity = %id, "pruned entity no longer reported by host");
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Origin;
    use crate::storage::open_memory_pool;

    fn entity(id: &str, priority: Priority) -> Entity {
        Entity::new(id, EntityKind::Numeric, priority, Origin::Configured)
    }

    #[tokio::test]
    async fn test_registry_persists_across_open() {
        let pool = open_memory_pool().unwrap();
        let registry = EntityRegistry::open(pool.clone()).await.unwrap();
        registry.upsert(entity("sensor.a", Priority::High)).await.unwrap();
        registry.set_enabled("sensor.a", false).await.unwrap();
        drop(registry);

        let reopened = EntityRegistry::open(pool).await.unwrap();
        let a = reopened.get("sensor.a").unwrap();
        assert_eq!(a.priority, Priority::High);
        assert!(!a.enabled);
    }

    #[tokio::test]
    async fn test_for_priority_filters() {
        let registry = EntityRegistry::open(open_memory_pool().unwrap()).await.unwrap();
        registry.upsert(entity("sensor.a", Priority::High)).await.unwrap();
        registry.upsert(entity("sensor.b", Priority::Standard)).await.unwrap();
        registry.upsert(entity("sensor.c", Priority::High)).await.unwrap();
        registry.set_enabled("sensor.c", false).await.unwrap();
        registry.upsert(entity("sensor.d", Priority::High)).await.unwrap();
        registry
            .set_unsuitable("sensor.d", Some("too many labels".to_string()))
            .await
            .unwrap();

        let ids: Vec<_> = registry
            .for_priority(Priority::High)
            .into_iter()
            .map(|e| e.id)
            .collect();
        assert_eq!(ids, vec!["sensor.a".to_string()]);
    }

    #[tokio::test]
    async fn test_ignore_and_unknown() {
        let registry = EntityRegistry::open(open_memory_pool().unwrap()).await.unwrap();
        registry.upsert(entity("sensor.a", Priority::Standard)).await.unwrap();
        registry.ignore("sensor.a").await.unwrap();
        assert!(registry.get("sensor.a").is_none());
        assert!(registry.is_ignored("sensor.a"));

        let err = registry.set_enabled("sensor.a", true).await.unwrap_err();
        assert!(matches!(err, DetectError::UnknownEntity(_)));

        registry.upsert(entity("sensor.a", Priority::Standard)).await.unwrap();
        assert!(!registry.is_ignored("sensor.a"));
    }

    #[tokio::test]
    async fn test_prune_missing() {
        let registry = EntityRegistry::open(open_memory_pool().unwrap()).await.unwrap();
        registry.upsert(entity("sensor.a", Priority::Standard)).await.unwrap();
        registry.upsert(entity("sensor.gone", Priority::Standard)).await.unwrap();

        let present = BTreeSet::from(["sensor.a".to_string()]);
        let removed = registry.prune_missing(&present).await.unwrap();
        assert_eq!(removed, vec!["sensor.gone".to_string()]);
        assert_eq!(registry.all().len(), 1);
    }
}
