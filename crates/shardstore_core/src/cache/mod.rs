//! The entity registry of one channel.
//!
//! An [`EntityCache`] knows every live entity of its channel: where its
//! newest record is stored, its type, its GC color and, if the cache policy
//! allows, the record bytes themselves. It is owned and mutated by the
//! channel thread only; other channels reach it through the mark queues.
//!
//! The cache never touches files directly. Record reads and the release of
//! a superseded record's space go through [`DataFileAccess`], implemented by
//! the channel's file manager.

mod entity;
mod marking;

pub use entity::GcColor;
pub(crate) use entity::EntityKey;

use crate::binary::EntityHeader;
use crate::config::GcConfig;
use crate::dictionary::{TypeDictionary, TypeLayout};
use crate::error::{CoreError, CoreResult};
use crate::gc::evaluator::{initially_cache_entity, CacheCandidate, EntityCacheEvaluator};
use crate::gc::monitor::{MarkMonitor, ReferenceMarker};
use crate::stats::StorageStats;
use crate::types::{now_millis, ObjectId, TypeId};
use bytes::Bytes;
use entity::{Chain, ChainKind, Entity, EntityArena};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// File-side operations the cache needs.
pub(crate) trait DataFileAccess {
    /// Reads a whole entity record.
    fn read_record(&self, file_number: u64, position: u64, length: u64) -> CoreResult<Vec<u8>>;

    /// Records that `length` bytes of `file_number` are no longer live.
    fn release_content(&mut self, file_number: u64, length: u64);
}

#[derive(Debug)]
struct EntityType {
    layout: Arc<TypeLayout>,
    chain: Chain,
}

/// Where an entity's record lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntityLocation {
    pub(crate) key: EntityKey,
    pub(crate) object_id: ObjectId,
    pub(crate) position: u64,
    pub(crate) length: u64,
}

/// Entity registry, GC state and record cache of one channel.
#[derive(Debug)]
pub(crate) struct EntityCache {
    channel: usize,
    arena: EntityArena,
    index: HashMap<ObjectId, EntityKey>,
    types: BTreeMap<TypeId, EntityType>,
    files: BTreeMap<u64, Chain>,
    cache_size: i64,
    dictionary: Arc<dyn TypeDictionary>,
    evaluator: Arc<dyn EntityCacheEvaluator>,
    monitor: Arc<MarkMonitor>,
    marker: ReferenceMarker,
    mark_buffer: Vec<u64>,
    marking_wait: Duration,
    stats: Arc<StorageStats>,
    cache_check_cursor: usize,
}

impl EntityCache {
    pub(crate) fn new(
        channel: usize,
        dictionary: Arc<dyn TypeDictionary>,
        evaluator: Arc<dyn EntityCacheEvaluator>,
        monitor: Arc<MarkMonitor>,
        gc: &GcConfig,
        stats: Arc<StorageStats>,
    ) -> Self {
        Self {
            channel,
            arena: EntityArena::new(),
            index: HashMap::new(),
            types: BTreeMap::new(),
            files: BTreeMap::new(),
            cache_size: 0,
            dictionary,
            evaluator,
            marker: ReferenceMarker::new(Arc::clone(&monitor), gc.reference_buffer_size),
            monitor,
            mark_buffer: vec![0; gc.mark_buffer_size.max(1)],
            marking_wait: gc.marking_wait,
            stats,
            cache_check_cursor: 0,
        }
    }

    pub(crate) const fn channel(&self) -> usize {
        self.channel
    }

    pub(crate) fn monitor(&self) -> &Arc<MarkMonitor> {
        &self.monitor
    }

    pub(crate) fn entity_count(&self) -> usize {
        self.arena.len()
    }

    pub(crate) const fn cache_size(&self) -> i64 {
        self.cache_size
    }

    pub(crate) fn contains(&self, object_id: ObjectId) -> bool {
        self.index.contains_key(&object_id)
    }

    pub(crate) fn type_ids(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.types
            .iter()
            .filter(|(_, entity_type)| !entity_type.chain.is_empty())
            .map(|(type_id, _)| *type_id)
    }

    pub(crate) fn type_name(&self, type_id: TypeId) -> Option<String> {
        self.types.get(&type_id).map(|entity_type| entity_type.layout.name().to_owned())
    }

    pub(crate) fn highest_object_id(&self) -> ObjectId {
        self.index.keys().copied().max().unwrap_or(ObjectId::NULL)
    }

    fn entity_type(&mut self, type_id: TypeId) -> CoreResult<&mut EntityType> {
        match self.types.entry(type_id) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let layout = self.dictionary.layout(type_id).ok_or_else(|| {
                    CoreError::consistency(format!("unknown type {type_id} in channel {}", self.channel))
                })?;
                Ok(entry.insert(EntityType {
                    layout,
                    chain: Chain::default(),
                }))
            }
        }
    }

    fn entity(&self, key: EntityKey) -> CoreResult<&Entity> {
        self.arena
            .get(key)
            .ok_or_else(|| CoreError::consistency(format!("stale entity key in channel {}", self.channel)))
    }

    /// Registers an entity found by the startup scan.
    ///
    /// The scan runs from the newest record to the oldest, but each file's
    /// winners are registered in file order to keep the file chain sorted.
    pub(crate) fn register_initial(&mut self, header: &EntityHeader, file_number: u64, position: u64) -> CoreResult<()> {
        if self.index.contains_key(&header.object_id) {
            return Err(CoreError::consistency(format!(
                "{} registered twice in channel {}",
                header.object_id, self.channel
            )));
        }
        let entity_type = self.entity_type(header.type_id)?;
        let has_references = entity_type.layout.has_references();
        let key = self.arena.insert(Entity::new(
            header.object_id,
            header.type_id,
            file_number,
            position,
            header.length,
            has_references,
        ));
        if let Some(entity_type) = self.types.get_mut(&header.type_id) {
            self.arena.push_back(&mut entity_type.chain, ChainKind::Type, key);
        }
        let chain = self.files.entry(file_number).or_default();
        self.arena.push_back(chain, ChainKind::File, key);
        self.index.insert(header.object_id, key);
        Ok(())
    }

    /// Registers a freshly written record, replacing an older version.
    ///
    /// The old version's space is released, the record is cached if the
    /// cache policy allows it, and the entity is colored for the running GC
    /// cycle.
    pub(crate) fn register_stored(
        &mut self,
        header: &EntityHeader,
        file_number: u64,
        position: u64,
        record: Bytes,
        files: &mut dyn DataFileAccess,
    ) -> CoreResult<()> {
        let has_references = self.entity_type(header.type_id)?.layout.has_references();
        let key = match self.index.get(&header.object_id).copied() {
            Some(key) => {
                self.unlink_file(key, files)?;
                let old_type = self.entity(key)?.type_id;
                if old_type != header.type_id {
                    if let Some(entity_type) = self.types.get_mut(&old_type) {
                        self.arena.unlink(&mut entity_type.chain, ChainKind::Type, key);
                    }
                    if let Some(entity_type) = self.types.get_mut(&header.type_id) {
                        self.arena.push_back(&mut entity_type.chain, ChainKind::Type, key);
                    }
                }
                let released = self.entity(key)?.cached_length();
                self.cache_size -= released;
                if let Some(entity) = self.arena.get_mut(key) {
                    entity.type_id = header.type_id;
                    entity.file_number = file_number;
                    entity.position = position;
                    entity.length = header.length;
                    entity.has_references = has_references;
                    entity.cached = None;
                }
                key
            }
            None => {
                let key = self.arena.insert(Entity::new(
                    header.object_id,
                    header.type_id,
                    file_number,
                    position,
                    header.length,
                    has_references,
                ));
                if let Some(entity_type) = self.types.get_mut(&header.type_id) {
                    self.arena.push_back(&mut entity_type.chain, ChainKind::Type, key);
                }
                self.index.insert(header.object_id, key);
                key
            }
        };

        let chain = self.files.entry(file_number).or_default();
        self.arena.push_back(chain, ChainKind::File, key);
        self.cache_loaded(key, record, now_millis());
        self.mark_entity_for_changed_data(key);
        Ok(())
    }

    fn unlink_file(&mut self, key: EntityKey, files: &mut dyn DataFileAccess) -> CoreResult<()> {
        let (file_number, length) = {
            let entity = self.entity(key)?;
            (entity.file_number, entity.length)
        };
        if let Some(chain) = self.files.get_mut(&file_number) {
            self.arena.unlink(chain, ChainKind::File, key);
        }
        files.release_content(file_number, length);
        Ok(())
    }

    /// Keeps `record` cached if the policy allows it and touches the entity.
    fn cache_loaded(&mut self, key: EntityKey, record: Bytes, now_ms: i64) {
        let Some(entity) = self.arena.get_mut(key) else {
            return;
        };
        entity.last_touched = now_ms;
        if entity.cached.is_some() {
            return;
        }
        let candidate = CacheCandidate {
            cached_length: record.len() as i64,
            last_touched_ms: now_ms,
            has_references: entity.has_references,
        };
        let total = self.cache_size.wrapping_add(candidate.cached_length);
        if initially_cache_entity(self.evaluator.as_ref(), total, now_ms, &candidate) {
            self.cache_size = total;
            entity.cached = Some(record);
        }
    }

    /// Removes an entity from every chain and the index.
    fn unregister(&mut self, key: EntityKey, files: &mut dyn DataFileAccess) -> CoreResult<()> {
        self.unlink_file(key, files)?;
        let type_id = self.entity(key)?.type_id;
        if let Some(entity_type) = self.types.get_mut(&type_id) {
            self.arena.unlink(&mut entity_type.chain, ChainKind::Type, key);
        }
        let entity = self
            .arena
            .remove(key)
            .ok_or_else(|| CoreError::consistency(format!("stale entity key in channel {}", self.channel)))?;
        self.cache_size -= entity.cached_length();
        self.index.remove(&entity.object_id);
        Ok(())
    }

    pub(crate) fn lookup(&self, object_id: ObjectId) -> Option<EntityKey> {
        self.index.get(&object_id).copied()
    }

    /// Returns the record of `key`, reading and possibly caching it.
    pub(crate) fn load(&mut self, key: EntityKey, files: &dyn DataFileAccess) -> CoreResult<Bytes> {
        let now = now_millis();
        let entity = self.entity(key)?;
        if let Some(cached) = &entity.cached {
            let record = cached.clone();
            if let Some(entity) = self.arena.get_mut(key) {
                entity.last_touched = now;
            }
            return Ok(record);
        }
        let record = Bytes::from(files.read_record(entity.file_number, entity.position, entity.length)?);
        self.cache_loaded(key, record.clone(), now);
        Ok(record)
    }

    /// Returns the record of `key` without caching it.
    pub(crate) fn peek(&self, key: EntityKey, files: &dyn DataFileAccess) -> CoreResult<Bytes> {
        let entity = self.entity(key)?;
        match &entity.cached {
            Some(cached) => Ok(cached.clone()),
            None => Ok(Bytes::from(files.read_record(
                entity.file_number,
                entity.position,
                entity.length,
            )?)),
        }
    }

    /// Keys of every entity of `type_id`.
    pub(crate) fn keys_of_type(&self, type_id: TypeId) -> Vec<EntityKey> {
        self.types.get(&type_id).map_or_else(Vec::new, |entity_type| {
            self.arena.iter_chain(&entity_type.chain, ChainKind::Type).collect()
        })
    }

    /// Highest object ID of the root type in this channel, or null.
    pub(crate) fn root_object_id(&self) -> ObjectId {
        let Some(root_type) = self.dictionary.root_type_id() else {
            return ObjectId::NULL;
        };
        self.keys_of_type(root_type)
            .into_iter()
            .filter_map(|key| self.arena.get(key).map(|entity| entity.object_id))
            .max()
            .unwrap_or(ObjectId::NULL)
    }

    /// Entities stored in `file_number`, in file order.
    pub(crate) fn file_entities(&self, file_number: u64) -> Vec<EntityLocation> {
        let Some(chain) = self.files.get(&file_number) else {
            return Vec::new();
        };
        self.arena
            .iter_chain(chain, ChainKind::File)
            .filter_map(|key| {
                self.arena.get(key).map(|entity| EntityLocation {
                    key,
                    object_id: entity.object_id,
                    position: entity.position,
                    length: entity.length,
                })
            })
            .collect()
    }

    /// The first entity of `file_number`'s chain.
    pub(crate) fn first_in_file(&self, file_number: u64) -> Option<EntityLocation> {
        let key = self.files.get(&file_number)?.first()?;
        self.arena.get(key).map(|entity| EntityLocation {
            key,
            object_id: entity.object_id,
            position: entity.position,
            length: entity.length,
        })
    }

    /// The longest run of entities at the front of `file_number` that are
    /// stored back to back and together fit in `limit` bytes. The first
    /// entity is always included.
    pub(crate) fn leading_run(&self, file_number: u64, limit: u64) -> Vec<EntityLocation> {
        let Some(chain) = self.files.get(&file_number) else {
            return Vec::new();
        };
        let mut run: Vec<EntityLocation> = Vec::new();
        let mut total = 0u64;
        for key in self.arena.iter_chain(chain, ChainKind::File) {
            let Some(entity) = self.arena.get(key) else {
                break;
            };
            if let Some(last) = run.last() {
                if last.position + last.length != entity.position || total + entity.length > limit {
                    break;
                }
            }
            total += entity.length;
            run.push(EntityLocation {
                key,
                object_id: entity.object_id,
                position: entity.position,
                length: entity.length,
            });
        }
        run
    }

    pub(crate) fn file_entity_count(&self, file_number: u64) -> usize {
        self.files.get(&file_number).map_or(0, Chain::len)
    }

    /// Moves an entity's record location to the end of another file.
    pub(crate) fn relocate(&mut self, key: EntityKey, file_number: u64, position: u64) -> CoreResult<()> {
        let old_file = self.entity(key)?.file_number;
        if let Some(chain) = self.files.get_mut(&old_file) {
            self.arena.unlink(chain, ChainKind::File, key);
        }
        let chain = self.files.entry(file_number).or_default();
        self.arena.push_back(chain, ChainKind::File, key);
        if let Some(entity) = self.arena.get_mut(key) {
            entity.file_number = file_number;
            entity.position = position;
        }
        Ok(())
    }

    /// Forgets a file whose entities have all moved away.
    pub(crate) fn remove_file(&mut self, file_number: u64) -> CoreResult<()> {
        match self.files.get(&file_number) {
            Some(chain) if !chain.is_empty() => Err(CoreError::consistency(format!(
                "data file {file_number} of channel {} still holds {} entities",
                self.channel,
                chain.len()
            ))),
            _ => {
                self.files.remove(&file_number);
                Ok(())
            }
        }
    }

    /// Runs the cache policy over the cached entities, continuing where
    /// the last call stopped. Returns true once a full pass completed.
    pub(crate) fn incremental_cache_check(
        &mut self,
        evaluator: Option<&dyn EntityCacheEvaluator>,
        deadline: Option<Instant>,
    ) -> bool {
        if self.cache_size == 0 {
            self.cache_check_cursor = 0;
            return true;
        }
        let evaluator = evaluator.unwrap_or(self.evaluator.as_ref());
        let now = now_millis();
        let mut evicted = 0u64;
        let slot_count = self.arena.slot_count();
        while self.cache_check_cursor < slot_count {
            if self.cache_check_cursor % 64 == 0 && deadline.map_or(false, |d| Instant::now() >= d) {
                debug!(channel = self.channel, evicted, "cache check paused");
                return false;
            }
            if let Some(entity) = self.arena.get_at_mut(self.cache_check_cursor) {
                let length = entity.cached_length();
                if length > 0 {
                    let candidate = CacheCandidate {
                        cached_length: length,
                        last_touched_ms: entity.last_touched,
                        has_references: entity.has_references,
                    };
                    if evaluator.clear_entity_cache(self.cache_size, now, &candidate) {
                        entity.cached = None;
                        self.cache_size -= length;
                        evicted += 1;
                        self.stats.record_cache_eviction();
                    }
                }
            }
            self.cache_check_cursor += 1;
        }
        self.cache_check_cursor = 0;
        debug!(channel = self.channel, evicted, cache_size = self.cache_size, "cache check complete");
        true
    }
}
