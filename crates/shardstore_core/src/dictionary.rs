//! Type dictionary boundary.
//!
//! The engine does not decode entity content. All it needs to know about a
//! type is where the object ID references sit inside a record (to follow
//! them while marking) and which record lengths are plausible (to reject
//! garbage before it is written). Both come from a [`TypeDictionary`].

use crate::binary::{u64_at, ENTITY_HEADER_LENGTH};
use crate::error::{CoreError, CoreResult};
use crate::types::{ObjectId, TypeId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Resolves type IDs to their reference layout.
pub trait TypeDictionary: Send + Sync + fmt::Debug {
    /// Returns the layout of `type_id`, if the type is known.
    fn layout(&self, type_id: TypeId) -> Option<Arc<TypeLayout>>;

    /// The type whose entities are the roots of the object graph.
    ///
    /// Without a root type nothing is reachable from a root, so every
    /// entity not touched by a store in the current GC cycle is collected.
    fn root_type_id(&self) -> Option<TypeId>;
}

/// Where the references of a type's records are.
///
/// Offsets are relative to the record content, i.e. after the 24 header
/// bytes. All references are 8-byte little-endian object IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeLayout {
    type_id: TypeId,
    name: String,
    reference_offsets: Vec<u32>,
    reference_array_start: Option<u32>,
    min_content_length: u64,
    max_content_length: u64,
}

impl TypeLayout {
    /// Creates a layout without references accepting any content length.
    pub fn new(type_id: TypeId, name: impl Into<String>) -> Self {
        Self {
            type_id,
            name: name.into(),
            reference_offsets: Vec::new(),
            reference_array_start: None,
            min_content_length: 0,
            max_content_length: u64::MAX,
        }
    }

    /// Adds fixed reference fields at the given content offsets.
    #[must_use]
    pub fn with_references(mut self, offsets: impl IntoIterator<Item = u32>) -> Self {
        self.reference_offsets.extend(offsets);
        self
    }

    /// Treats every 8-byte value from `start` to the end of the content as
    /// a reference (collections of references).
    #[must_use]
    pub const fn with_reference_array(mut self, start: u32) -> Self {
        self.reference_array_start = Some(start);
        self
    }

    /// Restricts valid content lengths to `min..=max`.
    #[must_use]
    pub const fn with_content_length(mut self, min: u64, max: u64) -> Self {
        self.min_content_length = min;
        self.max_content_length = max;
        self
    }

    /// The type ID.
    #[must_use]
    pub const fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The type name, used for export file names.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns true if records of this type can reference other entities.
    #[must_use]
    pub fn has_references(&self) -> bool {
        !self.reference_offsets.is_empty() || self.reference_array_start.is_some()
    }

    /// Checks a record of this type before it is accepted.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the length is outside the type's
    /// bounds, too short for a fixed reference, or the object ID is null.
    pub fn validate(&self, length: u64, object_id: ObjectId) -> CoreResult<()> {
        if object_id.is_null() {
            return Err(CoreError::validation(format!(
                "null object ID for type {}",
                self.type_id
            )));
        }
        let content = length.saturating_sub(ENTITY_HEADER_LENGTH);
        if content < self.min_content_length || content > self.max_content_length {
            return Err(CoreError::validation(format!(
                "content length {content} of {object_id} outside [{}, {}] for type {}",
                self.min_content_length, self.max_content_length, self.type_id
            )));
        }
        if content < self.fixed_references_end() {
            return Err(CoreError::validation(format!(
                "content length {content} of {object_id} cuts off a reference of type {}, {} bytes required",
                self.type_id,
                self.fixed_references_end()
            )));
        }
        Ok(())
    }

    /// Content length up to the end of the last fixed reference.
    fn fixed_references_end(&self) -> u64 {
        self.reference_offsets
            .iter()
            .map(|offset| u64::from(*offset) + 8)
            .max()
            .unwrap_or(0)
    }

    /// Calls `f` with every non-null reference in `record`.
    ///
    /// # Errors
    ///
    /// Returns a consistency error if a reference offset lies outside the
    /// record.
    pub fn for_each_reference(&self, record: &[u8], mut f: impl FnMut(ObjectId)) -> CoreResult<()> {
        let header = ENTITY_HEADER_LENGTH as usize;
        for offset in &self.reference_offsets {
            let id = u64_at(record, header + *offset as usize)?;
            if id != 0 {
                f(ObjectId(id));
            }
        }
        if let Some(start) = self.reference_array_start {
            let mut position = header + start as usize;
            while position + 8 <= record.len() {
                let id = u64_at(record, position)?;
                if id != 0 {
                    f(ObjectId(id));
                }
                position += 8;
            }
        }
        Ok(())
    }
}

/// A [`TypeDictionary`] backed by a map, filled by registration.
#[derive(Debug, Default)]
pub struct SimpleTypeDictionary {
    layouts: RwLock<HashMap<TypeId, Arc<TypeLayout>>>,
    root_type_id: Option<TypeId>,
}

impl SimpleTypeDictionary {
    /// Creates an empty dictionary without root type.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty dictionary with the given root type.
    #[must_use]
    pub fn with_root_type(root_type_id: TypeId) -> Self {
        Self {
            layouts: RwLock::default(),
            root_type_id: Some(root_type_id),
        }
    }

    /// Registers a layout.
    ///
    /// # Errors
    ///
    /// Returns a validation error if a different layout is already
    /// registered for the same type ID; layouts never change once known.
    pub fn register(&self, layout: TypeLayout) -> CoreResult<()> {
        let mut layouts = self.layouts.write();
        match layouts.get(&layout.type_id) {
            Some(existing) if **existing != layout => Err(CoreError::validation(format!(
                "conflicting layout for type {}",
                layout.type_id
            ))),
            Some(_) => Ok(()),
            None => {
                layouts.insert(layout.type_id, Arc::new(layout));
                Ok(())
            }
        }
    }
}

impl TypeDictionary for SimpleTypeDictionary {
    fn layout(&self, type_id: TypeId) -> Option<Arc<TypeLayout>> {
        self.layouts.read().get(&type_id).cloned()
    }

    fn root_type_id(&self) -> Option<TypeId> {
        self.root_type_id
    }
}
