use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::db::content::ContentTable;
use crate::db::{MetastoreError, MetastoreResult, ProfileMetaStore};
use crate::model::{
    Function, FunctionId, FunctionKey, Line, Location, LocationId, LocationKey, Mapping,
    MappingId, MappingKey, NewFunction, NewLocation, NewMapping, Outcome,
};

/// Metastore held entirely in process memory.
///
/// Each entity lives in its own [`ContentTable`]; nothing is persisted.
#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    mappings: ContentTable<MappingKey, Mapping>,
    functions: ContentTable<FunctionKey, Function>,
    locations: ContentTable<LocationKey, Location>,
    closed: AtomicBool,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> MetastoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MetastoreError::Closed);
        }
        Ok(())
    }

    fn ensure_functions_exist(&self, lines: &[Line]) -> MetastoreResult<()> {
        for line in lines {
            if self.functions.get(line.function_id.get())?.is_none() {
                return Err(MetastoreError::not_found_function(line.function_id));
            }
        }
        Ok(())
    }
}

impl ProfileMetaStore for MemoryMetaStore {
    fn create_mapping(&self, mapping: &NewMapping) -> MetastoreResult<Outcome<MappingId>> {
        self.ensure_open()?;
        let flags = mapping.flags;
        let created = self.mappings.get_or_create(
            mapping.key(),
            |id| Mapping::from_new(MappingId(id), mapping),
            |existing| existing.flags = existing.flags.merge(flags),
        )?;
        Ok(Outcome::new(MappingId(created.id), created.created))
    }

    fn get_mapping(&self, id: MappingId) -> MetastoreResult<Mapping> {
        self.ensure_open()?;
        self.mappings.get(id.get())?.ok_or_else(|| MetastoreError::not_found_mapping(id))
    }

    fn get_mappings(&self) -> MetastoreResult<Vec<Mapping>> {
        self.ensure_open()?;
        self.mappings.values()
    }

    fn create_function(&self, function: &NewFunction) -> MetastoreResult<Outcome<FunctionId>> {
        self.ensure_open()?;
        let created = self.functions.get_or_create(
            FunctionKey::from(function),
            |id| Function::from_new(FunctionId(id), function),
            |_| {},
        )?;
        Ok(Outcome::new(FunctionId(created.id), created.created))
    }

    fn get_function(&self, id: FunctionId) -> MetastoreResult<Function> {
        self.ensure_open()?;
        self.functions.get(id.get())?.ok_or_else(|| MetastoreError::not_found_function(id))
    }

    fn get_functions(&self) -> MetastoreResult<Vec<Function>> {
        self.ensure_open()?;
        self.functions.values()
    }

    fn create_location(&self, location: &NewLocation) -> MetastoreResult<Outcome<LocationId>> {
        self.ensure_open()?;
        if let Some(mapping_id) = location.mapping_id {
            if self.mappings.get(mapping_id.get())?.is_none() {
                return Err(MetastoreError::not_found_mapping(mapping_id));
            }
        }
        let key = location.key();
        self.ensure_functions_exist(&key.lines)?;

        let lines = key.lines.clone();
        let created = self.locations.get_or_create(
            key,
            |id| Location {
                id: LocationId(id),
                mapping_id: location.mapping_id,
                address: location.address,
                is_folded: location.is_folded,
                lines,
            },
            |_| {},
        )?;
        Ok(Outcome::new(LocationId(created.id), created.created))
    }

    fn get_location(&self, id: LocationId) -> MetastoreResult<Location> {
        self.ensure_open()?;
        self.locations.get(id.get())?.ok_or_else(|| MetastoreError::not_found_location(id))
    }

    fn get_locations(&self) -> MetastoreResult<Vec<Location>> {
        self.ensure_open()?;
        self.locations.values()
    }

    fn get_unsymbolized_locations(&self) -> MetastoreResult<Vec<Location>> {
        self.ensure_open()?;
        let symbolizable: HashSet<MappingId> = self
            .mappings
            .values()?
            .into_iter()
            .filter(Mapping::is_symbolizable)
            .map(|m| m.id)
            .collect();

        Ok(self
            .locations
            .values()?
            .into_iter()
            .filter(|l| !l.is_symbolized() && l.address != 0)
            .filter(|l| l.mapping_id.is_some_and(|m| symbolizable.contains(&m)))
            .collect())
    }

    fn set_lines(&self, id: LocationId, lines: &[Line]) -> MetastoreResult<()> {
        self.ensure_open()?;
        self.ensure_functions_exist(lines)?;

        let outcome = self.locations.update(id.get(), |location| {
            if lines.is_empty() {
                return Ok(());
            }
            if location.is_symbolized() {
                return Err(MetastoreError::AlreadySymbolized(id));
            }
            location.lines = lines.to_vec();
            Ok(())
        })?;

        match outcome {
            Some(result) => result,
            None => Err(MetastoreError::not_found_location(id)),
        }
    }

    fn ping(&self) -> MetastoreResult<()> {
        self.ensure_open()
    }

    fn close(&self) -> MetastoreResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
