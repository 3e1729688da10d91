//! Per-instance subclasses.
//!
//! Hooking a single instance moves it into a private subclass of its class
//! so that the subclass's method table, and nothing else, carries the
//! replacement. Each subclass is exclusive to one instance.
//!
//! Someone else may later move a wrapped instance into a subclass of ours
//! (key-value observing does this). Such an instance still counts as
//! wrapped, and it is left where it is until it is destroyed.

use crate::error::{Error, Result, internal_error};
use crate::runtime::{Class, Object, WeakObject};
use fxhash::FxHashMap;
use std::sync::Arc;

/// Association key of the marker naming the manager that wrapped an
/// instance. Manager keys count down from `usize::MAX`, so 0 is free.
const OWNER_KEY: usize = 0;

/// Marker stored on wrapped instances.
struct WrapOwner(usize);

/// Bookkeeping for one wrapped instance.
pub(crate) struct ShadowRecord {
    pub(crate) original: Class,
    pub(crate) subclass: Class,
    pub(crate) instance: WeakObject,
}

/// Wrapped instances, keyed by subclass identity.
pub(crate) struct DynamicClasses {
    records: FxHashMap<usize, ShadowRecord>,
    prefix: String,
    counter: u64,
    owner: usize,
}

/// Result of [`DynamicClasses::unwrap`].
pub(crate) enum Unwrapped {
    /// The instance left its subclass, which is disposed.
    Restored(ShadowRecord),
    /// The instance was re-classed below its subclass by someone else and
    /// stays wrapped.
    Reclassed,
}

impl ShadowRecord {
    /// Moves the instance, if alive and still in its subclass, back to its
    /// original class. Returns `None` for dead or re-classed instances.
    pub(crate) fn release_instance(&self) -> Option<Object> {
        let instance = self.instance.upgrade()?;
        if instance.class() != self.subclass {
            return None;
        }
        instance.set_class(&self.original);
        drop(instance.remove_associated(OWNER_KEY));
        Some(instance)
    }

    /// Returns `true` if the instance is alive and someone else moved it
    /// out of its subclass.
    pub(crate) fn is_reclassed(&self) -> bool {
        self.instance
            .upgrade()
            .is_some_and(|instance| instance.class() != self.subclass)
    }
}

impl DynamicClasses {
    /// `owner` identifies the manager; instances wrapped by another owner
    /// are refused.
    pub(crate) fn new(prefix: &str, owner: usize) -> Self {
        DynamicClasses {
            records: FxHashMap::default(),
            prefix: prefix.to_string(),
            counter: 0,
            owner,
        }
    }

    pub(crate) fn is_dynamic(&self, class: &Class) -> bool {
        self.records.contains_key(&class.id())
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns the id of the subclass `class` is, or inherits from.
    fn owning_subclass(&self, class: &Class) -> Option<usize> {
        let mut current = Some(class.clone());
        while let Some(candidate) = current {
            if self.records.contains_key(&candidate.id()) {
                return Some(candidate.id());
            }
            current = candidate.super_class();
        }
        None
    }

    /// Returns the subclass wrapping `instance`, if any.
    pub(crate) fn subclass_of(&self, instance: &Object) -> Option<Class> {
        let id = self.owning_subclass(&instance.class())?;
        self.records.get(&id).map(|record| record.subclass.clone())
    }

    /// Moves `instance` into a fresh subclass of its class.
    ///
    /// # Errors
    ///
    /// - `InstanceHookedByAnotherManager` if another owner wrapped it
    /// - `InternalError` if the instance is already wrapped
    pub(crate) fn wrap(&mut self, instance: &Object) -> Result<Class> {
        let original = instance.class();
        if let Some(owner) = instance.associated::<WrapOwner>(OWNER_KEY) {
            if owner.0 != self.owner {
                return Err(Error::InstanceHookedByAnotherManager);
            }
        }
        if self.owning_subclass(&original).is_some() {
            return Err(internal_error!());
        }

        let subclass = loop {
            self.counter += 1;
            let name = format!("{}{}_{}", self.prefix, original.name(), self.counter);
            match Class::new(&name, &original) {
                Ok(subclass) => break subclass,
                Err(Error::ClassAlreadyExists { .. }) => continue,
                Err(err) => return Err(err),
            }
        };

        instance.set_class(&subclass);
        instance.set_associated(OWNER_KEY, Arc::new(WrapOwner(self.owner)));
        oxhook_log::debug!("wrapped instance of {original} in {subclass}");
        self.records.insert(
            subclass.id(),
            ShadowRecord {
                original,
                subclass: subclass.clone(),
                instance: instance.downgrade(),
            },
        );
        Ok(subclass)
    }

    /// Moves `instance` back to its original class and disposes the
    /// subclass.
    ///
    /// A live instance re-classed below its subclass is left alone. Once
    /// it is being destroyed its record is dropped without touching its
    /// class.
    ///
    /// # Errors
    ///
    /// `InternalError` if the instance is not wrapped.
    pub(crate) fn unwrap(&mut self, instance: &Object) -> Result<Unwrapped> {
        let current = instance.class();
        let id = self
            .owning_subclass(&current)
            .ok_or_else(|| internal_error!())?;
        let reclassed = id != current.id();
        if reclassed && !instance.is_deallocating() {
            return Ok(Unwrapped::Reclassed);
        }

        let record = self.records.remove(&id).ok_or_else(|| internal_error!())?;
        if !reclassed {
            instance.set_class(&record.original);
        }
        drop(instance.remove_associated(OWNER_KEY));
        record.subclass.dispose()?;
        oxhook_log::debug!(
            "unwrapped instance from {} back to {}",
            record.subclass,
            record.original
        );
        Ok(Unwrapped::Restored(record))
    }

    /// Removes every record, for manager teardown.
    pub(crate) fn drain(&mut self) -> Vec<ShadowRecord> {
        self.records.drain().map(|(_, record)| record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_and_unwrap() {
        let class = Class::new_root("DynamicWrap").unwrap();
        let obj = Object::new(&class).unwrap();
        let sibling = Object::new(&class).unwrap();
        let mut dynamic = DynamicClasses::new("Test_", 1);

        let subclass = dynamic.wrap(&obj).unwrap();
        assert!(subclass.name().starts_with("Test_DynamicWrap_"));
        assert_eq!(obj.class(), subclass);
        assert_eq!(sibling.class(), class);
        assert!(subclass.is_subclass_of(&class));
        assert!(dynamic.is_dynamic(&subclass));
        assert_eq!(dynamic.len(), 1);

        let Unwrapped::Restored(record) = dynamic.unwrap(&obj).unwrap() else {
            panic!("instance was not restored");
        };
        assert_eq!(record.original, class);
        assert!(record.instance.points_to(&obj));
        assert_eq!(obj.class(), class);
        assert!(subclass.is_disposed());
        assert_eq!(dynamic.len(), 0);
    }

    #[test]
    fn test_double_wrap_and_stray_unwrap_fail() {
        let class = Class::new_root("DynamicDoubleWrap").unwrap();
        let obj = Object::new(&class).unwrap();
        let mut dynamic = DynamicClasses::new("Test_", 1);

        assert!(matches!(dynamic.unwrap(&obj), Err(Error::InternalError { .. })));
        dynamic.wrap(&obj).unwrap();
        assert!(matches!(dynamic.wrap(&obj), Err(Error::InternalError { .. })));
    }

    #[test]
    fn test_foreign_owner_is_refused() {
        let class = Class::new_root("DynamicForeignOwner").unwrap();
        let obj = Object::new(&class).unwrap();
        let mut ours = DynamicClasses::new("Ours_", 1);
        let mut theirs = DynamicClasses::new("Theirs_", 2);

        ours.wrap(&obj).unwrap();
        assert_eq!(
            theirs.wrap(&obj).unwrap_err(),
            Error::InstanceHookedByAnotherManager
        );
        assert!(matches!(ours.unwrap(&obj).unwrap(), Unwrapped::Restored(_)));
        theirs.wrap(&obj).unwrap();
        assert!(obj.class().name().starts_with("Theirs_"));
    }

    #[test]
    fn test_reclassed_instance_stays_wrapped() {
        let class = Class::new_root("DynamicReclassed").unwrap();
        let obj = Object::new(&class).unwrap();
        let mut dynamic = DynamicClasses::new("Test_", 1);

        let subclass = dynamic.wrap(&obj).unwrap();
        let observing = Class::new("Observing_DynamicReclassed", &subclass).unwrap();
        obj.set_class(&observing);
        assert_eq!(dynamic.subclass_of(&obj), Some(subclass.clone()));
        assert!(matches!(dynamic.wrap(&obj), Err(Error::InternalError { .. })));

        assert!(matches!(dynamic.unwrap(&obj).unwrap(), Unwrapped::Reclassed));
        assert_eq!(obj.class(), observing);
        assert_eq!(dynamic.len(), 1);
        assert!(!subclass.is_disposed());

        obj.set_class(&subclass);
        assert!(matches!(dynamic.unwrap(&obj).unwrap(), Unwrapped::Restored(_)));
        assert_eq!(obj.class(), class);
        assert_eq!(dynamic.len(), 0);
    }

    #[test]
    fn test_names_skip_taken_classes() {
        let class = Class::new_root("DynamicTaken").unwrap();
        let _squatter = Class::new_root("Skip_DynamicTaken_1").unwrap();
        let obj = Object::new(&class).unwrap();
        let mut dynamic = DynamicClasses::new("Skip_", 1);
        assert_eq!(dynamic.wrap(&obj).unwrap().name(), "Skip_DynamicTaken_2");
    }
}
