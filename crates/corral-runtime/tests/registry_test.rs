//! Registry semantics shared by every driver using it.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use corral_common::types::ContainerId;
use corral_core::profile::IsolationConfig;
use corral_runtime::backend::RuntimeFactory;
use corral_runtime::error::DriverError;
use corral_runtime::registry::{ActiveContainer, ActiveContainers};

use common::{FakeFactory, World};

fn entry(world: &Arc<World>, id: &str) -> Arc<ActiveContainer> {
    let id = ContainerId::new(id);
    let handle = FakeFactory(Arc::clone(world))
        .create(&id, &IsolationConfig::default())
        .unwrap();
    Arc::new(ActiveContainer::new(id, handle.into()))
}

#[test]
fn duplicate_ids_are_rejected() {
    let world = Arc::new(World::default());
    let registry = ActiveContainers::new();
    registry.insert(entry(&world, "a")).unwrap();

    let err = registry.insert(entry(&world, "a")).unwrap_err();
    assert!(matches!(err, DriverError::AlreadyActive { .. }));
    assert_eq!(registry.len(), 1);
}

#[test]
fn remove_is_idempotent() {
    let world = Arc::new(World::default());
    let registry = ActiveContainers::new();
    let a = entry(&world, "a");
    registry.insert(Arc::clone(&a)).unwrap();

    assert!(registry.remove_entry(&a));
    assert!(!registry.remove_entry(&a));
    assert!(registry.is_empty());
}

#[test]
fn stale_entry_removal_spares_newer_container() {
    let world = Arc::new(World::default());
    let registry = ActiveContainers::new();
    let old = entry(&world, "a");
    registry.insert(Arc::clone(&old)).unwrap();
    assert!(registry.remove_entry(&old));

    let new = entry(&world, "a");
    registry.insert(Arc::clone(&new)).unwrap();
    assert!(!registry.remove_entry(&old));
    assert!(Arc::ptr_eq(&registry.get(new.id()).unwrap(), &new));
    assert!(registry.remove_entry(&new));
    assert!(registry.is_empty());
}

#[test]
fn ids_are_sorted() {
    let world = Arc::new(World::default());
    let registry = ActiveContainers::new();
    for id in ["c", "a", "b"] {
        registry.insert(entry(&world, id)).unwrap();
    }
    let ids: Vec<_> = registry.ids().iter().map(|id| id.as_str().to_string()).collect();
    assert_eq!(ids, ["a", "b", "c"]);
}

#[test]
fn concurrent_inserts_admit_exactly_one() {
    let world = Arc::new(World::default());
    let registry = Arc::new(ActiveContainers::new());
    let admitted: usize = std::thread::scope(|s| {
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let container = entry(&world, "race");
                s.spawn(move || registry.insert(container).is_ok())
            })
            .collect();
        workers
            .into_iter()
            .map(|w| usize::from(w.join().unwrap()))
            .sum()
    });
    assert_eq!(admitted, 1);
    assert_eq!(registry.len(), 1);
}
