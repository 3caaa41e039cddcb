//! Module lifecycle tests
//!
//! Tests for install, idempotent re-install, collision handling, update, and
//! uninstall.

mod common;

use common::*;
use module_container::container::hooks::{
    AllowAllCollisionHook, DefaultResolverHookFactory, ModuleCollisionHook,
};
use module_container::container::resolver::DefaultResolver;
use module_container::{
    ContainerConfig, ContainerError, InMemoryStore, Module, ModuleContainer,
};
use std::sync::Arc;

#[test]
fn test_install_and_lookup() {
    let container = container();
    let module = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    assert_eq!(module.location(), "mem:a");
    assert_eq!(container.get_module("mem:a").unwrap().id(), module.id());
    assert_eq!(container.modules().len(), 1);

    let revision = module.current_revision().unwrap();
    assert_eq!(revision.name(), Some("pkg"));
    assert_eq!(revision.version(), &v("1.0.0"));
}

#[test]
fn test_install_is_idempotent_by_location() {
    let container = container();
    let first = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    let second = container.install(None, "mem:a", module("other", "9.9.9")).unwrap();
    // Same module returned, no new revision created
    assert_eq!(first.id(), second.id());
    assert_eq!(second.revisions().revisions().len(), 1);
    assert_eq!(second.current_revision().unwrap().name(), Some("pkg"));
}

#[test]
fn test_duplicate_name_version_rejected() {
    let container = container();
    container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    let err = container
        .install(None, "mem:b", module("pkg", "1.0.0"))
        .unwrap_err();
    match err {
        ContainerError::Collision { existing, .. } => assert_eq!(existing, "mem:a"),
        other => panic!("expected collision, got {other}"),
    }
    // A different version of the same name is not a collision
    container.install(None, "mem:c", module("pkg", "2.0.0")).unwrap();
}

#[test]
fn test_collision_hook_can_permit_duplicates() {
    init_tracing();
    let container = ModuleContainer::new(
        ContainerConfig::default(),
        Box::new(InMemoryStore::new()),
        Box::new(DefaultResolver),
        Box::new(DefaultResolverHookFactory),
        Box::new(AllowAllCollisionHook),
    );
    container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    container.install(None, "mem:b", module("pkg", "1.0.0")).unwrap();
    assert_eq!(container.modules().len(), 2);
}

#[test]
fn test_visibility_denied_on_existing_location() {
    struct InvisibleHook;
    impl ModuleCollisionHook for InvisibleHook {
        fn filter_collisions(
            &self,
            _operation: module_container::container::hooks::CollisionOperation,
            _origin: Option<&Arc<Module>>,
            _candidates: &[Arc<Module>],
        ) -> Vec<Arc<Module>> {
            Vec::new()
        }
        fn is_visible(&self, _origin: Option<&Arc<Module>>, _existing: &Arc<Module>) -> bool {
            false
        }
    }

    init_tracing();
    let container = ModuleContainer::new(
        ContainerConfig::default(),
        Box::new(InMemoryStore::new()),
        Box::new(DefaultResolver),
        Box::new(DefaultResolverHookFactory),
        Box::new(InvisibleHook),
    );
    container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    let err = container
        .install(None, "mem:a", module("pkg", "1.0.0"))
        .unwrap_err();
    assert!(matches!(err, ContainerError::VisibilityDenied(_)));
}

#[test]
fn test_update_appends_new_head() {
    let container = container();
    let module_ref = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    let old = module_ref.current_revision().unwrap();

    let new = container.update(&module_ref, module("pkg", "2.0.0")).unwrap();
    assert_eq!(new.version(), &v("2.0.0"));
    assert_eq!(module_ref.current_revision().unwrap().version(), &v("2.0.0"));
    // The old revision stays in the history until refreshed away
    assert_eq!(module_ref.revisions().revisions().len(), 2);
    assert_eq!(old.version(), &v("1.0.0"));
}

#[test]
fn test_update_collision_excludes_self() {
    let container = container();
    let module_ref = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    // Updating to the version the module already has is not a self-collision
    container.update(&module_ref, module("pkg", "1.0.0")).unwrap();
}

#[test]
fn test_update_collision_with_other_module() {
    let container = container();
    let module_ref = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    container.install(None, "mem:b", module("pkg", "2.0.0")).unwrap();
    let err = container
        .update(&module_ref, module("pkg", "2.0.0"))
        .unwrap_err();
    assert!(matches!(err, ContainerError::Collision { .. }));
}

#[test]
fn test_uninstall_is_terminal() {
    let container = container();
    let module_ref = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    container.uninstall(&module_ref).unwrap();

    assert!(container.get_module("mem:a").is_none());
    assert!(module_ref.revisions().is_uninstalled());
    assert!(module_ref.current_revision().is_none());

    let err = container.uninstall(&module_ref).unwrap_err();
    assert!(matches!(err, ContainerError::AlreadyUninstalled(_)));

    let err = container
        .update(&module_ref, module("pkg", "2.0.0"))
        .unwrap_err();
    assert!(matches!(err, ContainerError::AlreadyUninstalled(_)));
}

#[test]
fn test_location_reusable_after_uninstall() {
    let container = container();
    let module_ref = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    container.uninstall(&module_ref).unwrap();
    let fresh = container.install(None, "mem:a", module("pkg", "1.0.0")).unwrap();
    assert_ne!(fresh.id(), module_ref.id());
}

#[test]
fn test_nameless_module_installs() {
    let container = container();
    let module_ref = container
        .install(None, "mem:anon", module_container::ModuleRevisionBuilder::new().version(v("1.0.0")))
        .unwrap();
    assert!(module_ref.current_revision().unwrap().name().is_none());
}
