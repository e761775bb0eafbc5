//! End-to-end tests for the storage coordinator.

mod common;

use bytes::Bytes;
use common::{DiskRoot, SessionOnly, TestStorage, origin, url};
use roster_core::{RegistrationId, ResourceId, VersionId, VersionStatus};
use roster_coordinator::{
    CoordinatorOptions, LiveRegistration, LiveVersion, ScriptCacheError, StorageCoordinator,
    StorageEvent, StorageStatusError,
};
use roster_metadata::repos::{MetaRepo, RegistrationRepo, ResourceIdRepo};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

const SW: &[u8] = b"self.addEventListener('fetch', () => {});";

#[tokio::test]
async fn test_ids_are_allocated_after_lazy_init() {
    let storage = TestStorage::in_memory();
    let coordinator = &storage.coordinator;

    assert_eq!(coordinator.new_registration_id().await, Ok(RegistrationId::new(0)));
    assert_eq!(coordinator.new_registration_id().await, Ok(RegistrationId::new(1)));
    assert_eq!(coordinator.new_version_id().await, Ok(VersionId::new(0)));
    assert_eq!(coordinator.new_resource_id().await, Ok(ResourceId::new(0)));
    assert!(!coordinator.is_disabled().await);
}

#[tokio::test]
async fn test_store_then_find_by_document_pattern_and_id() {
    let mut storage = TestStorage::in_memory();
    let installed = storage
        .install_and_store(
            "https://www.example.com/scope/",
            &[("https://www.example.com/scope/sw.js", SW)],
        )
        .await;
    let event = storage
        .wait_for(|e| matches!(e, StorageEvent::RegistrationStored { .. }))
        .await;
    assert_eq!(
        event,
        StorageEvent::RegistrationStored {
            registration_id: installed.registration_id,
            version_id: installed.version_id,
            origin: origin("https://www.example.com"),
        }
    );
    assert_eq!(
        storage.quota.deltas(),
        vec![(origin("https://www.example.com"), SW.len() as i64)]
    );

    let coordinator = &storage.coordinator;
    let found = coordinator
        .find_registration_for_document(&url("https://www.example.com/scope/page.html"))
        .await
        .unwrap();
    assert_eq!(found.id, installed.registration_id);
    assert_eq!(found.resources_total_size_bytes, SW.len() as u64);

    let found = coordinator
        .find_registration_for_pattern(&url("https://www.example.com/scope/"))
        .await
        .unwrap();
    assert_eq!(found.id, installed.registration_id);

    assert_eq!(
        coordinator
            .find_registration_for_pattern(&url("https://www.example.com/other/"))
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator
            .find_registration_for_document(&url("https://www.example.com/outside.html"))
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator
            .find_registration_for_document(&url("https://unknown.example.com/scope/"))
            .await,
        Err(StorageStatusError::NotFound)
    );

    let found = coordinator
        .find_registration_for_id(installed.registration_id, &origin("https://www.example.com"))
        .await
        .unwrap();
    assert_eq!(found.scope, url("https://www.example.com/scope/"));
}

#[tokio::test]
async fn test_lookups_rebuild_live_objects_from_the_store() {
    let storage = TestStorage::in_memory();
    let installed = storage
        .install_and_store("https://a.test/", &[("https://a.test/sw.js", SW)])
        .await;
    storage.evict_all(&installed);
    let live = storage.coordinator.live();
    assert_eq!(live.registration_count(), 0);

    let found = storage
        .coordinator
        .find_registration_for_id_only(installed.registration_id)
        .await
        .unwrap();
    assert_eq!(found.active_version, Some(installed.version_id));

    let version = live.version(installed.version_id).unwrap();
    assert_eq!(version.status, VersionStatus::Activated);
    assert_eq!(version.script_cache_map.resource_ids(), installed.resource_ids);
    assert_eq!(
        version
            .script_cache_map
            .lookup_resource_size(&url("https://a.test/sw.js")),
        Some(SW.len() as u64)
    );

    assert_eq!(
        storage
            .coordinator
            .find_registration_for_id_only(RegistrationId::new(77))
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert!(!storage.coordinator.is_disabled().await);
}

#[tokio::test]
async fn test_document_lookup_prefers_longest_scope() {
    let storage = TestStorage::in_memory();
    let outer = storage
        .install_and_store("https://a.test/app/", &[("https://a.test/app/sw.js", SW)])
        .await;
    let inner = storage
        .install_and_store(
            "https://a.test/app/admin/",
            &[("https://a.test/app/admin/sw.js", SW)],
        )
        .await;
    storage.evict_all(&outer);
    storage.evict_all(&inner);

    let coordinator = &storage.coordinator;
    let found = coordinator
        .find_registration_for_document(&url("https://a.test/app/admin/users"))
        .await
        .unwrap();
    assert_eq!(found.id, inner.registration_id);

    let found = coordinator
        .find_registration_for_document(&url("https://a.test/app/index.html"))
        .await
        .unwrap();
    assert_eq!(found.id, outer.registration_id);
}

#[tokio::test]
async fn test_installing_registrations_are_found_before_storing() {
    let storage = TestStorage::in_memory();
    let installed = storage
        .install("https://b.test/", &[("https://b.test/sw.js", SW)], false)
        .await;
    let coordinator = &storage.coordinator;
    coordinator.notify_installing_registration(installed.registration_id);

    let found = coordinator
        .find_registration_for_document(&url("https://b.test/page"))
        .await
        .unwrap();
    assert_eq!(found.id, installed.registration_id);
    let found = coordinator
        .find_registration_for_pattern(&url("https://b.test/"))
        .await
        .unwrap();
    assert_eq!(found.id, installed.registration_id);
    let found = coordinator
        .find_registration_for_id(installed.registration_id, &origin("https://b.test"))
        .await
        .unwrap();
    assert_eq!(found.id, installed.registration_id);

    let listed = coordinator
        .get_registrations_for_origin(&origin("https://b.test"))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    let infos = coordinator.get_all_registrations_infos().await.unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(
        infos[0].waiting_version.as_ref().unwrap().version_id,
        installed.version_id
    );

    coordinator.notify_done_installing_registration(
        installed.registration_id,
        Some(installed.version_id),
        true,
    );
    assert_eq!(
        coordinator
            .find_registration_for_document(&url("https://b.test/page"))
            .await,
        Err(StorageStatusError::NotFound)
    );
}

#[tokio::test]
async fn test_store_without_resources_fails_without_recovery() {
    let storage = TestStorage::in_memory();
    let coordinator = &storage.coordinator;
    let registration_id = coordinator.new_registration_id().await.unwrap();
    let version_id = coordinator.new_version_id().await.unwrap();
    coordinator
        .live()
        .insert_registration(LiveRegistration::new(registration_id, url("https://c.test/")));
    coordinator.live().insert_version(LiveVersion::new(
        version_id,
        registration_id,
        url("https://c.test/sw.js"),
    ));

    assert_eq!(
        coordinator.store_registration(registration_id, version_id).await,
        Err(StorageStatusError::Failed)
    );
    assert_eq!(
        coordinator
            .store_registration(RegistrationId::new(99), version_id)
            .await,
        Err(StorageStatusError::Failed)
    );
    assert!(!coordinator.is_disabled().await);
    assert!(storage.quota.deltas().is_empty());
}

#[tokio::test]
async fn test_overwrite_purges_old_resources_once_version_is_gone() {
    let mut storage = TestStorage::in_memory();
    let first = storage
        .install_and_store("https://d.test/", &[("https://d.test/sw.js", b"v1")])
        .await;
    let old_resource = first.resource_ids[0];

    // A new version of the same registration.
    let coordinator = storage.coordinator.clone();
    let version_id = coordinator.new_version_id().await.unwrap();
    let script = url("https://d.test/sw.js");
    let mut version = LiveVersion::new(version_id, first.registration_id, script);
    version.status = VersionStatus::Installing;
    coordinator.live().insert_version(version);
    let new_resource = storage
        .cache_script(version_id, &url("https://d.test/sw.js"), b"version 2")
        .await;
    coordinator.live().with_registration_mut(first.registration_id, |r| {
        r.active_version = Some(version_id);
    });
    coordinator
        .store_registration(first.registration_id, version_id)
        .await
        .unwrap();

    // The old version is still live, so its body stays.
    coordinator.flush().await;
    assert!(storage.cache.exists(old_resource).await.unwrap());
    assert_eq!(
        storage.store.get_purgeable_resource_ids().await.unwrap(),
        BTreeSet::from([old_resource])
    );
    assert_eq!(
        storage.quota.deltas().last().unwrap().1,
        b"version 2".len() as i64 - b"v1".len() as i64
    );

    coordinator.doom_version(first.version_id);
    storage.wait_for_purge(old_resource).await;
    assert!(!storage.cache.exists(old_resource).await.unwrap());
    assert!(storage.cache.exists(new_resource).await.unwrap());
    assert!(storage.store.get_purgeable_resource_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_overwrite_purges_immediately_when_old_version_is_not_live() {
    let mut storage = TestStorage::in_memory();
    let first = storage
        .install_and_store("https://e.test/", &[("https://e.test/sw.js", b"v1")])
        .await;
    let coordinator = storage.coordinator.clone();
    coordinator.live().with_registration_mut(first.registration_id, |r| {
        r.active_version = None;
    });
    coordinator.live().evict_version(first.version_id).unwrap();

    let version_id = coordinator.new_version_id().await.unwrap();
    let script = url("https://e.test/sw.js");
    let mut version = LiveVersion::new(version_id, first.registration_id, script);
    version.status = VersionStatus::Installing;
    coordinator.live().insert_version(version);
    storage
        .cache_script(version_id, &url("https://e.test/sw.js"), b"v2")
        .await;
    coordinator
        .store_registration(first.registration_id, version_id)
        .await
        .unwrap();

    storage.wait_for_purge(first.resource_ids[0]).await;
    assert!(!storage.cache.exists(first.resource_ids[0]).await.unwrap());
}

#[tokio::test]
async fn test_delete_registration_updates_index_and_quota() {
    let mut storage = TestStorage::in_memory();
    let installed = storage
        .install_and_store("https://f.test/", &[("https://f.test/sw.js", SW)])
        .await;
    let coordinator = storage.coordinator.clone();
    let f = origin("https://f.test");

    coordinator
        .delete_registration(installed.registration_id, &f)
        .await
        .unwrap();
    storage
        .wait_for(|e| matches!(e, StorageEvent::RegistrationDeleted { .. }))
        .await;
    assert!(
        coordinator
            .live()
            .registration(installed.registration_id)
            .unwrap()
            .is_deleted
    );
    assert_eq!(storage.quota.deltas().last(), Some(&(f.clone(), -(SW.len() as i64))));
    assert!(coordinator.get_all_registrations_infos().await.unwrap().is_empty());
    assert_eq!(
        coordinator
            .find_registration_for_document(&url("https://f.test/page"))
            .await,
        Err(StorageStatusError::NotFound)
    );

    // Deleting again is fine.
    coordinator
        .delete_registration(installed.registration_id, &f)
        .await
        .unwrap();

    // The live version keeps its body until it is doomed.
    coordinator.live().with_registration_mut(installed.registration_id, |r| {
        r.active_version = None;
    });
    coordinator.doom_version(installed.version_id);
    storage.wait_for_purge(installed.resource_ids[0]).await;
}

#[tokio::test]
async fn test_deleted_registration_is_not_found_while_origin_stays() {
    let mut storage = TestStorage::in_memory();
    let deleted = storage
        .install_and_store("https://f.test/a/", &[("https://f.test/a/sw.js", SW)])
        .await;
    let kept = storage
        .install_and_store("https://f.test/b/", &[("https://f.test/b/sw.js", SW)])
        .await;
    let coordinator = storage.coordinator.clone();
    let f = origin("https://f.test");

    coordinator
        .delete_registration(deleted.registration_id, &f)
        .await
        .unwrap();
    storage
        .wait_for(|e| matches!(e, StorageEvent::RegistrationDeleted { .. }))
        .await;
    assert_eq!(storage.quota.deltas().last(), Some(&(f.clone(), -(SW.len() as i64))));

    // Still live in memory, but every lookup misses it.
    assert!(coordinator.live().registration(deleted.registration_id).is_some());
    coordinator.notify_installing_registration(deleted.registration_id);
    assert_eq!(
        coordinator
            .find_registration_for_id(deleted.registration_id, &f)
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator
            .find_registration_for_id_only(deleted.registration_id)
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator
            .find_registration_for_pattern(&url("https://f.test/a/"))
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator
            .find_registration_for_document(&url("https://f.test/a/page"))
            .await,
        Err(StorageStatusError::NotFound)
    );

    let found = coordinator
        .find_registration_for_id(kept.registration_id, &f)
        .await
        .unwrap();
    assert_eq!(found.id, kept.registration_id);
    let found = coordinator
        .find_registration_for_document(&url("https://f.test/b/page"))
        .await
        .unwrap();
    assert_eq!(found.id, kept.registration_id);

    // A delete that finds nothing stored still reports its (empty) size change.
    coordinator
        .delete_registration(deleted.registration_id, &f)
        .await
        .unwrap();
    assert_eq!(storage.quota.deltas().last(), Some(&(f.clone(), 0)));
}

#[tokio::test]
async fn test_registration_infos_prefer_live_state() {
    let storage = TestStorage::in_memory();
    let kept = storage
        .install_and_store("https://g.test/a/", &[("https://g.test/a/sw.js", SW)])
        .await;
    let evicted = storage
        .install_and_store("https://g.test/b/", &[("https://g.test/b/sw.js", SW)])
        .await;
    storage.evict_all(&evicted);
    storage.coordinator.live().with_version_mut(kept.version_id, |v| {
        v.status = VersionStatus::Activating;
    });

    let infos = storage.coordinator.get_all_registrations_infos().await.unwrap();
    assert_eq!(infos.len(), 2);
    assert_eq!(
        infos[0].active_version.as_ref().unwrap().status,
        VersionStatus::Activating
    );
    assert_eq!(
        infos[1].active_version.as_ref().unwrap().status,
        VersionStatus::Activated
    );
    assert_eq!(infos[1].stored_version_size_bytes, SW.len() as u64);
    // Listing never builds live objects.
    assert!(!storage.coordinator.live().has_registration(evicted.registration_id));
}

#[tokio::test]
async fn test_update_active_state_and_last_check() {
    let storage = TestStorage::in_memory();
    let installed = storage
        .install("https://h.test/", &[("https://h.test/sw.js", SW)], false)
        .await;
    let coordinator = &storage.coordinator;
    let h = origin("https://h.test");
    coordinator
        .store_registration(installed.registration_id, installed.version_id)
        .await
        .unwrap();

    coordinator
        .update_to_active_state(installed.registration_id, &h)
        .await
        .unwrap();
    let checked = OffsetDateTime::from_unix_timestamp(1_714_564_800).unwrap();
    coordinator
        .update_last_update_check_time(installed.registration_id, &h, checked)
        .await
        .unwrap();
    assert_eq!(
        coordinator
            .live()
            .registration(installed.registration_id)
            .unwrap()
            .last_update_check,
        checked
    );

    storage.evict_all(&installed);
    let found = coordinator
        .find_registration_for_id(installed.registration_id, &h)
        .await
        .unwrap();
    assert_eq!(found.active_version, Some(installed.version_id));
    assert_eq!(found.last_update_check, checked);

    assert_eq!(
        coordinator
            .update_to_active_state(RegistrationId::new(500), &h)
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert!(!coordinator.is_disabled().await);
}

#[tokio::test]
async fn test_user_data_through_the_coordinator() {
    let storage = TestStorage::in_memory();
    let installed = storage
        .install_and_store("https://i.test/", &[("https://i.test/sw.js", SW)])
        .await;
    let coordinator = &storage.coordinator;
    let i = origin("https://i.test");
    let id = installed.registration_id;

    coordinator.store_user_data(id, &i, "push", b"token").await.unwrap();
    assert_eq!(coordinator.get_user_data(id, "push").await.unwrap(), b"token");
    assert_eq!(
        coordinator.get_user_data_for_all_registrations("push").await.unwrap(),
        vec![(id, b"token".to_vec())]
    );

    assert_eq!(
        coordinator.get_user_data(id, "missing").await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator
            .store_user_data(RegistrationId::new(404), &i, "push", b"x")
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(
        coordinator.store_user_data(id, &i, "", b"x").await,
        Err(StorageStatusError::Failed)
    );
    assert_eq!(
        coordinator.get_user_data(RegistrationId::INVALID, "push").await,
        Err(StorageStatusError::Failed)
    );
    assert_eq!(
        coordinator.get_user_data_for_all_registrations("").await,
        Err(StorageStatusError::Failed)
    );

    coordinator.clear_user_data(id, "push").await.unwrap();
    assert_eq!(
        coordinator.get_user_data(id, "push").await,
        Err(StorageStatusError::NotFound)
    );
    assert!(!coordinator.is_disabled().await);
}

#[tokio::test]
async fn test_stale_resources_are_collected_on_first_mutation() {
    let store = Arc::new(roster_metadata::SqliteStore::in_memory());
    let cache = Arc::new(roster_storage::MemoryBackend::new(1024));
    let leftover = ResourceId::new(5);
    let doomed = ResourceId::new(6);
    store.write_uncommitted_resource_ids(&[leftover]).await.unwrap();
    store.write_purgeable_resource_ids(&[doomed]).await.unwrap();
    roster_storage::BlobCache::put(&*cache, leftover, Bytes::from_static(b"half")).await.unwrap();
    roster_storage::BlobCache::put(&*cache, doomed, Bytes::from_static(b"old")).await.unwrap();

    let mut storage = TestStorage::with_parts(store, cache, CoordinatorOptions::default());
    let writer = storage
        .coordinator
        .create_resource_writer(ResourceId::new(7))
        .await
        .unwrap();
    writer.abort().await.unwrap();

    let event = storage
        .wait_for(|e| matches!(e, StorageEvent::StaleResourcesCollected { .. }))
        .await;
    assert_eq!(event, StorageEvent::StaleResourcesCollected { count: 2 });
    storage.wait_for_purge(leftover).await;
    storage.wait_for_purge(doomed).await;

    assert!(!storage.cache.exists(leftover).await.unwrap());
    assert!(!storage.cache.exists(doomed).await.unwrap());
    storage.coordinator.flush().await;
    assert_eq!(
        storage.store.get_uncommitted_resource_ids().await.unwrap(),
        BTreeSet::from([ResourceId::new(7)])
    );
    assert!(storage.store.get_purgeable_resource_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_doom_uncommitted_resource() {
    let mut storage = TestStorage::in_memory();
    let coordinator = storage.coordinator.clone();
    let resource_id = coordinator.new_resource_id().await.unwrap();

    let mut writer = coordinator.create_resource_writer(resource_id).await.unwrap();
    writer.write(Bytes::from_static(b"partial body")).await.unwrap();
    writer.finish().await.unwrap();
    assert_eq!(
        coordinator
            .create_resource_reader(resource_id)
            .read_all()
            .await
            .unwrap(),
        Bytes::from_static(b"partial body")
    );

    coordinator.doom_uncommitted_resource(resource_id);
    storage.wait_for_purge(resource_id).await;
    assert!(!storage.cache.exists(resource_id).await.unwrap());
    coordinator.flush().await;
    assert!(storage.store.get_uncommitted_resource_ids().await.unwrap().is_empty());
    assert!(storage.store.get_purgeable_resource_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_install_purges_its_resources() {
    let mut storage = TestStorage::in_memory();
    let installed = storage
        .install(
            "https://j.test/",
            &[("https://j.test/sw.js", SW), ("https://j.test/lib.js", b"lib")],
            false,
        )
        .await;
    let coordinator = storage.coordinator.clone();
    coordinator.notify_installing_registration(installed.registration_id);
    coordinator.notify_done_installing_registration(
        installed.registration_id,
        Some(installed.version_id),
        false,
    );

    for resource_id in installed.resource_ids.clone() {
        storage.wait_for_purge(resource_id).await;
        assert!(!storage.cache.exists(resource_id).await.unwrap());
    }
}

#[tokio::test]
async fn test_script_cache_map_notifications() {
    let mut storage = TestStorage::in_memory();
    let coordinator = storage.coordinator.clone();
    let registration_id = coordinator.new_registration_id().await.unwrap();
    let version_id = coordinator.new_version_id().await.unwrap();
    let main = url("https://k.test/sw.js");
    let mut version = LiveVersion::new(version_id, registration_id, main.clone());
    version.status = VersionStatus::Installing;
    coordinator.live().insert_version(version);

    let resource_id = storage.cache_script(version_id, &main, SW).await;
    let again = coordinator.live().with_version_mut(version_id, |v| {
        v.script_cache_map.notify_started_caching(
            VersionStatus::Installing,
            main.clone(),
            ResourceId::new(999),
            &coordinator,
        )
    });
    assert_eq!(again, Some(Err(ScriptCacheError::AlreadyCaching(main.clone()))));

    let installed = coordinator.live().with_version_mut(version_id, |v| {
        v.script_cache_map.notify_started_caching(
            VersionStatus::Activated,
            url("https://k.test/late.js"),
            ResourceId::new(998),
            &coordinator,
        )
    });
    assert_eq!(
        installed,
        Some(Err(ScriptCacheError::NotAcceptingResources(
            VersionStatus::Activated
        )))
    );

    // A failed main script is remembered and its resource doomed.
    coordinator.live().with_version_mut(version_id, |v| {
        v.script_cache_map.notify_finished_caching(
            &main,
            0,
            Err("network error".to_string()),
            &coordinator,
        );
    });
    storage.wait_for_purge(resource_id).await;
    let version = coordinator.live().version(version_id).unwrap();
    assert!(version.script_cache_map.is_empty());
    assert_eq!(version.script_cache_map.main_script_error(), Some("network error"));
}

#[tokio::test]
async fn test_uninstalling_registration_lookup() {
    let storage = TestStorage::in_memory();
    let installed = storage
        .install_and_store("https://l.test/", &[("https://l.test/sw.js", SW)])
        .await;
    let coordinator = &storage.coordinator;
    let scope = url("https://l.test/");

    assert!(coordinator.get_uninstalling_registration(&scope).await.is_none());
    coordinator.notify_uninstalling_registration(installed.registration_id);
    let found = coordinator.get_uninstalling_registration(&scope).await.unwrap();
    assert_eq!(found.id, installed.registration_id);
    assert!(found.is_uninstalling);

    coordinator.notify_done_uninstalling_registration(installed.registration_id);
    assert!(coordinator.get_uninstalling_registration(&scope).await.is_none());
}

#[tokio::test]
async fn test_delete_and_start_over_resets_everything() {
    let mut storage = TestStorage::in_memory();
    let installed = storage
        .install_and_store("https://m.test/", &[("https://m.test/sw.js", SW)])
        .await;
    let coordinator = storage.coordinator.clone();

    coordinator.schedule_delete_and_start_over();
    storage
        .wait_for(|e| *e == StorageEvent::DeleteAndStartOverScheduled)
        .await;
    storage.wait_for(|e| *e == StorageEvent::StorageReset).await;

    assert!(!coordinator.is_disabled().await);
    assert_eq!(coordinator.live().registration_count(), 0);
    assert!(!storage.cache.exists(installed.resource_ids[0]).await.unwrap());
    assert_eq!(
        coordinator
            .find_registration_for_id_only(installed.registration_id)
            .await,
        Err(StorageStatusError::NotFound)
    );
    assert_eq!(coordinator.new_registration_id().await, Ok(RegistrationId::new(0)));
}

#[tokio::test]
async fn test_corrupt_database_triggers_recovery() {
    let root = DiskRoot::new();
    let db_path = root.db_path();
    std::fs::create_dir_all(db_path.parent().unwrap()).unwrap();
    std::fs::write(&db_path, b"this is not an sqlite database, not even close").unwrap();

    let coordinator =
        StorageCoordinator::from_config(&root.config, CoordinatorOptions::default()).unwrap();
    let mut events = coordinator.subscribe();

    assert_eq!(
        coordinator.new_registration_id().await,
        Err(StorageStatusError::Failed)
    );
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if events.recv().await.unwrap() == StorageEvent::StorageReset {
                break;
            }
        }
    })
    .await
    .expect("storage reset");

    assert_eq!(coordinator.new_registration_id().await, Ok(RegistrationId::new(0)));
    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_old_blob_cache_is_migrated_on_first_use() {
    let root = DiskRoot::new();
    let old_dir = root.config.old_blob_cache_path().unwrap();
    std::fs::create_dir_all(&old_dir).unwrap();
    std::fs::write(old_dir.join("3"), b"legacy body").unwrap();

    // A database written before migration flags existed.
    let seed = root.open_store();
    seed.skip_writing_migration_flags_on_init_for_testing();
    seed.write_uncommitted_resource_ids(&[ResourceId::new(42)])
        .await
        .unwrap();
    assert!(seed.is_blob_cache_migration_needed().await.unwrap());
    seed.close().await;

    let storage = root.start(CoordinatorOptions::default());
    storage.coordinator.new_registration_id().await.unwrap();
    assert_eq!(
        storage
            .coordinator
            .create_resource_reader(ResourceId::new(3))
            .read_all()
            .await
            .unwrap(),
        Bytes::from_static(b"legacy body")
    );

    tokio::time::timeout(Duration::from_secs(5), async {
        while old_dir.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("old cache deleted");
    storage.coordinator.flush().await;
    assert!(!storage.store.is_blob_cache_migration_needed().await.unwrap());
}

#[tokio::test]
async fn test_shutdown_deletes_session_only_origins() {
    let root = DiskRoot::new();
    let session = origin("https://session.test");
    let options = CoordinatorOptions {
        session_policy: Some(Arc::new(SessionOnly(BTreeSet::from([session.clone()])))),
        ..CoordinatorOptions::default()
    };
    let storage = root.start(options);
    storage
        .install_and_store("https://session.test/", &[("https://session.test/sw.js", SW)])
        .await;
    let kept = storage
        .install_and_store("https://kept.test/", &[("https://kept.test/sw.js", SW)])
        .await;

    storage.coordinator.shutdown().await;
    assert_eq!(
        storage.coordinator.new_registration_id().await,
        Err(StorageStatusError::Failed)
    );

    let reopened = root.open_store();
    assert_eq!(
        reopened.get_origins_with_registrations().await.unwrap(),
        BTreeSet::from([origin("https://kept.test")])
    );
    assert!(
        reopened
            .read_registration(kept.registration_id, &origin("https://kept.test"))
            .await
            .is_ok()
    );
}

#[tokio::test]
async fn test_state_survives_restart() {
    let root = DiskRoot::new();
    let storage = root.start(CoordinatorOptions::default());
    let installed = storage
        .install_and_store("https://n.test/", &[("https://n.test/sw.js", SW)])
        .await;
    storage.coordinator.shutdown().await;
    drop(storage);

    let storage = root.start(CoordinatorOptions::default());
    let found = storage
        .coordinator
        .find_registration_for_document(&url("https://n.test/index.html"))
        .await
        .unwrap();
    assert_eq!(found.id, installed.registration_id);
    assert!(
        storage.coordinator.new_registration_id().await.unwrap() > installed.registration_id
    );
    let body = storage
        .coordinator
        .create_resource_reader(installed.resource_ids[0])
        .read_all()
        .await
        .unwrap();
    assert_eq!(body, Bytes::from_static(SW));
}
