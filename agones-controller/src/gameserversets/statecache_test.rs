use agones_core::crd::RequiredMetadata;

use super::statecache::GameServerStateCache;
use crate::fixtures::game_server;

#[test]
fn created_entries_are_merged_until_listed() {
    let cache = GameServerStateCache::default();
    let gs = game_server("fresh");
    cache.created(&gs);

    // The lister hasn't caught up: the created server is merged in.
    let list = cache.reconcile_with_updated_server_list(vec![]);
    assert_eq!(list.len(), 1);
    assert_eq!(RequiredMetadata::name(&list[0]), "fresh");
    assert_eq!(cache.len(), 1);

    // The lister caught up: the shadow entry is garbage collected.
    let list = cache.reconcile_with_updated_server_list(vec![gs.clone()]);
    assert_eq!(list.len(), 1);
    assert!(cache.is_empty());

    // And nothing is merged afterwards.
    let list = cache.reconcile_with_updated_server_list(vec![]);
    assert!(list.is_empty());
}

#[test]
fn deleted_entries_are_hidden_until_gone() {
    let cache = GameServerStateCache::default();
    let gs = game_server("doomed");
    cache.deleted(&gs);

    // The lister still sees the server: it is hidden from the result.
    let list = cache.reconcile_with_updated_server_list(vec![gs.clone()]);
    assert!(list.is_empty());
    assert_eq!(cache.len(), 1);

    // The lister caught up with the deletion: the entry is collected.
    let list = cache.reconcile_with_updated_server_list(vec![]);
    assert!(list.is_empty());
    assert!(cache.is_empty());
}

#[test]
fn unrelated_servers_pass_through() {
    let cache = GameServerStateCache::default();
    cache.created(&game_server("fresh"));
    cache.deleted(&game_server("doomed"));

    let list = cache.reconcile_with_updated_server_list(vec![game_server("steady"), game_server("doomed")]);

    let names: Vec<&str> = list.iter().map(|gs| RequiredMetadata::name(gs)).collect();
    assert_eq!(list.len(), 2);
    assert!(names.contains(&"steady"));
    assert!(names.contains(&"fresh"));
    assert!(!names.contains(&"doomed"));
}

#[test]
fn latest_intent_wins_per_uid() {
    let cache = GameServerStateCache::default();
    let gs = game_server("flip");

    cache.created(&gs);
    cache.deleted(&gs);

    // Create-then-delete within the lag window: the server must not reappear.
    let list = cache.reconcile_with_updated_server_list(vec![]);
    assert!(list.is_empty());
}
