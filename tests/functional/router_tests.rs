//! Router registry tests: listing registered routers with upgrade
//! annotations and removing stale registrations.

use semver::Version;
use serde_json::Map;

use mysql_admin::controller::error::Error;
use mysql_admin::controller::router::RouterCompatTable;
use mysql_admin::metadata::types::RouterRecord;

use crate::mock_state::*;

fn router(id: u64, hostname: &str, label: &str, version: Option<&str>) -> RouterRecord {
    RouterRecord {
        router_id: id,
        label: label.to_string(),
        hostname: hostname.to_string(),
        version: version.map(str::to_string),
        last_check_in: None,
        attributes: Map::new(),
    }
}

#[tokio::test]
async fn test_list_routers_annotates_upgrade_requirement() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.meta.add_router(router(1, "app1", "r1", Some("8.0.19")));
    fixture.meta.add_router(router(2, "app1", "r2", Some("8.0.18")));
    fixture.meta.add_router(router(3, "app2", "", Some("1.0.9")));
    fixture.meta.add_router(router(4, "app3", "old", None));

    let routers = cluster.list_routers(false).await.unwrap();
    assert_eq!(routers.len(), 4);

    let by_id = |id: u64| routers.iter().find(|r| r.record.router_id == id).unwrap();
    // Schema 2.3.0 requires router 8.0.19 or newer.
    assert!(!by_id(1).upgrade_required);
    assert!(by_id(2).upgrade_required);
    assert!(by_id(3).upgrade_required);
    // A router that never reported a version cannot be proven compatible.
    assert!(by_id(4).upgrade_required);
}

#[tokio::test]
async fn test_list_routers_parses_last_check_in() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    let mut record = router(1, "app1", "r1", Some("8.0.19"));
    record.last_check_in = Some("2026-08-20 10:15:00".to_string());
    fixture.meta.add_router(record);
    fixture.meta.add_router(router(2, "app2", "", Some("8.0.19")));

    let routers = cluster.list_routers(false).await.unwrap();
    let checked = routers[0].last_check_in.expect("parses the DATETIME text");
    assert_eq!(checked.year(), 2026);
    assert_eq!(checked.hour(), 10);
    assert!(routers[1].last_check_in.is_none());
}

#[tokio::test]
async fn test_list_routers_filter_keeps_only_stale_ones() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.meta.add_router(router(1, "app1", "r1", Some("8.0.19")));
    fixture.meta.add_router(router(2, "app1", "r2", Some("8.0.18")));

    let routers = cluster.list_routers(true).await.unwrap();
    assert_eq!(routers.len(), 1);
    assert_eq!(routers[0].record.router_id, 2);
}

#[tokio::test]
async fn test_list_routers_against_legacy_schema() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.meta.set_schema_version(Version::new(1, 0, 1));
    fixture.meta.add_router(router(1, "app1", "r1", Some("1.0.9")));

    // Under a 1.x schema, any 1.x router is current.
    let routers = cluster.list_routers(false).await.unwrap();
    assert!(!routers[0].upgrade_required);
}

#[tokio::test]
async fn test_list_routers_honors_custom_compat_table() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.meta.add_router(router(1, "app1", "r1", Some("8.0.19")));

    // A deployment can demand a newer router than the built-in table.
    cluster.set_router_compat(RouterCompatTable::new(vec![(
        Version::new(2, 0, 0),
        Version::new(8, 4, 0),
    )]));

    let routers = cluster.list_routers(false).await.unwrap();
    assert!(routers[0].upgrade_required);
}

#[tokio::test]
async fn test_remove_router_metadata() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.meta.add_router(router(1, "app1", "r1", Some("8.0.19")));
    fixture.meta.add_router(router(2, "app1", "r2", Some("8.0.19")));

    cluster
        .remove_router_metadata("app1::r2")
        .await
        .expect("removal succeeds");

    let remaining = fixture.meta.routers();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].router_id, 1);
}

#[tokio::test]
async fn test_remove_router_with_empty_label() {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.meta.add_router(router(1, "app2", "", Some("8.0.19")));

    cluster
        .remove_router_metadata("app2::")
        .await
        .expect("empty label is a valid identifier");
    assert!(fixture.meta.routers().is_empty());
}

#[tokio::test]
async fn test_remove_router_rejects_malformed_identifiers() {
    let (mut cluster, _fixture) = seeded_cluster(true).await;

    for identifier in ["app1", "::r1", "app1::r1::extra", "app:1::r1"] {
        let err = cluster.remove_router_metadata(identifier).await.unwrap_err();
        assert!(matches!(err, Error::Argument(_)), "{}", identifier);
        assert!(err.to_string().contains(identifier), "{}", identifier);
    }
}

#[tokio::test]
async fn test_remove_unknown_router_is_a_metadata_error() {
    let (mut cluster, _fixture) = seeded_cluster(true).await;

    let err = cluster
        .remove_router_metadata("ghost::r1")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Metadata(_)));
    assert!(err.to_string().contains("ghost::r1"));
}
