//! Rescan tests: reconciling metadata with the live group membership,
//! repairing drifted identities and missing recovery accounts.

use serde_json::Value;

use mysql_admin::controller::error::Error;
use mysql_admin::controller::membership::AddInstanceOptions;
use mysql_admin::controller::repl_options::ReplicationOptions;
use mysql_admin::controller::rescan::RescanOptions;
use mysql_admin::metadata::types::{
    ATTR_INVALIDATED, ATTR_RECOVERY_ACCOUNT_HOST, ATTR_RECOVERY_ACCOUNT_USER, ATTR_SERVER_ID,
};

use crate::mock_state::*;

/// A two-member cluster where both rows carry recovery accounts.
async fn two_member_cluster() -> (mysql_admin::Cluster, Fixture) {
    let (mut cluster, fixture) = seeded_cluster(true).await;
    fixture.world.add_server(ServerSim {
        snapshot: snapshot("db2:3306", "uuid-2", 22, ""),
        reachable: true,
        in_group: false,
        channel_users: Vec::new(),
    });
    cluster
        .add_instance(&"db2:3306".parse().unwrap(), AddInstanceOptions::default())
        .await
        .expect("second member joins");
    (cluster, fixture)
}

#[tokio::test]
async fn test_rescan_adds_unmanaged_member_with_flag() {
    let (mut cluster, fixture) = two_member_cluster().await;
    // db3 joined the group behind the engine's back, replicating with its
    // own recovery user.
    let mut sim = ServerSim {
        snapshot: snapshot("db3:3306", "uuid-3", 33, ""),
        reachable: true,
        in_group: true,
        channel_users: Vec::new(),
    };
    sim.snapshot.channels.push(live_channel(
        "mysql_innodb_cluster_33",
        ReplicationOptions::default(),
    ));
    fixture.world.add_server(sim);

    cluster
        .rescan(RescanOptions {
            add_unmanaged: true,
            remove_obsolete: false,
        })
        .await
        .expect("rescan succeeds");

    let record = fixture.meta.instance("db3:3306").expect("row created");
    assert_eq!(record.server_uuid, "uuid-3");
    assert_eq!(record.server_id(), Some(33));
    // The account is taken from the channel user, not re-derived.
    assert_eq!(
        record.recovery_account(),
        Some(("mysql_innodb_cluster_33".to_string(), "%".to_string()))
    );
}

#[tokio::test]
async fn test_rescan_reports_unmanaged_without_flag() {
    let (mut cluster, fixture) = two_member_cluster().await;
    fixture.world.add_server(ServerSim {
        snapshot: snapshot("db3:3306", "uuid-3", 33, ""),
        reachable: true,
        in_group: true,
        channel_users: Vec::new(),
    });

    cluster.rescan(RescanOptions::default()).await.unwrap();

    assert!(fixture.meta.instance("db3:3306").is_none());
    assert!(fixture.console_text().contains("addUnmanaged"));
}

#[tokio::test]
async fn test_rescan_prompts_for_unmanaged_when_interactive() {
    let (cluster, fixture) = two_member_cluster().await;
    fixture.world.add_server(ServerSim {
        snapshot: snapshot("db3:3306", "uuid-3", 33, ""),
        reachable: true,
        in_group: true,
        channel_users: Vec::new(),
    });
    // Reconnect interactively with a prompter that accepts.
    let (context, fixture2) = context_with(
        &fixture.world,
        &fixture.meta,
        ScriptedPrompter::confirming(),
        true,
    );
    drop(cluster);
    let mut cluster = mysql_admin::Cluster::connect(context, &"db1:3306".parse().unwrap())
        .await
        .unwrap();

    cluster.rescan(RescanOptions::default()).await.unwrap();

    assert!(fixture2.meta.instance("db3:3306").is_some());
    let questions = fixture2.questions.lock().unwrap().clone();
    assert!(questions.iter().any(|q| q.contains("db3:3306")));
}

#[tokio::test]
async fn test_rescan_removes_obsolete_rows_with_flag() {
    let (mut cluster, fixture) = two_member_cluster().await;
    fixture.world.set_in_group("db2:3306", false);
    fixture.world.set_reachable("db2:3306", false);

    cluster
        .rescan(RescanOptions {
            add_unmanaged: false,
            remove_obsolete: true,
        })
        .await
        .expect("rescan succeeds");

    assert!(fixture.meta.instance("db2:3306").is_none());
    assert!(fixture.meta.instance("db1:3306").is_some());
}

#[tokio::test]
async fn test_rescan_asks_one_combined_question_for_obsolete_rows() {
    let (cluster, fixture) = two_member_cluster().await;
    fixture.world.add_server(ServerSim {
        snapshot: snapshot("db3:3306", "uuid-3", 33, ""),
        reachable: true,
        in_group: true,
        channel_users: Vec::new(),
    });
    let (context, fixture2) = context_with(
        &fixture.world,
        &fixture.meta,
        ScriptedPrompter::confirming(),
        true,
    );
    drop(cluster);
    let mut cluster = mysql_admin::Cluster::connect(context, &"db1:3306".parse().unwrap())
        .await
        .unwrap();
    cluster.rescan(RescanOptions::default()).await.unwrap();

    // Both survivors vanish from the group at once.
    fixture2.world.set_in_group("db2:3306", false);
    fixture2.world.set_reachable("db2:3306", false);
    fixture2.world.set_in_group("db3:3306", false);
    fixture2.world.set_reachable("db3:3306", false);
    fixture2.questions.lock().unwrap().clear();

    cluster.rescan(RescanOptions::default()).await.unwrap();

    let questions = fixture2.questions.lock().unwrap().clone();
    let removal_questions: Vec<_> = questions
        .iter()
        .filter(|q| q.contains("no longer part"))
        .collect();
    assert_eq!(removal_questions.len(), 1);
    assert!(removal_questions[0].contains("db2:3306"));
    assert!(removal_questions[0].contains("db3:3306"));
    assert!(fixture2.meta.instance("db2:3306").is_none());
    assert!(fixture2.meta.instance("db3:3306").is_none());
}

#[tokio::test]
async fn test_rescan_removing_own_row_invalidates_handle() {
    let (mut cluster, fixture) = two_member_cluster().await;
    // The connected member itself fell out of the group.
    fixture.world.set_in_group("db1:3306", false);

    cluster
        .rescan(RescanOptions {
            add_unmanaged: false,
            remove_obsolete: true,
        })
        .await
        .expect("rescan still completes");

    assert!(fixture.meta.instance("db1:3306").is_none());
    assert!(fixture.console_text().contains("no longer usable"));

    let err = cluster.status().await.unwrap_err();
    assert!(matches!(err, Error::Dissolved));
}

#[tokio::test]
async fn test_rescan_repairs_server_id_drift() {
    let (mut cluster, fixture) = two_member_cluster().await;
    {
        let mut state = fixture.meta.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == "db2:3306")
            .unwrap();
        record
            .attributes
            .insert(ATTR_SERVER_ID.to_string(), Value::from(99));
    }

    cluster.rescan(RescanOptions::default()).await.unwrap();

    let record = fixture.meta.instance("db2:3306").unwrap();
    assert_eq!(record.server_id(), Some(22));
}

#[tokio::test]
async fn test_rescan_restores_blank_server_uuid() {
    let (mut cluster, fixture) = two_member_cluster().await;
    {
        let mut state = fixture.meta.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == "db2:3306")
            .unwrap();
        record.server_uuid = String::new();
    }

    cluster.rescan(RescanOptions::default()).await.unwrap();

    let record = fixture.meta.instance("db2:3306").unwrap();
    assert_eq!(record.server_uuid, "uuid-2");
}

#[tokio::test]
async fn test_rescan_restores_missing_recovery_account() {
    let (mut cluster, fixture) = two_member_cluster().await;
    fixture.world.set_channel(
        "db2:3306",
        live_channel("mysql_innodb_cluster_22", ReplicationOptions::default()),
    );
    {
        let mut state = fixture.meta.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == "db2:3306")
            .unwrap();
        record.attributes.remove(ATTR_RECOVERY_ACCOUNT_USER);
        record.attributes.remove(ATTR_RECOVERY_ACCOUNT_HOST);
    }

    cluster.rescan(RescanOptions::default()).await.unwrap();

    let record = fixture.meta.instance("db2:3306").unwrap();
    assert_eq!(
        record.recovery_account(),
        Some(("mysql_innodb_cluster_22".to_string(), "%".to_string()))
    );
}

#[tokio::test]
async fn test_rescan_skips_invalidated_rows() {
    let (mut cluster, fixture) = two_member_cluster().await;
    fixture.world.set_in_group("db2:3306", false);
    fixture.world.set_reachable("db2:3306", false);
    {
        let mut state = fixture.meta.0.lock().unwrap();
        let record = state
            .instances
            .iter_mut()
            .find(|r| r.address == "db2:3306")
            .unwrap();
        record
            .attributes
            .insert(ATTR_INVALIDATED.to_string(), Value::Bool(true));
    }

    cluster
        .rescan(RescanOptions {
            add_unmanaged: false,
            remove_obsolete: true,
        })
        .await
        .unwrap();

    // An invalidated row is never treated as obsolete.
    assert!(fixture.meta.instance("db2:3306").is_some());
    assert!(fixture.console_text().contains("invalidated"));
}

#[tokio::test]
async fn test_rescan_is_a_noop_when_in_sync() {
    let (mut cluster, fixture) = two_member_cluster().await;

    cluster.rescan(RescanOptions::default()).await.unwrap();

    assert!(fixture.console_text().contains("No changes detected"));
}
