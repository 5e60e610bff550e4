//! Stories about the ConfigMap-backed revision ledger

use autorestart::ledger::{ledger_object_name, ConfigMapLedger, RevisionLedger};
use autorestart::model::{ConfigIdentity, RevisionMarker};

use super::helpers::{ensure_test_cluster, TestNamespace};

/// Story: two replicas racing to record the first revision, only one wins
#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn story_first_commit_wins() {
    let client = ensure_test_cluster().await;
    let ns = TestNamespace::create(&client, "autorestart-ledger").await;
    let ledger = ConfigMapLedger::new(client.clone(), ns.name.clone());
    let identity = ConfigIdentity::new("fedx-1000", "db-config");

    let rev_a = RevisionMarker::new("5");
    let rev_b = RevisionMarker::new("6");
    let a = ledger.compare_and_set(&identity, None, &rev_a);
    let b = ledger.compare_and_set(&identity, None, &rev_b);
    let (a, b) = tokio::join!(a, b);
    assert!(a.unwrap() ^ b.unwrap(), "exactly one writer must win");

    let entry = ledger.get(&identity).await.unwrap().unwrap();
    let winner = entry.last_processed_revision.clone();
    assert!(winner.as_str() == "5" || winner.as_str() == "6");

    assert!(ledger
        .compare_and_set(&identity, Some(winner), &RevisionMarker::new("7"))
        .await
        .unwrap());
    assert_eq!(ledger.list().await.unwrap().len(), 1);

    ledger.delete(&identity).await.unwrap();
    assert!(ledger.get(&identity).await.unwrap().is_none());

    ns.cleanup().await;
}

#[tokio::test]
#[ignore = "requires a Kubernetes cluster"]
async fn entries_use_hashed_names() {
    let client = ensure_test_cluster().await;
    let ns = TestNamespace::create(&client, "autorestart-names").await;
    let ledger = ConfigMapLedger::new(client.clone(), ns.name.clone());
    let identity = ConfigIdentity::new("a-very-long-namespace-name", "a-very-long-configmap-name");

    ledger
        .compare_and_set(&identity, None, &RevisionMarker::new("1"))
        .await
        .unwrap();

    let api: kube::Api<k8s_openapi::api::core::v1::ConfigMap> =
        kube::Api::namespaced(client.clone(), &ns.name);
    assert!(api
        .get_opt(&ledger_object_name(&identity))
        .await
        .unwrap()
        .is_some());

    ns.cleanup().await;
}
