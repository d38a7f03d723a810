use super::*;

fn topics(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

async fn client(cluster: &MemoryCluster) -> Arc<dyn TransportClient> {
    MemoryTransport::with_cluster(cluster.clone())
        .connect(&ClientSettings::default())
        .await
        .unwrap()
}

#[tokio::test]
async fn test_send_appends_in_order() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;

    let first = client.send(Record::new("orders", b"a".to_vec())).await.unwrap();
    let second = client.send(Record::new("orders", b"b".to_vec())).await.unwrap();

    assert_eq!(first.offset, 0);
    assert_eq!(second.offset, 1);
    assert_eq!(cluster.records("orders").len(), 2);
}

#[tokio::test]
async fn test_every_group_sees_every_record() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    client.send(Record::new("orders", b"a".to_vec())).await.unwrap();

    let g1 = client.consumer_group("g1").await.unwrap();
    let g2 = client.consumer_group("g2").await.unwrap();
    let mut s1 = g1.join(&topics(&["orders"])).await.unwrap();
    let mut s2 = g2.join(&topics(&["orders"])).await.unwrap();

    assert_eq!(s1.next().await.unwrap().unwrap().record.payload, b"a");
    assert_eq!(s2.next().await.unwrap().unwrap().record.payload, b"a");
}

#[tokio::test]
async fn test_members_of_one_group_share_records() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    client.send(Record::new("orders", b"a".to_vec())).await.unwrap();
    client.send(Record::new("orders", b"b".to_vec())).await.unwrap();

    let m1 = client.consumer_group("shared").await.unwrap();
    let m2 = client.consumer_group("shared").await.unwrap();
    let mut s1 = m1.join(&topics(&["orders"])).await.unwrap();
    let mut s2 = m2.join(&topics(&["orders"])).await.unwrap();

    let a = s1.next().await.unwrap().unwrap();
    let b = s2.next().await.unwrap().unwrap();
    assert_eq!(a.offset, 0);
    assert_eq!(b.offset, 1);
}

#[tokio::test]
async fn test_rejoin_redelivers_uncommitted() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    client.send(Record::new("orders", b"a".to_vec())).await.unwrap();
    client.send(Record::new("orders", b"b".to_vec())).await.unwrap();

    let group = client.consumer_group("g").await.unwrap();
    let mut session = group.join(&topics(&["orders"])).await.unwrap();
    let first = session.next().await.unwrap().unwrap();
    first.commit().unwrap();
    let _second = session.next().await.unwrap().unwrap();
    drop(session);

    assert_eq!(cluster.committed_offset("g", "orders"), Some(1));

    let mut session = group.join(&topics(&["orders"])).await.unwrap();
    let again = session.next().await.unwrap().unwrap();
    assert_eq!(again.offset, 1);
    assert_eq!(again.record.payload, b"b");
}

#[tokio::test]
async fn test_session_wakes_on_append() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    let group = client.consumer_group("g").await.unwrap();
    let mut session = group.join(&topics(&["orders"])).await.unwrap();

    let waiter = tokio::spawn(async move { session.next().await });
    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
    client.send(Record::new("orders", b"late".to_vec())).await.unwrap();

    let claim = tokio::time::timeout(tokio::time::Duration::from_secs(1), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(claim.record.payload, b"late");
}

#[tokio::test]
async fn test_close_ends_session_and_rejects_join() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    let group = client.consumer_group("g").await.unwrap();
    let mut session = group.join(&topics(&["orders"])).await.unwrap();

    group.close().await.unwrap();

    assert!(session.next().await.is_none());
    assert!(matches!(
        group.join(&topics(&["orders"])).await,
        Err(TransportError::GroupClosed)
    ));
}

#[tokio::test]
async fn test_offline_cluster_fails_operations() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    cluster.set_offline(true);

    assert!(matches!(
        client.send(Record::new("orders", Vec::new())).await,
        Err(TransportError::Unavailable(_))
    ));
    assert!(MemoryTransport::with_cluster(cluster.clone())
        .connect(&ClientSettings::default())
        .await
        .is_err());

    cluster.set_offline(false);
    assert!(client.send(Record::new("orders", Vec::new())).await.is_ok());
}

#[tokio::test]
async fn test_join_count_per_topic() {
    let cluster = MemoryCluster::new();
    let client = client(&cluster).await;
    let group = client.consumer_group("g").await.unwrap();

    let _s1 = group.join(&topics(&["orders"])).await.unwrap();
    let _s2 = group.join(&topics(&["orders"])).await.unwrap();

    assert_eq!(cluster.join_count("orders"), 2);
    assert_eq!(cluster.join_count("inventory"), 0);
}
