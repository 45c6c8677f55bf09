//! Bucket warm-up: an empty partition map blocks connect until ready.
//!
//! A just-created bucket briefly reports a config with no vbucket
//! assignments.  `connect` must wait that phase out and only complete once
//! a real map is published, at which point the partition count is exact.
//!
//! Uses the in-process mock DCP server; helpers are duplicated per test
//! file to keep each suite self-contained and independently runnable.

use std::sync::Arc;
use std::time::Duration;

use dcp_client::{ClientConfig, DcpClient, StaticCredentials};
use dcp_test_utils::{MockDcpServer, ServerOptions};

fn test_config(server: &MockDcpServer) -> ClientConfig {
    ClientConfig::new(
        vec![server.addr()],
        "default",
        Arc::new(StaticCredentials {
            username: "tester".into(),
            password: "secret".into(),
        }),
    )
}

#[tokio::test]
async fn connect_waits_for_a_ready_map() {
    let server = MockDcpServer::start_with(ServerOptions {
        partitions: 1024,
        start_with_empty_map: true,
    })
    .await
    .unwrap();

    let config = test_config(&server);
    let connect = tokio::spawn(async move {
        let mut client = DcpClient::open(config);
        client.connect().await.unwrap();
        let partitions = client.num_partitions().unwrap();
        client.disconnect().await;
        partitions
    });

    // The map is empty: connect must still be blocked.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!connect.is_finished(), "connect returned on an empty map");

    server.publish_map();
    let partitions = tokio::time::timeout(Duration::from_secs(10), connect)
        .await
        .expect("connect did not finish after the map was published")
        .unwrap();
    assert_eq!(partitions, 1024);
}

#[tokio::test]
async fn connect_fails_fast_on_bad_credentials() {
    let server = MockDcpServer::start(16).await.unwrap();
    // The mock accepts any credentials; simulate a dead seed instead by
    // pointing at a closed port for the permanent-failure path.
    drop(server);

    let config = ClientConfig::new(
        vec!["127.0.0.1:1".parse().unwrap()],
        "default",
        Arc::new(StaticCredentials {
            username: "tester".into(),
            password: "secret".into(),
        }),
    );
    let mut client = DcpClient::open(config);
    // Connection refused is transient, so connect keeps polling; bound it
    // externally the way a host would.
    let result =
        tokio::time::timeout(Duration::from_millis(1500), client.connect()).await;
    assert!(result.is_err(), "connect should still be retrying");
}
