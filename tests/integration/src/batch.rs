//! Integration tests for batched writes.

use kinetic_core::StatusCode;

use crate::helpers::{ServerOptions, TestServer};

#[tokio::test]
async fn batch_commits_all_members() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "old", "x", "SYNC", "writeback"]).await;

    assert!(c.cmd(&["STARTBATCH", "1"]).await.status.is_success());
    c.send(&["PUT", "a", "1", "BATCH", "1", "SYNC", "writeback"]).await;
    c.send(&["PUT", "b", "2", "BATCH", "1", "SYNC", "writeback"]).await;
    c.send(&["DELETE", "old", "BATCH", "1", "SYNC", "writeback"]).await;
    let end = c.cmd(&["ENDBATCH", "1", "3"]).await;
    assert!(end.status.is_success(), "{:?}", end.status);
    assert_eq!(end.ack_sequence, Some(6));

    assert_eq!(c.cmd(&["GET", "a"]).await.value.as_deref(), Some(&b"1"[..]));
    assert_eq!(c.cmd(&["GET", "b"]).await.value.as_deref(), Some(&b"2"[..]));
    assert_eq!(c.cmd(&["GET", "old"]).await.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn members_are_invisible_until_commit() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["STARTBATCH", "4"]).await;
    c.send(&["PUT", "pending", "v", "BATCH", "4", "SYNC", "writeback"]).await;
    let get = c.cmd(&["GET", "pending"]).await;
    assert_eq!(get.status.code, StatusCode::NotFound);

    let end = c.cmd(&["ENDBATCH", "4", "1"]).await;
    assert!(end.status.is_success());
    let get = c.cmd(&["GET", "pending"]).await;
    assert!(get.status.is_success());
}

#[tokio::test]
async fn abort_discards_members() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["STARTBATCH", "2"]).await;
    c.send(&["PUT", "a", "1", "BATCH", "2", "SYNC", "writeback"]).await;
    let abort = c.cmd(&["ABORTBATCH", "2"]).await;
    assert!(abort.status.is_success());

    let get = c.cmd(&["GET", "a"]).await;
    assert_eq!(get.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn failed_member_reports_its_sequence() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "k", "v", "SYNC", "writeback", "NEWVERSION", "1"]).await;

    c.cmd(&["STARTBATCH", "3"]).await;
    c.send(&["PUT", "fresh", "v", "BATCH", "3", "SYNC", "writeback"]).await;
    c.send(&["PUT", "k", "w", "BATCH", "3", "SYNC", "writeback", "VERSION", "9"])
        .await;
    let end = c.cmd(&["ENDBATCH", "3", "2"]).await;
    assert_eq!(end.status.code, StatusCode::VersionMismatch);
    assert_eq!(end.failed_sequence, Some(4));

    // nothing from the batch was applied
    assert_eq!(c.cmd(&["GET", "fresh"]).await.status.code, StatusCode::NotFound);
    assert_eq!(c.cmd(&["GET", "k"]).await.value.as_deref(), Some(&b"v"[..]));
}

#[tokio::test]
async fn member_without_batch_closes_connection() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.send(&["PUT", "a", "1", "BATCH", "9", "SYNC", "writeback"]).await;
    let seen = c.read_until_closed().await;
    let last = seen.last().expect("an error before the close");
    assert_eq!(last.status.code, StatusCode::InvalidBatch);
    assert_eq!(last.ack_sequence, None);
}

#[tokio::test]
async fn reused_batch_id_closes_connection() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert!(c.cmd(&["STARTBATCH", "1"]).await.status.is_success());
    c.send(&["STARTBATCH", "1"]).await;
    let seen = c.read_until_closed().await;
    assert!(seen
        .iter()
        .any(|r| r.status.message == "Batch ID was in use"));
}

#[tokio::test]
async fn abandoned_batch_times_out() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert!(c
        .cmd(&["STARTBATCH", "5", "TIMEOUT", "200"])
        .await
        .status
        .is_success());
    c.send(&["PUT", "a", "1", "BATCH", "5", "SYNC", "writeback"]).await;

    let seen = c.read_until_closed().await;
    let expired = seen.last().expect("an expiry before the close");
    assert_eq!(expired.status.code, StatusCode::Expired);
    assert_eq!(expired.status.message, "Timed out");
    assert_eq!(expired.ack_sequence, None);

    // the batch never committed
    let mut other = server.connect().await;
    assert_eq!(other.cmd(&["GET", "a"]).await.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn oversized_batch_is_refused() {
    let server = TestServer::start_with(ServerOptions {
        args: vec!["--max-batch-size".into(), "16".into()],
        ..Default::default()
    });
    let mut c = server.connect().await;

    c.cmd(&["STARTBATCH", "1"]).await;
    let big = "x".repeat(64);
    c.send(&["PUT", "a", &big, "BATCH", "1", "SYNC", "writeback"]).await;
    let end = c.cmd(&["ENDBATCH", "1", "1"]).await;
    assert_eq!(end.status.code, StatusCode::InvalidBatch);
    assert_eq!(end.status.message, "Exceed maximum allowable batch's size");

    assert_eq!(c.cmd(&["GET", "a"]).await.status.code, StatusCode::NotFound);
}
