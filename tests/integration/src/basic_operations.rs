//! Integration tests for single-key commands and per-connection rules.

use std::collections::HashSet;

use kinetic_core::StatusCode;

use crate::helpers::{ServerOptions, TestServer};

#[tokio::test]
async fn noop_is_acknowledged() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let resp = c.cmd(&["NOOP"]).await;
    assert!(resp.status.is_success());
    assert_eq!(resp.ack_sequence, Some(1));
}

#[tokio::test]
async fn put_get_roundtrip() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let put = c
        .cmd(&["PUT", "foo", "bar", "SYNC", "writeback", "NEWVERSION", "v1"])
        .await;
    assert!(put.status.is_success(), "{:?}", put.status);

    let get = c.cmd(&["GET", "foo"]).await;
    assert!(get.status.is_success());
    assert_eq!(get.value.as_deref(), Some(&b"bar"[..]));
    assert_eq!(get.db_version.as_deref(), Some(&b"v1"[..]));
}

#[tokio::test]
async fn writethrough_put_is_acknowledged() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let put = c.cmd(&["PUT", "k", "v", "SYNC", "writethrough"]).await;
    assert!(put.status.is_success());
    assert_eq!(put.ack_sequence, Some(1));
}

#[tokio::test]
async fn get_missing_key() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let resp = c.cmd(&["GET", "nope"]).await;
    assert_eq!(resp.status.code, StatusCode::NotFound);
    assert!(resp.value.is_none());
}

#[tokio::test]
async fn getversion_omits_value() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "k", "v", "SYNC", "writeback", "NEWVERSION", "7"]).await;
    let resp = c.cmd(&["GETVERSION", "k"]).await;
    assert!(resp.status.is_success());
    assert!(resp.value.is_none());
    assert_eq!(resp.db_version.as_deref(), Some(&b"7"[..]));
}

#[tokio::test]
async fn getnext_and_getprevious_return_neighbours() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    for key in ["a", "b", "c"] {
        c.cmd(&["PUT", key, "x", "SYNC", "writeback"]).await;
    }

    let next = c.cmd(&["GETNEXT", "a"]).await;
    assert_eq!(next.value.as_deref(), Some(&b"b"[..]));
    let prev = c.cmd(&["GETPREVIOUS", "c"]).await;
    assert_eq!(prev.value.as_deref(), Some(&b"b"[..]));
    let past_end = c.cmd(&["GETNEXT", "c"]).await;
    assert_eq!(past_end.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn stale_version_is_rejected_unless_forced() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "k", "one", "SYNC", "writeback", "NEWVERSION", "1"]).await;

    let stale = c
        .cmd(&["PUT", "k", "two", "SYNC", "writeback", "VERSION", "0"])
        .await;
    assert_eq!(stale.status.code, StatusCode::VersionMismatch);

    let forced = c
        .cmd(&["PUT", "k", "two", "SYNC", "writeback", "FORCE"])
        .await;
    assert!(forced.status.is_success());
    let get = c.cmd(&["GET", "k"]).await;
    assert_eq!(get.value.as_deref(), Some(&b"two"[..]));
}

#[tokio::test]
async fn delete_removes_key() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "k", "v", "SYNC", "writeback"]).await;
    let del = c.cmd(&["DELETE", "k", "SYNC", "writeback"]).await;
    assert!(del.status.is_success());
    let get = c.cmd(&["GET", "k"]).await;
    assert_eq!(get.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn write_without_sync_is_invalid() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let resp = c.cmd(&["PUT", "k", "v"]).await;
    assert_eq!(resp.status.code, StatusCode::InvalidRequest);
    assert_eq!(resp.ack_sequence, Some(1));

    let get = c.cmd(&["GET", "k"]).await;
    assert_eq!(get.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn flush_is_acknowledged() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "k", "v", "SYNC", "writeback"]).await;
    let resp = c.cmd(&["FLUSH"]).await;
    assert!(resp.status.is_success());
}

#[tokio::test]
async fn repeated_sequence_keeps_connection_open() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    assert!(c.cmd(&["NOOP", "SEQ", "5"]).await.status.is_success());

    let again = c.cmd(&["NOOP", "SEQ", "5"]).await;
    assert_eq!(again.status.code, StatusCode::InvalidRequest);
    assert_eq!(again.status.message, "Invalid sequence ID");

    // the auto-assigned sequence moves past the highest seen
    let next = c.cmd(&["NOOP"]).await;
    assert!(next.status.is_success());
    assert_eq!(next.ack_sequence, Some(6));
}

#[tokio::test]
async fn unknown_command_gets_unsolicited_error() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let resp = c.cmd(&["BOGUS", "x"]).await;
    assert_eq!(resp.status.code, StatusCode::InvalidRequest);
    assert_eq!(resp.ack_sequence, None);

    // still usable afterwards
    assert!(c.cmd(&["NOOP"]).await.status.is_success());
}

#[tokio::test]
async fn bad_option_gets_unsolicited_error() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    let resp = c.cmd(&["GET", "k", "PRIORITY", "urgent"]).await;
    assert_eq!(resp.status.code, StatusCode::InvalidRequest);
    assert!(resp.status.message.contains("priority"));
}

#[tokio::test]
async fn pipelined_commands_are_all_answered() {
    let server = TestServer::start();
    let mut c = server.connect().await;

    c.cmd(&["PUT", "k", "v", "SYNC", "writeback"]).await;

    let priorities = ["lowest", "normal", "highest"];
    for i in 0..30 {
        c.send(&["GET", "k", "PRIORITY", priorities[i % 3]]).await;
    }

    let mut acked = HashSet::new();
    for _ in 0..30 {
        let resp = c.read_response().await;
        assert!(resp.status.is_success());
        assert_eq!(resp.value.as_deref(), Some(&b"v"[..]));
        acked.insert(resp.ack_sequence.unwrap());
    }
    assert_eq!(acked, (2..=31).collect::<HashSet<u64>>());
}

#[tokio::test]
async fn connections_have_independent_sequences() {
    let server = TestServer::start();
    let mut a = server.connect().await;
    let mut b = server.connect().await;

    assert_eq!(a.cmd(&["NOOP", "SEQ", "10"]).await.ack_sequence, Some(10));
    let resp = b.cmd(&["NOOP", "SEQ", "1"]).await;
    assert!(resp.status.is_success());
    assert_eq!(resp.ack_sequence, Some(1));
}

#[tokio::test]
async fn read_only_drive_refuses_writes() {
    let server = TestServer::start_with(ServerOptions {
        read_only: true,
        ..Default::default()
    });
    let mut c = server.connect().await;

    let put = c.cmd(&["PUT", "k", "v", "SYNC", "writeback"]).await;
    assert_eq!(put.status.code, StatusCode::InvalidRequest);
    let get = c.cmd(&["GET", "k"]).await;
    assert_eq!(get.status.code, StatusCode::NotFound);
}
