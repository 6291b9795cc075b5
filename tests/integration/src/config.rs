//! Integration tests for file-driven configuration.

use kinetic_core::StatusCode;

use crate::helpers::{ServerOptions, TestServer};

const USERS: &str = r#"
cluster_version = 3

[[users]]
id = 1
read = true
write = true
delete = true

[[users]]
id = 2
read = true
prefix = "public/"
"#;

fn server() -> TestServer {
    TestServer::start_with(ServerOptions {
        config: Some(USERS.into()),
        ..Default::default()
    })
}

#[tokio::test]
async fn cluster_version_must_match() {
    let server = server();
    let mut c = server.connect().await;

    let wrong = c.cmd(&["GET", "k", "USER", "1"]).await;
    assert_eq!(wrong.status.code, StatusCode::VersionFailure);

    let right = c.cmd(&["GET", "k", "USER", "1", "CLUSTER", "3"]).await;
    assert_eq!(right.status.code, StatusCode::NotFound);
}

#[tokio::test]
async fn users_are_limited_to_their_access() {
    let server = server();
    let mut admin = server.connect().await;
    let mut reader = server.connect().await;

    let put = admin
        .cmd(&["PUT", "public/a", "v", "SYNC", "writeback", "USER", "1", "CLUSTER", "3"])
        .await;
    assert!(put.status.is_success());

    let get = reader.cmd(&["GET", "public/a", "USER", "2", "CLUSTER", "3"]).await;
    assert!(get.status.is_success());

    let outside = reader.cmd(&["GET", "secret", "USER", "2", "CLUSTER", "3"]).await;
    assert_eq!(outside.status.code, StatusCode::NotAuthorized);

    let write = reader
        .cmd(&["PUT", "public/b", "v", "SYNC", "writeback", "USER", "2", "CLUSTER", "3"])
        .await;
    assert_eq!(write.status.code, StatusCode::NotAuthorized);

    let unknown = reader.cmd(&["GET", "public/a", "USER", "9", "CLUSTER", "3"]).await;
    assert_eq!(unknown.status.code, StatusCode::NotAuthorized);
}

#[test]
fn config_template_is_printed() {
    let out = std::process::Command::new(crate::helpers::server_binary())
        .arg("--config-template")
        .output()
        .unwrap();
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("port = 8123"));
    assert!(text.contains("max_batch_size = \"64M\""));
}
