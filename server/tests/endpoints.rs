use reqwest::{Client, StatusCode};

use server::types::{ApiError, BlockPut, DirEntry, EntryKind, LookupResponse, Packing};
use server::{spawn_inprocess, ServerConfig};

fn file_entry(name: &str) -> DirEntry {
    DirEntry {
        name: name.to_string(),
        writer: "tester@example.org".to_string(),
        kind: EntryKind::File,
        packing: Packing::Ee,
        sequence: 0,
        mtime: 0,
        link: None,
        blocks: Vec::new(),
        packdata: String::new(),
        attr_mode: 0o644,
    }
}

fn dir_entry(name: &str) -> DirEntry {
    DirEntry { kind: EntryKind::Dir, packing: Packing::Plain, ..file_entry(name) }
}

#[tokio::test]
async fn health_endpoint() {
    let srv = spawn_inprocess(ServerConfig::default());
    let body = reqwest::get(format!("{}/health", srv.url()))
        .await
        .expect("send")
        .text()
        .await
        .expect("body");
    assert_eq!(body, "OK");
}

#[tokio::test]
async fn user_roots_appear_on_first_lookup() {
    let srv = spawn_inprocess(ServerConfig::default());
    let resp: LookupResponse = reqwest::get(format!("{}/dir/tester@example.org", srv.url()))
        .await
        .expect("send")
        .json()
        .await
        .expect("json");
    assert_eq!(resp.status, "ok");
    assert_eq!(resp.entry.kind, EntryKind::Dir);
}

#[tokio::test]
async fn put_then_lookup_and_list() {
    let srv = spawn_inprocess(ServerConfig::default());
    let client = Client::new();
    let base = srv.url();

    let put: DirEntry = client
        .put(format!("{}/dir/tester@example.org/f.txt", base))
        .json(&file_entry("tester@example.org/f.txt"))
        .send()
        .await
        .expect("send")
        .json()
        .await
        .expect("json");
    assert!(put.sequence > 0);

    let got: LookupResponse = client
        .get(format!("{}/dir/tester@example.org/f.txt", base))
        .send()
        .await
        .expect("send")
        .json()
        .await
        .expect("json");
    assert_eq!(got.entry.sequence, put.sequence);

    let listing: Vec<DirEntry> = client
        .get(format!("{}/list/tester@example.org", base))
        .send()
        .await
        .expect("send")
        .json()
        .await
        .expect("json");
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].name, "tester@example.org/f.txt");
}

#[tokio::test]
async fn sequences_are_monotone_per_root() {
    let srv = spawn_inprocess(ServerConfig::default());
    let client = Client::new();
    let base = srv.url();
    let a: DirEntry = client
        .put(format!("{}/dir/tester@example.org/a", base))
        .json(&file_entry("tester@example.org/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let b: DirEntry = client
        .put(format!("{}/dir/tester@example.org/a", base))
        .json(&file_entry("tester@example.org/a"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(b.sequence > a.sequence);
}

#[tokio::test]
async fn delete_refuses_non_empty_directories() {
    let srv = spawn_inprocess(ServerConfig::default());
    let client = Client::new();
    let base = srv.url();

    client
        .put(format!("{}/dir/tester@example.org/d", base))
        .json(&dir_entry("tester@example.org/d"))
        .send()
        .await
        .unwrap();
    client
        .put(format!("{}/dir/tester@example.org/d/child", base))
        .json(&file_entry("tester@example.org/d/child"))
        .send()
        .await
        .unwrap();

    let resp = client
        .delete(format!("{}/dir/tester@example.org/d", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let err: ApiError = resp.json().await.unwrap();
    assert_eq!(err.kind, "not-empty");

    client
        .delete(format!("{}/dir/tester@example.org/d/child", base))
        .send()
        .await
        .unwrap();
    let resp = client
        .delete(format!("{}/dir/tester@example.org/d", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn rename_conflicts_with_existing_destination() {
    let srv = spawn_inprocess(ServerConfig::default());
    let client = Client::new();
    let base = srv.url();

    for name in ["a", "b"] {
        client
            .put(format!("{}/dir/tester@example.org/{}", base, name))
            .json(&file_entry(&format!("tester@example.org/{}", name)))
            .send()
            .await
            .unwrap();
    }

    let resp = client
        .post(format!(
            "{}/rename?from=tester@example.org/a&to=tester@example.org/b",
            base
        ))
        .json(&file_entry("tester@example.org/b"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = client
        .post(format!(
            "{}/rename?from=tester@example.org/a&to=tester@example.org/c",
            base
        ))
        .json(&file_entry("tester@example.org/c"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let moved: DirEntry = resp.json().await.unwrap();
    assert_eq!(moved.name, "tester@example.org/c");

    let resp = client
        .get(format!("{}/dir/tester@example.org/a", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn block_store_round_trip_counts_fetches() {
    let srv = spawn_inprocess(ServerConfig::default());
    let client = Client::new();
    let base = srv.url();

    let put: BlockPut = client
        .post(format!("{}/block", base))
        .body(vec![7u8; 1024])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let body = client
        .get(format!("{}/block/{}", base, put.reference))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap();
    assert_eq!(body.len(), 1024);
    assert_eq!(srv.state.fetch_count(&put.reference), 1);

    let resp = client
        .get(format!("{}/block/{}", base, "0".repeat(64)))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn key_registry_round_trip() {
    let srv = spawn_inprocess(ServerConfig::default());
    let client = Client::new();
    let base = srv.url();

    let resp = client
        .get(format!("{}/key/tester@example.org", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    client
        .put(format!("{}/key/tester@example.org", base))
        .json(&server::types::UserKeyRecord {
            user: String::new(),
            key: "04abcd".to_string(),
            previous: None,
        })
        .send()
        .await
        .unwrap();

    let rec: server::types::UserKeyRecord = client
        .get(format!("{}/key/tester@example.org", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rec.user, "tester@example.org");
    assert_eq!(rec.key, "04abcd");
}
