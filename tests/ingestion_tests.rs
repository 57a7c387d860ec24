//! End-to-end ingestion through scripted mailboxes

mod common;

use chrono::{TimeZone, Utc};
use common::{raw_message, raw_message_dated, raw_with_attachments, FakeConnector, Harness, RecordingTransport, Script};
use relaymail::email::{FailureKind, Folder, IngestOutcome, ListQuery};
use relaymail::mime::SurrogateIdentity;
use relaymail::AppError;

#[tokio::test]
async fn test_ingestion_is_idempotent() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;
    h.connector.script(
        "sales@relay.test",
        Script::Messages(vec![
            raw_message(Some("<a@vendor.test>"), "a@vendor.test", &["sales@relay.test"], "First", "one"),
            raw_message(Some("<b@vendor.test>"), "b@vendor.test", &["sales@relay.test"], "Second", "two"),
        ]),
    );

    let first = h.app.ingest("sales@relay.test").await;
    assert_eq!((first.fetched, first.stored, first.skipped), (2, 2, 0));
    assert!(first.errors.is_empty());

    let second = h.app.ingest("sales@relay.test").await;
    assert_eq!((second.fetched, second.stored, second.skipped), (2, 0, 2));
    assert!(second.errors.is_empty());

    let stats = h.app.stats().await.unwrap();
    assert_eq!(stats.message_count, 2);
    assert_eq!(stats.unread_count, 2);
}

#[tokio::test]
async fn test_received_at_is_protocol_date_and_created_at_is_local() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;

    let before = Utc::now();
    let raw = raw_message_dated(
        Some("<old@vendor.test>"),
        "Vendor <old@vendor.test>",
        &["sales@relay.test"],
        "Archived",
        "from the past",
        "Mon, 06 Jan 2020 09:30:00 +0000",
    );
    let IngestOutcome::Stored { id, .. } = h.app.import("sales@relay.test", &raw).await.unwrap() else {
        panic!("expected the message to be stored");
    };

    let stored = h.app.get_message(owner, id).await.unwrap().unwrap();
    assert_eq!(stored.received_at, Some(Utc.with_ymd_and_hms(2020, 1, 6, 9, 30, 0).unwrap()));
    assert!(stored.created_at >= before - chrono::Duration::seconds(1));
    assert_eq!(stored.from_name.as_deref(), Some("Vendor"));
    assert_eq!(stored.folder, Folder::Inbox);
    assert!(!stored.is_read && !stored.is_starred && !stored.is_deleted);
}

#[tokio::test]
async fn test_malformed_message_is_recorded_and_skipped() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;
    h.connector.script(
        "sales@relay.test",
        Script::Messages(vec![
            raw_message(Some("<a@vendor.test>"), "a@vendor.test", &["sales@relay.test"], "First", "one"),
            b"this is not a message at all\r\n".to_vec(),
            raw_message(Some("<c@vendor.test>"), "c@vendor.test", &["sales@relay.test"], "Third", "three"),
        ]),
    );

    let result = h.app.ingest("sales@relay.test").await;
    assert_eq!(result.fetched, 3);
    assert_eq!(result.stored, 2);
    assert_eq!(result.skipped, 0);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].kind, FailureKind::Parse);
    assert!(!result.is_failed());
}

#[tokio::test]
async fn test_attachments_are_stored_and_counted_in_size() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;

    let outcome = h
        .app
        .import("sales@relay.test", &raw_with_attachments("<invoice-7@vendor.test>"))
        .await
        .unwrap();
    let IngestOutcome::Stored {
        id,
        attachments_stored,
        attachment_failures,
        ..
    } = outcome
    else {
        panic!("expected the message to be stored");
    };
    assert_eq!(attachments_stored, 2);
    assert!(attachment_failures.is_empty());

    let stored = h.app.get_message(owner, id).await.unwrap().unwrap();
    assert_eq!(stored.attachments.len(), 2);
    let pdf = stored.attachments.iter().find(|a| a.filename == "invoice.pdf").unwrap();
    let csv = stored.attachments.iter().find(|a| a.filename == "lines.csv").unwrap();
    assert_eq!(pdf.content_type, "application/pdf");
    assert_eq!(pdf.size, 8);
    assert_eq!(csv.size, 5);
    assert!(pdf.blob_name.ends_with("_invoice.pdf"));

    let body = stored.body_text.as_deref().unwrap_or_default().len() as u64;
    assert_eq!(stored.size, body + pdf.size + csv.size);

    let (meta, data) = h.app.read_attachment(owner, pdf.id).await.unwrap().unwrap();
    assert_eq!(meta.id, pdf.id);
    assert_eq!(data, b"%PDF-1.4".to_vec());

    let stranger = h.user("stranger@example.com").await;
    assert!(h.app.read_attachment(stranger, pdf.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_connection_failures_are_isolated_per_mailbox() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "good@relay.test").await;
    h.alias(owner, "locked@relay.test").await;
    h.alias(owner, "down@relay.test").await;
    h.connector.script(
        "good@relay.test",
        Script::Messages(vec![raw_message(Some("<g@x.test>"), "g@x.test", &["good@relay.test"], "Hi", "hi")]),
    );
    h.connector.script("locked@relay.test", Script::RejectLogin);
    h.connector.script("down@relay.test", Script::Unreachable);

    let results = h.app.ingest_all_active_mailboxes().await.unwrap();
    assert_eq!(results.len(), 3);

    let by_alias = |email: &str| results.iter().find(|r| r.alias_email == email).unwrap();
    assert_eq!(by_alias("good@relay.test").stored, 1);
    assert!(!by_alias("good@relay.test").is_failed());
    assert_eq!(by_alias("locked@relay.test").errors[0].kind, FailureKind::Authentication);
    assert_eq!(by_alias("down@relay.test").errors[0].kind, FailureKind::Connection);
    assert!(by_alias("down@relay.test").is_failed());
}

#[tokio::test]
async fn test_unknown_alias() {
    let h = Harness::new().await;

    let result = h.app.ingest("nobody@relay.test").await;
    assert_eq!(result.errors[0].kind, FailureKind::AliasNotFound);
    assert_eq!(h.connector.sessions_opened(), 0);

    let raw = raw_message(Some("<x@x.test>"), "x@x.test", &["nobody@relay.test"], "x", "x");
    assert!(matches!(
        h.app.import("nobody@relay.test", &raw).await,
        Err(AppError::AliasNotFound(_))
    ));
}

#[tokio::test]
async fn test_messages_without_message_id_get_random_surrogates() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;

    let raw = raw_message(None, "anon@x.test", &["sales@relay.test"], "No id", "same bytes");
    let first = h.app.import("sales@relay.test", &raw).await.unwrap();
    let second = h.app.import("sales@relay.test", &raw).await.unwrap();

    let (IngestOutcome::Stored { message_id: a, .. }, IngestOutcome::Stored { message_id: b, .. }) = (first, second)
    else {
        panic!("both imports should store a message");
    };
    assert_ne!(a, b);
    assert!(a.ends_with("@imported>"));

    let page = h.app.list(owner, &ListQuery::folder(Folder::Inbox)).await.unwrap();
    assert_eq!(page.total, 2);
}

#[tokio::test]
async fn test_content_hash_surrogates_deduplicate() {
    let h = Harness::build(FakeConnector::new(), RecordingTransport::default(), |config| {
        config.sync.surrogate_identity = SurrogateIdentity::ContentHash;
    })
    .await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;

    let raw = raw_message(None, "anon@x.test", &["sales@relay.test"], "No id", "same bytes");
    assert!(matches!(
        h.app.import("sales@relay.test", &raw).await.unwrap(),
        IngestOutcome::Stored { .. }
    ));
    assert!(matches!(
        h.app.import("sales@relay.test", &raw).await.unwrap(),
        IngestOutcome::Duplicate { .. }
    ));
}

#[tokio::test]
async fn test_sweep_removes_only_unreferenced_blobs() {
    let h = Harness::build(FakeConnector::new(), RecordingTransport::default(), |config| {
        config.sync.orphan_grace_seconds = 0;
    })
    .await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;
    h.app
        .import("sales@relay.test", &raw_with_attachments("<kept@vendor.test>"))
        .await
        .unwrap();

    let attachments_dir = h.app.config().attachments_dir.clone();
    std::fs::write(attachments_dir.join("0000_orphan.bin"), b"left behind").unwrap();

    let report = h.app.sweep_orphans().await.unwrap();
    assert_eq!(report.scanned, 3);
    assert_eq!(report.removed, vec!["0000_orphan.bin".to_string()]);
    assert!(!attachments_dir.join("0000_orphan.bin").exists());
    assert_eq!(std::fs::read_dir(&attachments_dir).unwrap().count(), 2);
}

#[tokio::test]
async fn test_imported_rows_are_visible_to_other_connections() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;

    let other = h.second_handle().await;
    let alias: Option<i64> = sqlx::query_scalar("SELECT id FROM aliases WHERE email = 'sales@relay.test'")
        .fetch_optional(&other.pool)
        .await
        .unwrap();
    assert!(alias.is_some());

    let IngestOutcome::Stored { id, .. } = h
        .app
        .import("sales@relay.test", &raw_with_attachments("<shared@vendor.test>"))
        .await
        .unwrap()
    else {
        panic!("expected the message to be stored");
    };

    assert!(other.get_message_by_id(id).await.unwrap().is_some());
    assert_eq!(other.attachments_for_message(id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_deactivated_user_is_left_out_of_the_tick() {
    let h = Harness::new().await;
    let active = h.user("active@example.com").await;
    let departed = h.user("departed@example.com").await;
    h.alias(active, "kept@relay.test").await;
    h.alias(departed, "gone@relay.test").await;
    for alias in ["kept@relay.test", "gone@relay.test"] {
        h.connector.script(
            alias,
            Script::Messages(vec![raw_message(
                Some(&format!("<{}>", alias)),
                "vendor@vendor.test",
                &[alias],
                "Hello",
                "hi",
            )]),
        );
    }

    h.app.directory().set_user_active(departed, false).await.unwrap();

    let results = h.app.ingest_all_active_mailboxes().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].alias_email, "kept@relay.test");
    assert_eq!(h.connector.sessions_opened(), 1);

    let direct = h.app.ingest("gone@relay.test").await;
    assert_eq!(direct.stored, 0);
    assert!(direct.errors.iter().any(|e| e.kind == FailureKind::AliasNotFound));
}
