//! Listing, pagination and search

mod common;

use common::{raw_message, FakeConnector, Harness, RecordingTransport};
use relaymail::email::{Folder, IngestOutcome, ListQuery, SortDirection, SortField};

async fn import(h: &Harness, alias: &str, id: &str, from: &str, to: &[&str], subject: &str, body: &str) -> i64 {
    let raw = raw_message(Some(id), from, to, subject, body);
    match h.app.import(alias, &raw).await.unwrap() {
        IngestOutcome::Stored { id, .. } => id,
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_pagination_reports_totals() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;
    for n in 0..45 {
        import(
            &h,
            "sales@relay.test",
            &format!("<bulk-{}@vendor.test>", n),
            "bulk@vendor.test",
            &["sales@relay.test"],
            &format!("Bulk {}", n),
            "body",
        )
        .await;
    }

    let page = h
        .app
        .list(owner, &ListQuery::folder(Folder::Inbox).page(3, 20))
        .await
        .unwrap();
    assert_eq!(page.items.len(), 5);
    assert_eq!(page.total, 45);
    assert_eq!(page.page, 3);
    assert_eq!(page.page_size, 20);
    assert_eq!(page.total_pages, 3);

    // Newest first: the last page holds the first five imported
    let mut subjects: Vec<_> = page.items.iter().map(|m| m.subject.clone()).collect();
    subjects.sort();
    assert_eq!(subjects, vec!["Bulk 0", "Bulk 1", "Bulk 2", "Bulk 3", "Bulk 4"]);

    let beyond = h
        .app
        .list(owner, &ListQuery::folder(Folder::Inbox).page(4, 20))
        .await
        .unwrap();
    assert!(beyond.items.is_empty());
    assert_eq!(beyond.total, 45);

    let first = h
        .app
        .list(owner, &ListQuery::folder(Folder::Inbox).page(0, 20))
        .await
        .unwrap();
    assert_eq!(first.page, 1);
    assert_eq!(first.items.len(), 20);
}

#[tokio::test]
async fn test_page_size_is_capped() {
    let h = Harness::build(FakeConnector::new(), RecordingTransport::default(), |config| {
        config.listing.max_page_size = 10;
    })
    .await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;
    for n in 0..12 {
        import(&h, "sales@relay.test", &format!("<c-{}@x.test>", n), "x@x.test", &["sales@relay.test"], "s", "b").await;
    }

    let page = h
        .app
        .list(owner, &ListQuery::folder(Folder::Inbox).page(1, 500))
        .await
        .unwrap();
    assert_eq!(page.page_size, 10);
    assert_eq!(page.items.len(), 10);
    assert_eq!(page.total_pages, 2);
}

#[tokio::test]
async fn test_sorting_and_alias_filter() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    let sales = h.alias(owner, "sales@relay.test").await;
    h.alias(owner, "support@relay.test").await;
    import(&h, "sales@relay.test", "<1@x.test>", "zed@x.test", &["sales@relay.test"], "Banana", "b").await;
    import(&h, "sales@relay.test", "<2@x.test>", "amy@x.test", &["sales@relay.test"], "Cherry", "b").await;
    import(&h, "support@relay.test", "<3@x.test>", "bob@x.test", &["support@relay.test"], "Apple", "b").await;

    let by_subject = ListQuery {
        sort: SortField::Subject,
        direction: SortDirection::Asc,
        page: 1,
        ..ListQuery::default()
    };
    let page = h.app.list(owner, &by_subject).await.unwrap();
    let subjects: Vec<_> = page.items.iter().map(|m| m.subject.as_str()).collect();
    assert_eq!(subjects, vec!["Apple", "Banana", "Cherry"]);

    let by_sender = ListQuery {
        sort: "from_email".parse().unwrap(),
        direction: SortDirection::Desc,
        alias_id: Some(sales),
        page: 1,
        ..ListQuery::default()
    };
    let page = h.app.list(owner, &by_sender).await.unwrap();
    let senders: Vec<_> = page.items.iter().map(|m| m.from_addr.as_str()).collect();
    assert_eq!(senders, vec!["zed@x.test", "amy@x.test"]);
    assert!(page.items.iter().all(|m| m.alias_email == "sales@relay.test"));
}

#[tokio::test]
async fn test_search_by_recipient_is_owner_scoped() {
    let h = Harness::new().await;
    let alice = h.user("alice@example.com").await;
    let bob = h.user("bob@example.com").await;
    h.alias(alice, "alice@relay.test").await;
    h.alias(bob, "bob@relay.test").await;

    let mine = import(
        &h,
        "alice@relay.test",
        "<a@relay.test>",
        "alice@relay.test",
        &["client@bigco.com", "other@bigco.com"],
        "Proposal",
        "terms",
    )
    .await;
    import(
        &h,
        "bob@relay.test",
        "<b@relay.test>",
        "bob@relay.test",
        &["client@bigco.com"],
        "Proposal",
        "terms",
    )
    .await;

    let page = h.app.search(alice, "client@bigco.com", 1, None).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, mine);
    assert_eq!(page.items[0].to_addrs, vec!["client@bigco.com", "other@bigco.com"]);

    let page = h.app.search(bob, "client@bigco.com", 1, None).await.unwrap();
    assert_eq!(page.total, 1);
    assert_ne!(page.items[0].id, mine);
}

#[tokio::test]
async fn test_search_text_sender_and_tombstones() {
    let h = Harness::new().await;
    let owner = h.user("owner@example.com").await;
    h.alias(owner, "sales@relay.test").await;

    let report = import(
        &h,
        "sales@relay.test",
        "<r@x.test>",
        "cfo@finance.test",
        &["sales@relay.test"],
        "Quarterly report",
        "Revenue grew",
    )
    .await;
    let lunch = import(
        &h,
        "sales@relay.test",
        "<l@x.test>",
        "friend@social.test",
        &["sales@relay.test"],
        "Lunch",
        "Shall we discuss the quarterly numbers over lunch?",
    )
    .await;
    import(&h, "sales@relay.test", "<n@x.test>", "news@letter.test", &["sales@relay.test"], "News", "Nothing").await;

    let page = h.app.search(owner, "quarterly", 1, None).await.unwrap();
    let ids: Vec<_> = page.items.iter().map(|m| m.id).collect();
    assert_eq!(page.total, 2);
    assert!(ids.contains(&report) && ids.contains(&lunch));

    let page = h.app.search(owner, "finance.test", 1, None).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, report);

    // Query syntax is treated as text
    assert_eq!(h.app.search(owner, "\"quarterly", 1, None).await.unwrap().total, 2);
    assert_eq!(h.app.search(owner, "   ", 1, None).await.unwrap().total, 0);
    assert_eq!(h.app.search(owner, "100%", 1, None).await.unwrap().total, 0);

    h.app.delete(owner, report).await.unwrap();
    assert_eq!(h.app.search(owner, "quarterly", 1, None).await.unwrap().total, 2);
    h.app.delete(owner, report).await.unwrap();
    let page = h.app.search(owner, "quarterly", 1, None).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.items[0].id, lunch);
}
