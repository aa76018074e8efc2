use super::*;

async fn make_store() -> LedgerStore {
    let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
    let store = LedgerStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

#[tokio::test]
async fn insert_and_get_entry() {
    let store = make_store().await;
    let entry = LedgerEntry::tracked("docs/a.txt", 1_700_000_000_123_456_789, 10);

    store.insert(&entry).await.unwrap();
    let fetched = store.get("docs/a.txt").await.unwrap();

    assert_eq!(fetched, Some(entry));
    assert_eq!(store.get("docs/missing.txt").await.unwrap(), None);
}

#[tokio::test]
async fn insert_rejects_duplicate_path() {
    let store = make_store().await;
    store
        .insert(&LedgerEntry::tracked("a.txt", 1, 1))
        .await
        .unwrap();

    let err = store
        .insert(&LedgerEntry::tracked("a.txt", 2, 2))
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Duplicate(path) if path == "a.txt"));
    let kept = store.get("a.txt").await.unwrap().unwrap();
    assert_eq!((kept.mod_time, kept.size), (1, 1));
}

#[tokio::test]
async fn update_touches_only_given_fields() {
    let store = make_store().await;
    store
        .insert(&LedgerEntry::tracked("a.txt", 100, 10))
        .await
        .unwrap();

    let matched = store
        .update(
            "a.txt",
            &EntryUpdate {
                size: Some(20),
                exists: Some(false),
                ..EntryUpdate::default()
            },
        )
        .await
        .unwrap();

    assert!(matched);
    let entry = store.get("a.txt").await.unwrap().unwrap();
    assert_eq!(entry.mod_time, 100);
    assert_eq!(entry.size, 20);
    assert!(!entry.exists);
    assert!(!entry.downloading);
}

#[tokio::test]
async fn update_of_missing_path_reports_no_match() {
    let store = make_store().await;
    let matched = store
        .update(
            "nope.txt",
            &EntryUpdate {
                exists: Some(true),
                ..EntryUpdate::default()
            },
        )
        .await
        .unwrap();
    assert!(!matched);
}

#[tokio::test]
async fn clearing_downloading_drops_claim_timestamp() {
    let store = make_store().await;
    store.insert(&LedgerEntry::claim("a.txt", 500)).await.unwrap();

    store
        .update(
            "a.txt",
            &EntryUpdate {
                mod_time: Some(900),
                size: Some(5),
                downloading: Some(false),
                ..EntryUpdate::default()
            },
        )
        .await
        .unwrap();

    let entry = store.get("a.txt").await.unwrap().unwrap();
    assert!(!entry.downloading);
    assert_eq!(entry.claimed_at, None);
    assert_eq!((entry.mod_time, entry.size), (900, 5));
}

#[tokio::test]
async fn mark_all_not_existing_skips_downloading_rows() {
    let store = make_store().await;
    store
        .insert(&LedgerEntry::tracked("a.txt", 1, 1))
        .await
        .unwrap();
    store.insert(&LedgerEntry::claim("b.txt", 1)).await.unwrap();

    let cleared = store.mark_all_not_existing().await.unwrap();

    assert_eq!(cleared, 1);
    assert!(!store.get("a.txt").await.unwrap().unwrap().exists);
    assert!(store.get("b.txt").await.unwrap().unwrap().exists);
}

#[tokio::test]
async fn list_where_filters_rows() {
    let store = make_store().await;
    store
        .insert(&LedgerEntry::tracked("a.txt", 1, 1))
        .await
        .unwrap();
    store
        .insert(&LedgerEntry {
            exists: false,
            ..LedgerEntry::tracked("b.txt", 1, 1)
        })
        .await
        .unwrap();
    store.insert(&LedgerEntry::claim("c.txt", 50)).await.unwrap();

    let paths = |entries: Vec<LedgerEntry>| -> Vec<String> {
        entries.into_iter().map(|e| e.path).collect()
    };

    assert_eq!(
        paths(store.list_where(LedgerFilter::All).await.unwrap()),
        vec!["a.txt", "b.txt", "c.txt"]
    );
    assert_eq!(
        paths(store.list_where(LedgerFilter::NotExisting).await.unwrap()),
        vec!["b.txt"]
    );
    assert_eq!(
        paths(store.list_where(LedgerFilter::Downloading).await.unwrap()),
        vec!["c.txt"]
    );
    assert!(
        store
            .list_where(LedgerFilter::StaleClaims { claimed_before: 50 })
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(
        paths(
            store
                .list_where(LedgerFilter::StaleClaims { claimed_before: 51 })
                .await
                .unwrap()
        ),
        vec!["c.txt"]
    );
}

#[tokio::test]
async fn delete_not_existing_keeps_claims_and_present_rows() {
    let store = make_store().await;
    store
        .insert(&LedgerEntry::tracked("keep.txt", 1, 1))
        .await
        .unwrap();
    store
        .insert(&LedgerEntry::tracked("gone.txt", 1, 1))
        .await
        .unwrap();
    store.insert(&LedgerEntry::claim("claim.txt", 1)).await.unwrap();
    store.mark_all_not_existing().await.unwrap();
    store
        .update(
            "keep.txt",
            &EntryUpdate {
                exists: Some(true),
                ..EntryUpdate::default()
            },
        )
        .await
        .unwrap();

    let removed = store.delete_not_existing().await.unwrap();

    assert_eq!(removed, 1);
    assert!(store.get("gone.txt").await.unwrap().is_none());
    assert!(store.get("keep.txt").await.unwrap().is_some());
    assert!(store.get("claim.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn reclaim_stale_claims_removes_only_old_claims() {
    let store = make_store().await;
    store.insert(&LedgerEntry::claim("old.txt", 100)).await.unwrap();
    store.insert(&LedgerEntry::claim("new.txt", 300)).await.unwrap();
    store
        .insert(&LedgerEntry::tracked("plain.txt", 1, 1))
        .await
        .unwrap();

    let reclaimed = store.reclaim_stale_claims(200).await.unwrap();

    assert_eq!(reclaimed, vec!["old.txt".to_string()]);
    assert!(store.get("old.txt").await.unwrap().is_none());
    assert!(store.get("new.txt").await.unwrap().is_some());
    assert!(store.get("plain.txt").await.unwrap().is_some());
}

#[tokio::test]
async fn failures_are_tracked_per_direction() {
    let store = make_store().await;
    let record = FailureRecord {
        path: "a.txt".into(),
        direction: TransferDirection::Upload,
        attempt: 1,
        retry_at: 1_000,
        last_error: Some("timeout".into()),
    };
    store.record_failure(&record).await.unwrap();
    store
        .record_failure(&FailureRecord {
            attempt: 2,
            retry_at: 2_000,
            ..record.clone()
        })
        .await
        .unwrap();

    let stored = store
        .failure("a.txt", TransferDirection::Upload)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.attempt, 2);
    assert_eq!(stored.retry_at, 2_000);
    assert!(
        store
            .failure("a.txt", TransferDirection::Download)
            .await
            .unwrap()
            .is_none()
    );

    store
        .clear_failure("a.txt", TransferDirection::Upload)
        .await
        .unwrap();
    assert!(
        store
            .failure("a.txt", TransferDirection::Upload)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn orphans_accumulate_attempts_until_deleted() {
    let store = make_store().await;
    store.record_orphan("a.txt", "503", 10).await.unwrap();
    store.record_orphan("a.txt", "timeout", 20).await.unwrap();

    let orphans = store.list_orphans().await.unwrap();
    assert_eq!(orphans.len(), 1);
    assert_eq!(orphans[0].attempt, 2);
    assert_eq!(orphans[0].last_error.as_deref(), Some("timeout"));
    assert_eq!(orphans[0].recorded_at, 10);

    store.delete_orphan("a.txt").await.unwrap();
    assert!(store.list_orphans().await.unwrap().is_empty());
}

#[tokio::test]
async fn open_creates_database_file_and_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("state").join(".files.db");

    {
        let store = LedgerStore::open(&db_path).await.unwrap();
        store
            .insert(&LedgerEntry::tracked("a.txt", 7, 3))
            .await
            .unwrap();
    }

    assert!(db_path.exists());
    let reopened = LedgerStore::open(&db_path).await.unwrap();
    let entry = reopened.get("a.txt").await.unwrap().unwrap();
    assert_eq!((entry.mod_time, entry.size), (7, 3));
}
