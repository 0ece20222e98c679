use super::*;

fn like(cid: &str, subject_cid: &str) -> LikeRow {
    LikeRow {
        cid: cid.into(),
        created_at: None,
        did: "did:plc:ewvi7nxzyoun6zhxrhs64oiz".into(),
        commit: "bafyreib3cqh3qw2kpk4jjtoyyr6rl6bsr6428gedkkmsc2bihzulf4gvgu".into(),
        subject_cid: subject_cid.into(),
        subject_url: "at://did:plc:abc/app.bsky.feed.post/3l5a2nyip2c2t".into(),
    }
}

#[test]
fn dedupe_keeps_the_latest_occurrence_of_a_key() {
    let rows = vec![like("cid-a", "s1"), like("cid-b", "s2"), like("cid-a", "s3")];
    let deduped = dedupe_by_key(&rows);
    assert_eq!(deduped.len(), 2);
    let a = deduped.iter().find(|row| row.cid == "cid-a").expect("cid-a missing");
    assert_eq!(a.subject_cid, "s3");
}

#[test]
fn dedupe_orders_rows_deterministically() {
    let rows = vec![like("z", "s1"), like("a", "s2"), like("m", "s3")];
    let keys: Vec<&str> = dedupe_by_key(&rows).iter().map(|row| row.key()).collect();
    assert_eq!(keys, ["a", "m", "z"]);
}

#[test]
fn user_upsert_keeps_first_known_as_write_once() {
    let rows = vec![Identity {
        did: "did:plc:ewvi7nxzyoun6zhxrhs64oiz".into(),
        first_known_as: Some("alice.test".into()),
        also_known_as: Some("alice.test".into()),
    }];
    let mut builder = user_upsert(&rows);
    let sql = builder.sql();
    assert!(sql.contains("COALESCE(users.first_known_as, EXCLUDED.first_known_as)"));
    assert!(sql.contains("also_known_as = COALESCE(EXCLUDED.also_known_as, users.also_known_as)"));
}

#[tokio::test]
async fn an_empty_batch_never_reaches_the_database() {
    // connect_lazy performs no I/O; any statement would fail.
    let pool = PgPool::connect_lazy("postgres://widesky@db.invalid/widesky")
        .expect("failed to build pool");
    Identity::insert_batch(&pool, &[]).await.expect("empty user batch should be a no-op");
    LikeRow::insert_batch(&pool, &[]).await.expect("empty like batch should be a no-op");
}

#[test]
fn every_row_type_names_its_table() {
    assert_eq!(Identity::TABLE, "users");
    assert_eq!(PostRow::TABLE, "posts");
    assert_eq!(LikeRow::TABLE, "likes");
    assert_eq!(RepostRow::TABLE, "reposts");
}
