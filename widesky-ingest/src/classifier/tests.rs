use std::collections::BTreeMap;

use ipld_core::cid::multihash::Multihash;

use super::*;

const DAG_CBOR: u64 = 0x71;

fn test_cid(tag: &[u8]) -> Cid {
    let hash = Multihash::<64>::wrap(0x00, tag).expect("failed to wrap digest");
    Cid::new_v1(DAG_CBOR, hash)
}

fn map(entries: Vec<(&str, Ipld)>) -> Ipld {
    Ipld::Map(entries.into_iter().map(|(key, value)| (key.to_owned(), value)).collect::<BTreeMap<_, _>>())
}

fn text(value: &str) -> Ipld {
    Ipld::String(value.to_owned())
}

fn commit() -> RepoCommit {
    RepoCommit {
        seq: 42,
        did: "did:plc:ewvi7nxzyoun6zhxrhs64oiz".to_owned(),
        rev: "3l5a2nyip2c2t".to_owned(),
        commit: test_cid(b"commit"),
        ops: Vec::new(),
    }
}

fn create_op(collection: &str, record: &Ipld) -> Operation {
    Operation {
        action: "create".to_owned(),
        path: format!("{collection}/3l5a2nyip2c2t"),
        cid: Some(test_cid(b"record")),
        record: Some(serde_ipld_dagcbor::to_vec(record).expect("failed to encode record")),
    }
}

fn strong_ref(cid: &str, uri: &str) -> Ipld {
    map(vec![("cid", text(cid)), ("uri", text(uri))])
}

fn image_embed(links: &[Cid]) -> Ipld {
    let items = links
        .iter()
        .map(|link| {
            map(vec![(
                "image",
                map(vec![("$type", text("blob")), ("ref", Ipld::Link(*link))]),
            )])
        })
        .collect();
    map(vec![("$type", text("app.bsky.embed.images")), ("images", Ipld::List(items))])
}

#[test]
fn classifies_a_post_with_reply_and_image_embed() {
    let commit = commit();
    let image = test_cid(b"image");
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("createdAt", text("2024-09-28T12:34:56.789Z")),
        ("text", text("hello world")),
        ("langs", Ipld::List(vec![text("en"), text("ja")])),
        (
            "reply",
            map(vec![
                ("root", strong_ref("root-cid", "at://root")),
                ("parent", strong_ref("parent-cid", "at://parent")),
            ]),
        ),
        ("embed", image_embed(&[image])),
    ]);

    let decoded = classify(&commit, &create_op(POST_COLLECTION, &record))
        .expect("create should classify");
    let DecodedRecord::Post(post) = decoded else {
        panic!("expected a post, got {decoded:?}");
    };
    assert_eq!(post.did, commit.did);
    assert_eq!(post.commit, commit.commit.to_string());
    assert_eq!(post.text, "hello world");
    assert_eq!(post.langs.as_deref(), Some(["en".to_owned(), "ja".to_owned()].as_slice()));
    assert_eq!(
        post.created_at.map(|at| at.to_rfc3339()),
        Some("2024-09-28T12:34:56.789+00:00".to_owned()),
    );
    assert!(post.has_embed);
    assert_eq!(post.embed_type.as_deref(), Some("images"));
    assert_eq!(post.embed_refs, Some(vec![image.to_string()]));
    assert!(post.is_reply);
    assert_eq!(post.reply_root_cid.as_deref(), Some("root-cid"));
    assert_eq!(post.reply_parent_uri.as_deref(), Some("at://parent"));
    assert!(!post.has_record);
}

#[test]
fn bare_post_leaves_embed_and_reply_fields_empty() {
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("text", text("plain")),
    ]);
    let decoded = classify(&commit(), &create_op(POST_COLLECTION, &record))
        .expect("create should classify");
    let DecodedRecord::Post(post) = decoded else {
        panic!("expected a post, got {decoded:?}");
    };
    assert!(!post.has_embed);
    assert_eq!(post.embed_type, None);
    assert_eq!(post.embed_refs, None);
    assert!(!post.is_reply);
    assert_eq!(post.reply_root_cid, None);
    assert_eq!(post.langs, None);
    assert_eq!(post.facets, None);
}

#[test]
fn external_embed_captures_the_uri() {
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("text", text("link")),
        (
            "embed",
            map(vec![
                ("$type", text("app.bsky.embed.external")),
                ("external", map(vec![("uri", text("https://example.com")), ("title", text("t"))])),
            ]),
        ),
    ]);
    let Some(DecodedRecord::Post(post)) = classify(&commit(), &create_op(POST_COLLECTION, &record))
    else {
        panic!("expected a post");
    };
    assert!(post.has_embed);
    assert_eq!(post.embed_type.as_deref(), Some("external"));
    assert_eq!(post.external_uri.as_deref(), Some("https://example.com"));
}

#[test]
fn quote_embed_sets_the_record_fields_without_media() {
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("text", text("quoting")),
        (
            "embed",
            map(vec![
                ("$type", text("app.bsky.embed.record")),
                ("record", strong_ref("quoted-cid", "at://quoted")),
            ]),
        ),
    ]);
    let Some(DecodedRecord::Post(post)) = classify(&commit(), &create_op(POST_COLLECTION, &record))
    else {
        panic!("expected a post");
    };
    assert!(!post.has_embed);
    assert!(post.has_record);
    assert_eq!(post.embed_type.as_deref(), Some("record"));
    assert_eq!(post.record_cid.as_deref(), Some("quoted-cid"));
    assert_eq!(post.record_uri.as_deref(), Some("at://quoted"));
}

#[test]
fn quote_with_media_carries_the_media_tag() {
    let image = test_cid(b"media");
    let record = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("text", text("quoting with media")),
        (
            "embed",
            map(vec![
                ("$type", text("app.bsky.embed.recordWithMedia")),
                ("record", map(vec![("record", strong_ref("quoted-cid", "at://quoted"))])),
                ("media", image_embed(&[image])),
            ]),
        ),
    ]);
    let Some(DecodedRecord::Post(post)) = classify(&commit(), &create_op(POST_COLLECTION, &record))
    else {
        panic!("expected a post");
    };
    assert!(post.has_embed);
    assert!(post.has_record);
    assert_eq!(post.embed_type.as_deref(), Some("images"));
    assert_eq!(post.embed_refs, Some(vec![image.to_string()]));
    assert_eq!(post.record_uri.as_deref(), Some("at://quoted"));
}

#[test]
fn likes_and_reposts_capture_their_subject() {
    let record = map(vec![
        ("$type", text("app.bsky.feed.like")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("subject", strong_ref("subject-cid", "at://subject")),
    ]);
    let commit = commit();
    let Some(DecodedRecord::Like(like)) = classify(&commit, &create_op(LIKE_COLLECTION, &record))
    else {
        panic!("expected a like");
    };
    assert_eq!(like.subject_cid, "subject-cid");
    assert_eq!(like.subject_url, "at://subject");

    let record = map(vec![
        ("$type", text("app.bsky.feed.repost")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("subject", strong_ref("subject-cid", "at://subject")),
    ]);
    let Some(DecodedRecord::Repost(repost)) =
        classify(&commit, &create_op(REPOST_COLLECTION, &record))
    else {
        panic!("expected a repost");
    };
    assert_eq!(repost.subject_cid, "subject-cid");
    assert_eq!(repost.subject_uri, "at://subject");
}

#[test]
fn follows_are_typed_but_carry_only_the_subject_did() {
    let record = map(vec![
        ("$type", text("app.bsky.graph.follow")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("subject", text("did:plc:other")),
    ]);
    let Some(DecodedRecord::Follow(follow)) =
        classify(&commit(), &create_op(FOLLOW_COLLECTION, &record))
    else {
        panic!("expected a follow");
    };
    assert_eq!(follow.subject_did, "did:plc:other");
}

#[test]
fn non_create_actions_are_dropped() {
    let record = map(vec![("$type", text("app.bsky.feed.post")), ("text", text("gone"))]);
    let mut op = create_op(POST_COLLECTION, &record);
    op.action = "delete".to_owned();
    assert_eq!(classify(&commit(), &op), None);
}

#[test]
fn unknown_collections_are_counted_as_unhandled() {
    let record = map(vec![("$type", text("app.bsky.graph.list"))]);
    let decoded = classify(&commit(), &create_op("app.bsky.graph.list", &record))
        .expect("create should classify");
    assert_eq!(decoded, DecodedRecord::Unhandled { collection: "app.bsky.graph.list".to_owned() });
}

#[test]
fn missing_record_block_degrades_to_unhandled() {
    let record = map(vec![("$type", text("app.bsky.feed.post"))]);
    let mut op = create_op(POST_COLLECTION, &record);
    op.record = None;
    let decoded = classify(&commit(), &op).expect("create should classify");
    assert_eq!(decoded, DecodedRecord::Unhandled { collection: POST_COLLECTION.to_owned() });
}

#[test]
fn one_malformed_operation_does_not_discard_its_siblings() {
    let commit = commit();
    let good = map(vec![
        ("$type", text("app.bsky.feed.post")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("text", text("fine")),
    ]);
    // A like whose subject is a bare string instead of a strong ref.
    let bad = map(vec![
        ("$type", text("app.bsky.feed.like")),
        ("createdAt", text("2024-09-28T12:34:56Z")),
        ("subject", text("not-a-ref")),
    ]);
    let ops = [
        create_op(POST_COLLECTION, &good),
        create_op(LIKE_COLLECTION, &bad),
        create_op(POST_COLLECTION, &good),
    ];

    let decoded: Vec<DecodedRecord> =
        ops.iter().filter_map(|op| classify(&commit, op)).collect();
    assert_eq!(decoded.len(), 3);
    assert!(matches!(decoded[0], DecodedRecord::Post(_)));
    assert_eq!(
        decoded[1],
        DecodedRecord::Unhandled { collection: LIKE_COLLECTION.to_owned() },
    );
    assert!(matches!(decoded[2], DecodedRecord::Post(_)));
}

#[test]
fn facets_are_preserved_as_json_with_links_and_bytes_rendered() {
    let link = test_cid(b"facet");
    let facets = Ipld::List(vec![map(vec![
        ("index", map(vec![("byteStart", Ipld::Integer(0)), ("byteEnd", Ipld::Integer(5))])),
        ("ref", Ipld::Link(link)),
        ("blob", Ipld::Bytes(vec![0xde, 0xad])),
    ])]);
    let json = ipld_to_json(&facets);
    let facet = &json[0];
    assert_eq!(facet["index"]["byteStart"], serde_json::json!(0));
    assert_eq!(facet["ref"], serde_json::json!(link.to_string()));
    assert_eq!(facet["blob"], serde_json::json!("3q0="));
}
