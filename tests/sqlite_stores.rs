use matrix_bridge_qq::database::{
    Database, DatabaseError, MessageRecord, NameQuality, PortalRecord, PuppetRecord, Stores,
    UserRecord,
};
use matrix_bridge_qq::qq::{MessageKey, PortalKey, Uid};
use uuid::Uuid;

async fn sqlite_stores() -> (Stores, std::path::PathBuf) {
    let path = std::env::temp_dir().join(format!("matrix-bridge-qq-test-{}.db", Uuid::new_v4()));
    let db = Database::connect("sqlite", &path.to_string_lossy(), 4, 1)
        .await
        .expect("sqlite should open");
    db.run_migrations().await.expect("migrations should run");
    (db.stores(), path)
}

fn message(chat: &PortalKey, seq: &str, ts: i64, mxid: &str) -> MessageRecord {
    MessageRecord::new(chat.clone(), MessageKey::new(seq, seq), Uid::user("20"), ts).with_mxid(mxid)
}

#[tokio::test]
async fn portal_records_round_trip_through_sqlite() {
    let (stores, path) = sqlite_stores().await;
    let key = PortalKey::private("20", "10000");

    stores
        .portals
        .insert(&PortalRecord::new(key.clone()).with_name("Bob"))
        .await
        .expect("insert");
    let mut record = stores
        .portals
        .get_by_key(&key)
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(record.name, "Bob");
    assert!(record.mxid.is_none());

    record.mxid = Some("!room:example.org".to_string());
    record.encrypted = true;
    stores.portals.update(&record).await.expect("update");
    let by_mxid = stores
        .portals
        .get_by_mxid("!room:example.org")
        .await
        .expect("lookup")
        .expect("indexed by room");
    assert_eq!(by_mxid.key, key);
    assert!(by_mxid.encrypted);

    let private = stores
        .portals
        .find_private_chats_with(&Uid::user("20"))
        .await
        .expect("lookup");
    assert_eq!(private.len(), 1);

    stores.portals.delete(&key).await.expect("delete");
    assert!(stores.portals.get_by_key(&key).await.expect("lookup").is_none());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn message_index_rejects_duplicates_and_resolves_replies() {
    let (stores, path) = sqlite_stores().await;
    let chat = PortalKey::group("300");

    stores
        .messages
        .insert(&message(&chat, "5", 1000, "net.qq.bridge.fake::1"))
        .await
        .expect("insert");
    let err = stores
        .messages
        .insert(&message(&chat, "5", 1000, "$other"))
        .await
        .unwrap_err();
    assert!(matches!(err, DatabaseError::Duplicate(_)));

    stores
        .messages
        .update_mxid(&chat, &MessageKey::new("5", "5"), "$real", true)
        .await
        .expect("update");
    let found = stores
        .messages
        .get_by_reply(&chat, "5", 995, 10)
        .await
        .expect("lookup")
        .expect("inside window");
    assert_eq!(found.mxid, "$real");
    assert!(found.sent);
    assert!(
        stores
            .messages
            .get_by_reply(&chat, "5", 900, 10)
            .await
            .expect("lookup")
            .is_none()
    );

    stores.messages.delete_all(&chat).await.expect("delete");
    assert!(stores.messages.get_by_mxid("$real").await.expect("lookup").is_none());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn puppets_and_users_persist_their_fields() {
    let (stores, path) = sqlite_stores().await;
    let uid = Uid::user("20");

    let mut puppet = PuppetRecord::new(uid.clone());
    puppet.displayname = "Bobby (QQ)".to_string();
    puppet.name_quality = NameQuality::Remark;
    stores.puppets.insert(&puppet).await.expect("insert");
    let stored = stores.puppets.get(&uid).await.expect("lookup").expect("stored");
    assert_eq!(stored.displayname, "Bobby (QQ)");
    assert_eq!(stored.name_quality, NameQuality::Remark);

    let mut user = UserRecord::new("@alice:example.org");
    user.uin = Some("10000".to_string());
    stores.users.upsert(&user).await.expect("upsert");
    let by_uin = stores
        .users
        .get_by_uin("10000")
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(by_uin.mxid, "@alice:example.org");
    assert_eq!(stores.users.get_all_logged_in().await.expect("list").len(), 1);
    let _ = std::fs::remove_file(path);
}
