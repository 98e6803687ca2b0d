mod common;

use common::*;
use matrix_bridge_qq::database::{MessageRecord, NameQuality};
use matrix_bridge_qq::qq::{ContactInfo, MessageKey, PortalKey, QqElement, QqEvent, Uid};

fn reply_to(seq: &str, time: i64, sender: &str) -> QqElement {
    QqElement::Reply {
        id: String::new(),
        seq: seq.to_string(),
        time,
        sender: sender.to_string(),
        group_id: None,
        summary: String::new(),
    }
}

async fn private_room_with_bob(h: &Harness) -> String {
    h.qq.add_friend("20", "Bob");
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "1", vec![QqElement::text("hello")])),
        )
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 1).await);
    h.bridge
        .get_portal_by_key(&PortalKey::private("20", SELF_UIN))
        .await
        .expect("portal")
        .mxid()
        .expect("room")
}

#[tokio::test]
async fn reply_within_window_threads_to_original_event() {
    let h = harness().await;
    private_room_with_bob(&h).await;

    let mut original = MessageRecord::new(
        PortalKey::private("20", SELF_UIN),
        MessageKey::new("5", "5"),
        Uid::user("20"),
        1000,
    )
    .with_mxid("$orig");
    original.sent = true;
    h.bridge.stores.messages.insert(&original).await.expect("insert");

    // The relay reports a reply timestamp a few seconds early.
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message(
                "20",
                "2",
                vec![reply_to("5", 995, "20"), QqElement::text("answer")],
            )),
        )
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 2).await);

    let event = &h.matrix.messages()[1];
    assert_eq!(
        event.content["m.relates_to"]["m.in_reply_to"]["event_id"],
        "$orig"
    );
    assert_eq!(event.content["body"], "answer");
}

#[tokio::test]
async fn reply_outside_window_degrades_to_name_prefix() {
    let h = harness().await;
    private_room_with_bob(&h).await;

    let mut original = MessageRecord::new(
        PortalKey::private("20", SELF_UIN),
        MessageKey::new("5", "5"),
        Uid::user("20"),
        1000,
    )
    .with_mxid("$orig");
    original.sent = true;
    h.bridge.stores.messages.insert(&original).await.expect("insert");

    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message(
                "20",
                "2",
                vec![reply_to("5", 900, "20"), QqElement::text("answer")],
            )),
        )
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 2).await);

    let event = &h.matrix.messages()[1];
    assert!(event.content.get("m.relates_to").is_none());
    assert_eq!(event.content["body"], "@Bob (QQ) answer");
}

#[tokio::test]
async fn better_names_are_never_replaced_by_worse_ones() {
    let h = harness().await;
    let puppet = h.bridge.get_puppet(&Uid::user("20")).await.expect("puppet");
    let contact = |name: &str, remark: &str| ContactInfo {
        uin: "20".to_string(),
        name: name.to_string(),
        remark: remark.to_string(),
        avatar_url: String::new(),
    };

    puppet
        .sync(&h.bridge, h.qq.as_ref(), &contact("", ""), false, false)
        .await;
    assert_eq!(puppet.displayname(), "20 (QQ)");
    assert_eq!(puppet.name_quality(), NameQuality::Uin);

    puppet
        .sync(&h.bridge, h.qq.as_ref(), &contact("Bob", "Bobby"), false, false)
        .await;
    assert_eq!(puppet.displayname(), "Bobby (QQ)");
    assert_eq!(puppet.name_quality(), NameQuality::Remark);

    puppet
        .sync(&h.bridge, h.qq.as_ref(), &contact("Robert", ""), false, false)
        .await;
    assert_eq!(puppet.displayname(), "Bobby (QQ)");

    puppet
        .sync(&h.bridge, h.qq.as_ref(), &contact("", ""), false, false)
        .await;
    assert_eq!(puppet.displayname(), "Bobby (QQ)");
    assert_eq!(puppet.name_quality(), NameQuality::Remark);

    let stored = h
        .bridge
        .stores
        .puppets
        .get(&Uid::user("20"))
        .await
        .expect("lookup")
        .expect("ghost should be saved");
    assert_eq!(stored.displayname, "Bobby (QQ)");
}
