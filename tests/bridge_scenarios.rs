mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use common::*;
use matrix_bridge_qq::bridge::QqBridge;
use matrix_bridge_qq::database::{MessageErrorKind, MessageRecord};
use matrix_bridge_qq::formatter::{ConvertError, MatrixToQq};
use matrix_bridge_qq::matrix::{MessageContent, RoomEvent};
use matrix_bridge_qq::qq::{
    GroupMember, MediaSource, MemberRole, MessageKey, PortalKey, QqElement, QqEvent,
    SharedQqClient, Uid,
};
use serde_json::json;

const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDRfake-image-payload";

fn member(uin: &str, role: MemberRole) -> GroupMember {
    GroupMember {
        uin: uin.to_string(),
        nickname: format!("nick{uin}"),
        card: String::new(),
        role,
    }
}

async fn known_ghost(h: &Harness, uin: &str, name: &str) {
    h.qq.add_friend(uin, name);
    let puppet = h
        .bridge
        .get_puppet(&Uid::user(uin))
        .await
        .expect("puppet should load");
    puppet
        .sync_contact(&h.bridge, h.qq.as_ref(), false, "test setup")
        .await;
}

async fn room_of(h: &Harness, key: &PortalKey) -> String {
    let portal = h
        .bridge
        .get_portal_by_key(key)
        .await
        .expect("portal should load");
    assert!(
        wait_until(|| portal.mxid().is_some()).await,
        "portal room should be created"
    );
    portal.mxid().expect("room id")
}

fn matrix_event(room_id: &str, event_id: &str, content: serde_json::Value) -> RoomEvent {
    RoomEvent {
        event_id: event_id.to_string(),
        room_id: room_id.to_string(),
        sender: OWNER.to_string(),
        event_type: "m.room.message".to_string(),
        content,
        ..Default::default()
    }
}

#[tokio::test]
async fn group_text_with_mention_of_known_ghost_becomes_one_linked_event() {
    let h = harness().await;
    h.qq.add_group("300", "Rust fans", vec![member("30", MemberRole::Member)]);
    known_ghost(&h, "20", "Bob").await;

    let message = group_message(
        "300",
        "30",
        "1",
        vec![QqElement::text("hi "), QqElement::at("20", "@Bob")],
    );
    h.user.handle_event(&h.bridge, QqEvent::Message(message)).await;

    assert!(wait_until(|| h.matrix.messages().len() == 1).await);
    settle().await;
    let events = h.matrix.messages();
    assert_eq!(events.len(), 1, "exactly one Matrix event per QQ message");

    let event = &events[0];
    assert_eq!(event.event_type, "m.room.message");
    assert_eq!(event.as_user, "@qq_30:example.org");
    assert_eq!(event.ts, Some(1_700_000_000_000));
    let html = event.content["formatted_body"].as_str().expect("html body");
    assert_eq!(html.matches("<a href=").count(), 1);
    assert!(html.contains(r#"href="https://matrix.to/#/@qq_20:example.org""#));
    assert!(html.contains("Bob (QQ)"));
    assert_eq!(
        event.content["m.mentions"]["user_ids"],
        json!(["@qq_20:example.org"])
    );
}

#[tokio::test]
async fn private_lone_image_becomes_native_image_event() {
    let h = harness().await;
    h.qq.attachments
        .lock()
        .insert("http://qq.example/img".to_string(), PNG.to_vec());

    let message = private_message(
        "20",
        "1",
        vec![QqElement::Image {
            source: MediaSource::Url("http://qq.example/img".to_string()),
            file: "img.png".to_string(),
        }],
    );
    h.user.handle_event(&h.bridge, QqEvent::Message(message)).await;

    assert!(wait_until(|| h.matrix.messages().len() == 1).await);
    let event = &h.matrix.messages()[0];
    assert_eq!(event.content["msgtype"], "m.image");
    assert_eq!(event.content["info"]["mimetype"], "image/png");
    assert_eq!(event.content["info"]["size"], json!(PNG.len()));
    assert!(
        event.content["url"]
            .as_str()
            .is_some_and(|url| url.starts_with("mxc://"))
    );
    assert_eq!(event.as_user, "@qq_20:example.org");
}

#[tokio::test]
async fn failed_image_download_becomes_notice_with_reason() {
    let h = harness().await;
    let message = private_message(
        "21",
        "7",
        vec![QqElement::Image {
            source: MediaSource::Url("http://qq.example/missing".to_string()),
            file: "missing.png".to_string(),
        }],
    );
    h.user.handle_event(&h.bridge, QqEvent::Message(message)).await;

    assert!(wait_until(|| h.matrix.messages().len() == 1).await);
    settle().await;
    let events = h.matrix.messages();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].content["msgtype"], "m.notice");
    assert!(
        events[0].content["body"]
            .as_str()
            .is_some_and(|body| body.contains("failed to download image from QQ"))
    );

    let stored = h
        .bridge
        .stores
        .messages
        .get_by_message_key(&PortalKey::private("21", SELF_UIN), &MessageKey::new("7", "7"))
        .await
        .expect("lookup")
        .expect("record should be stored");
    assert_eq!(stored.error, MessageErrorKind::MediaNotFound);
    assert!(stored.sent);
}

#[tokio::test]
async fn private_reply_to_own_message_is_addressed_to_peer() {
    let h = harness().await;
    let chat = PortalKey::private("20", SELF_UIN);
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "1", vec![QqElement::text("hello")])),
        )
        .await;
    let room_id = room_of(&h, &chat).await;

    let mut earlier = MessageRecord::new(
        chat.clone(),
        MessageKey::new("70000", "70000"),
        Uid::user(SELF_UIN),
        1_699_999_000,
    )
    .with_mxid("$mine")
    .with_content("earlier");
    earlier.sent = true;
    h.bridge.stores.messages.insert(&earlier).await.expect("insert");

    let event = matrix_event(
        &room_id,
        "$reply",
        json!({
            "msgtype": "m.text",
            "body": "reply",
            "m.relates_to": { "m.in_reply_to": { "event_id": "$mine" } }
        }),
    );
    h.bridge.handle_matrix_event(event).await;

    assert!(wait_until(|| h.qq.sent.lock().len() == 1).await);
    let sent = h.qq.sent.lock()[0].clone();
    assert_eq!(sent.target, "20");
    assert!(!sent.group);
    match &sent.elements[0] {
        QqElement::Reply {
            seq,
            group_id,
            sender,
            ..
        } => {
            assert_eq!(seq, &(70000u32 as u16).to_string());
            assert_eq!(group_id.as_deref(), Some("20"));
            assert_eq!(sender, SELF_UIN);
        }
        other => panic!("expected reply element, got {other:?}"),
    }
    assert_eq!(sent.elements[1], QqElement::text("reply"));

    let stored = h
        .bridge
        .stores
        .messages
        .get_by_mxid("$reply")
        .await
        .expect("lookup")
        .expect("outgoing message should be recorded");
    assert!(stored.sent);
    assert_eq!(stored.sender, Uid::user(SELF_UIN));
}

#[tokio::test]
async fn unsupported_matrix_message_type_is_rejected_without_sending() {
    let h = harness().await;
    let chat = PortalKey::private("20", SELF_UIN);

    let converter = MatrixToQq {
        matrix: h.matrix.as_ref(),
        qq: h.qq.as_ref(),
        codec: &PassthroughCodec,
        puppets: &h.bridge.puppet_ids,
        portal: &chat,
        max_file_size: 1024,
    };
    let content = MessageContent::new("m.server_notice", "hello");
    let result = converter.convert("m.room.message", &content, None).await;
    assert!(matches!(
        result,
        Err(ConvertError::UnsupportedMessageType(ref kind)) if kind == "m.server_notice"
    ));

    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "1", vec![QqElement::text("hello")])),
        )
        .await;
    let room_id = room_of(&h, &chat).await;
    let event = matrix_event(
        &room_id,
        "$odd",
        json!({ "msgtype": "m.server_notice", "body": "hello" }),
    );
    h.bridge.handle_matrix_event(event).await;

    assert!(
        wait_until(|| h.matrix.messages().iter().any(|e| {
            e.content["msgtype"] == "m.notice"
                && e.content["body"]
                    .as_str()
                    .is_some_and(|b| b.contains("unsupported message type"))
        }))
        .await
    );
    assert_eq!(h.qq.sent.lock().len(), 0, "nothing may reach QQ");
}

#[tokio::test]
async fn group_roles_become_power_levels() {
    let h = harness().await;
    h.qq.add_group(
        "300",
        "Rust fans",
        vec![
            member("30", MemberRole::Owner),
            member("31", MemberRole::Member),
            member("40", MemberRole::Admin),
        ],
    );
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(group_message("300", "31", "1", vec![QqElement::text("hi")])),
        )
        .await;
    let room_id = room_of(&h, &PortalKey::group("300")).await;
    assert!(wait_until(|| h.matrix.messages().len() == 1).await);

    let levels = h
        .matrix
        .state
        .lock()
        .get(&(room_id.clone(), "m.room.power_levels".to_string(), String::new()))
        .cloned()
        .expect("power levels should be set");
    assert_eq!(levels["users"]["@qq_30:example.org"], 95);
    assert_eq!(levels["users"]["@qq_40:example.org"], 50);
    assert!(levels["users"].get("@qq_31:example.org").is_none());
    assert_eq!(levels["users"][BOT], 100);

    let created = h.matrix.created.lock()[0].clone();
    assert_eq!(created.name.as_deref(), Some("Rust fans"));
    assert!(!created.is_direct);
    assert!(
        created
            .initial_state
            .iter()
            .any(|state| state.event_type == "m.bridge" && state.state_key == "net.qq.bridge://qq/300")
    );
}

#[tokio::test]
async fn group_recall_redacts_as_operator_then_falls_back_to_bot() {
    let h = harness().await;
    h.qq.add_group("300", "Rust fans", Vec::new());
    for (sender, seq) in [("30", "9"), ("31", "10")] {
        h.user
            .handle_event(
                &h.bridge,
                QqEvent::Message(group_message("300", sender, seq, vec![QqElement::text("x")])),
            )
            .await;
    }
    assert!(wait_until(|| h.matrix.messages().len() == 2).await);
    let events = h.matrix.messages();

    h.user
        .handle_event(
            &h.bridge,
            QqEvent::GroupRecall {
                group: "300".to_string(),
                operator: "30".to_string(),
                key: MessageKey::new("9", "9"),
                time: 1_700_000_000,
            },
        )
        .await;
    assert!(wait_until(|| h.matrix.redactions.lock().len() == 1).await);
    let (as_user, _, event_id) = h.matrix.redactions.lock()[0].clone();
    assert_eq!(as_user, "@qq_30:example.org");
    assert_eq!(event_id, events[0].event_id);

    h.matrix
        .forbid_redact
        .lock()
        .insert("@qq_40:example.org".to_string());
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::GroupRecall {
                group: "300".to_string(),
                operator: "40".to_string(),
                key: MessageKey::new("10", "10"),
                time: 1_700_000_000,
            },
        )
        .await;
    assert!(wait_until(|| h.matrix.redactions.lock().len() == 2).await);
    let (as_user, _, event_id) = h.matrix.redactions.lock()[1].clone();
    assert_eq!(as_user, BOT);
    assert_eq!(event_id, events[1].event_id);
}

#[tokio::test]
async fn matrix_redaction_recalls_the_qq_message() {
    let h = harness().await;
    h.qq.add_group("300", "Rust fans", Vec::new());
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(group_message("300", "30", "1", vec![QqElement::text("hi")])),
        )
        .await;
    let room_id = room_of(&h, &PortalKey::group("300")).await;

    h.bridge
        .handle_matrix_event(matrix_event(
            &room_id,
            "$out",
            json!({ "msgtype": "m.text", "body": "to be recalled" }),
        ))
        .await;
    assert!(wait_until(|| h.qq.sent.lock().len() == 1).await);

    h.bridge
        .handle_matrix_event(RoomEvent {
            event_id: "$redaction".to_string(),
            room_id: room_id.clone(),
            sender: OWNER.to_string(),
            event_type: "m.room.redaction".to_string(),
            redacts: Some("$out".to_string()),
            ..Default::default()
        })
        .await;
    assert!(wait_until(|| h.qq.recalls.lock().len() == 1).await);
    let stored = h
        .bridge
        .stores
        .messages
        .get_by_mxid("$out")
        .await
        .expect("lookup")
        .expect("record");
    assert_eq!(h.qq.recalls.lock()[0], stored.key);
}

#[tokio::test]
async fn removal_from_group_posts_notice_and_tears_down_portal() {
    let h = harness().await;
    h.qq.add_group("300", "Rust fans", Vec::new());
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(group_message("300", "30", "1", vec![QqElement::text("hi")])),
        )
        .await;
    let room_id = room_of(&h, &PortalKey::group("300")).await;
    h.matrix.join(&room_id, OWNER);
    assert!(wait_until(|| h.matrix.messages().len() == 1).await);

    h.user
        .handle_event(
            &h.bridge,
            QqEvent::MemberLeft {
                group: "300".to_string(),
                member: SELF_UIN.to_string(),
                operator: Some("30".to_string()),
            },
        )
        .await;

    assert!(
        wait_until(|| h.matrix.messages().iter().any(|e| {
            e.content["body"] == "You are no longer a member of this QQ group"
        }))
        .await
    );
    assert!(
        wait_until(|| h
            .matrix
            .kicks
            .lock()
            .iter()
            .any(|(_, user, _)| user == OWNER))
        .await
    );
    let mut gone = false;
    for _ in 0..100 {
        let stored = h
            .bridge
            .stores
            .portals
            .get_by_key(&PortalKey::group("300"))
            .await
            .expect("lookup");
        if stored.is_none() {
            gone = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(gone, "empty portal should be deleted");
}

#[tokio::test]
async fn status_reports_logged_in_relay_session() {
    let h = harness().await;
    let status = h.bridge.status();
    assert!(status.relay_connected);
    assert_eq!(status.qq_uin.as_deref(), Some(SELF_UIN));

    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Disconnected {
                reason: "relay closed".to_string(),
            },
        )
        .await;
    assert!(!h.bridge.status().relay_connected);
}

/// A reply segment as the relay delivers it: the quoted message id and nothing else.
fn relay_reply(id: &str) -> QqElement {
    QqElement::Reply {
        id: id.to_string(),
        seq: id.to_string(),
        time: 0,
        sender: String::new(),
        group_id: None,
        summary: String::new(),
    }
}

#[tokio::test]
async fn relay_reply_with_only_an_id_threads_to_the_original() {
    let h = harness().await;
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "55", vec![QqElement::text("question")])),
        )
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 1).await);
    let original = h.matrix.messages()[0].event_id.clone();

    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message(
                "20",
                "56",
                vec![relay_reply("55"), QqElement::text("answer")],
            )),
        )
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 2).await);
    let reply = &h.matrix.messages()[1];
    assert_eq!(
        reply.content["m.relates_to"]["m.in_reply_to"]["event_id"],
        json!(original)
    );
    assert_eq!(reply.content["body"], "answer");
}

#[tokio::test]
async fn reply_to_unknown_message_adds_no_empty_mention() {
    let h = harness().await;
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message(
                "20",
                "57",
                vec![relay_reply("404"), QqElement::text("answer")],
            )),
        )
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 1).await);
    let event = &h.matrix.messages()[0];
    assert!(event.content.get("m.relates_to").is_none());
    assert_eq!(event.content["body"], "answer");
}

#[tokio::test]
async fn redelivered_matrix_event_reaches_qq_once() {
    let h = harness().await;
    let chat = PortalKey::private("20", SELF_UIN);
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "1", vec![QqElement::text("hello")])),
        )
        .await;
    let room_id = room_of(&h, &chat).await;

    let event = matrix_event(&room_id, "$same", json!({ "msgtype": "m.text", "body": "once" }));
    h.bridge.handle_matrix_event(event.clone()).await;
    h.bridge.handle_matrix_event(event.clone()).await;
    assert!(wait_until(|| h.qq.sent.lock().len() == 1).await);
    settle().await;
    assert_eq!(h.qq.send_calls.load(Ordering::SeqCst), 1);

    // A restarted bridge only has the message index to go on.
    let restarted = QqBridge::new(
        h.bridge.config.clone(),
        h.bridge.stores.clone(),
        h.matrix.clone(),
        Arc::new(PassthroughCodec),
    )
    .expect("bridge should build");
    let user = restarted.get_user_by_mxid(OWNER).await.expect("owner");
    let client: SharedQqClient = h.qq.clone();
    user.login(&restarted, client, SELF_UIN).await.expect("login");
    restarted.handle_matrix_event(event).await;
    settle().await;
    assert_eq!(h.qq.send_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn qq_message_is_retried_after_failed_matrix_send() {
    let h = harness().await;
    let chat = PortalKey::private("20", SELF_UIN);
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "1", vec![QqElement::text("first")])),
        )
        .await;
    room_of(&h, &chat).await;
    assert!(wait_until(|| h.matrix.messages().len() == 1).await);

    let message = private_message("20", "9", vec![QqElement::text("hello")]);
    h.matrix.fail_next_send.store(true, Ordering::SeqCst);
    h.user
        .handle_event(&h.bridge, QqEvent::Message(message.clone()))
        .await;
    assert!(wait_until(|| !h.matrix.fail_next_send.load(Ordering::SeqCst)).await);
    settle().await;
    assert_eq!(h.matrix.messages().len(), 1);
    let partial = h
        .bridge
        .stores
        .messages
        .get_by_message_key(&chat, &MessageKey::new("9", "9"))
        .await
        .expect("lookup")
        .expect("partial record should be kept");
    assert!(!partial.sent);

    h.user
        .handle_event(&h.bridge, QqEvent::Message(message))
        .await;
    assert!(wait_until(|| h.matrix.messages().len() == 2).await);
    let delivered = h.matrix.messages()[1].clone();
    assert_eq!(delivered.content["body"], "hello");
    let stored = h
        .bridge
        .stores
        .messages
        .get_by_message_key(&chat, &MessageKey::new("9", "9"))
        .await
        .expect("lookup")
        .expect("record");
    assert!(stored.sent);
    assert_eq!(stored.mxid, delivered.event_id);
}

#[tokio::test]
async fn matrix_location_becomes_qq_location_card() {
    let h = harness().await;
    let chat = PortalKey::private("20", SELF_UIN);
    h.user
        .handle_event(
            &h.bridge,
            QqEvent::Message(private_message("20", "1", vec![QqElement::text("where?")])),
        )
        .await;
    let room_id = room_of(&h, &chat).await;

    h.bridge
        .handle_matrix_event(matrix_event(
            &room_id,
            "$here",
            json!({
                "msgtype": "m.location",
                "body": "Tower",
                "geo_uri": "geo:31.2304,121.4737;u=35"
            }),
        ))
        .await;
    assert!(wait_until(|| h.qq.sent.lock().len() == 1).await);
    let sent = h.qq.sent.lock()[0].clone();
    let [QqElement::LightApp { content }] = sent.elements.as_slice() else {
        panic!("expected one location card, got {:?}", sent.elements);
    };
    let card: serde_json::Value = serde_json::from_str(content).expect("card json");
    assert_eq!(card["view"], "LocationShare");
    assert_eq!(card["meta"]["Location.Search"]["lat"], "31.23040");
    assert_eq!(card["meta"]["Location.Search"]["lng"], "121.47370");
}

#[tokio::test]
async fn text_sent_with_a_video_follows_as_its_own_event() {
    let h = harness().await;
    h.qq.attachments
        .lock()
        .insert("http://qq.example/clip".to_string(), b"fake-mp4".to_vec());
    let message = private_message(
        "20",
        "3",
        vec![
            QqElement::Video {
                source: MediaSource::Url("http://qq.example/clip".to_string()),
                name: "clip.mp4".to_string(),
                size: 8,
            },
            QqElement::text("look at this"),
        ],
    );
    h.user.handle_event(&h.bridge, QqEvent::Message(message)).await;

    assert!(wait_until(|| h.matrix.messages().len() == 2).await);
    let events = h.matrix.messages();
    assert_eq!(events[0].content["msgtype"], "m.video");
    assert_eq!(events[1].content["msgtype"], "m.text");
    assert_eq!(events[1].content["body"], "look at this");
}
