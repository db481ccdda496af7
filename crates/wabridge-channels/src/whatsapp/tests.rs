use super::*;
use wabridge_store::device;
use waproto::whatsapp::{message, Message};

#[test]
fn test_message_text_plain_and_extended() {
    let plain = Message {
        conversation: Some("  hi there ".into()),
        ..Default::default()
    };
    assert_eq!(message_text(&plain).as_deref(), Some("hi there"));

    let extended = Message {
        extended_text_message: Some(Box::new(message::ExtendedTextMessage {
            text: Some("with link".into()),
            ..Default::default()
        })),
        ..Default::default()
    };
    assert_eq!(message_text(&extended).as_deref(), Some("with link"));
}

#[test]
fn test_message_text_unwraps_ephemeral() {
    let inner = Message {
        conversation: Some("secret".into()),
        ..Default::default()
    };
    let wrapped = Message {
        ephemeral_message: Some(Box::new(message::FutureProofMessage {
            message: Some(Box::new(inner)),
        })),
        ..Default::default()
    };
    assert_eq!(message_text(&wrapped).as_deref(), Some("secret"));
}

#[test]
fn test_message_text_empty_is_none() {
    assert!(message_text(&Message::default()).is_none());
    let blank = Message {
        conversation: Some("   ".into()),
        ..Default::default()
    };
    assert!(message_text(&blank).is_none());
}

#[test]
fn test_parse_jid_accepts_phone_and_full_jid() {
    let user = groups::parse_jid("+6281234").unwrap();
    assert_eq!(user.to_string(), "6281234@s.whatsapp.net");
    let group = groups::parse_jid("120363@g.us").unwrap();
    assert_eq!(group.to_string(), "120363@g.us");
}

#[tokio::test]
async fn test_store_identity_flag_follows_device_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("whatsmeow-1-62.db");

    let fresh = AccountStore::open(&path).await.unwrap();
    assert!(!fresh.identity_flag().load(Ordering::SeqCst));
    fresh.close().await;

    let pool = device::init_device_store(&path).await.unwrap();
    device::write_identity_row(&pool, b"paired").await.unwrap();
    pool.close().await;

    let paired = AccountStore::open(&path).await.unwrap();
    assert!(paired.identity_flag().load(Ordering::SeqCst));
    paired.close().await;
}

#[tokio::test]
async fn test_store_keyed_tables_replace_and_delete() {
    use wacore::store::traits::{DeviceStore, ProtocolStore, SignalStore};

    let dir = tempfile::tempdir().unwrap();
    let store = AccountStore::open(&dir.path().join("whatsmeow-2-62.db"))
        .await
        .unwrap();

    store.put_session("62812@s.whatsapp.net", b"one").await.unwrap();
    store.put_session("62812@s.whatsapp.net", b"two").await.unwrap();
    assert_eq!(
        store.get_session("62812@s.whatsapp.net").await.unwrap(),
        Some(b"two".to_vec())
    );
    store.delete_session("62812@s.whatsapp.net").await.unwrap();
    assert!(store.get_session("62812@s.whatsapp.net").await.unwrap().is_none());

    store.store_signed_prekey(7, b"signed").await.unwrap();
    store.store_prekey(7, b"plain", true).await.unwrap();
    assert_eq!(
        store.load_all_signed_prekeys().await.unwrap(),
        vec![(7, b"signed".to_vec())]
    );
    assert_eq!(store.load_prekey(7).await.unwrap(), Some(b"plain".to_vec()));
    store.remove_prekey(7).await.unwrap();
    assert!(store.load_prekey(7).await.unwrap().is_none());

    assert!(store.get_devices("62812").await.unwrap().is_none());
    assert!(!store.exists().await.unwrap());
    assert!(store.load().await.unwrap().is_none());
    store.close().await;
}

#[tokio::test]
async fn test_factory_creates_disconnected_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("whatsapp.db");
    let (tx, _rx) = mpsc::unbounded_channel();
    let client = WebClientFactory.create(&path, tx).await.unwrap();
    assert!(!client.is_connected());
    assert!(!client.has_identity());
    let err = client.joined_groups().await.unwrap_err();
    assert!(matches!(err, BridgeError::Connect(_)));
    assert!(device::validate_device_store(&path).await == device::DeviceValidation::EmptyDeviceTable);
}
