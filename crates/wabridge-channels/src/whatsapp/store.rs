//! SQLx storage backend for `whatsapp-rust`, one per account database.
//!
//! The schema comes from the device migrations in `wabridge-store`, so the
//! reconciler's validation and this backend agree on table names. Most of
//! the protocol state is opaque bytes or JSON documents keyed by a single
//! column; those go through [`Blobs`] and [`Docs`] instead of hand-written
//! statements per trait method.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Sqlite, SqlitePool};
use wabridge_core::BridgeError;
use wabridge_store::device::init_device_store;
use wacore::appstate::hash::HashState;
use wacore::appstate::processor::AppStateMutationMAC;
use wacore::store::error::{db_err, StoreError};
use wacore::store::traits::{
    AppStateSyncKey, AppSyncStore, DeviceListRecord, DeviceStore, LidPnMappingEntry, ProtocolStore,
    SignalStore,
};
use wacore::store::Device;

type Result<T> = wacore::store::error::Result<T>;

fn ser_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Serialization(e.to_string())
}

/// Single-column key of a keyed table.
#[derive(Clone, Copy)]
enum Key<'a> {
    Addr(&'a str),
    Id(u32),
}

/// A `key -> BLOB` table.
struct Blobs {
    table: &'static str,
    key: &'static str,
    value: &'static str,
}

/// A `key -> JSON TEXT` table.
struct Docs {
    table: &'static str,
    key: &'static str,
}

const IDENTITIES: Blobs = Blobs {
    table: "wa_identities",
    key: "address",
    value: "key_data",
};
const SESSIONS: Blobs = Blobs {
    table: "wa_sessions",
    key: "address",
    value: "session_data",
};
const PREKEYS: Blobs = Blobs {
    table: "wa_prekeys",
    key: "id",
    value: "record",
};
const SIGNED_PREKEYS: Blobs = Blobs {
    table: "wa_signed_prekeys",
    key: "id",
    value: "record",
};
const SENDER_KEYS: Blobs = Blobs {
    table: "wa_sender_keys",
    key: "address",
    value: "record",
};
const APP_VERSIONS: Docs = Docs {
    table: "wa_app_versions",
    key: "collection",
};
const DEVICE_LISTS: Docs = Docs {
    table: "wa_device_lists",
    key: "user",
};

/// Where the account's own device row lives. Keys minted before pairing
/// stay pending; a row with a phone identity is what marks the file paired.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Paired,
    Pending,
}

impl Slot {
    /// Lookup order for [`DeviceStore::load`].
    const ALL: [Slot; 2] = [Slot::Paired, Slot::Pending];

    fn of(device: &Device) -> Self {
        if device.pn.is_some() {
            Slot::Paired
        } else {
            Slot::Pending
        }
    }

    fn table(self) -> &'static str {
        match self {
            Slot::Paired => "wa_device_info",
            Slot::Pending => "wa_device_pending",
        }
    }
}

/// Account device store.
pub struct AccountStore {
    pool: SqlitePool,
    identity: Arc<AtomicBool>,
}

impl AccountStore {
    /// Open (creating if needed) the store at `path`.
    pub async fn open(path: &Path) -> std::result::Result<Self, BridgeError> {
        let pool = init_device_store(path).await?;
        let store = Self {
            pool,
            identity: Arc::new(AtomicBool::new(false)),
        };
        let paired = store
            .has_row(Slot::Paired)
            .await
            .map_err(|e| BridgeError::Db(format!("device store {}: {e}", path.display())))?;
        store.identity.store(paired, Ordering::SeqCst);
        Ok(store)
    }

    /// Flag flipped once a paired device row is written.
    pub fn identity_flag(&self) -> Arc<AtomicBool> {
        self.identity.clone()
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn blob(&self, t: &Blobs, key: Key<'_>) -> Result<Option<Vec<u8>>> {
        let sql = format!("SELECT {} FROM {} WHERE {} = ?", t.value, t.table, t.key);
        let query = sqlx::query_as::<Sqlite, (Vec<u8>,)>(&sql);
        let query = match key {
            Key::Addr(a) => query.bind(a),
            Key::Id(id) => query.bind(i64::from(id)),
        };
        let row = query.fetch_optional(&self.pool).await.map_err(db_err)?;
        Ok(row.map(|(bytes,)| bytes))
    }

    async fn put_blob(&self, t: &Blobs, key: Key<'_>, value: &[u8]) -> Result<()> {
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}, {}) VALUES (?, ?)",
            t.table, t.key, t.value
        );
        let query = sqlx::query::<Sqlite>(&sql);
        let query = match key {
            Key::Addr(a) => query.bind(a),
            Key::Id(id) => query.bind(i64::from(id)),
        };
        query
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn drop_blob(&self, t: &Blobs, key: Key<'_>) -> Result<()> {
        let sql = format!("DELETE FROM {} WHERE {} = ?", t.table, t.key);
        let query = sqlx::query::<Sqlite>(&sql);
        let query = match key {
            Key::Addr(a) => query.bind(a),
            Key::Id(id) => query.bind(i64::from(id)),
        };
        query.execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }

    async fn doc<T: DeserializeOwned>(&self, t: &Docs, key: &str) -> Result<Option<T>> {
        let sql = format!("SELECT data FROM {} WHERE {} = ?", t.table, t.key);
        let row: Option<(String,)> = sqlx::query_as(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|(data,)| serde_json::from_str(&data).map_err(ser_err))
            .transpose()
    }

    async fn put_doc<T: Serialize>(&self, t: &Docs, key: &str, value: &T) -> Result<()> {
        let data = serde_json::to_string(value).map_err(ser_err)?;
        let sql = format!(
            "INSERT OR REPLACE INTO {} ({}, data) VALUES (?, ?)",
            t.table, t.key
        );
        sqlx::query(&sql)
            .bind(key)
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn has_row(&self, slot: Slot) -> Result<bool> {
        let sql = format!("SELECT 1 FROM {} LIMIT 1", slot.table());
        let row: Option<(i64,)> = sqlx::query_as(&sql)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.is_some())
    }
}

#[async_trait]
impl SignalStore for AccountStore {
    async fn put_identity(&self, address: &str, key: [u8; 32]) -> Result<()> {
        self.put_blob(&IDENTITIES, Key::Addr(address), &key).await
    }

    async fn load_identity(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.blob(&IDENTITIES, Key::Addr(address)).await
    }

    async fn delete_identity(&self, address: &str) -> Result<()> {
        self.drop_blob(&IDENTITIES, Key::Addr(address)).await
    }

    async fn get_session(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.blob(&SESSIONS, Key::Addr(address)).await
    }

    async fn put_session(&self, address: &str, session: &[u8]) -> Result<()> {
        self.put_blob(&SESSIONS, Key::Addr(address), session).await
    }

    async fn delete_session(&self, address: &str) -> Result<()> {
        self.drop_blob(&SESSIONS, Key::Addr(address)).await
    }

    async fn store_prekey(&self, id: u32, record: &[u8], uploaded: bool) -> Result<()> {
        // The upload marker is the one extra column among the blob tables.
        sqlx::query("INSERT OR REPLACE INTO wa_prekeys (id, record, uploaded) VALUES (?, ?, ?)")
            .bind(i64::from(id))
            .bind(record)
            .bind(uploaded)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn load_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.blob(&PREKEYS, Key::Id(id)).await
    }

    async fn remove_prekey(&self, id: u32) -> Result<()> {
        self.drop_blob(&PREKEYS, Key::Id(id)).await
    }

    async fn store_signed_prekey(&self, id: u32, record: &[u8]) -> Result<()> {
        self.put_blob(&SIGNED_PREKEYS, Key::Id(id), record).await
    }

    async fn load_signed_prekey(&self, id: u32) -> Result<Option<Vec<u8>>> {
        self.blob(&SIGNED_PREKEYS, Key::Id(id)).await
    }

    async fn load_all_signed_prekeys(&self) -> Result<Vec<(u32, Vec<u8>)>> {
        let rows: Vec<(i64, Vec<u8>)> = sqlx::query_as("SELECT id, record FROM wa_signed_prekeys")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|(id, record)| Ok((u32::try_from(id).map_err(ser_err)?, record)))
            .collect()
    }

    async fn remove_signed_prekey(&self, id: u32) -> Result<()> {
        self.drop_blob(&SIGNED_PREKEYS, Key::Id(id)).await
    }

    async fn put_sender_key(&self, address: &str, record: &[u8]) -> Result<()> {
        self.put_blob(&SENDER_KEYS, Key::Addr(address), record).await
    }

    async fn get_sender_key(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.blob(&SENDER_KEYS, Key::Addr(address)).await
    }

    async fn delete_sender_key(&self, address: &str) -> Result<()> {
        self.drop_blob(&SENDER_KEYS, Key::Addr(address)).await
    }
}

#[async_trait]
impl AppSyncStore for AccountStore {
    async fn get_sync_key(&self, key_id: &[u8]) -> Result<Option<AppStateSyncKey>> {
        let row: Option<(Vec<u8>, i64, Option<Vec<u8>>)> = sqlx::query_as(
            "SELECT key_data, timestamp, fingerprint FROM wa_app_sync_keys WHERE key_id = ?",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(key_data, timestamp, fingerprint)| AppStateSyncKey {
            key_data,
            timestamp,
            fingerprint: fingerprint.unwrap_or_default(),
        }))
    }

    async fn set_sync_key(&self, key_id: &[u8], key: AppStateSyncKey) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_app_sync_keys (key_id, key_data, timestamp, fingerprint) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(key_id)
        .bind(&key.key_data)
        .bind(key.timestamp)
        .bind(&key.fingerprint)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_version(&self, name: &str) -> Result<HashState> {
        Ok(self.doc(&APP_VERSIONS, name).await?.unwrap_or_default())
    }

    async fn set_version(&self, name: &str, state: HashState) -> Result<()> {
        self.put_doc(&APP_VERSIONS, name, &state).await
    }

    async fn put_mutation_macs(
        &self,
        name: &str,
        version: u64,
        mutations: &[AppStateMutationMAC],
    ) -> Result<()> {
        let version = i64::try_from(version).map_err(ser_err)?;
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for mac in mutations {
            sqlx::query(
                "INSERT OR REPLACE INTO wa_mutation_macs \
                 (collection, index_mac, version, value_mac) VALUES (?, ?, ?, ?)",
            )
            .bind(name)
            .bind(&mac.index_mac)
            .bind(version)
            .bind(&mac.value_mac)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn get_mutation_mac(&self, name: &str, index_mac: &[u8]) -> Result<Option<Vec<u8>>> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT value_mac FROM wa_mutation_macs WHERE collection = ? AND index_mac = ?",
        )
        .bind(name)
        .bind(index_mac)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.map(|(mac,)| mac))
    }

    async fn delete_mutation_macs(&self, name: &str, index_macs: &[Vec<u8>]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for index_mac in index_macs {
            sqlx::query("DELETE FROM wa_mutation_macs WHERE collection = ? AND index_mac = ?")
                .bind(name)
                .bind(index_mac)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }
}

const LID_SELECT: &str =
    "SELECT lid, phone_number, created_at, updated_at, learning_source FROM wa_lid_mappings";

type LidRow = (String, String, i64, i64, String);

fn lid_entry(row: LidRow) -> LidPnMappingEntry {
    let (lid, phone_number, created_at, updated_at, learning_source) = row;
    LidPnMappingEntry {
        lid,
        phone_number,
        created_at,
        updated_at,
        learning_source,
    }
}

#[async_trait]
impl ProtocolStore for AccountStore {
    async fn get_skdm_recipients(&self, group_jid: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT device_jid FROM wa_skdm_recipients WHERE group_jid = ?")
                .bind(group_jid)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(rows.into_iter().map(|(jid,)| jid).collect())
    }

    async fn add_skdm_recipients(&self, group_jid: &str, device_jids: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for device in device_jids {
            sqlx::query(
                "INSERT OR IGNORE INTO wa_skdm_recipients (group_jid, device_jid) VALUES (?, ?)",
            )
            .bind(group_jid)
            .bind(device)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)
    }

    async fn clear_skdm_recipients(&self, group_jid: &str) -> Result<()> {
        sqlx::query("DELETE FROM wa_skdm_recipients WHERE group_jid = ?")
            .bind(group_jid)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_lid_mapping(&self, lid: &str) -> Result<Option<LidPnMappingEntry>> {
        let row: Option<LidRow> = sqlx::query_as(&format!("{LID_SELECT} WHERE lid = ?"))
            .bind(lid)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(lid_entry))
    }

    async fn get_pn_mapping(&self, phone: &str) -> Result<Option<LidPnMappingEntry>> {
        // A number can map to several LIDs over time; the newest wins.
        let sql = format!("{LID_SELECT} WHERE phone_number = ? ORDER BY updated_at DESC LIMIT 1");
        let row: Option<LidRow> = sqlx::query_as(&sql)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row.map(lid_entry))
    }

    async fn put_lid_mapping(&self, entry: &LidPnMappingEntry) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_lid_mappings \
             (lid, phone_number, created_at, updated_at, learning_source) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&entry.lid)
        .bind(&entry.phone_number)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .bind(&entry.learning_source)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_all_lid_mappings(&self) -> Result<Vec<LidPnMappingEntry>> {
        let rows: Vec<LidRow> = sqlx::query_as(LID_SELECT)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(rows.into_iter().map(lid_entry).collect())
    }

    async fn save_base_key(&self, address: &str, message_id: &str, base_key: &[u8]) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO wa_base_keys (address, message_id, base_key) VALUES (?, ?, ?)",
        )
        .bind(address)
        .bind(message_id)
        .bind(base_key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn has_same_base_key(
        &self,
        address: &str,
        message_id: &str,
        current_base_key: &[u8],
    ) -> Result<bool> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as(
            "SELECT base_key FROM wa_base_keys WHERE address = ? AND message_id = ?",
        )
        .bind(address)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(matches!(row, Some((stored,)) if stored == current_base_key))
    }

    async fn delete_base_key(&self, address: &str, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM wa_base_keys WHERE address = ? AND message_id = ?")
            .bind(address)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_device_list(&self, record: DeviceListRecord) -> Result<()> {
        self.put_doc(&DEVICE_LISTS, &record.user, &record).await
    }

    async fn get_devices(&self, user: &str) -> Result<Option<DeviceListRecord>> {
        self.doc(&DEVICE_LISTS, user).await
    }

    async fn mark_forget_sender_key(&self, group_jid: &str, participant: &str) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO wa_forget_sender_keys (group_jid, participant) VALUES (?, ?)",
        )
        .bind(group_jid)
        .bind(participant)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn consume_forget_marks(&self, group_jid: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let marks: Vec<(String,)> =
            sqlx::query_as("SELECT participant FROM wa_forget_sender_keys WHERE group_jid = ?")
                .bind(group_jid)
                .fetch_all(&mut *tx)
                .await
                .map_err(db_err)?;
        sqlx::query("DELETE FROM wa_forget_sender_keys WHERE group_jid = ?")
            .bind(group_jid)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(marks.into_iter().map(|(participant,)| participant).collect())
    }
}

#[async_trait]
impl DeviceStore for AccountStore {
    async fn save(&self, device: &Device) -> Result<()> {
        // Key pairs need a binary serde format.
        let data = bincode::serialize(device).map_err(ser_err)?;
        let slot = Slot::of(device);

        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (id, data) VALUES (1, ?)",
            slot.table()
        ))
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if slot == Slot::Paired {
            sqlx::query(&format!("DELETE FROM {}", Slot::Pending.table()))
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;

        if slot == Slot::Paired {
            self.identity.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn load(&self) -> Result<Option<Device>> {
        for slot in Slot::ALL {
            let sql = format!("SELECT data FROM {} WHERE id = 1", slot.table());
            let row: Option<(Vec<u8>,)> = sqlx::query_as(&sql)
                .fetch_optional(&self.pool)
                .await
                .map_err(db_err)?;
            if let Some((data,)) = row {
                return bincode::deserialize(&data).map(Some).map_err(ser_err);
            }
        }
        Ok(None)
    }

    async fn exists(&self) -> Result<bool> {
        for slot in Slot::ALL {
            if self.has_row(slot).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn create(&self) -> Result<i32> {
        // One device per file; its data arrives through `save`.
        Ok(1)
    }
}
