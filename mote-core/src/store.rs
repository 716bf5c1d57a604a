//! Key-value configuration seam.
//!
//! The provisioning side writes the gateway address and credentials; the
//! runtime only reads them, apart from the device identity, which is created
//! on first boot and persisted.

use std::collections::HashMap;
use std::fmt::Write as _;

use parking_lot::Mutex;
use rand::RngCore;
use tracing::info;

use crate::error::{MoteError, Result};
use crate::transport::{Endpoint, TlsMode, DEFAULT_PORT};

pub const NS_GATEWAY: &str = "gateway";
pub const NS_DEVICE: &str = "device";

pub const KEY_HOST: &str = "host";
pub const KEY_PORT: &str = "port";
pub const KEY_TOKEN: &str = "token";
pub const KEY_TLS: &str = "tls";
pub const KEY_DEVICE_ID: &str = "id";

/// Namespaced string store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;
    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()>;
}

/// Process-local store for tests and hosts without persistence.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .entries
            .lock()
            .get(&(namespace.to_owned(), key.to_owned()))
            .cloned())
    }

    fn put(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.entries
            .lock()
            .insert((namespace.to_owned(), key.to_owned()), value.to_owned());
        Ok(())
    }
}

/// Read the gateway endpoint, falling back to `fallback` key by key.
///
/// Returns `Ok(None)` when no host is configured anywhere.
pub fn load_endpoint(
    store: &dyn KeyValueStore,
    fallback: Option<&Endpoint>,
) -> Result<Option<Endpoint>> {
    let host = non_empty(store.get(NS_GATEWAY, KEY_HOST)?)
        .or_else(|| fallback.map(|f| f.host.clone()).filter(|h| !h.is_empty()));
    let Some(host) = host else {
        return Ok(None);
    };

    let port = match non_empty(store.get(NS_GATEWAY, KEY_PORT)?) {
        Some(raw) => raw
            .trim()
            .parse::<u16>()
            .map_err(|_| MoteError::Config(format!("invalid gateway port `{raw}`")))?,
        None => fallback.map_or(DEFAULT_PORT, |f| f.port),
    };

    let token = non_empty(store.get(NS_GATEWAY, KEY_TOKEN)?)
        .or_else(|| fallback.map(|f| f.token.clone()))
        .unwrap_or_default();

    let tls = match non_empty(store.get(NS_GATEWAY, KEY_TLS)?) {
        Some(raw) => raw.parse::<TlsMode>()?,
        None => fallback.map_or(TlsMode::Auto, |f| f.tls),
    };

    let mut endpoint = Endpoint::new(host, port, token).with_tls(tls);
    if let Some(f) = fallback {
        endpoint.path = f.path.clone();
    }
    endpoint.validate()?;
    Ok(Some(endpoint))
}

/// The persisted device identity, generated on first use.
pub fn device_id(store: &dyn KeyValueStore) -> Result<String> {
    if let Some(id) = non_empty(store.get(NS_DEVICE, KEY_DEVICE_ID)?) {
        return Ok(id);
    }
    let id = generate_device_id();
    store.put(NS_DEVICE, KEY_DEVICE_ID, &id)?;
    info!(device_id = %id, "generated device id");
    Ok(id)
}

/// Twelve lowercase hex digits, the shape of a colon-less MAC address.
pub fn generate_device_id() -> String {
    let mut bytes = [0u8; 6];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().fold(String::with_capacity(12), |mut s, b| {
        let _ = write!(s, "{b:02x}");
        s
    })
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
