//! Pinned kernel maps opened through `aya`.
//!
//! A probe loader pins its query map under bpffs; the control plane opens
//! the pin and garbage-collects it with [`crate::gc::GarbageCollector`].

use std::fmt;
use std::io;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use aya::Pod;
use aya::maps::{HashMap, Map, MapData, MapError as AyaMapError};

use gadget_common::error::{GadgetError, Result};

use crate::map::{KernelMap, MapError, MapScan};

/// Key of the DNS query map: one outstanding query per mount namespace and
/// transaction ID.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DnsQueryKey {
    /// Mount namespace inode of the querying process.
    pub mount_ns_id: u64,
    /// DNS header ID.
    pub id: u16,
    pad: [u8; 6],
}

impl DnsQueryKey {
    /// Creates a key with zeroed padding.
    #[must_use]
    pub const fn new(mount_ns_id: u64, id: u16) -> Self {
        Self {
            mount_ns_id,
            id,
            pad: [0; 6],
        }
    }
}

// SAFETY: `#[repr(C)]` with explicit padding, so every byte is initialized
// and any bit pattern is a valid value.
#[allow(unsafe_code)]
unsafe impl Pod for DnsQueryKey {}

/// A pinned `BPF_MAP_TYPE_HASH` whose values are creation timestamps.
pub struct BpfQueryMap<K: Pod> {
    name: String,
    map: Mutex<HashMap<MapData, K, u64>>,
}

impl<K: Pod> BpfQueryMap<K> {
    /// Opens the map pinned at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pin does not exist or is not a hash map with
    /// the expected key and value sizes.
    pub fn from_pin(path: &Path) -> Result<Self> {
        let data = MapData::from_pin(path).map_err(|e| GadgetError::Io {
            path: path.to_path_buf(),
            source: io::Error::other(e.to_string()),
        })?;
        let map = Map::from_map_data(data).map_err(|e| invalid_map(path, &e))?;
        let map = HashMap::<MapData, K, u64>::try_from(map).map_err(|e| invalid_map(path, &e))?;

        let name = path
            .file_name()
            .map_or_else(|| path.display().to_string(), |n| n.to_string_lossy().into_owned());
        tracing::info!(map = %name, path = %path.display(), "opened pinned query map");

        Ok(Self {
            name,
            map: Mutex::new(map),
        })
    }
}

fn invalid_map(path: &Path, e: &AyaMapError) -> GadgetError {
    GadgetError::Config {
        message: format!("{} is not a usable query map: {e}", path.display()),
    }
}

fn is_not_found(e: &AyaMapError) -> bool {
    match e {
        AyaMapError::KeyNotFound => true,
        AyaMapError::SyscallError(err) => err.io_error.kind() == io::ErrorKind::NotFound,
        _ => false,
    }
}

impl<K: Pod + fmt::Debug + Send> KernelMap for BpfQueryMap<K> {
    type Key = K;

    fn scan(&self) -> MapScan<K> {
        let map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = Vec::new();
        for item in map.iter() {
            match item {
                Ok(entry) => entries.push(entry),
                Err(e) if is_not_found(&e) => {
                    return MapScan::partial(entries, MapError::IterationAborted(e.to_string()));
                }
                Err(e) => return MapScan::partial(entries, MapError::Other(e.to_string())),
            }
        }
        MapScan::complete(entries)
    }

    fn delete(&self, key: &K) -> std::result::Result<(), MapError> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        match map.remove(key) {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Err(MapError::KeyNotFound),
            Err(e) => Err(MapError::Other(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
