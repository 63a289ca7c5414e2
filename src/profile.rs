use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Mutex, PoisonError, RwLock},
};

/// Phone model and the firmware pair a profile was discovered for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct ProfileKey {
    pub platform_id: String,
    pub current_firmware: String,
    pub target_firmware: String,
}

impl ProfileKey {
    pub fn new(
        platform_id: impl Into<String>,
        current_firmware: impl Into<String>,
        target_firmware: impl Into<String>,
    ) -> Self {
        Self {
            platform_id: platform_id.into(),
            current_firmware: current_firmware.into(),
            target_firmware: target_firmware.into(),
        }
    }
}

impl std::fmt::Display for ProfileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({} -> {})",
            self.platform_id, self.current_firmware, self.target_firmware
        )
    }
}

/// Exploit parameters that worked for a [`ProfileKey`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FlashProfile {
    /// Bytes the undersized header declares, padding the heap ahead of the crafted header
    pub fill_size: u32,
    /// Size of the allocation the crafted header upload occupies
    pub header_size: u32,
    pub assume_image_header_falls_in_gap: bool,
    pub allocate_async_buffers_on_phone: bool,
    #[serde(default)]
    pub allocate_backup_buffers_on_phone: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Failed to access profile store '{0}': {1}")]
    Io(PathBuf, std::io::Error),
    #[error("Profile store '{0}' is malformed: {1}")]
    Format(PathBuf, serde_json::Error),
}

/// Durable backing for a [`ProfileCache`].
pub trait ProfileStore {
    fn load(&self) -> Result<HashMap<ProfileKey, FlashProfile>, ProfileError>;
    fn save(&self, profiles: &HashMap<ProfileKey, FlashProfile>) -> Result<(), ProfileError>;
}

#[derive(serde::Serialize, serde::Deserialize)]
struct StoredProfile {
    #[serde(flatten)]
    key: ProfileKey,
    #[serde(flatten)]
    profile: FlashProfile,
}

/// Profiles kept as a JSON array in a single file.
pub struct JsonProfileStore {
    path: PathBuf,
}

impl JsonProfileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ProfileStore for JsonProfileStore {
    fn load(&self) -> Result<HashMap<ProfileKey, FlashProfile>, ProfileError> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(why) if why.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(why) => return Err(ProfileError::Io(self.path.clone(), why)),
        };

        let stored: Vec<StoredProfile> = serde_json::from_slice(&data)
            .map_err(|why| ProfileError::Format(self.path.clone(), why))?;

        Ok(stored
            .into_iter()
            .map(|stored| (stored.key, stored.profile))
            .collect())
    }

    fn save(&self, profiles: &HashMap<ProfileKey, FlashProfile>) -> Result<(), ProfileError> {
        let mut stored = profiles
            .iter()
            .map(|(key, profile)| StoredProfile {
                key: key.clone(),
                profile: *profile,
            })
            .collect::<Vec<_>>();
        stored.sort_by(|a, b| a.key.cmp(&b.key));

        let data = serde_json::to_vec_pretty(&stored)
            .map_err(|why| ProfileError::Format(self.path.clone(), why))?;

        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|why| ProfileError::Io(self.path.clone(), why))?;
        }

        std::fs::write(&self.path, data).map_err(|why| ProfileError::Io(self.path.clone(), why))
    }
}

/// Shared between every flashing operation in the process.
#[derive(Default)]
pub struct ProfileCache {
    profiles: RwLock<HashMap<ProfileKey, FlashProfile>>,
    store: Option<Box<dyn ProfileStore + Send + Sync>>,
    /// Held across a save so snapshots reach the store in write order.
    saving: Mutex<()>,
}

impl ProfileCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn open(store: impl ProfileStore + Send + Sync + 'static) -> Result<Self, ProfileError> {
        let profiles = store.load()?;
        tracing::debug!("Loaded {} flashing profiles", profiles.len());

        Ok(Self {
            profiles: RwLock::new(profiles),
            store: Some(Box::new(store)),
            saving: Mutex::new(()),
        })
    }

    pub fn get(&self, key: &ProfileKey) -> Option<FlashProfile> {
        self.profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    /// Upserts `profile`. A failure to persist is logged, the in-memory entry
    /// is kept either way. Readers are not held up while the store saves.
    pub fn set(&self, key: ProfileKey, profile: FlashProfile) {
        let _saving = self.saving.lock().unwrap_or_else(PoisonError::into_inner);

        tracing::info!("Storing flashing profile for {key}: {profile:?}");
        let snapshot = {
            let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
            profiles.insert(key, profile);
            profiles.clone()
        };

        self.persist(&snapshot);
    }

    pub fn remove(&self, key: &ProfileKey) -> Option<FlashProfile> {
        let _saving = self.saving.lock().unwrap_or_else(PoisonError::into_inner);

        let (removed, snapshot) = {
            let mut profiles = self.profiles.write().unwrap_or_else(PoisonError::into_inner);
            let removed = profiles.remove(key);
            (removed, profiles.clone())
        };

        if removed.is_some() {
            self.persist(&snapshot);
        }

        removed
    }

    pub fn list(&self) -> Vec<(ProfileKey, FlashProfile)> {
        let mut profiles = self
            .profiles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, profile)| (key.clone(), *profile))
            .collect::<Vec<_>>();
        profiles.sort_by(|a, b| a.0.cmp(&b.0));
        profiles
    }

    fn persist(&self, profiles: &HashMap<ProfileKey, FlashProfile>) {
        let Some(store) = &self.store else {
            return;
        };

        if let Err(why) = store.save(profiles) {
            tracing::warn!("Failed to persist flashing profiles: {why}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, mpsc};

    use super::*;

    fn profile(fill_size: u32) -> FlashProfile {
        FlashProfile {
            fill_size,
            header_size: 0x2_0000,
            assume_image_header_falls_in_gap: true,
            allocate_async_buffers_on_phone: false,
            allocate_backup_buffers_on_phone: false,
        }
    }

    #[test]
    fn set_overwrites_only_its_key() {
        let cache = ProfileCache::in_memory();
        let lumia_950 =
            ProfileKey::new("Microsoft.MSM8992.P6211.1.2", "01078.00053", "01078.00053");
        let lumia_640 = ProfileKey::new("Microsoft.MSM8x26.C800.1.0", "02540.00019", "02540.00019");

        cache.set(lumia_950.clone(), profile(0x1000));
        cache.set(lumia_640.clone(), profile(0x2000));
        cache.set(lumia_950.clone(), profile(0x3000));

        assert_eq!(cache.get(&lumia_950).map(|p| p.fill_size), Some(0x3000));
        assert_eq!(cache.get(&lumia_640).map(|p| p.fill_size), Some(0x2000));
        assert_eq!(cache.list().len(), 2);
    }

    #[test]
    fn concurrent_readers_see_a_whole_profile() {
        let cache = Arc::new(ProfileCache::in_memory());
        let key = ProfileKey::new("platform", "a", "b");
        cache.set(key.clone(), profile(0x1000));

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let cache = &cache;
                let key = &key;
                scope.spawn(move || {
                    for _ in 0..1000 {
                        let found = cache.get(key).unwrap();
                        assert_eq!(found.header_size, 0x2_0000);
                    }
                });
            }

            for fill_size in (0x1000..0x20000).step_by(0x1000) {
                cache.set(key.clone(), profile(fill_size));
            }
        });

        assert_eq!(cache.get(&key).unwrap().fill_size, 0x1F000);
    }

    /// Parks every save until the test lets it go.
    struct ParkedStore {
        entered: mpsc::SyncSender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl ProfileStore for ParkedStore {
        fn load(&self) -> Result<HashMap<ProfileKey, FlashProfile>, ProfileError> {
            Ok(HashMap::new())
        }

        fn save(&self, _profiles: &HashMap<ProfileKey, FlashProfile>) -> Result<(), ProfileError> {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(())
        }
    }

    #[test]
    fn readers_are_not_blocked_by_a_save() {
        let (entered_sender, entered) = mpsc::sync_channel(0);
        let (release, release_receiver) = mpsc::channel();
        let cache = ProfileCache::open(ParkedStore {
            entered: entered_sender,
            release: Mutex::new(release_receiver),
        })
        .unwrap();
        let key = ProfileKey::new("platform", "a", "b");

        std::thread::scope(|scope| {
            scope.spawn(|| cache.set(key.clone(), profile(0x4000)));

            entered.recv().unwrap();
            assert_eq!(cache.get(&key), Some(profile(0x4000)));
            assert_eq!(cache.list().len(), 1);
            release.send(()).unwrap();
        });
    }

    #[test]
    fn json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles").join("flash.json");
        let key = ProfileKey::new("platform", "current", "target");

        {
            let cache = ProfileCache::open(JsonProfileStore::new(&path)).unwrap();
            assert!(cache.get(&key).is_none());
            cache.set(key.clone(), profile(0x5000));
        }

        let reopened = ProfileCache::open(JsonProfileStore::new(&path)).unwrap();
        assert_eq!(reopened.get(&key), Some(profile(0x5000)));
    }

    #[test]
    fn missing_backup_flag_defaults_to_false() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flash.json");
        std::fs::write(
            &path,
            r#"[{"platform_id":"p","current_firmware":"c","target_firmware":"t",
                "fill_size":4096,"header_size":8192,
                "assume_image_header_falls_in_gap":false,
                "allocate_async_buffers_on_phone":true}]"#,
        )
        .unwrap();

        let cache = ProfileCache::open(JsonProfileStore::new(&path)).unwrap();
        let found = cache.get(&ProfileKey::new("p", "c", "t")).unwrap();
        assert!(found.allocate_async_buffers_on_phone);
        assert!(!found.allocate_backup_buffers_on_phone);
    }
}
