use log::{info, warn};

use crate::config::NodeConfig;
use crate::error::NodeError;
use crate::ports::{ConfigBackend, StorageError};
use crate::types::{BrokerIdentity, NetworkCredentials};

/// Runtime overrides layered over the stored document.
pub type Overlay = Box<dyn Fn(&mut NodeConfig)>;

/// Single owner of the persisted credentials and broker identity.
///
/// `stored` mirrors what is on the backend; `effective` is `stored` with the
/// overlay applied and is what the rest of the node sees.
pub struct ConfigStore {
    backend: Box<dyn ConfigBackend>,
    stored: NodeConfig,
    effective: NodeConfig,
    overlay: Option<Overlay>,
    credentials_changed: bool,
}

impl ConfigStore {
    /// Loads the document, falling back to defaults (and rewriting storage)
    /// when it is unreadable, unparseable, or missing critical fields.
    pub fn load(mut backend: Box<dyn ConfigBackend>) -> Self {
        let loaded = match backend.read() {
            Ok(Some(bytes)) => match serde_json::from_slice::<NodeConfig>(&bytes) {
                Ok(config) if config.has_critical_fields() => Some(config),
                Ok(_) => {
                    warn!("config is missing broker host or edge id, using defaults");
                    None
                }
                Err(err) => {
                    NodeError::ConfigReadFailed(err.to_string()).report();
                    None
                }
            },
            Ok(None) => {
                info!("no stored config, using defaults");
                None
            }
            Err(err) => {
                NodeError::ConfigReadFailed(err.to_string()).report();
                None
            }
        };

        let mut store = Self {
            backend,
            stored: NodeConfig::default(),
            effective: NodeConfig::default(),
            overlay: None,
            credentials_changed: false,
        };

        match loaded {
            Some(mut config) => {
                config.sanitize();
                store.stored = config.clone();
                store.effective = config;
            }
            None => {
                if let Err(err) = store.write(&NodeConfig::default()) {
                    warn!("failed to rewrite default config: {err}");
                }
            }
        }
        store
    }

    pub fn config(&self) -> &NodeConfig {
        &self.effective
    }

    pub fn credentials(&self) -> NetworkCredentials {
        self.effective.credentials()
    }

    pub fn broker_identity(&self) -> BrokerIdentity {
        self.effective.broker_identity()
    }

    pub fn submit_credentials(&mut self, credentials: &NetworkCredentials) -> Result<(), NodeError> {
        self.submit_provisioning(credentials, None)
    }

    /// Stores new credentials and, when given, a new broker identity in a
    /// single write. Nothing changes unless the write succeeds. A new
    /// identity takes effect on the next broker connection attempt.
    pub fn submit_provisioning(
        &mut self,
        credentials: &NetworkCredentials,
        identity: Option<&BrokerIdentity>,
    ) -> Result<(), NodeError> {
        let mut next = self.stored.clone();
        next.set_credentials(credentials);
        if let Some(identity) = identity {
            next.set_broker_identity(identity);
        }
        next.sanitize();
        self.commit(next)?;
        self.credentials_changed = true;

        info!("stored credentials for ssid '{}'", credentials.ssid);
        if let Some(identity) = identity {
            info!(
                "stored broker identity {}:{} as '{}'",
                identity.host, identity.port, identity.client_id
            );
        }
        Ok(())
    }

    pub fn factory_reset(&mut self) -> Result<(), NodeError> {
        self.commit(NodeConfig::default())?;
        self.credentials_changed = true;
        info!("config reset to defaults");
        Ok(())
    }

    /// Returns and clears the flag set by a successful credential change.
    pub fn take_credentials_changed(&mut self) -> bool {
        std::mem::take(&mut self.credentials_changed)
    }

    /// Installs runtime overrides. They shape every view of the config but
    /// are never written to storage, and they are reapplied after each commit.
    pub fn overlay(&mut self, apply: impl Fn(&mut NodeConfig) + 'static) {
        self.overlay = Some(Box::new(apply));
        self.refresh();
    }

    fn refresh(&mut self) {
        let mut effective = self.stored.clone();
        if let Some(apply) = &self.overlay {
            apply(&mut effective);
            effective.sanitize();
        }
        self.effective = effective;
    }

    fn commit(&mut self, next: NodeConfig) -> Result<(), NodeError> {
        self.write(&next)?;
        self.stored = next;
        self.refresh();
        Ok(())
    }

    fn write(&mut self, config: &NodeConfig) -> Result<(), NodeError> {
        let bytes = serde_json::to_vec_pretty(config)
            .map_err(|err| NodeError::ConfigWriteFailed(err.to_string()))?;
        self.backend.write(&bytes)?;
        Ok(())
    }
}

/// Volatile backend used when no persistent storage is available.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    pub contents: Option<Vec<u8>>,
    pub fail_writes: bool,
}

impl ConfigBackend for MemoryBackend {
    fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.contents.clone())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io("write rejected".to_string()));
        }
        self.contents = Some(bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Clone, Default)]
    struct SharedBackend(Arc<Mutex<MemoryBackend>>);

    impl ConfigBackend for SharedBackend {
        fn read(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
            self.0.lock().unwrap().read()
        }

        fn write(&mut self, bytes: &[u8]) -> Result<(), StorageError> {
            self.0.lock().unwrap().write(bytes)
        }
    }

    fn stored(backend: &SharedBackend) -> NodeConfig {
        let inner = backend.0.lock().unwrap();
        serde_json::from_slice(inner.contents.as_ref().unwrap()).unwrap()
    }

    #[test]
    fn empty_storage_loads_defaults_and_rewrites() {
        let backend = SharedBackend::default();
        let store = ConfigStore::load(Box::new(backend.clone()));

        assert_eq!(store.config(), &NodeConfig::default());
        assert_eq!(stored(&backend), NodeConfig::default());
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let backend = SharedBackend::default();
        backend.0.lock().unwrap().contents = Some(b"{not json".to_vec());

        let store = ConfigStore::load(Box::new(backend.clone()));

        assert_eq!(store.config(), &NodeConfig::default());
        assert_eq!(stored(&backend), NodeConfig::default());
    }

    #[test]
    fn missing_edge_id_falls_back_to_defaults() {
        let backend = SharedBackend::default();
        backend.0.lock().unwrap().contents =
            Some(br#"{"wifi":{"ssid":"HomeNet"},"mqtt":{"edgeId":""}}"#.to_vec());

        let store = ConfigStore::load(Box::new(backend));

        assert_eq!(store.credentials().ssid, "");
        assert_eq!(store.broker_identity().client_id, "24dcc3a736ec");
    }

    #[test]
    fn valid_document_is_kept() {
        let backend = SharedBackend::default();
        backend.0.lock().unwrap().contents = Some(
            br#"{"wifi":{"ssid":"HomeNet","password":"secret"},"mqtt":{"broker":"10.0.0.2","edgeId":"abc","port":0}}"#
                .to_vec(),
        );

        let store = ConfigStore::load(Box::new(backend));

        assert_eq!(store.credentials().ssid, "HomeNet");
        let identity = store.broker_identity();
        assert_eq!(identity.host, "10.0.0.2");
        assert_eq!(identity.port, 1883);
    }

    #[test]
    fn submitted_credentials_persist_and_raise_flag() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));
        assert!(!store.take_credentials_changed());

        store
            .submit_credentials(&NetworkCredentials {
                ssid: "HomeNet".into(),
                password: "secret".into(),
                enterprise_username: None,
            })
            .unwrap();

        assert_eq!(stored(&backend).wifi.ssid, "HomeNet");
        assert!(store.take_credentials_changed());
        assert!(!store.take_credentials_changed());

        let reloaded = ConfigStore::load(Box::new(backend));
        assert_eq!(reloaded.credentials().password, "secret");
    }

    #[test]
    fn failed_write_keeps_previous_credentials() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));
        backend.0.lock().unwrap().fail_writes = true;

        let err = store
            .submit_credentials(&NetworkCredentials {
                ssid: "HomeNet".into(),
                ..Default::default()
            })
            .unwrap_err();

        assert!(matches!(err, NodeError::ConfigWriteFailed(_)));
        assert_eq!(store.credentials().ssid, "");
        assert!(!store.take_credentials_changed());
    }

    #[test]
    fn factory_reset_restores_defaults() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));
        store
            .submit_credentials(&NetworkCredentials {
                ssid: "HomeNet".into(),
                ..Default::default()
            })
            .unwrap();
        store.take_credentials_changed();

        store.factory_reset().unwrap();

        assert_eq!(stored(&backend), NodeConfig::default());
        assert!(store.take_credentials_changed());
    }

    #[test]
    fn overrides_survive_provisioning_without_reaching_storage() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));
        store.overlay(|config| {
            config.mqtt.broker = "env-host".into();
            config.mqtt.password = "env-secret".into();
        });

        store
            .submit_credentials(&NetworkCredentials {
                ssid: "HomeNet".into(),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(store.broker_identity().host, "env-host");
        assert_eq!(store.credentials().ssid, "HomeNet");

        let on_disk = stored(&backend);
        assert_eq!(on_disk.wifi.ssid, "HomeNet");
        assert_eq!(on_disk.mqtt.broker, "192.168.31.21");
        assert_eq!(on_disk.mqtt.password, "passwd");

        let reloaded = ConfigStore::load(Box::new(backend));
        assert_eq!(reloaded.broker_identity().host, "192.168.31.21");
    }

    #[test]
    fn provisioning_writes_credentials_and_identity_together() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));
        let identity = BrokerIdentity {
            host: "10.0.0.2".into(),
            port: 1884,
            client_id: "node7".into(),
            username: String::new(),
            password: String::new(),
        };

        store
            .submit_provisioning(
                &NetworkCredentials {
                    ssid: "HomeNet".into(),
                    ..Default::default()
                },
                Some(&identity),
            )
            .unwrap();

        let on_disk = stored(&backend);
        assert_eq!(on_disk.wifi.ssid, "HomeNet");
        assert_eq!(on_disk.mqtt.edge_id, "node7");
        assert_eq!(on_disk.mqtt.port, 1884);
        assert!(store.take_credentials_changed());
    }

    #[test]
    fn failed_provisioning_write_changes_nothing() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));
        backend.0.lock().unwrap().fail_writes = true;

        let err = store
            .submit_provisioning(
                &NetworkCredentials {
                    ssid: "HomeNet".into(),
                    ..Default::default()
                },
                Some(&BrokerIdentity {
                    host: "10.0.0.2".into(),
                    port: 1883,
                    client_id: "node7".into(),
                    username: String::new(),
                    password: String::new(),
                }),
            )
            .unwrap_err();

        assert!(matches!(err, NodeError::ConfigWriteFailed(_)));
        assert_eq!(store.credentials().ssid, "");
        assert_eq!(store.broker_identity().client_id, "24dcc3a736ec");
        assert!(!store.take_credentials_changed());
    }

    #[test]
    fn overlay_is_not_persisted() {
        let backend = SharedBackend::default();
        let mut store = ConfigStore::load(Box::new(backend.clone()));

        store.overlay(|config| {
            config.mqtt.broker = " 127.0.0.1 ".into();
            config.mqtt.port = 0;
        });

        let identity = store.broker_identity();
        assert_eq!(identity.host, "127.0.0.1");
        assert_eq!(identity.port, 1883);
        assert_eq!(stored(&backend), NodeConfig::default());
    }
}
