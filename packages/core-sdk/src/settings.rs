use std::{collections::BTreeMap, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    models::{ProviderConfig, ProviderId},
    telemetry,
};

pub const ACTIVE_PROVIDER_KEY: &str = "activeProvider";
pub const SELECTED_MODELS_KEY: &str = "selectedModels";
pub const API_KEYS_KEY: &str = "apiKeys";
pub const CUSTOM_ENDPOINT_KEY: &str = "customEndpoint";
pub const CUSTOM_MODEL_KEY: &str = "customModel";

/**
 * \brief 按作用域划分的字符串槽位，用于持久化 Provider 设置。
 * \details 落盘方式由实现决定；SQLite 实现为明文，可替换为加密实现而不影响 `SettingsStore` 调用方。
 */
pub trait SecretStore: Send + Sync {
    fn get(&self, scope: &str, key: &str) -> Result<Option<String>>;
    fn set(&self, scope: &str, key: &str, value: &str) -> Result<()>;
}

/**
 * \brief 以五个独立槽位读写 `ProviderConfig`。
 */
#[derive(Clone)]
pub struct SettingsStore {
    store: Arc<dyn SecretStore>,
}

struct RawSlots {
    active_provider: Option<String>,
    selected_models: Option<String>,
    api_keys: Option<String>,
    custom_endpoint: Option<String>,
    custom_model: Option<String>,
}

impl SettingsStore {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /**
     * \brief 读取 `scope` 的设置。
     * \details 存储不可读时返回 `None`；缺失或格式错误的槽位仅各自回退到默认值。
     */
    pub fn load(&self, scope: &str) -> Option<ProviderConfig> {
        match self.read_slots(scope) {
            Ok(raw) => Some(resolve(raw)),
            Err(err) => {
                telemetry::log_error("settings.load", &format!("scope={} {:#}", scope, err));
                None
            }
        }
    }

    pub fn load_or_default(&self, scope: &str) -> ProviderConfig {
        self.load(scope).unwrap_or_default()
    }

    /**
     * \brief 覆盖写入 `scope` 的全部五个槽位。
     */
    pub fn save(&self, scope: &str, config: &ProviderConfig) -> Result<()> {
        let models = serde_json::to_string(&config.selected_models)?;
        let keys = serde_json::to_string(&config.api_keys)?;
        let slots = [
            (ACTIVE_PROVIDER_KEY, config.active_provider.as_str()),
            (SELECTED_MODELS_KEY, models.as_str()),
            (API_KEYS_KEY, keys.as_str()),
            (CUSTOM_ENDPOINT_KEY, config.custom_endpoint.as_str()),
            (CUSTOM_MODEL_KEY, config.custom_model.as_str()),
        ];
        for (key, value) in slots {
            self.store
                .set(scope, key, value)
                .with_context(|| format!("Failed to save API settings ({})", key))?;
        }
        telemetry::log_event(
            "settings.save",
            &format!("scope={} active={}", scope, config.active_provider),
        );
        Ok(())
    }

    fn read_slots(&self, scope: &str) -> Result<RawSlots> {
        Ok(RawSlots {
            active_provider: self.store.get(scope, ACTIVE_PROVIDER_KEY)?,
            selected_models: self.store.get(scope, SELECTED_MODELS_KEY)?,
            api_keys: self.store.get(scope, API_KEYS_KEY)?,
            custom_endpoint: self.store.get(scope, CUSTOM_ENDPOINT_KEY)?,
            custom_model: self.store.get(scope, CUSTOM_MODEL_KEY)?,
        })
    }
}

fn resolve(raw: RawSlots) -> ProviderConfig {
    let mut config = ProviderConfig::default();
    if let Some(id) = raw.active_provider.and_then(|s| s.parse::<ProviderId>().ok()) {
        config.active_provider = id;
    }
    if let Some(models) = raw.selected_models.as_deref().and_then(parse_mapping) {
        config.selected_models = models;
    }
    if let Some(keys) = raw.api_keys.as_deref().and_then(parse_mapping) {
        config.api_keys = keys;
    }
    config.custom_endpoint = raw.custom_endpoint.unwrap_or_default();
    config.custom_model = raw.custom_model.unwrap_or_default();
    config.normalize();
    config
}

/* 映射中无法识别的 Provider 标识直接丢弃。 */
fn parse_mapping(raw: &str) -> Option<BTreeMap<ProviderId, String>> {
    let map: BTreeMap<String, String> = serde_json::from_str(raw).ok()?;
    Some(
        map.into_iter()
            .filter_map(|(k, v)| k.parse::<ProviderId>().ok().map(|id| (id, v)))
            .collect(),
    )
}
