use serde::{Deserialize, Serialize};

use crate::{
    db::{Storage, KEY_API_KEY, KEY_USER_CONFIG},
    error::Result,
    llm::UpstreamClient,
    models::{default_models, ModelConfig, ModelInfo},
};

/**
 * \brief ModelConfig 的部分更新。
 */
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none", alias = "max_tokens")]
    pub max_tokens: Option<u32>,
}

impl ModelConfigPatch {
    pub fn apply_to(&self, base: &ModelConfig) -> ModelConfig {
        ModelConfig {
            model: self.model.clone().unwrap_or_else(|| base.model.clone()),
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
        }
    }
}

/** \brief 持久化的用户配置；字段缺失时按默认值补齐。 */
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserConfig {
    #[serde(default)]
    model_config: ModelConfigPatch,
}

/**
 * \brief 凭证与模型配置的状态模块。
 */
#[derive(Debug)]
pub struct ConfigStore {
    storage: Storage,
    api_key: String,
    model_config: ModelConfig,
    available_models: Vec<ModelInfo>,
    error: Option<String>,
}

impl ConfigStore {
    /**
     * \brief 从存储加载，缺失或损坏的字段回退默认值。
     */
    pub fn load(storage: Storage) -> Self {
        let api_key: String = storage.load_or(KEY_API_KEY, String::new());
        let stored: UserConfig = storage.load_or(KEY_USER_CONFIG, UserConfig::default());
        let mut model_config = stored.model_config.apply_to(&ModelConfig::default());
        if let Err(e) = model_config.validate() {
            tracing::warn!(error = %e, "stored model config is out of range, using defaults");
            model_config = ModelConfig::default();
        }
        Self {
            storage,
            api_key,
            model_config,
            available_models: default_models(),
            error: None,
        }
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }

    pub fn model_config(&self) -> &ModelConfig {
        &self.model_config
    }

    pub fn available_models(&self) -> &[ModelInfo] {
        &self.available_models
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_api_key(&mut self, api_key: &str) {
        self.api_key = api_key.trim().to_string();
        self.storage.save_best_effort(KEY_API_KEY, &self.api_key);
    }

    /**
     * \brief 合并部分更新；合并结果越界时拒绝且不修改当前配置。
     */
    pub fn set_model_config(&mut self, patch: &ModelConfigPatch) -> Result<()> {
        let next = patch.apply_to(&self.model_config);
        next.validate()?;
        self.model_config = next;
        self.persist_model_config();
        Ok(())
    }

    /** \brief 清空凭证并恢复默认模型配置。 */
    pub fn reset(&mut self) {
        self.api_key.clear();
        self.model_config = ModelConfig::default();
        self.available_models = default_models();
        self.error = None;
        for key in [KEY_API_KEY, KEY_USER_CONFIG] {
            if let Err(e) = self.storage.remove(key) {
                tracing::warn!(key, error = %e, "removing stored setting failed");
            }
        }
    }

    /**
     * \brief 拉取上游模型列表；无凭证或失败时使用默认列表。
     */
    pub async fn fetch_available_models(&mut self, upstream: &UpstreamClient) {
        self.error = None;
        if !self.has_api_key() {
            self.available_models = default_models();
            return;
        }
        match upstream.list_models(&self.api_key).await {
            Ok(models) if !models.is_empty() => self.available_models = models,
            Ok(_) => self.available_models = default_models(),
            Err(e) => {
                tracing::warn!(error = %e, "fetching models failed");
                self.available_models = default_models();
                self.error = Some("failed to fetch models, using defaults".to_string());
            }
        }
    }

    fn persist_model_config(&self) {
        let stored = UserConfig {
            model_config: ModelConfigPatch {
                model: Some(self.model_config.model.clone()),
                temperature: Some(self.model_config.temperature),
                max_tokens: Some(self.model_config.max_tokens),
            },
        };
        self.storage.save_best_effort(KEY_USER_CONFIG, &stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RelayError;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_defaults_when_nothing_stored() {
        let store = ConfigStore::load(Storage::in_memory().expect("storage"));
        assert!(!store.has_api_key());
        assert_eq!(store.model_config(), &ModelConfig::default());
        assert_eq!(store.available_models(), default_models().as_slice());
    }

    #[test]
    fn test_settings_persist_across_loads() {
        let storage = Storage::in_memory().expect("storage");
        let mut store = ConfigStore::load(storage.clone());
        store.set_api_key("  sk-abc ");
        store
            .set_model_config(&ModelConfigPatch {
                temperature: Some(1.3),
                ..Default::default()
            })
            .expect("valid patch");

        let reloaded = ConfigStore::load(storage);
        assert_eq!(reloaded.api_key(), "sk-abc");
        assert_eq!(reloaded.model_config().temperature, 1.3);
        assert_eq!(reloaded.model_config().max_tokens, 1000);
    }

    #[test]
    fn test_partial_stored_config_is_merged_with_defaults() {
        let storage = Storage::in_memory().expect("storage");
        storage
            .save(KEY_USER_CONFIG, &json!({"modelConfig": {"model": "qwen"}}))
            .expect("save");
        let store = ConfigStore::load(storage);
        assert_eq!(store.model_config().model, "qwen");
        assert_eq!(store.model_config().temperature, 0.7);
    }

    #[test]
    fn test_out_of_range_patch_is_rejected() {
        let mut store = ConfigStore::load(Storage::in_memory().expect("storage"));
        let err = store
            .set_model_config(&ModelConfigPatch {
                max_tokens: Some(5000),
                ..Default::default()
            })
            .expect_err("rejected");
        assert!(matches!(err, RelayError::Validation(_)));
        assert_eq!(store.model_config().max_tokens, 1000);
    }

    #[test]
    fn test_reset_restores_defaults() {
        let storage = Storage::in_memory().expect("storage");
        let mut store = ConfigStore::load(storage.clone());
        store.set_api_key("sk");
        store
            .set_model_config(&ModelConfigPatch {
                model: Some("gpt-4".into()),
                ..Default::default()
            })
            .expect("patch");
        store.reset();
        assert_eq!(storage.load_or(KEY_API_KEY, String::from("absent")), "absent");
        assert_eq!(
            storage.load_or(KEY_USER_CONFIG, serde_json::Value::Null),
            serde_json::Value::Null
        );
        let reloaded = ConfigStore::load(storage);
        assert!(!reloaded.has_api_key());
        assert_eq!(reloaded.model_config(), &ModelConfig::default());
    }

    #[tokio::test]
    async fn test_fetch_models_falls_back_with_note() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/models"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let upstream = UpstreamClient::new(&server.uri(), Duration::from_secs(5)).expect("client");

        let mut store = ConfigStore::load(Storage::in_memory().expect("storage"));
        store.fetch_available_models(&upstream).await;
        assert!(store.error().is_none());

        store.set_api_key("sk");
        store.fetch_available_models(&upstream).await;
        assert_eq!(store.available_models(), default_models().as_slice());
        assert!(store.error().is_some());
    }
}
