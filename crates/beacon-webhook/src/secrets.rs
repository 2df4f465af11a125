//! Supporting secrets in the Pod's namespace
//!
//! Injected Pods mount two secrets: the injection config (install script,
//! tenant settings, proxy) and the data-ingest endpoint. Both are created on
//! first use from the WorkloadConfig and the token secret in the operator
//! namespace. Concurrent admissions in the same namespace race on creation,
//! so an existing secret is never an error.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::{debug, info};

use beacon_common::crd::WorkloadConfig;
use beacon_common::kube_utils::create_if_absent;
use beacon_common::{
    Error, DATA_INGEST_TOKEN_KEY, ENDPOINT_SECRET_NAME, INGEST_TOKEN_FIELD, INGEST_URL_FIELD,
    INIT_SECRET_NAME, PAAS_TOKEN_KEY, WEBHOOK_COMPONENT,
};

/// Endpoint fields handed to enriched containers, keyed by env name
pub type DataIngestFields = BTreeMap<String, String>;

/// Key of the install script in the injection config secret
pub const INIT_SCRIPT_KEY: &str = "init.sh";

/// Key of the tenant settings in the injection config secret
pub const CONFIG_KEY: &str = "config.json";

/// Key of the endpoint properties in the endpoint secret
pub const ENDPOINT_PROPERTIES_KEY: &str = "endpoint.properties";

const PROXY_KEY: &str = "proxy";

const INIT_SCRIPT: &str = r#"#!/usr/bin/env bash
set -eu
exec /opt/beacon/bin/beacon-install --config /mnt/config/config.json
"#;

/// Guarantees the supporting secrets exist
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretEnsurer: Send + Sync {
    /// Ensure the injection config secret exists in `namespace`
    async fn ensure_init_secret(&self, config: &WorkloadConfig, namespace: &str)
        -> Result<(), Error>;

    /// Ensure the endpoint secret exists in `namespace` and return its fields
    async fn ensure_endpoint_secret(
        &self,
        config: &WorkloadConfig,
        namespace: &str,
    ) -> Result<DataIngestFields, Error>;
}

/// [`SecretEnsurer`] that creates secrets through the API server
pub struct KubeSecretEnsurer {
    client: Client,
    operator_namespace: String,
}

impl KubeSecretEnsurer {
    /// Create an ensurer reading tokens from `operator_namespace`
    pub fn new(client: Client, operator_namespace: impl Into<String>) -> Self {
        Self {
            client,
            operator_namespace: operator_namespace.into(),
        }
    }

    async fn read_operator_secret(&self, name: &str) -> Result<BTreeMap<String, String>, Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &self.operator_namespace);
        let secret = api.get(name).await?;
        Ok(decode_secret(secret))
    }

    async fn proxy(&self, config: &WorkloadConfig) -> Result<Option<String>, Error> {
        let Some(proxy) = config.spec.proxy.as_ref() else {
            return Ok(None);
        };
        if let Some(value) = proxy.value.as_deref().filter(|v| !v.is_empty()) {
            return Ok(Some(value.to_string()));
        }
        match proxy.value_from.as_deref().filter(|v| !v.is_empty()) {
            Some(secret_name) => {
                let data = self.read_operator_secret(secret_name).await?;
                Ok(Some(required_key(&data, secret_name, PROXY_KEY)?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SecretEnsurer for KubeSecretEnsurer {
    async fn ensure_init_secret(
        &self,
        config: &WorkloadConfig,
        namespace: &str,
    ) -> Result<(), Error> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        if api.get_opt(INIT_SECRET_NAME).await?.is_some() {
            debug!(namespace, secret = INIT_SECRET_NAME, "injection config secret exists");
            return Ok(());
        }

        let tokens = self.read_operator_secret(config.tokens_secret_name()).await?;
        let proxy = self.proxy(config).await?;
        let secret = build_init_secret(config, namespace, &tokens, proxy.as_deref())?;
        if create_if_absent(&api, &secret).await? {
            info!(namespace, secret = INIT_SECRET_NAME, "created injection config secret");
        }
        Ok(())
    }

    async fn ensure_endpoint_secret(
        &self,
        config: &WorkloadConfig,
        namespace: &str,
    ) -> Result<DataIngestFields, Error> {
        let tokens = self.read_operator_secret(config.tokens_secret_name()).await?;
        let fields = endpoint_fields(config, &tokens)?;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        if api.get_opt(ENDPOINT_SECRET_NAME).await?.is_none()
            && create_if_absent(&api, &build_endpoint_secret(namespace, &fields)).await?
        {
            info!(namespace, secret = ENDPOINT_SECRET_NAME, "created data-ingest endpoint secret");
        }
        Ok(fields)
    }
}

/// Flatten `data` and `stringData` into text values
fn decode_secret(secret: Secret) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = secret
        .data
        .unwrap_or_default()
        .into_iter()
        .filter_map(|(k, v)| String::from_utf8(v.0).ok().map(|v| (k, v)))
        .collect();
    out.extend(secret.string_data.unwrap_or_default());
    out
}

fn required_key(data: &BTreeMap<String, String>, secret: &str, key: &str) -> Result<String, Error> {
    data.get(key)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| Error::not_found("secret key", format!("{secret}/{key}")))
}

/// Endpoint URL and token for a WorkloadConfig
pub fn endpoint_fields(
    config: &WorkloadConfig,
    tokens: &BTreeMap<String, String>,
) -> Result<DataIngestFields, Error> {
    let api_url = config.spec.api_url.trim_end_matches('/');
    if api_url.is_empty() {
        return Err(Error::validation_for_field("spec.apiUrl", "must not be empty"));
    }
    let token = required_key(tokens, config.tokens_secret_name(), DATA_INGEST_TOKEN_KEY)?;
    Ok(BTreeMap::from([
        (
            INGEST_URL_FIELD.to_string(),
            format!("{api_url}/v2/metrics/ingest"),
        ),
        (INGEST_TOKEN_FIELD.to_string(), token),
    ]))
}

fn managed_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::from([(
            "app.kubernetes.io/managed-by".to_string(),
            WEBHOOK_COMPONENT.to_string(),
        )])),
        ..Default::default()
    }
}

/// Injection config secret for `namespace`
pub fn build_init_secret(
    config: &WorkloadConfig,
    namespace: &str,
    tokens: &BTreeMap<String, String>,
    proxy: Option<&str>,
) -> Result<Secret, Error> {
    let settings = serde_json::json!({
        "apiUrl": config.spec.api_url,
        "paasToken": tokens.get(PAAS_TOKEN_KEY).cloned().unwrap_or_default(),
        "proxy": proxy.unwrap_or_default(),
        "networkZone": config.network_zone().unwrap_or_default(),
    });
    let mut data = BTreeMap::from([
        (
            INIT_SCRIPT_KEY.to_string(),
            ByteString(INIT_SCRIPT.as_bytes().to_vec()),
        ),
        (
            CONFIG_KEY.to_string(),
            ByteString(serde_json::to_vec(&settings)?),
        ),
    ]);
    // Containers read the proxy through a secretKeyRef
    if let Some(proxy) = proxy {
        data.insert(PROXY_KEY.to_string(), ByteString(proxy.as_bytes().to_vec()));
    }
    Ok(Secret {
        metadata: managed_meta(INIT_SECRET_NAME, namespace),
        data: Some(data),
        ..Default::default()
    })
}

/// Endpoint secret for `namespace`
pub fn build_endpoint_secret(namespace: &str, fields: &DataIngestFields) -> Secret {
    let properties: String = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}\n"))
        .collect();
    Secret {
        metadata: managed_meta(ENDPOINT_SECRET_NAME, namespace),
        data: Some(BTreeMap::from([(
            ENDPOINT_PROPERTIES_KEY.to_string(),
            ByteString(properties.into_bytes()),
        )])),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::crd::WorkloadConfigSpec;

    fn config(api_url: &str) -> WorkloadConfig {
        WorkloadConfig::new(
            "prod",
            WorkloadConfigSpec {
                api_url: api_url.to_string(),
                ..Default::default()
            },
        )
    }

    fn tokens(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn endpoint_fields_derive_from_api_url() {
        let fields = endpoint_fields(
            &config("https://tenant.example.com/api/"),
            &tokens(&[(DATA_INGEST_TOKEN_KEY, "di-token")]),
        )
        .unwrap();
        assert_eq!(
            fields.get(INGEST_URL_FIELD).map(String::as_str),
            Some("https://tenant.example.com/api/v2/metrics/ingest")
        );
        assert_eq!(
            fields.get(INGEST_TOKEN_FIELD).map(String::as_str),
            Some("di-token")
        );
    }

    /// Story: a token secret without the data-ingest token cannot be used
    #[test]
    fn story_missing_token_key_aborts() {
        let err = endpoint_fields(
            &config("https://tenant.example.com/api"),
            &tokens(&[(PAAS_TOKEN_KEY, "paas")]),
        )
        .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains("prod/dataIngestToken"));
    }

    #[test]
    fn empty_api_url_is_rejected() {
        let err = endpoint_fields(&config(""), &tokens(&[(DATA_INGEST_TOKEN_KEY, "t")])).unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn init_secret_carries_script_settings_and_proxy() {
        let secret = build_init_secret(
            &config("https://tenant.example.com/api"),
            "shop",
            &tokens(&[(PAAS_TOKEN_KEY, "paas")]),
            Some("http://proxy:3128"),
        )
        .unwrap();
        assert_eq!(secret.metadata.name.as_deref(), Some(INIT_SECRET_NAME));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("shop"));

        let data = secret.data.unwrap();
        assert!(data.contains_key(INIT_SCRIPT_KEY));
        assert_eq!(data.get(PROXY_KEY).unwrap().0, b"http://proxy:3128".to_vec());

        let settings: serde_json::Value =
            serde_json::from_slice(&data.get(CONFIG_KEY).unwrap().0).unwrap();
        assert_eq!(settings["apiUrl"], "https://tenant.example.com/api");
        assert_eq!(settings["paasToken"], "paas");
    }

    #[test]
    fn init_secret_without_proxy_has_no_proxy_key() {
        let secret =
            build_init_secret(&config("https://t/api"), "shop", &BTreeMap::new(), None).unwrap();
        assert!(!secret.data.unwrap().contains_key(PROXY_KEY));
    }

    #[test]
    fn endpoint_secret_renders_properties() {
        let fields = BTreeMap::from([
            (INGEST_URL_FIELD.to_string(), "https://t/api/v2/metrics/ingest".to_string()),
            (INGEST_TOKEN_FIELD.to_string(), "tok".to_string()),
        ]);
        let secret = build_endpoint_secret("shop", &fields);
        let body = String::from_utf8(
            secret.data.unwrap().get(ENDPOINT_PROPERTIES_KEY).unwrap().0.clone(),
        )
        .unwrap();
        assert_eq!(
            body,
            "BEACON_METRICS_INGEST_API_TOKEN=tok\nBEACON_METRICS_INGEST_URL=https://t/api/v2/metrics/ingest\n"
        );
    }

    #[test]
    fn decode_secret_merges_string_data() {
        let secret = Secret {
            data: Some(BTreeMap::from([(
                "a".to_string(),
                ByteString(b"one".to_vec()),
            )])),
            string_data: Some(BTreeMap::from([("b".to_string(), "two".to_string())])),
            ..Default::default()
        };
        let decoded = decode_secret(secret);
        assert_eq!(decoded.get("a").map(String::as_str), Some("one"));
        assert_eq!(decoded.get("b").map(String::as_str), Some("two"));
    }
}
