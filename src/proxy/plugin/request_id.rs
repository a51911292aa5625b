use std::sync::Arc;

use async_trait::async_trait;
use pingora_error::{ErrorType::ReadError, OrErr, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;
use rand::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::proxy::ProxyContext;
use crate::utils::request::get_req_header_value;

use super::ProxyPlugin;

pub const PLUGIN_NAME: &str = "request-id";

const DEFAULT_HEADER_NAME: &str = "X-Request-Id";
const ALGORITHM_UUID: &str = "uuid";
const ALGORITHM_RANGE_ID: &str = "range_id";
const DEFAULT_CHAR_SET: &str = "abcdefghijklmnopqrstuvwxyzABCDEFGHIGKLMNOPQRSTUVWXYZ0123456789";

pub fn create_request_id_plugin(cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let config: PluginConfig =
        serde_json::from_value(cfg).or_err_with(ReadError, || "Invalid request id plugin config")?;
    config
        .validate()
        .or_err_with(ReadError, || "Request id plugin config validation failed")?;
    Ok(Arc::new(PluginRequestID { config }))
}

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
struct PluginConfig {
    #[serde(default = "PluginConfig::default_header_name")]
    header_name: String,
    #[serde(default = "PluginConfig::default_include_in_response")]
    include_in_response: bool,
    #[serde(default = "PluginConfig::default_algorithm")]
    #[validate(custom(function = "PluginConfig::validate_algorithm"))]
    algorithm: String,
    #[serde(default)]
    range_id: RangeId,
}

impl PluginConfig {
    fn default_header_name() -> String {
        DEFAULT_HEADER_NAME.to_string()
    }

    fn default_include_in_response() -> bool {
        true
    }

    fn default_algorithm() -> String {
        ALGORITHM_UUID.to_string()
    }

    fn validate_algorithm(algorithm: &String) -> Result<(), ValidationError> {
        if algorithm == ALGORITHM_UUID || algorithm == ALGORITHM_RANGE_ID {
            Ok(())
        } else {
            Err(ValidationError::new("algorithm must be either 'uuid' or 'range_id'"))
        }
    }
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct RangeId {
    #[serde(default = "RangeId::default_char_set")]
    char_set: String,
    #[serde(default = "RangeId::default_length")]
    length: u32,
}

impl RangeId {
    fn default_char_set() -> String {
        DEFAULT_CHAR_SET.to_string()
    }

    fn default_length() -> u32 {
        16
    }
}

pub struct PluginRequestID {
    config: PluginConfig,
}

impl PluginRequestID {
    fn generate(&self) -> String {
        match self.config.algorithm.as_str() {
            ALGORITHM_RANGE_ID => self.generate_range_id(),
            _ => Uuid::new_v4().to_string(),
        }
    }

    fn generate_range_id(&self) -> String {
        let char_set = if self.config.range_id.char_set.is_empty() {
            DEFAULT_CHAR_SET
        } else {
            &self.config.range_id.char_set
        };
        let chars: Vec<char> = char_set.chars().collect();
        let mut rng = rand::thread_rng();
        (0..self.config.range_id.length)
            .map(|_| *chars.choose(&mut rng).unwrap())
            .collect()
    }
}

#[async_trait]
impl ProxyPlugin for PluginRequestID {
    fn name(&self) -> &str {
        PLUGIN_NAME
    }

    fn priority(&self) -> i32 {
        12015
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        let value = match get_req_header_value(session.req_header(), &self.config.header_name) {
            Some(s) => s.to_string(),
            None => {
                let request_id = self.generate();
                session
                    .req_header_mut()
                    .insert_header(self.config.header_name.clone(), &request_id)?;
                request_id
            }
        };

        ctx.vars.insert("request_id".to_string(), value);
        Ok(false)
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        if self.config.include_in_response {
            if let Some(request_id) = ctx.vars.get("request_id") {
                upstream_response.insert_header(self.config.header_name.clone(), request_id)?;
            }
        }
        Ok(())
    }
}
