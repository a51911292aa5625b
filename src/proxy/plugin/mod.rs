pub mod cache;
pub mod gzip;
pub mod ip_restriction;
pub mod prometheus;
pub mod redirect;
pub mod request_id;

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use once_cell::sync::Lazy;
use pingora::OkOrErr;
use pingora_error::{Error, ErrorType::ReadError, Result};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::Session;
use regex::Regex;
use serde_json::Value as JsonValue;

use super::{route::ProxyRoute, service::service_fetch, ProxyContext};

/// Type alias for plugin initialization functions
pub type PluginCreateFn = Arc<dyn Fn(JsonValue) -> Result<Arc<dyn ProxyPlugin>> + Send + Sync>;

/// Registry of plugin builders
static PLUGIN_BUILDER_REGISTRY: Lazy<HashMap<&'static str, PluginCreateFn>> = Lazy::new(|| {
    let arr: Vec<(&str, PluginCreateFn)> = vec![
        (cache::PLUGIN_NAME, Arc::new(cache::create_cache_plugin)),
        (gzip::PLUGIN_NAME, Arc::new(gzip::create_gzip_plugin)),
        (
            ip_restriction::PLUGIN_NAME,
            Arc::new(ip_restriction::create_ip_restriction_plugin),
        ),
        (
            prometheus::PLUGIN_NAME,
            Arc::new(prometheus::create_prometheus_plugin),
        ),
        (
            redirect::PLUGIN_NAME,
            Arc::new(redirect::create_redirect_plugin),
        ),
        (
            request_id::PLUGIN_NAME,
            Arc::new(request_id::create_request_id_plugin),
        ),
    ];
    arr.into_iter().collect()
});

/// Builds a plugin instance based on its name and configuration.
///
/// # Errors
/// - `ReadError`: Returned if the plugin name is not found in the `PLUGIN_BUILDER_REGISTRY`.
pub fn build_plugin(name: &str, cfg: JsonValue) -> Result<Arc<dyn ProxyPlugin>> {
    let builder = PLUGIN_BUILDER_REGISTRY
        .get(name)
        .or_err(ReadError, "Unknow plugin type")?;
    builder(cfg)
}

/// Builds a `ProxyPluginExecutor` by combining plugins from both a route and its associated service.
///
/// Plugins coming from the route take precedence over same-named plugins from the service.
/// The merged list is sorted by priority, descending.
pub fn build_plugin_executor(route: Arc<ProxyRoute>) -> Arc<ProxyPluginExecutor> {
    let mut plugin_map: HashMap<String, Arc<dyn ProxyPlugin>> = HashMap::new();

    let service_plugins = route
        .inner
        .service_id
        .as_deref()
        .and_then(service_fetch)
        .map_or_else(Vec::new, |service| service.plugins.clone());

    for plugin in route.plugins.iter().chain(service_plugins.iter()) {
        plugin_map
            .entry(plugin.name().to_string())
            .or_insert_with(|| plugin.clone());
    }

    let mut merged_plugins: Vec<_> = plugin_map.into_values().collect();
    merged_plugins.sort_by_key(|b| std::cmp::Reverse(b.priority()));

    Arc::new(ProxyPluginExecutor {
        plugins: merged_plugins,
    })
}

/// Expands a path against an alternating list of `[pattern, template, pattern, template, ...]`
/// pairs, returning the template output of the first pattern that matches the whole path.
///
/// Falls back to the original path unchanged if no pattern matches.
pub fn apply_regex_uri_template(path: &str, regex_uri: &[&str]) -> String {
    for pair in regex_uri.chunks(2) {
        let [pattern, template] = pair else {
            break;
        };

        let Ok(re) = Regex::new(pattern) else {
            continue;
        };

        if let Some(caps) = re.captures(path) {
            let mut expanded = String::new();
            caps.expand(template, &mut expanded);
            return expanded;
        }
    }

    path.to_string()
}

#[async_trait]
pub trait ProxyPlugin: Send + Sync {
    /// Return the name of this plugin
    fn name(&self) -> &str;

    /// Return the priority of this plugin
    fn priority(&self) -> i32;

    /// Handle the incoming request.
    ///
    /// In this phase, users can parse, validate, rate limit, perform access control and/or
    /// return a response for this request.
    ///
    /// # Returns
    /// * `Ok(true)` if a response was sent and the proxy should exit
    /// * `Ok(false)` if the proxy should continue to the next phase
    async fn request_filter(
        &self,
        _session: &mut Session,
        _ctx: &mut ProxyContext,
    ) -> Result<bool> {
        Ok(false)
    }

    /// Handle the incoming request before any downstream module is executed.
    async fn early_request_filter(
        &self,
        _session: &mut Session,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Modify the request before it is sent to the upstream
    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        _upstream_request: &mut RequestHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Handle the request body chunks before they are forwarded to the upstream
    async fn request_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        _end_of_stream: bool,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Modify the response header before it is sent to the downstream
    async fn response_filter(
        &self,
        _session: &mut Session,
        _upstream_response: &mut ResponseHeader,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Handle the response body chunks
    fn response_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        _end_of_stream: bool,
        _ctx: &mut ProxyContext,
    ) -> Result<()> {
        Ok(())
    }

    /// This filter is called when the entire response is sent to the downstream successfully or
    /// there is a fatal error that terminate the request.
    ///
    /// This phase is used for collecting metrics and sending access logs.
    async fn logging(&self, _session: &mut Session, _e: Option<&Error>, _ctx: &mut ProxyContext) {}
}

/// A struct that manages the execution of proxy plugins.
///
/// Plugins are expected to be sorted by priority (descending) during
/// construction of the `ProxyPluginExecutor`.
#[derive(Default)]
pub struct ProxyPluginExecutor {
    pub plugins: Vec<Arc<dyn ProxyPlugin>>,
}

#[async_trait]
impl ProxyPlugin for ProxyPluginExecutor {
    fn name(&self) -> &str {
        "plugin-executor"
    }

    fn priority(&self) -> i32 {
        0
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut ProxyContext) -> Result<bool> {
        for plugin in self.plugins.iter() {
            if plugin.request_filter(session, ctx).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn early_request_filter(
        &self,
        session: &mut Session,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin.early_request_filter(session, ctx).await?;
        }
        Ok(())
    }

    async fn upstream_request_filter(
        &self,
        session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin
                .upstream_request_filter(session, upstream_request, ctx)
                .await?;
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin
                .response_filter(session, upstream_response, ctx)
                .await?;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut ProxyContext,
    ) -> Result<()> {
        for plugin in self.plugins.iter() {
            plugin.response_body_filter(session, body, end_of_stream, ctx)?;
        }
        Ok(())
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut ProxyContext) {
        for plugin in self.plugins.iter() {
            plugin.logging(session, e, ctx).await;
        }
    }
}
