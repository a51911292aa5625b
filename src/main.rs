#![allow(clippy::upper_case_acronyms)]

use std::sync::Arc;

use pingora::services::background::background_service;
use pingora::services::listening::Service;
use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::{http_proxy_service_with_name, HttpProxy};

use loomgate::admin::AdminHttpApp;
use loomgate::config::Config;
use loomgate::ip_allow;
use loomgate::logging::Logger;
use loomgate::prewarm::{DnsTcpConnector, PreWarmPool, PreWarmPoolConfig};
use loomgate::proxy::health_check::SHARED_HEALTH_CHECK_SERVICE;
use loomgate::proxy::ssl::{self, DynamicCert};
use loomgate::proxy::{global_rule, route, service as proxy_service, upstream};
use loomgate::service::http::HttpService;
use loomgate::service::status::{self, StatusHttpApp};
use loomgate::stats;

fn main() {
    env_logger::init();

    let opt = Opt::parse_args();
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    stats::init();

    log::info!("Loading upstreams...");
    upstream::load_upstreams(&config).expect("Failed to load upstreams");

    log::info!("Loading services...");
    proxy_service::load_static_services(&config).expect("Failed to load services");

    log::info!("Loading global rules...");
    global_rule::load_static_global_rules(&config).expect("Failed to load global rules");

    log::info!("Loading SSL certificates...");
    ssl::load_static_ssls(&config).expect("Failed to load SSL certificates");

    log::info!("Loading routes...");
    route::load_static_routes(&config).expect("Failed to load routes");

    load_ip_allow(&config);

    let pingsix_server_conf = config.pingora;
    let mut pingsix_server = Server::new_with_opt_and_conf(Some(opt), pingsix_server_conf);

    if let Some(log_cfg) = config.pingsix.log.clone() {
        log::info!("Adding log sync service...");
        let logger = Logger::new(log_cfg);
        logger.init_env_logger();
        pingsix_server.add_service(logger);
    }

    log::info!("Adding shared health check service...");
    pingsix_server.add_service(SHARED_HEALTH_CHECK_SERVICE.clone());

    log::info!("Adding connection pre-warm pool...");
    let prewarm_pool = PreWarmPool::new(PreWarmPoolConfig::default(), prewarm_connector());
    pingsix_server.add_service(background_service("prewarm pool", prewarm_pool));

    let http_service_impl = HttpService;
    let mut http_service = http_proxy_service_with_name(
        &pingsix_server.configuration,
        http_service_impl,
        "loomgate",
    );

    log::info!("Adding listeners...");
    add_listeners(&mut http_service, &config.pingsix);

    add_optional_services(&mut pingsix_server, &config.pingsix);

    log::info!("Bootstrapping...");
    pingsix_server.bootstrap();

    log::info!("Bootstrapped. Adding services...");
    pingsix_server.add_service(http_service);

    status::set_ready();

    log::info!("Starting server...");
    pingsix_server.run_forever();
}

fn load_ip_allow(config: &Config) {
    let Some(path) = config.ip_allow_path.as_ref() else {
        log::info!("No ip_allow_path configured, all source addresses are allowed.");
        return;
    };

    let text = std::fs::read_to_string(path)
        .unwrap_or_else(|e| panic!("Failed to read ip_allow file '{path}': {e}"));

    let build = if path.ends_with(".yaml") || path.ends_with(".yml") {
        ip_allow::load_yaml(&text)
    } else {
        ip_allow::load_legacy(&text)
    }
    .unwrap_or_else(|e| panic!("Failed to parse ip_allow file '{path}': {e}"));

    ip_allow::reload_global_ip_allow(build);
}

fn prewarm_connector() -> Arc<dyn loomgate::prewarm::PreWarmConnector> {
    let resolver = hickory_resolver::TokioAsyncResolver::tokio_from_system_conf()
        .expect("Failed to initialize DNS resolver for pre-warm pool");
    Arc::new(DnsTcpConnector::new(Arc::new(resolver)))
}

fn add_listeners(http_service: &mut Service<HttpProxy<HttpService>>, cfg: &loomgate::config::Pingsix) {
    for list_cfg in cfg.listeners.iter() {
        if let Some(tls) = &list_cfg.tls {
            let dynamic_cert = DynamicCert::new(tls);
            let mut tls_settings = TlsSettings::with_callbacks(dynamic_cert)
                .expect("Adding TLS listener shouldn't fail");
            if list_cfg.offer_h2 {
                tls_settings.enable_h2();
            }
            http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, tls_settings);
        } else if list_cfg.offer_h2c {
            let http_logic = http_service.app_logic_mut().unwrap();
            let mut http_server_options = HttpServerOptions::default();
            http_server_options.h2c = true;
            http_logic.server_options = Some(http_server_options);
            http_service.add_tcp(&list_cfg.address.to_string());
        } else {
            http_service.add_tcp(&list_cfg.address.to_string());
        }
    }
}

fn add_optional_services(server: &mut Server, cfg: &loomgate::config::Pingsix) {
    if let Some(sentry_cfg) = &cfg.sentry {
        if sentry_cfg.dsn.trim().is_empty() {
            log::warn!("Sentry DSN is empty, Sentry reporting stays disabled.");
        } else {
            log::warn!(
                "Sentry DSN configured but error-reporting integration is not wired in this build."
            );
        }
    }

    if cfg.admin.is_some() {
        log::info!("Adding Admin HTTP...");
        let admin_service_http = AdminHttpApp::admin_http_service(cfg);
        server.add_service(admin_service_http);
    }

    if let Some(status_cfg) = &cfg.status {
        log::info!("Adding Status HTTP...");
        let status_service_http = StatusHttpApp::status_http_service(status_cfg);
        server.add_service(status_service_http);
    }

    if let Some(prometheus_cfg) = &cfg.prometheus {
        log::info!("Adding Prometheus HTTP...");
        let mut prometheus_service_http = Service::prometheus_http_service();
        prometheus_service_http.add_tcp(&prometheus_cfg.address.to_string());
        server.add_service(prometheus_service_http);
    }
}
