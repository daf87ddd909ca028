use pingora_core::apps::HttpServerOptions;
use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;

use pingagg::config::{Config, Tls};
use pingagg::logging::Logger;
use pingagg::service::http::build_http_service;

fn main() {
    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = match Config::load_yaml_with_opt_override(&opt) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let logger = config.log.clone().map(|log_cfg| {
        let logger = Logger::new(log_cfg);
        logger.init_env_logger();
        logger
    });
    if logger.is_none() {
        env_logger::init();
    }

    log::info!("Loading clusters...");
    let http_service = build_http_service(&config).expect("Failed to initialize proxy service");

    // Create Pingora server with optional configuration
    let mut pingagg_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    // Create HTTP proxy service with name
    let mut http_service =
        http_proxy_service_with_name(&pingagg_server.configuration, http_service, "pingagg");

    // Add listeners from configuration
    log::info!("Adding listeners...");
    for list_cfg in config.listeners {
        match list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(&cert_path, &key_path)
                    .expect("Adding TLS listener shouldn't fail");
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                if list_cfg.offer_h2c {
                    if let Some(http_logic) = http_service.app_logic_mut() {
                        let mut http_server_options = HttpServerOptions::default();
                        http_server_options.h2c = true;
                        http_logic.server_options = Some(http_server_options);
                    }
                }
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    pingagg_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    if let Some(logger) = logger {
        pingagg_server.add_service(logger);
    }
    pingagg_server.add_service(http_service);

    log::info!("Starting Server...");
    pingagg_server.run_forever();
}
