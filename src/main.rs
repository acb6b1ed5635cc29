use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
    routing::any,
    serve::{Listener, ListenerExt},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, eyre},
};
use futures_util::StreamExt;
use junction::{
    adapters::tls::build_server_config,
    config::{ProxyConfig, ProxyConfigValidator, SelectionStrategy, loader::load_config},
    core::selector::TargetSelector,
    ports::http_client::HttpClient,
    tracing_setup,
    utils::ShutdownCoordinator,
    EtcdClient, HttpClientAdapter, HttpHandler, SelectorFactory, SyncEngine, shared_routes,
};
use tls_listener::TlsListener;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    sync::oneshot,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "config.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
    /// Start the proxy (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "config.toml")]
        config: String,
    },
}

struct AxumListener<S> {
    stream: S,
    local_addr: SocketAddr,
}

impl<S, I, E> Listener for AxumListener<S>
where
    S: futures_util::Stream<Item = Result<(I, SocketAddr), E>> + Unpin + Send + 'static,
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    type Io = I;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.stream.next().await {
                Some(Ok((io, addr))) => return (io, addr),
                Some(Err(e)) => tracing::debug!("Accept error: {}", e),
                None => std::future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    let (command, config_path) = match args.command {
        Some(Commands::Validate { config }) => ("validate", config),
        Some(Commands::Init { config }) => ("init", config),
        Some(Commands::Serve { config }) => ("serve", config),
        None => ("serve", args.config),
    };

    match command {
        "validate" => {
            return validate_config_command(&config_path).await;
        }
        "init" => {
            return init_config_command(&config_path).await;
        }
        "serve" => {
            // Continue with normal server startup
        }
        _ => unreachable!(),
    }

    tracing_setup::init_tracing().map_err(|e| eyre!("Failed to initialize tracing: {}", e))?;

    let provider = rustls::crypto::aws_lc_rs::default_provider();
    if let Err(e) = rustls::crypto::CryptoProvider::install_default(provider) {
        tracing::warn!(
            "CryptoProvider::install_default for aws-lc-rs reported an error: {:?}. \
            This can happen if a provider was already installed.",
            e
        );
    }

    tracing::info!("Loading configuration from {config_path}");
    let config: ProxyConfig = load_config(&config_path)
        .await
        .with_context(|| format!("Failed to load config from {config_path}"))?;
    ProxyConfigValidator::validate(&config)
        .map_err(|e| eyre!("Configuration is invalid:\n{e}"))?;

    serve(config).await
}

async fn serve(config: ProxyConfig) -> Result<()> {
    tracing::info!(
        endpoint = %config.store.endpoint,
        directory = %config.store.directory,
        "Connecting to routing store"
    );

    let store = Arc::new(
        EtcdClient::new(&config.store.endpoint).context("Failed to create store client")?,
    );
    let routes = shared_routes();

    let mut engine = SyncEngine::new(
        store,
        config.store.directory.clone(),
        routes.clone(),
        Duration::from_secs(config.store.watch_idle_secs),
    );
    engine
        .start()
        .await
        .context("Failed to load the initial routing table")?;
    let engine_handle = tokio::spawn(engine.run());

    let selector: Arc<dyn TargetSelector> =
        Arc::from(SelectorFactory::create_strategy(config.selection.strategy));
    let http_client: Arc<dyn HttpClient> =
        Arc::new(HttpClientAdapter::new().context("Failed to create HTTP client adapter")?);
    let handler = Arc::new(HttpHandler::new(routes, selector, http_client));

    let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_secs(
        config.shutdown.grace_secs,
    )));

    // An unrecovered sync fault shuts the process down through the
    // coordinator rather than crashing mid-flight.
    let fault_coordinator = coordinator.clone();
    tokio::spawn(async move {
        match engine_handle.await {
            Ok(()) => tracing::error!("Config sync engine stopped unexpectedly"),
            Err(e) => tracing::error!(error = %e, "Config sync engine failed"),
        }
        fault_coordinator.trigger_shutdown();
    });

    let tls_config = match &config.ssl {
        Some(ssl) if !ssl.ports.is_empty() => Some(Arc::new(
            build_server_config(ssl).context("Failed to load TLS material")?,
        )),
        _ => None,
    };
    let tls_ports: Vec<u16> = config.ssl.as_ref().map(|s| s.ports.clone()).unwrap_or_default();

    for address in &config.addresses {
        for port in &config.ports {
            let addr: SocketAddr = format!("{address}:{port}")
                .parse()
                .with_context(|| format!("Invalid listen address {address}:{port}"))?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to bind {addr}"))?;

            let is_tls = tls_ports.contains(port);
            let app = build_router(handler.clone(), *port, is_tls);
            let (close_tx, close_rx) = oneshot::channel::<()>();

            let handle = if is_tls {
                let tls_config = tls_config
                    .clone()
                    .ok_or_else(|| eyre!("TLS port {port} configured without TLS material"))?;
                let acceptor = tokio_rustls::TlsAcceptor::from(tls_config);
                let local_addr = listener.local_addr().context("Failed to get local addr")?;
                tokio::spawn(async move {
                    let tls_stream = TlsListener::new(acceptor, listener);
                    let tls_listener = AxumListener {
                        stream: tls_stream,
                        local_addr,
                    }
                    .tap_io(|_io| {});
                    axum::serve(
                        tls_listener,
                        build_connect_service(app),
                    )
                    .with_graceful_shutdown(async move {
                        let _ = close_rx.await;
                    })
                    .await
                    .map_err(|e| eyre!("TLS listener on {local_addr} failed: {e}"))
                })
            } else {
                tokio::spawn(async move {
                    axum::serve(listener, build_connect_service(app))
                        .with_graceful_shutdown(async move {
                            let _ = close_rx.await;
                        })
                        .await
                        .map_err(|e| eyre!("Listener on {addr} failed: {e}"))
                })
            };

            coordinator.register(format!("{addr}"), close_tx, handle);
            tracing::info!(%addr, tls = is_tls, "Listening");
        }
    }

    coordinator.run_until_shutdown().await;
    Ok(())
}

fn build_connect_service(
    app: Router,
) -> axum::extract::connect_info::IntoMakeServiceWithConnectInfo<Router, SocketAddr> {
    app.into_make_service_with_connect_info::<SocketAddr>()
}

fn build_router(handler: Arc<HttpHandler>, port: u16, is_tls: bool) -> Router {
    let make_request_route = |handler: Arc<HttpHandler>| {
        any(
            move |ConnectInfo(client_addr): ConnectInfo<SocketAddr>, req: Request| {
                let handler = handler.clone();
                async move {
                    let response: Response<Body> =
                        handler.handle_request(req, client_addr, port, is_tls).await;
                    response
                }
            },
        )
    };

    Router::new()
        .route("/{*path}", make_request_route(handler.clone()))
        .route("/", make_request_route(handler))
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("🔍 Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("✅ Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("❌ Configuration parsing failed:");
            eprintln!("   {e}");
            std::process::exit(1);
        }
    };

    match ProxyConfigValidator::validate(&config) {
        Ok(()) => {
            println!("✅ Configuration validation: OK");
            println!();
            println!("📋 Configuration Summary:");
            println!("   • Addresses: {}", config.addresses.join(", "));
            println!(
                "   • Ports: {}",
                config
                    .ports
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            println!(
                "   • TLS Ports: {}",
                config
                    .ssl
                    .as_ref()
                    .map(|s| s.ports.len())
                    .unwrap_or_default()
            );
            println!("   • Store: {}", config.store.endpoint);
            println!("   • Routing Directory: {}", config.store.directory);
            println!(
                "   • Selection: {}",
                match config.selection.strategy {
                    SelectionStrategy::IpHash => "ip_hash",
                    SelectionStrategy::WeightedRandom => "weighted_random",
                }
            );
            println!();
            println!("🎉 Configuration is valid and ready to use!");
            Ok(())
        }
        Err(e) => {
            eprintln!("❌ Configuration validation failed:");
            eprintln!("{e}");
            println!();
            println!("💡 Common fixes:");
            println!("   • Addresses must be plain IPs (e.g., '0.0.0.0')");
            println!("   • TLS ports must also appear in the ports list");
            println!("   • The store endpoint must be an http(s) URL");
            println!("   • The routing directory must be an absolute key path");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("❌ Error: Configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# Junction reverse proxy configuration

# Listeners are created for every address x port pair
addresses = ["0.0.0.0"]
ports = [80]

# TLS listeners (uncomment to enable)
# [ssl]
# ports = [443]
# cert = "/etc/junction/cert.pem"
# key = "/etc/junction/key.pem"
# ca = []

# Routing store connection
[store]
endpoint = "http://127.0.0.1:4001"
directory = "/junction"
watch_idle_secs = 60

# Backend selection: "ip_hash" (sticky, default) or "weighted_random"
[selection]
strategy = "ip_hash"

# Graceful shutdown watchdog
[shutdown]
grace_secs = 10
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("✅ Created default configuration at: {config_path}");
    println!("   Run 'junction serve --config {config_path}' to start the proxy");
    Ok(())
}
