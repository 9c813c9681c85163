use std::net::SocketAddr;

use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use funcd_core::{id, Error, Result};
use funcd_grpc::PureRunner;
use funcd_server::api;
use funcd_server::api::middleware::{self, DEFAULT_RID_HEADER};
use funcd_server::config::Options;
use funcd_server::lifecycle::Lifecycle;
use funcd_server::logging;
use funcd_server::node::Node;

#[tokio::main]
async fn main() {
    let opts = Options::parse();

    let _otel_guard = match logging::init(&opts) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("funcd: {e}");
            std::process::exit(1);
        }
    };

    // The machine id feeds call-id generation; resolved once, read-only
    // afterwards.
    id::init_machine_id(id::discover_local_addr(opts.web_port));

    if let Err(e) = run(opts).await {
        tracing::error!(error = %e, "fatal");
        std::process::exit(1);
    }
}

async fn run(opts: Options) -> Result<()> {
    let node = Node::build(&opts).await?;
    let lifecycle = Lifecycle::new();
    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    // Full nodes drive the async queue.
    if let Some((agent, da)) = node.async_worker() {
        funcd_agent::spawn_async_worker(agent, da, lifecycle.token().child_token());
    }

    // Role-specific web surface.
    let web = match &node {
        Node::Full { api, invoke } => {
            Some(api::api_router(api.clone()).merge(api::invoke_router(invoke.clone())))
        }
        Node::Api { api } => Some(api::api_router(api.clone())),
        Node::Lb { invoke } | Node::Runner { invoke } => Some(api::invoke_router(invoke.clone())),
        Node::PureRunner { .. } => None,
    };

    let admin_shares_web = web.is_some() && opts.admin_port() == opts.web_port;

    if let Some(mut router) = web {
        if admin_shares_web {
            router = router.merge(api::admin::router());
        }
        let router = apply_layers(router, &opts)?;
        servers.push(serve_http(router, opts.web_port, "web", &lifecycle).await?);
    }

    if !admin_shares_web {
        let router = apply_layers(api::admin::router(), &opts)?;
        servers.push(serve_http(router, opts.admin_port(), "admin", &lifecycle).await?);
    }

    // Pure runners expose the gRPC submit protocol.
    if let Node::PureRunner { agent } = &node {
        let service = PureRunner::new(agent.clone()).into_server();
        let addr = SocketAddr::from(([0, 0, 0, 0], opts.grpc_port));

        let mut builder = tonic::transport::Server::builder();
        if let Some(tls) = opts.tls_material() {
            builder = builder
                .tls_config(tls.server_config().await?)
                .map_err(|e| Error::Fatal(format!("grpc tls: {e}")))?;
        }

        // A fatal server error is a registered cancellation: it takes
        // the whole node down, not just the listener.
        let fatal = CancellationToken::new();
        lifecycle.register(fatal.clone(), "grpc-server");
        let shutdown = lifecycle.token();
        tracing::info!(%addr, "grpc listening");
        servers.push(tokio::spawn(async move {
            let served = builder
                .add_service(service)
                .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = served {
                tracing::error!(error = %e, "grpc server failed");
                fatal.cancel();
            }
        }));
    }

    lifecycle.wait().await;

    // Graceful teardown: listeners stop accepting, in-flight requests
    // finish, then the agent drains its pool.
    for server in servers {
        let _ = server.await;
    }
    if let Some(agent) = node.agent() {
        agent.close().await?;
    }
    tracing::info!("funcd stopped");
    Ok(())
}

fn apply_layers(router: Router, opts: &Options) -> Result<Router> {
    let rid_header: http::HeaderName = opts
        .rid_header
        .as_deref()
        .unwrap_or(DEFAULT_RID_HEADER)
        .parse()
        .map_err(|e| Error::Fatal(format!("rid-header: {e}")))?;
    let mut router = router
        .layer(axum::middleware::from_fn_with_state(
            rid_header,
            middleware::request_id,
        ))
        .layer(tower_http::trace::TraceLayer::new_for_http());
    if let Some(cors) = middleware::cors_layer(opts.cors_origins.as_deref(), opts.cors_headers.as_deref())
    {
        router = router.layer(cors);
    }
    Ok(router)
}

async fn serve_http(
    router: Router,
    port: u16,
    surface: &'static str,
    lifecycle: &Lifecycle,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| Error::Fatal(format!("binding {surface} port {port}: {e}")))?;
    tracing::info!(port, surface, "http listening");

    let fatal = CancellationToken::new();
    lifecycle.register(fatal.clone(), surface);
    let shutdown = lifecycle.token();
    Ok(tokio::spawn(async move {
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = served {
            tracing::error!(error = %e, surface, "http server failed");
            fatal.cancel();
        }
    }))
}
