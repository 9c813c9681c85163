//! The flat option surface. Options are collected once (flags with env
//! fallbacks), then validated into a [`Node`](crate::node::Node); no
//! option is interpreted before the full set is known.

use clap::Parser;

use funcd_core::{Error, Result};

/// Node role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum NodeKind {
    Full,
    Api,
    Lb,
    Runner,
    #[value(name = "pure-runner")]
    PureRunner,
}

/// Placement algorithm for LB nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum PlacerKind {
    Naive,
    Ch,
}

#[derive(Debug, Clone, Parser)]
#[command(name = "funcd", version, about = "Functions-as-a-Service platform node")]
pub struct Options {
    /// Role this process runs in.
    #[arg(long = "node-type", env = "FUNCD_NODE_TYPE", value_enum, default_value = "full")]
    pub node_type: NodeKind,

    /// HTTP listen port for the API / invocation surface.
    #[arg(long = "web-port", env = "FUNCD_WEB_PORT", default_value_t = 8080)]
    pub web_port: u16,

    /// gRPC listen port (pure-runner nodes).
    #[arg(long = "grpc-port", env = "FUNCD_GRPC_PORT", default_value_t = 9190)]
    pub grpc_port: u16,

    /// Admin HTTP port; shares the web listener when equal to web-port.
    #[arg(long = "admin-port", env = "FUNCD_ADMIN_PORT")]
    pub admin_port: Option<u16>,

    /// Catalog database URL (sqlite).
    #[arg(long = "db-url", env = "FUNCD_DB_URL")]
    pub db_url: Option<String>,

    /// Message queue URL; `mem://` is the built-in lease queue.
    #[arg(long = "mq-url", env = "FUNCD_MQ_URL")]
    pub mq_url: Option<String>,

    /// Log store URL; defaults to the catalog database.
    #[arg(long = "logstore-url", env = "FUNCD_LOGSTORE_URL")]
    pub logstore_url: Option<String>,

    /// Base URL of the API node serving the hybrid control plane.
    #[arg(long = "runner-api-url", env = "FUNCD_RUNNER_API_URL")]
    pub runner_api_url: Option<String>,

    /// Comma-separated pure-runner addresses for the LB pool.
    #[arg(long = "runner-addresses", env = "FUNCD_RUNNER_ADDRESSES")]
    pub runner_addresses: Option<String>,

    /// Static base for trigger endpoint annotations; wins over
    /// per-request derivation when set.
    #[arg(long = "public-lb-url", env = "FUNCD_PUBLIC_LB_URL")]
    pub public_lb_url: Option<String>,

    /// Placement algorithm.
    #[arg(long = "placer", env = "FUNCD_PLACER", value_enum, default_value = "naive")]
    pub placer: PlacerKind,

    /// Node certificate for mutual TLS on the runner link.
    #[arg(long = "node-cert", env = "FUNCD_NODE_CERT")]
    pub node_cert: Option<String>,

    #[arg(long = "node-cert-key", env = "FUNCD_NODE_CERT_KEY")]
    pub node_cert_key: Option<String>,

    #[arg(long = "node-cert-authority", env = "FUNCD_NODE_CERT_AUTHORITY")]
    pub node_cert_authority: Option<String>,

    /// Default log filter directive (trace, debug, info, warn, error).
    #[arg(long = "log-level", env = "FUNCD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log destination: `stderr`, or a `file://`, `tcp://`, `udp://` URL.
    #[arg(long = "log-dest", env = "FUNCD_LOG_DEST", default_value = "stderr")]
    pub log_dest: String,

    /// Prefix field attached to every log line.
    #[arg(long = "log-prefix", env = "FUNCD_LOG_PREFIX")]
    pub log_prefix: Option<String>,

    /// Comma-separated allowed CORS origins; `*` allows any.
    #[arg(long = "cors-origins", env = "FUNCD_CORS_ORIGINS")]
    pub cors_origins: Option<String>,

    /// Comma-separated allowed CORS headers.
    #[arg(long = "cors-headers", env = "FUNCD_CORS_HEADERS")]
    pub cors_headers: Option<String>,

    /// Zipkin collector URL; enables span export when set.
    #[arg(long = "zipkin-url", env = "FUNCD_ZIPKIN_URL")]
    pub zipkin_url: Option<String>,

    /// Jaeger collector URL; enables span export when set.
    #[arg(long = "jaeger-url", env = "FUNCD_JAEGER_URL")]
    pub jaeger_url: Option<String>,

    /// Header carrying the client-supplied request id.
    #[arg(long = "rid-header", env = "FUNCD_RID_HEADER")]
    pub rid_header: Option<String>,

    /// Space-separated process names for the sidecar process collector;
    /// empty disables it. The collector itself is external.
    #[arg(
        long = "process-collector-list",
        env = "FUNCD_PROCESS_COLLECTOR_LIST",
        default_value = "dockerd docker-containerd"
    )]
    pub process_collector_list: String,

    /// Allocatable container memory on execution nodes, MB.
    #[arg(long = "max-memory", env = "FUNCD_MAX_MEMORY", default_value_t = 1024)]
    pub max_memory: u64,

    /// Allocatable CPU shares on execution nodes, milli-CPUs; 0 means
    /// unconstrained.
    #[arg(long = "max-cpus", env = "FUNCD_MAX_CPUS", default_value_t = 0)]
    pub max_cpus: u64,

    /// Bound on waiting for in-flight calls during shutdown, seconds.
    #[arg(long = "shutdown-timeout", env = "FUNCD_SHUTDOWN_TIMEOUT", default_value_t = 30)]
    pub shutdown_timeout: u64,
}

impl Options {
    /// Effective admin port.
    pub fn admin_port(&self) -> u16 {
        self.admin_port.unwrap_or(self.web_port)
    }

    /// Cross-field validation that does not depend on the role; role
    /// checks live in [`Node::build`](crate::node::Node::build).
    pub fn validate(&self) -> Result<()> {
        let certs = [
            self.node_cert.as_ref(),
            self.node_cert_key.as_ref(),
            self.node_cert_authority.as_ref(),
        ];
        let set = certs.iter().filter(|c| c.is_some()).count();
        if set != 0 && set != 3 {
            return Err(Error::Fatal(
                "node-cert, node-cert-key and node-cert-authority must be set together".into(),
            ));
        }
        if self.zipkin_url.is_some() && self.jaeger_url.is_some() {
            return Err(Error::Fatal(
                "zipkin-url and jaeger-url are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    /// TLS material when the three certificate options are present.
    pub fn tls_material(&self) -> Option<funcd_grpc::TlsMaterial> {
        match (&self.node_cert, &self.node_cert_key, &self.node_cert_authority) {
            (Some(cert), Some(key), Some(ca)) => {
                Some(funcd_grpc::TlsMaterial::new(cert, key, ca))
            }
            _ => None,
        }
    }
}
