//! Role construction: the option set resolves into a sum type carrying
//! exactly the handles each role needs. A field that a role must not
//! have simply does not exist on its variant; misconfigurations are
//! fatal here, before any listener binds.

use std::sync::Arc;
use std::time::Duration;

use funcd_agent::{Agent, LocalAgent};
use funcd_core::{Error, Result};
use funcd_data::{
    CacheConfig, CachedAccess, DataAccess, Datastore, DirectAccess, HybridClient, LogStore,
    MemLogStore, MemQueue, MessageQueue, NopAccess, SqlStore,
};
use funcd_lb::{ChPlacer, ChPlacerConfig, LbAgent, NaivePlacer, Placer, StaticRunnerPool};
use funcd_pool::docker::DockerDriver;
use funcd_pool::{SlotPool, SlotPoolConfig};

use crate::config::{NodeKind, Options, PlacerKind};

const DEFAULT_DB_URL: &str = "sqlite::memory:";

/// State behind the catalog CRUD and hybrid control-plane surfaces.
#[derive(Clone)]
pub struct ApiState {
    pub datastore: Arc<dyn Datastore>,
    pub logstore: Arc<dyn LogStore>,
    pub queue: Arc<dyn MessageQueue>,
    /// `public-lb-url`; static trigger annotation base when set.
    pub trigger_base: Option<String>,
}

/// State behind the `/r` and `/t` invocation surfaces.
#[derive(Clone)]
pub struct InvokeState {
    pub agent: Arc<dyn Agent>,
    pub da: Arc<dyn DataAccess>,
}

/// One constructed node. Each variant carries exactly what its role
/// serves; there is nothing to nil-check at runtime.
pub enum Node {
    Full { api: ApiState, invoke: InvokeState },
    Api { api: ApiState },
    Lb { invoke: InvokeState },
    Runner { invoke: InvokeState },
    PureRunner { agent: Arc<LocalAgent> },
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            Node::Full { .. } => "Full",
            Node::Api { .. } => "Api",
            Node::Lb { .. } => "Lb",
            Node::Runner { .. } => "Runner",
            Node::PureRunner { .. } => "PureRunner",
        };
        f.debug_struct(variant).finish_non_exhaustive()
    }
}

impl Node {
    pub async fn build(opts: &Options) -> Result<Node> {
        opts.validate()?;
        match opts.node_type {
            NodeKind::Full => {
                let api = build_api_state(opts).await?;
                let da: Arc<dyn DataAccess> = Arc::new(DirectAccess::new(
                    api.datastore.clone(),
                    api.logstore.clone(),
                    api.queue.clone(),
                ));
                let agent = build_local_agent(opts, da.clone());
                Ok(Node::Full {
                    api,
                    invoke: InvokeState { agent, da },
                })
            }
            NodeKind::Api => {
                let api = build_api_state(opts).await?;
                Ok(Node::Api { api })
            }
            NodeKind::Lb => {
                forbid(opts.db_url.as_deref(), "lb", "db-url")?;
                forbid(opts.mq_url.as_deref(), "lb", "mq-url")?;
                let runner_api = require(opts.runner_api_url.as_deref(), "lb", "runner-api-url")?;
                let addresses = require(opts.runner_addresses.as_deref(), "lb", "runner-addresses")?;

                let hybrid = HybridClient::new(runner_api)?;
                let da: Arc<dyn DataAccess> =
                    Arc::new(CachedAccess::new(Arc::new(hybrid), CacheConfig::default()));
                let tls = opts.tls_material();
                let pool = Arc::new(StaticRunnerPool::connect(addresses, tls.as_ref()).await?);
                let placer: Arc<dyn Placer> = match opts.placer {
                    PlacerKind::Naive => Arc::new(NaivePlacer::new()),
                    PlacerKind::Ch => Arc::new(ChPlacer::new(ChPlacerConfig::default())),
                };
                let agent: Arc<dyn Agent> = Arc::new(LbAgent::new(da.clone(), pool, placer));
                Ok(Node::Lb {
                    invoke: InvokeState { agent, da },
                })
            }
            NodeKind::Runner => {
                forbid(opts.db_url.as_deref(), "runner", "db-url")?;
                forbid(opts.mq_url.as_deref(), "runner", "mq-url")?;
                let runner_api = require(opts.runner_api_url.as_deref(), "runner", "runner-api-url")?;

                let hybrid = HybridClient::new(runner_api)?;
                let da: Arc<dyn DataAccess> =
                    Arc::new(CachedAccess::new(Arc::new(hybrid), CacheConfig::default()));
                let agent = build_local_agent(opts, da.clone());
                Ok(Node::Runner {
                    invoke: InvokeState { agent, da },
                })
            }
            NodeKind::PureRunner => {
                forbid(opts.db_url.as_deref(), "pure-runner", "db-url")?;
                forbid(opts.mq_url.as_deref(), "pure-runner", "mq-url")?;
                forbid(opts.runner_api_url.as_deref(), "pure-runner", "runner-api-url")?;
                let da: Arc<dyn DataAccess> = Arc::new(NopAccess::new());
                let pool = SlotPool::new(
                    Arc::new(DockerDriver::new()),
                    SlotPoolConfig {
                        memory_mb: opts.max_memory,
                        cpus_milli: opts.max_cpus,
                        ..Default::default()
                    },
                );
                let agent = Arc::new(LocalAgent::new(
                    da,
                    pool,
                    Some(Duration::from_secs(opts.shutdown_timeout)),
                ));
                Ok(Node::PureRunner { agent })
            }
        }
    }

    /// The agent to close during shutdown, if this role runs one.
    pub fn agent(&self) -> Option<Arc<dyn Agent>> {
        match self {
            Node::Full { invoke, .. } | Node::Lb { invoke } | Node::Runner { invoke } => {
                Some(invoke.agent.clone())
            }
            Node::PureRunner { agent } => Some(agent.clone()),
            Node::Api { .. } => None,
        }
    }

    /// Full nodes run the async dequeue worker.
    pub fn async_worker(&self) -> Option<(Arc<dyn Agent>, Arc<dyn DataAccess>)> {
        match self {
            Node::Full { invoke, .. } => Some((invoke.agent.clone(), invoke.da.clone())),
            _ => None,
        }
    }
}

fn require<'a>(value: Option<&'a str>, role: &str, option: &str) -> Result<&'a str> {
    value.ok_or_else(|| Error::Fatal(format!("{role} node requires {option}")))
}

fn forbid(value: Option<&str>, role: &str, option: &str) -> Result<()> {
    if value.is_some() {
        return Err(Error::Fatal(format!("{role} node must not set {option}")));
    }
    Ok(())
}

async fn build_api_state(opts: &Options) -> Result<ApiState> {
    let db_url = opts.db_url.as_deref().unwrap_or(DEFAULT_DB_URL);
    let store = Arc::new(SqlStore::connect(db_url).await?);

    let logstore: Arc<dyn LogStore> = match opts.logstore_url.as_deref() {
        None => store.clone(),
        Some(url) if url == db_url => store.clone(),
        Some("mem://") => Arc::new(MemLogStore::new()),
        Some(url) if url.starts_with("sqlite:") => Arc::new(SqlStore::connect(url).await?),
        Some(url) => return Err(Error::Fatal(format!("unsupported logstore-url {url:?}"))),
    };

    let queue: Arc<dyn MessageQueue> = match opts.mq_url.as_deref() {
        None | Some("mem://") => Arc::new(MemQueue::new()),
        Some(url) => return Err(Error::Fatal(format!("unsupported mq-url {url:?}"))),
    };

    Ok(ApiState {
        datastore: store.clone(),
        logstore,
        queue,
        trigger_base: opts.public_lb_url.clone(),
    })
}

fn build_local_agent(opts: &Options, da: Arc<dyn DataAccess>) -> Arc<dyn Agent> {
    let pool = SlotPool::new(
        Arc::new(DockerDriver::new()),
        SlotPoolConfig {
            memory_mb: opts.max_memory,
            cpus_milli: opts.max_cpus,
            ..Default::default()
        },
    );
    Arc::new(LocalAgent::new(
        da,
        pool,
        Some(Duration::from_secs(opts.shutdown_timeout)),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn opts(args: &[&str]) -> Options {
        Options::parse_from(std::iter::once("funcd").chain(args.iter().copied()))
    }

    #[tokio::test]
    async fn full_node_builds_with_defaults() {
        let node = Node::build(&opts(&[])).await.unwrap();
        assert!(matches!(node, Node::Full { .. }));
        assert!(node.agent().is_some());
        assert!(node.async_worker().is_some());
    }

    #[tokio::test]
    async fn api_node_has_no_agent() {
        let node = Node::build(&opts(&["--node-type", "api"])).await.unwrap();
        assert!(node.agent().is_none());
    }

    #[tokio::test]
    async fn lb_without_runner_api_url_is_fatal() {
        let err = Node::build(&opts(&["--node-type", "lb"]))
            .await
            .expect_err("missing runner-api-url");
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn lb_with_datastore_is_fatal() {
        let err = Node::build(&opts(&[
            "--node-type",
            "lb",
            "--db-url",
            "sqlite::memory:",
            "--runner-api-url",
            "http://api:8080",
            "--runner-addresses",
            "r1:9190",
        ]))
        .await
        .expect_err("lb must not hold a datastore");
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn pure_runner_refuses_catalog_configuration() {
        let err = Node::build(&opts(&[
            "--node-type",
            "pure-runner",
            "--runner-api-url",
            "http://api:8080",
        ]))
        .await
        .expect_err("pure runner holds no catalog");
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[tokio::test]
    async fn runner_node_builds_against_an_api_url() {
        let node = Node::build(&opts(&[
            "--node-type",
            "runner",
            "--runner-api-url",
            "http://api:8080",
        ]))
        .await
        .unwrap();
        assert!(matches!(node, Node::Runner { .. }));
    }
}
