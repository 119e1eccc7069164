//! Gateway state: the single lifecycle-owning object behind the global
//! connection, session, and pending tables.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::agent::rpc::RpcCorrelator;
use crate::agent::supervisor::{AgentCommand, AgentSupervisor};
use crate::auth::TokenService;
use crate::config::ServerConfig;
use crate::connection::ConnectionRegistry;
use crate::dispatch::Dispatcher;

/// Shared gateway state. All session and connection state is in-process;
/// nothing is persisted across restarts.
pub struct Gateway {
    pub config: ServerConfig,
    pub tokens: TokenService,
    pub connections: Arc<ConnectionRegistry>,
    pub supervisor: Arc<AgentSupervisor>,
    pub dispatcher: Arc<Dispatcher>,
    pub permits: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let tokens = TokenService::new(&config);
        let connections = Arc::new(ConnectionRegistry::new());
        let supervisor = Arc::new(AgentSupervisor::new(AgentCommand::resolve(
            config.agent_cmd.as_deref(),
        )));
        let correlator = Arc::new(RpcCorrelator::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&connections),
            Arc::clone(&supervisor),
            Arc::clone(&correlator),
        );
        let permits = Arc::new(Semaphore::new(config.connection_limit));

        Arc::new(Self {
            config,
            tokens,
            connections,
            supervisor,
            dispatcher,
            permits,
        })
    }
}
