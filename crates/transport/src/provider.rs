//! Transport provider: the entry point for connecting and accepting.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use corelib::{CommContext, NodeIdentity, Result};

use crate::broker::{BrokerConnection, BrokerConnector};
use crate::channel::MessageChannel;
use crate::connection_pool::ConnectionPool;
use crate::consumer::QueueConsumer;
use crate::endpoint::ChannelEndpointHandler;
use crate::handshake::{self, InitialInboxHandler};
use crate::protocol::{QUEUE_INITIAL_INBOX, QUEUE_REQUEST_INBOX};
use crate::request_dispatch::RequestDispatcher;

const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens channels to remote brokers and serves the local one.
pub struct TransportProvider {
    context: CommContext,
    connector: Arc<dyn BrokerConnector>,
    connections: ConnectionPool,
}

impl TransportProvider {
    pub fn new(context: CommContext, connector: Arc<dyn BrokerConnector>) -> Self {
        let connections = ConnectionPool::new(Arc::clone(&connector));
        Self {
            context,
            connector,
            connections,
        }
    }

    /// Perform a handshake with the node serving `contact_point`.
    ///
    /// Returns the established self-initiated channel. Fails with
    /// `Error::Protocol` on an incompatible or rejected handshake,
    /// `Error::Transport` if the broker is unreachable and `Error::Timeout`
    /// if no answer arrives in time. Nothing is retried.
    pub fn connect(
        &self,
        contact_point: &str,
        local: &NodeIdentity,
        endpoint: Arc<dyn ChannelEndpointHandler>,
    ) -> Result<Arc<MessageChannel>> {
        let pooled = self.connections.acquire(contact_point)?;
        handshake::initiate(&self.context, pooled, local, endpoint)
    }

    /// Start accepting handshakes and requests on the broker at `address`.
    pub fn start_server(
        &self,
        address: &str,
        local: NodeIdentity,
        endpoint: Arc<dyn ChannelEndpointHandler>,
    ) -> Result<ServerHandle> {
        let connection = self.connector.connect(address)?;
        let pool = self.context.pool().clone();
        let initial_consumer = QueueConsumer::start(
            "initial-inbox",
            Arc::clone(&connection),
            QUEUE_INITIAL_INBOX,
            Arc::new(InitialInboxHandler::new(
                self.context.clone(),
                Arc::clone(&connection),
                local.clone(),
                Arc::clone(&endpoint),
            )),
            pool.clone(),
        )?;
        let dispatcher = RequestDispatcher::new(self.context.clone(), Arc::clone(&connection), local.node_id, endpoint);
        let request_consumer = match QueueConsumer::start(
            "request-inbox",
            Arc::clone(&connection),
            QUEUE_REQUEST_INBOX,
            Arc::new(dispatcher),
            pool,
        ) {
            Ok(consumer) => consumer,
            Err(e) => {
                initial_consumer.trigger_shutdown();
                connection.close();
                return Err(e);
            }
        };
        info!(address, node = %local, "Accepting connections");
        Ok(ServerHandle {
            address: address.to_string(),
            connection,
            initial_consumer,
            request_consumer,
        })
    }

    pub fn connection_pool(&self) -> &ConnectionPool {
        &self.connections
    }

    pub fn context(&self) -> &CommContext {
        &self.context
    }
}

/// Running server side of a node.
pub struct ServerHandle {
    address: String,
    connection: Arc<dyn BrokerConnection>,
    initial_consumer: QueueConsumer,
    request_consumer: QueueConsumer,
}

impl ServerHandle {
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_running(&self) -> bool {
        self.initial_consumer.is_active() && self.request_consumer.is_active()
    }

    /// Stop both inbox consumers and close the server connection, which also
    /// removes the response queues of remote-initiated channels.
    pub fn shutdown(&self) {
        self.initial_consumer.trigger_shutdown();
        self.request_consumer.trigger_shutdown();
        self.initial_consumer.wait_stopped(SERVER_STOP_TIMEOUT);
        self.request_consumer.wait_stopped(SERVER_STOP_TIMEOUT);
        self.connection.close();
        info!(address = %self.address, "Stopped accepting connections");
    }
}
