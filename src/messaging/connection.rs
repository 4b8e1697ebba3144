use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::Mutex;

use crate::config::RabbitMqConfig;
use super::errors::MessagingError;

// ============================================================================
// Connection Manager
// ============================================================================
//
// Holds exactly one long-lived broker connection per process and hands out
// channels on demand. The connection is established lazily on the first
// channel request, so channel reuse avoids repeated handshakes. No retry
// logic lives here; callers decide whether a failed channel request is
// worth retrying.
//
// ============================================================================

pub struct RabbitMqConnection {
    uri: String,
    host: String,
    state: Mutex<ConnectionState>,
}

enum ConnectionState {
    Disconnected,
    Connected(Connection),
    Closed,
}

impl RabbitMqConnection {
    pub fn new(config: &RabbitMqConfig) -> Self {
        Self {
            uri: config.amqp_uri(),
            host: format!("{}:{}", config.host, config.port),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    /// Open a new channel, establishing the connection first if needed.
    /// Fails with [`MessagingError::ConnectionClosed`] after `close()`.
    pub async fn create_channel(&self) -> Result<Channel, MessagingError> {
        let mut state = self.state.lock().await;

        if let ConnectionState::Closed = *state {
            return Err(MessagingError::ConnectionClosed);
        }

        if let ConnectionState::Connected(connection) = &*state {
            if connection.status().connected() {
                return Ok(connection.create_channel().await?);
            }
            // Broker dropped the connection; fall through and re-establish.
            tracing::warn!(host = %self.host, "Broker connection lost, re-establishing");
        }

        let connection = Connection::connect(&self.uri, ConnectionProperties::default()).await?;
        tracing::info!(host = %self.host, "Connected to RabbitMQ");

        let channel = connection.create_channel().await?;
        *state = ConnectionState::Connected(connection);
        Ok(channel)
    }

    /// Release the connection. Safe to call multiple times; any later
    /// `create_channel` fails.
    pub async fn close(&self) -> Result<(), MessagingError> {
        let mut state = self.state.lock().await;

        if let ConnectionState::Connected(connection) =
            std::mem::replace(&mut *state, ConnectionState::Closed)
        {
            if connection.status().connected() {
                connection.close(200, "shutting down").await?;
            }
            tracing::info!(host = %self.host, "RabbitMQ connection closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_channel_after_close_fails() {
        let connection = RabbitMqConnection::new(&RabbitMqConfig::default());
        connection.close().await.unwrap();
        // Closing an unopened connection is a no-op and closing twice is safe.
        connection.close().await.unwrap();

        let result = connection.create_channel().await;
        assert!(matches!(result, Err(MessagingError::ConnectionClosed)));
    }
}
