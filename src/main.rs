use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod domain;
mod messaging;
mod metrics;
mod utils;

use config::RabbitMqConfig;
use domain::{CustomerCreatedEvent, DomainEvent, OrderCreatedEvent};
use messaging::{
    RabbitMqConnection, RabbitMqEventConsumer, RabbitMqEventPublisher, TopologyInitializer,
    ANALYTICS_EVENTS_EXCHANGE,
};

const ANALYTICS_QUEUE: &str = "analytics_raw";
const ANALYTICS_ROUTING_KEY: &str = "analytics.raw";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging with environment-based filtering.
    // Example: RUST_LOG=debug cargo run
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ddd_messaging=debug")),
        )
        .init();

    tracing::info!("Starting RabbitMQ event messaging demo");

    let config = RabbitMqConfig::from_env();
    let connection = Arc::new(RabbitMqConnection::new(&config));
    let metrics = Arc::new(metrics::Metrics::new()?);

    // === 1. Declare producer-side topology once at startup ===
    let initializer = TopologyInitializer::new(connection.clone());
    let topology = initializer.start().await?;

    // === 2. Publisher, validated against the declared topology ===
    let publisher =
        RabbitMqEventPublisher::new(&connection, topology.clone(), metrics.clone()).await?;

    // === 3. Consumer: subscribe typed handlers, then connect and start ===
    let consumer = Arc::new(RabbitMqEventConsumer::new(
        connection.clone(),
        &config,
        metrics.clone(),
    ));

    consumer.subscribe(|event: DomainEvent<CustomerCreatedEvent>| async move {
        tracing::info!(
            customer_id = %event.payload().customer_id,
            customer_name = %event.payload().customer_name,
            source = event.source(),
            "Customer created event received"
        );
        Ok(())
    });

    consumer.subscribe(|event: DomainEvent<OrderCreatedEvent>| async move {
        tracing::info!(
            order_id = %event.aggregate_id(),
            customer_id = %event.payload().customer_id,
            "Order created event received"
        );
        Ok(())
    });

    consumer
        .initialize_connection(ANALYTICS_QUEUE, ANALYTICS_EVENTS_EXCHANGE, ANALYTICS_ROUTING_KEY)
        .await?;
    consumer.start_consuming().await?;

    // === 4. Publish sample domain events ===
    let customer_id = uuid::Uuid::new_v4();
    let customer_event = DomainEvent::new(
        "MainApi",
        customer_id,
        CustomerCreatedEvent::new(customer_id, "Jan Kowalski")?,
    )?;
    publisher
        .publish(&customer_event, ANALYTICS_EVENTS_EXCHANGE, ANALYTICS_ROUTING_KEY)
        .await?;

    let order_id = uuid::Uuid::new_v4();
    let order_event = DomainEvent::new("MainApi", order_id, OrderCreatedEvent::new(customer_id)?)?;
    publisher
        .publish(&order_event, ANALYTICS_EVENTS_EXCHANGE, ANALYTICS_ROUTING_KEY)
        .await?;

    // === 5. Let the consumer drain, then shut down ===
    tokio::time::sleep(std::time::Duration::from_secs(5)).await;

    consumer.stop_consuming().await?;
    connection.close().await?;

    tracing::info!(
        published = metrics
            .events_published
            .with_label_values(&["CustomerCreatedEvent"])
            .get()
            + metrics
                .events_published
                .with_label_values(&["OrderCreatedEvent"])
                .get(),
        "Demo complete"
    );

    Ok(())
}
