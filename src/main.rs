use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use pepeunit_client::logger::console_filter;
use pepeunit_client::schema::SearchScope;
use pepeunit_client::{ClientConfig, InboundMessage, InputHandler, PepeunitClient};
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

const INPUT_TOPIC: &str = "input/pepeunit";
const OUTPUT_TOPIC: &str = "output/pepeunit";

/// Echoes non-zero integers from `input/pepeunit` onto `output/pepeunit`.
struct EchoInput;

#[async_trait]
impl InputHandler for EchoInput {
    async fn handle_input(
        &self,
        client: &PepeunitClient,
        message: &InboundMessage,
    ) -> color_eyre::Result<()> {
        let schema = client.schema().snapshot();
        let Ok(name) = schema.find_by_exact_topic(&message.topic, SearchScope::Input) else {
            return Ok(());
        };
        if name != INPUT_TOPIC {
            return Ok(());
        }

        let text = message.payload_str();
        let value: i64 = text
            .trim()
            .parse()
            .map_err(|_| eyre!("Value is not a number: {}", text))?;
        if value == 0 {
            client
                .logger()
                .info(format!("Get message from {INPUT_TOPIC} topics {value}"));
        } else {
            client
                .publish_by_logical_name(OUTPUT_TOPIC, &value.to_string())
                .await?;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(ClientConfig::default_path);
    info!("Loading client config from {:?}", config_path);
    let config = ClientConfig::load(&config_path).await?;

    let client = PepeunitClient::new(config)?;
    match client.unit_id() {
        Ok(id) => client.logger().debug(format!("Device UUID: {id}")),
        Err(e) => client.logger().error(format!("Failed to get unit UUID: {e}")),
    }

    client.set_input_handler(Arc::new(EchoInput));
    client
        .start()
        .await
        .map_err(|e| eyre!("Failed to start client: {}", e))?;

    let shutdown = client.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", e);
            return;
        }
        info!("Shutting down...");
        shutdown.stop().await;
    });

    let last_send: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
    let output = client.clone();
    client
        .run_main_cycle(move || {
            let (client, last_send) = (output.clone(), last_send.clone());
            async move { send_output(&client, &last_send).await }
        })
        .await;

    info!("Main cycle finished");
    Ok(())
}

/// Publishes a sample reading every `DELAY_PUB_MSG` seconds, falling back to
/// the state send interval.
async fn send_output(client: &PepeunitClient, last_send: &Mutex<Option<Instant>>) {
    let settings = client.settings().snapshot();
    let delay = settings
        .extra_u64("DELAY_PUB_MSG")
        .filter(|delay| *delay > 0)
        .map(Duration::from_secs)
        .unwrap_or_else(|| settings.state_send_interval());

    let now = Instant::now();
    {
        let mut last = last_send.lock().unwrap_or_else(|p| p.into_inner());
        if last.is_some_and(|at| now.duration_since(at) < delay) {
            return;
        }
        *last = Some(now);
    }

    let message = "12.45";
    client
        .logger()
        .info(format!("Send message to {OUTPUT_TOPIC} topics: {message}"));
    if let Err(e) = client.publish_by_logical_name(OUTPUT_TOPIC, message).await {
        client.logger().error(format!("Failed to publish message: {e}"));
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_env_filter(console_filter(std::env::var("RUST_LOG").ok().as_deref()))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
