//! cairnd — Cairn peer-to-peer daemon.
//!
//! Loads (or generates) the node identity, brings up the switch on the
//! configured listen addresses, wires in the pubsub router, subscribes the
//! configured topics, and logs deliveries until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use cairn_core::config::CairnConfig;
use cairn_core::{tracker, Keypair};
use cairn_net::{SessionConfig, Switch, SwitchConfig, TcpTransport};
use cairn_pubsub::{FloodSub, GossipSub, GossipsubConfig, PubSubConfig, RouterCore};

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls verbosity, e.g. RUST_LOG=cairn_net=debug
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = CairnConfig::load().context("loading configuration")?;

    let identity = Arc::new(
        Keypair::load_or_generate(&config.identity.keypair_path)
            .context("loading identity keypair")?,
    );
    tracing::info!(peer = %identity.peer_id(), "identity loaded");

    let switch_config = SwitchConfig {
        handshake_timeout: Duration::from_secs(config.network.handshake_timeout_secs),
        session: SessionConfig {
            idle_timeout: Duration::from_secs(config.network.channel_idle_timeout_secs),
            ..SessionConfig::default()
        },
    };
    let switch = Arc::new(Switch::new(
        identity.clone(),
        Arc::new(TcpTransport),
        switch_config,
        tracker::noop(),
    ));

    let pubsub_config = PubSubConfig {
        sign: config.pubsub.sign,
        verify: config.pubsub.verify,
        send_timeout: Duration::from_secs(config.pubsub.send_timeout_secs),
        ..PubSubConfig::default()
    };
    let router: Arc<RouterCore> = match config.pubsub.router.as_str() {
        "gossipsub" => GossipSub::new(
            switch.clone(),
            identity.clone(),
            pubsub_config,
            GossipsubConfig::default(),
        )
        .core()
        .clone(),
        _ => FloodSub::new(switch.clone(), identity.clone(), pubsub_config)
            .core()
            .clone(),
    };

    for addr in &config.network.listen_addrs {
        let bound = switch.listen(*addr).await.context("binding listener")?;
        tracing::info!(addr = %bound, "listener up");
    }

    for topic in &config.pubsub.topics {
        let name = topic.clone();
        router
            .subscribe(
                topic,
                Arc::new(move |msg| {
                    let name = name.clone();
                    Box::pin(async move {
                        tracing::info!(
                            topic = %name,
                            bytes = msg.data.as_deref().map(|d| d.len()).unwrap_or(0),
                            "message delivered"
                        );
                    })
                }),
            )
            .await;
    }

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    router.close().await;
    switch.close().await;
    Ok(())
}
