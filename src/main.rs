use std::env;
use std::path::PathBuf;
use std::time::Instant;

use tokio::net::TcpListener;

use meshrelay::beacon::BeaconStore;
use meshrelay::logging;
use meshrelay::mlog;
use meshrelay::relay::{NoPathPolicy, Relay, RelayConfig, RelayContext};
use meshrelay::status::{self, StatusState};

#[tokio::main]
async fn main() {
    logging::init();

    let data_dir = PathBuf::from(
        env::var("MESHRELAY_DATA_DIR").unwrap_or_else(|_| "meshrelay-data".to_string()),
    );
    if let Err(error) = std::fs::create_dir_all(&data_dir) {
        panic!("failed to create {}: {error}", data_dir.display());
    }

    let store = BeaconStore::open(&data_dir.join("meshrelay.db"))
        .unwrap_or_else(|error| panic!("failed to open store: {error}"));
    let keypair = store
        .load_or_create_identity()
        .unwrap_or_else(|error| panic!("failed to load identity: {error}"));
    let own_key = keypair
        .public_key_b64()
        .unwrap_or_else(|error| panic!("corrupt identity key: {error}"));
    mlog!("relay identity {}", logging::peer_key(&own_key));

    let config = RelayConfig {
        max_route_length: env_usize("MESHRELAY_MAX_ROUTE_LENGTH", 8),
        default_capacity: Some(env_u64("MESHRELAY_EDGE_CAPACITY", 100)),
        no_path_policy: no_path_policy_from_env(),
        node_version: 1,
    };
    let ctx = RelayContext::new(store.clone(), keypair, config);

    let status_bind =
        env::var("MESHRELAY_STATUS_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let status_state = StatusState {
        store: store.clone(),
        metrics: ctx.metrics.clone(),
        started: Instant::now(),
    };
    tokio::spawn(async move {
        let listener = TcpListener::bind(&status_bind)
            .await
            .unwrap_or_else(|error| panic!("failed to bind {status_bind}: {error}"));
        axum::serve(listener, status::app(status_state))
            .await
            .unwrap_or_else(|error| panic!("status server error: {error}"));
    });

    let bind = env::var("MESHRELAY_BIND").unwrap_or_else(|_| "0.0.0.0:5344".to_string());
    let listener = TcpListener::bind(&bind)
        .await
        .unwrap_or_else(|error| panic!("failed to bind {bind}: {error}"));
    mlog!("listening on {bind}");

    loop {
        let (socket, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                mlog!("accept failed: {error}");
                continue;
            }
        };
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let mut relay = match Relay::accept(socket, ctx).await {
                Ok(relay) => relay,
                Err(error) => {
                    mlog!("handshake with {peer_addr} failed: {error}");
                    return;
                }
            };
            while relay.do_relaying().await > 0 {}
            relay.close_connection().await;
        });
    }
}

fn no_path_policy_from_env() -> NoPathPolicy {
    match env::var("MESHRELAY_NO_PATH_POLICY").as_deref() {
        Ok("close") => NoPathPolicy::CloseConnection,
        _ => NoPathPolicy::DropBlock,
    }
}

fn env_u64(key: &str, default_value: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}

fn env_usize(key: &str, default_value: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default_value)
}
