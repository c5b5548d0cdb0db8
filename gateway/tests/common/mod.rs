// Copyright 2024 Cobalt Network Foundation
// This file is part of the cobalt library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use cobalt_gateway::{Config, Gateway, Limits, MemoryStore};

/// A configuration suitable for loopback tests: random port, short accept
/// interval, short deadlines.
pub fn test_config() -> Config {
    let mut config = Config::new("127.0.0.1:0".parse::<SocketAddr>().unwrap());
    config.accept_interval = Duration::from_millis(20);
    config.conn_std_deadline = Duration::from_secs(10);
    config.dial_timeout = Duration::from_secs(5);
    config.is_dev = true;
    config
}

/// Initializes a gateway with the test defaults.
#[allow(dead_code)]
pub async fn gateway() -> Gateway {
    gateway_with(test_config()).await
}

/// Initializes a gateway with the given configuration.
#[allow(dead_code)]
pub async fn gateway_with(config: Config) -> Gateway {
    Gateway::new(config, Arc::new(MemoryStore::new()), Limits::default())
        .await
        .expect("couldn't create a gateway")
}

/// Initializes a gateway and keeps a handle on its in-memory store.
#[allow(dead_code)]
pub async fn gateway_with_store(config: Config) -> (Gateway, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let gateway = Gateway::new(config, store.clone(), Limits::default())
        .await
        .expect("couldn't create a gateway");
    (gateway, store)
}

/// Enables logging in tests.
#[allow(dead_code)]
pub fn initialize_logger(level: u8) {
    match level {
        0 => env::set_var("RUST_LOG", "info"),
        1 => env::set_var("RUST_LOG", "debug"),
        2 | 3 => env::set_var("RUST_LOG", "trace"),
        _ => env::set_var("RUST_LOG", "info"),
    };

    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive("tokio_util=off".parse().unwrap())
        .add_directive("mio=off".parse().unwrap());

    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_target(level == 3).try_init();
}

/// Sleeps long enough for the other side of a loopback exchange to settle.
#[allow(dead_code)]
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(300)).await;
}
