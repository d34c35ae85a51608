// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Testcontainers setup for Redis.
//!
//! Each remote cluster in a live test gets its own disposable Redis 7
//! container. No external docker-compose setup is required; tests that use
//! these helpers are `#[ignore]`d and only run when Docker is available.

use redis::AsyncCommands;
use testcontainers::{clients::Cli, core::WaitFor, Container, GenericImage};

/// Create a vanilla Redis container.
///
/// Uses the official redis:7 image. Waits for "Ready to accept connections".
pub fn redis_container(docker: &Cli) -> Container<'_, GenericImage> {
    let image = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(6379)
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"));
    docker.run(image)
}

/// Get the Redis URL for a container.
pub fn redis_url(container: &Container<'_, GenericImage>) -> String {
    let port = container.get_host_port_ipv4(6379);
    format!("redis://127.0.0.1:{}", port)
}

/// One remote cluster backed by its own Redis container.
///
/// Keys written through [`put_state`](Self::put_state) land under the
/// `mesh/state/` prefix the mirror watches by default.
pub struct TestCluster<'a> {
    #[allow(dead_code)] // Kept alive for container lifetime
    container: Container<'a, GenericImage>,
    pub name: String,
    pub redis_url: String,
}

impl<'a> TestCluster<'a> {
    /// Start a fresh cluster container.
    pub fn new(docker: &'a Cli, name: &str) -> Self {
        let container = redis_container(docker);
        let redis_url = redis_url(&container);
        Self {
            container,
            name: name.to_string(),
            redis_url,
        }
    }

    async fn connection(&self) -> redis::aio::MultiplexedConnection {
        let client = redis::Client::open(self.redis_url.as_str()).expect("invalid redis url");
        client
            .get_multiplexed_async_connection()
            .await
            .expect("failed to connect to test redis")
    }

    /// Write a state entry the mirror should pick up.
    pub async fn put_state(&self, key: &str, value: &str) {
        let mut conn = self.connection().await;
        let _: () = conn
            .set(format!("mesh/state/{}", key), value)
            .await
            .expect("SET failed");
    }

    /// Remove a state entry.
    pub async fn delete_state(&self, key: &str) {
        let mut conn = self.connection().await;
        let _: () = conn
            .del(format!("mesh/state/{}", key))
            .await
            .expect("DEL failed");
    }

    /// Read a state entry back, if present.
    pub async fn get_state(&self, key: &str) -> Option<String> {
        let mut conn = self.connection().await;
        conn.get(format!("mesh/state/{}", key))
            .await
            .expect("GET failed")
    }

    /// Whether a raw key exists. Used for heartbeat assertions.
    pub async fn key_exists(&self, key: &str) -> bool {
        let mut conn = self.connection().await;
        conn.exists(key).await.expect("EXISTS failed")
    }
}
