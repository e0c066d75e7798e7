//! Node event loop: one dissemination session on one transport.

use std::fs::File;
use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::broadcast;

use deluge_core::config::DelugeConfig;
use deluge_services::{storage, Deluge, DelugeRegistry, StreamHint};

use crate::exec;
use crate::transport::{Transport, MAX_FRAME};

/// What this node starts with.
pub enum Role {
    /// Disseminate an existing file at `version`.
    Seed { path: PathBuf, version: u8 },
    /// Start empty and fetch the object named `name` into the storage dir.
    Join { name: String },
}

pub struct Node {
    deluge: Deluge<File>,
    transport: Transport,
    config: DelugeConfig,
    last_hint: Option<StreamHint>,
    last_version: u8,
}

impl Node {
    pub fn start(config: DelugeConfig, role: Role, transport: Transport) -> Result<Self> {
        let mut registry = DelugeRegistry::new();
        let rng = StdRng::from_entropy();
        let now = Instant::now();

        let deluge = match role {
            Role::Seed { path, version } => {
                let file = storage::open_existing(&path)
                    .with_context(|| format!("failed to open {}", path.display()))?;
                let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
                registry.disseminate(
                    file,
                    name.as_deref().unwrap_or("object"),
                    version,
                    &config.protocol,
                    rng,
                    now,
                )?
            }
            Role::Join { name } => {
                let path = config.storage.dir.join(&name);
                let file = storage::create_empty(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
                tracing::info!(path = %path.display(), "receiving into");
                registry.join(file, &name, &config.protocol, rng, now)?
            }
        };

        let last_version = deluge.object().version();
        Ok(Self {
            deluge,
            transport,
            config,
            last_hint: None,
            last_version,
        })
    }

    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut buf = vec![0u8; MAX_FRAME];
        self.flush().await;

        loop {
            let deadline = self.deluge.next_deadline().map(tokio::time::Instant::from_std);

            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("node shutting down");
                    break;
                }
                r = self.transport.recv(&mut buf) => match r {
                    Ok((len, from)) => {
                        tracing::trace!(
                            peer = %from,
                            len,
                            head = %hex::encode(&buf[..len.min(8)]),
                            "frame received"
                        );
                        self.deluge.handle_frame(&buf[..len], from, Instant::now());
                    }
                    Err(e) => tracing::warn!(error = %e, "recv_from failed"),
                },
                _ = sleep_until(deadline) => self.deluge.poll_timers(Instant::now()),
            }

            self.flush().await;
            self.check_update();
        }
        Ok(())
    }

    async fn flush(&mut self) {
        let hint = self.deluge.stream_hint();
        if hint != self.last_hint {
            tracing::trace!(?hint, "stream hint");
            self.last_hint = hint;
        }
        for out in self.deluge.drain_outbox() {
            match self.transport.send(&out).await {
                Ok(n) => tracing::trace!(bytes = n, target = ?out.target, "frame sent"),
                Err(e) => tracing::warn!(error = %e, target = ?out.target, "send failed"),
            }
        }
    }

    /// React to a newly completed version.
    fn check_update(&mut self) {
        let object = self.deluge.object();
        if object.version() == self.last_version || !object.is_complete() {
            return;
        }
        self.last_version = object.version();
        tracing::info!(
            filename = object.filename(),
            version = self.last_version,
            size = object.size(),
            "object up to date"
        );
        if self.config.loader.autoload {
            self.autoload();
        }
    }

    fn autoload(&mut self) {
        let mut loader = match exec::loader(&self.config.loader) {
            Ok(l) => l,
            Err(e) => {
                tracing::warn!(error = %e, "autoload skipped");
                return;
            }
        };
        match loader.load(self.deluge.object_mut().storage_mut()) {
            Ok(module) => tracing::info!(
                start = format_args!("{:#x}", module.start),
                skipped = module.skipped,
                "autoloaded object"
            ),
            Err(e) => tracing::warn!(code = e.code(), error = %e, "autoload failed"),
        }
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
