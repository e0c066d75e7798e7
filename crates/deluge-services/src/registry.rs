//! Node-wide object registry.
//!
//! Hands out object ids and enforces that a node disseminates one object at
//! a time.

use std::time::Instant;

use rand::rngs::StdRng;

use deluge_core::config::ProtocolConfig;
use deluge_core::Geometry;

use crate::error::DelugeError;
use crate::object::DisseminationObject;
use crate::protocol::{Deluge, ProtocolParams};
use crate::storage::Storage;

#[derive(Debug, Default)]
pub struct DelugeRegistry {
    next_object_id: u8,
}

impl DelugeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start disseminating `storage`, which holds the complete object at `version`.
    pub fn disseminate<S: Storage>(
        &mut self,
        storage: S,
        filename: &str,
        version: u8,
        config: &ProtocolConfig,
        rng: StdRng,
        now: Instant,
    ) -> Result<Deluge<S>, DelugeError> {
        let object_id = self.claim()?;
        let object = DisseminationObject::seeded(
            storage,
            filename,
            object_id,
            version,
            Geometry::from(config.variant),
        )?;
        tracing::info!(
            filename,
            object_id,
            version,
            size = object.size(),
            pages = object.page_count(),
            "disseminating object"
        );
        Ok(Self::start(object, config, rng, now))
    }

    /// Start with nothing and wait for a neighbour's profile.
    pub fn join<S: Storage>(
        &mut self,
        storage: S,
        filename: &str,
        config: &ProtocolConfig,
        rng: StdRng,
        now: Instant,
    ) -> Result<Deluge<S>, DelugeError> {
        let object_id = self.claim()?;
        let geometry = Geometry::from(config.variant);
        let object = DisseminationObject::empty(storage, filename, object_id, geometry);
        tracing::info!(filename, object_id, "waiting for object");
        Ok(Self::start(object, config, rng, now))
    }

    fn start<S: Storage>(
        object: DisseminationObject<S>,
        config: &ProtocolConfig,
        rng: StdRng,
        now: Instant,
    ) -> Deluge<S> {
        let mut deluge = Deluge::new(object, ProtocolParams::from(config), rng);
        deluge.start_round(now);
        deluge
    }

    fn claim(&mut self) -> Result<u8, DelugeError> {
        if self.next_object_id > 0 {
            return Err(DelugeError::AlreadyDisseminating {
                object_id: self.next_object_id - 1,
            });
        }
        let id = self.next_object_id;
        self.next_object_id += 1;
        Ok(id)
    }
}
