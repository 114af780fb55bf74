//! Hatchery registration and heartbeats.

use chrono::Utc;
use kiln_core::auth::{Caller, Consumer, Identity, generate_token, hash_token};
use kiln_core::hatchery::{Hatchery, HatcheryRegistration, RegisteredHatchery};
use kiln_core::worker::validate_name;
use kiln_core::{ConsumerId, Error, HatcheryId, Result};
use tracing::{debug, info};

use crate::context::DispatchContext;

impl DispatchContext {
    pub async fn register_hatchery(&self, registration: HatcheryRegistration) -> Result<RegisteredHatchery> {
        validate_name("hatchery", &registration.name)?;
        let group_id = self
            .store
            .consumers
            .group_for_token(&hash_token(&registration.token))
            .await?
            .ok_or_else(|| Error::Unauthorized("invalid registration token".to_string()))?;

        let now = Utc::now();
        let hatchery = Hatchery {
            id: HatcheryId::new(),
            name: registration.name,
            group_id,
            consumer_id: ConsumerId::new(),
            last_beat: now,
            created_at: now,
        };
        let uid = generate_token();
        let consumer = Consumer {
            id: hatchery.consumer_id,
            identity: Identity::Hatchery {
                hatchery_id: hatchery.id,
                group_id,
            },
            issuer: "group-token".to_string(),
            expires_at: None,
            created_at: now,
        };

        self.store
            .hatcheries
            .register(&hatchery, &consumer, &hash_token(&uid))
            .await?;

        info!(hatchery_id = %hatchery.id, hatchery = %hatchery.name, group_id = %group_id, "Hatchery registered");
        Ok(RegisteredHatchery { hatchery, uid })
    }

    /// A hatchery may only heartbeat for itself.
    pub async fn hatchery_heartbeat(&self, caller: &Caller, id: HatcheryId) -> Result<Hatchery> {
        if caller.hatchery_id()? != id {
            return Err(Error::Forbidden(
                "a hatchery can only refresh itself".to_string(),
            ));
        }
        let hatchery = self.store.hatcheries.heartbeat(id, Utc::now()).await?;
        debug!(hatchery = %hatchery.name, "Hatchery heartbeat");
        Ok(hatchery)
    }
}
