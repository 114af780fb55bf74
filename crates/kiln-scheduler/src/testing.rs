//! Shared fixtures for the scheduler tests.

use chrono::Utc;
use kiln_config::SystemConfig;
use kiln_core::auth::{Caller, Consumer, Identity, generate_token, hash_token};
use kiln_core::hatchery::{HatcheryRegistration, RegisteredHatchery};
use kiln_core::job::{Job, JobSource, NewJob};
use kiln_core::worker::RegistrationForm;
use kiln_core::{ConsumerId, GroupId};
use kiln_db::Store;

use crate::context::DispatchContext;
use crate::registry::RegisteredWorker;

/// One group, its registration token and a context over a memory store.
pub(crate) struct Fixture {
    pub ctx: DispatchContext,
    pub group: GroupId,
    pub group_token: String,
}

impl Fixture {
    pub async fn new() -> Self {
        Self::with_config(SystemConfig::default()).await
    }

    /// A fixture whose group is the shared infrastructure group.
    pub async fn new_shared() -> Self {
        let group = GroupId::new();
        let config = SystemConfig {
            shared_group: Some(group),
            ..SystemConfig::default()
        };
        let ctx = DispatchContext::new(Store::memory(), config);
        Self::in_group(ctx, group).await
    }

    pub async fn with_config(config: SystemConfig) -> Self {
        Self::with_store(DispatchContext::new(Store::memory(), config)).await
    }

    /// Another group sharing the same store.
    pub async fn with_store(ctx: DispatchContext) -> Self {
        Self::in_group(ctx, GroupId::new()).await
    }

    async fn in_group(ctx: DispatchContext, group: GroupId) -> Self {
        let group_token = generate_token();
        ctx.store
            .consumers
            .insert_group_token(&hash_token(&group_token), group)
            .await
            .unwrap();
        Self {
            ctx,
            group,
            group_token,
        }
    }

    pub fn service(&self) -> Caller {
        Caller {
            consumer_id: ConsumerId::new(),
            identity: Identity::Service {
                name: "engine".to_string(),
            },
            issuer: "test".to_string(),
        }
    }

    pub fn admin(&self) -> Caller {
        Caller {
            consumer_id: ConsumerId::new(),
            identity: Identity::User {
                username: "admin".to_string(),
                admin: true,
                groups: vec![],
            },
            issuer: "test".to_string(),
        }
    }

    /// Store a credential and return its token.
    pub async fn issue(&self, identity: Identity) -> String {
        let token = generate_token();
        let consumer = Consumer {
            id: ConsumerId::new(),
            identity,
            issuer: "test".to_string(),
            expires_at: None,
            created_at: Utc::now(),
        };
        self.ctx
            .store
            .consumers
            .insert(&consumer, &hash_token(&token))
            .await
            .unwrap();
        token
    }

    pub fn form(&self, name: &str) -> RegistrationForm {
        RegistrationForm {
            name: name.to_string(),
            token: self.group_token.clone(),
            version: "1.2.0".to_string(),
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            ..RegistrationForm::default()
        }
    }

    /// Register a worker (status Checking) and authenticate as it.
    pub async fn worker(&self, name: &str) -> (Caller, RegisteredWorker) {
        self.register(self.form(name)).await
    }

    pub async fn register(&self, form: RegistrationForm) -> (Caller, RegisteredWorker) {
        let registered = self.ctx.register_worker(form).await.unwrap();
        let caller = self.ctx.authenticate(&registered.token).await.unwrap();
        (caller, registered)
    }

    pub async fn hatchery(&self, name: &str) -> (Caller, RegisteredHatchery) {
        let registered = self
            .ctx
            .register_hatchery(HatcheryRegistration {
                name: name.to_string(),
                token: self.group_token.clone(),
            })
            .await
            .unwrap();
        let caller = self.ctx.authenticate(&registered.uid).await.unwrap();
        (caller, registered)
    }

    pub fn new_job(&self) -> NewJob {
        NewJob {
            source: JobSource::WorkflowNodeRun,
            name: "build".to_string(),
            group_id: self.group,
            project_key: "PROJ".to_string(),
            application: Some("api".to_string()),
            environment: None,
            requirements: vec![],
        }
    }

    pub async fn job(&self) -> Job {
        self.ctx.enqueue(&self.service(), self.new_job()).await.unwrap()
    }
}
