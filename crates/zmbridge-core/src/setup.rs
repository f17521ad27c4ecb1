use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::client::{HttpZmClient, ZmApi, ZmError};
use crate::config::{BridgeConfig, ConfigError, CoordinatorConfig, ServerConfig};
use crate::coordinator::{Coordinator, SharedClient};
use crate::entity::{
    build_entities, CommandError, DeviceInfo, EntityCommand, EntityState, ServerContext,
    SharedEntity,
};
use crate::model::ApiShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid username or password")]
    InvalidAuth,
    #[error("cannot connect to server")]
    CannotConnect,
    #[error("unexpected error")]
    Unknown,
}

impl ValidationError {
    pub fn key(&self) -> &'static str {
        match self {
            ValidationError::InvalidAuth => "invalid_auth",
            ValidationError::CannotConnect => "cannot_connect",
            ValidationError::Unknown => "unknown",
        }
    }
}

impl From<ZmError> for ValidationError {
    fn from(err: ZmError) -> Self {
        match err {
            ZmError::Login(_) => ValidationError::InvalidAuth,
            ZmError::Connectivity(_) | ZmError::Protocol(_) => ValidationError::CannotConnect,
            ZmError::Malformed(_) => ValidationError::Unknown,
        }
    }
}

pub async fn validate_connection(config: &ServerConfig) -> Result<(), ValidationError> {
    let client = HttpZmClient::new(config)?;
    validate_client(&client).await
}

pub async fn validate_client(client: &dyn ZmApi) -> Result<(), ValidationError> {
    match client.login().await {
        Ok(true) => Ok(()),
        Ok(false) => Err(ValidationError::InvalidAuth),
        Err(err) => {
            let kind = ValidationError::from(err);
            if kind == ValidationError::Unknown {
                warn!("unexpected error validating connection");
            }
            Err(kind)
        }
    }
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("{host} is not ready: {reason}")]
    NotReady { host: String, reason: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn not_ready(host: &str, reason: impl ToString) -> SetupError {
    SetupError::NotReady {
        host: host.to_string(),
        reason: reason.to_string(),
    }
}

pub struct Server {
    context: Arc<ServerContext>,
    entities: Vec<SharedEntity>,
}

impl Server {
    pub async fn setup(config: &ServerConfig, coordinator: CoordinatorConfig) -> Result<Self, SetupError> {
        let client = HttpZmClient::new(config).map_err(|err| not_ready(&config.host, err))?;
        Self::with_client(config, coordinator, Arc::new(client)).await
    }

    pub async fn with_client(
        config: &ServerConfig,
        coordinator: CoordinatorConfig,
        client: SharedClient,
    ) -> Result<Self, SetupError> {
        let host = config.host.as_str();

        match client.login().await {
            Ok(true) => {}
            Ok(false) => return Err(not_ready(host, "login failed")),
            Err(err) => return Err(not_ready(host, format!("cannot connect: {err}"))),
        }

        let version = match client.server_version().await {
            Ok(version) => version,
            Err(err) => {
                warn!(server = %host, "could not read server version: {err}");
                None
            }
        };
        let shape = ApiShape::from_version(version.as_deref());
        info!(server = %host, version = ?version, shape = ?shape, "detected API shape");

        let monitors = match client.fetch_monitor_list().await {
            Ok(monitors) => monitors,
            Err(err) => {
                error!(server = %host, "error fetching monitors: {err}");
                Vec::new()
            }
        };
        info!(server = %host, monitors = monitors.len(), "discovered monitors");

        let coordinator = Arc::new(Coordinator::new(host, client, monitors.clone(), coordinator));
        let context = Arc::new(ServerContext {
            host: host.to_string(),
            shape,
            options: config.options.clone(),
            coordinator,
            device: DeviceInfo::server(host, version),
        });
        let entities = build_entities(&context, &monitors);
        context
            .coordinator
            .register_event_queries(entities.iter().flat_map(|e| e.event_queries()));

        if !context.coordinator.refresh().await {
            let reason = context
                .coordinator
                .state()
                .last_error
                .unwrap_or_else(|| "first refresh failed".to_string());
            return Err(not_ready(host, reason));
        }

        info!(server = %host, entities = entities.len(), "server set up");
        Ok(Self { context, entities })
    }

    pub fn host(&self) -> &str {
        &self.context.host
    }

    pub fn shape(&self) -> ApiShape {
        self.context.shape
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.context.coordinator
    }

    pub fn entities(&self) -> &[SharedEntity] {
        &self.entities
    }

    pub fn entity(&self, unique_id: &str) -> Option<&SharedEntity> {
        self.entities.iter().find(|e| e.unique_id() == unique_id)
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        let mut devices = vec![self.context.device.clone()];
        for entity in &self.entities {
            if !devices.iter().any(|d| d.identifier == entity.device().identifier) {
                devices.push(entity.device().clone());
            }
        }
        devices
    }

    pub fn render(&self) -> Vec<EntityState> {
        let state = self.context.coordinator.state();
        self.entities.iter().map(|e| e.render(&state)).collect()
    }
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no server configured for host {0}")]
    UnknownHost(String),
    #[error("no entity with id {0}")]
    UnknownEntity(String),
    #[error(transparent)]
    Command(#[from] CommandError),
}

#[derive(Default)]
pub struct Hub {
    servers: BTreeMap<String, Server>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn setup(config: &BridgeConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let coordinator = config.coordinator_config();
        let mut hub = Self::new();
        for server in &config.servers {
            hub.add(Server::setup(server, coordinator.clone()).await?)?;
        }
        Ok(hub)
    }

    pub fn add(&mut self, server: Server) -> Result<(), ConfigError> {
        if self.servers.contains_key(server.host()) {
            return Err(ConfigError::DuplicateHost(server.host().to_string()));
        }
        self.servers.insert(server.host().to_string(), server);
        Ok(())
    }

    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.servers.values()
    }

    pub fn server(&self, host: &str) -> Option<&Server> {
        self.servers.get(host)
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn find_entity(&self, unique_id: &str) -> Option<&SharedEntity> {
        self.servers.values().find_map(|s| s.entity(unique_id))
    }

    pub async fn set_run_state(&self, host: &str, name: &str) -> Result<(), ServiceError> {
        let Some(server) = self.servers.get(host) else {
            error!(host = %host, "invalid server host provided");
            return Err(ServiceError::UnknownHost(host.to_string()));
        };

        let ctx = &server.context;
        ctx.write(
            format!("change run state to {name}"),
            ctx.client().set_active_run_state(name),
        )
        .await?;
        Ok(())
    }

    pub async fn command(&self, unique_id: &str, command: &EntityCommand) -> Result<(), ServiceError> {
        let entity = self
            .find_entity(unique_id)
            .ok_or_else(|| ServiceError::UnknownEntity(unique_id.to_string()))?;
        entity.command(command).await?;
        Ok(())
    }

    pub fn spawn_refresh_loops(&self) -> Vec<JoinHandle<()>> {
        self.servers
            .values()
            .map(|server| {
                let coordinator = server.coordinator().clone();
                tokio::spawn(async move { coordinator.run().await })
            })
            .collect()
    }
}
