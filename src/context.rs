//! Application context
//!
//! Owns every long-lived component. Binaries build one with `open`, hand it
//! to the CLI or the HTTP layer, and `close` it on the way out.

use crate::cache::{Cache, CacheStats};
use crate::config::ResearchConfig;
use crate::error::ResearchError;
use crate::executor::Executor;
use crate::llm::{GeminiClient, LanguageModel};
use crate::models::Session;
use crate::planner::{GeminiPlanner, Planner, RuleBasedPlanner};
use crate::providers::{FinancialDatasetsProvider, ProviderRegistry};
use crate::reflector::ReflectorLoop;
use crate::store::{InMemorySessionStore, SessionLeases, SessionStore, SqliteSessionStore};
use crate::synthesizer::{AnswerComposer, GeminiComposer, Synthesizer, TemplateComposer};
use crate::validator::create_default_validator;
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Out-of-band operations; never planned or dispatched as tasks.
#[derive(Debug, Clone, PartialEq)]
pub enum AdminCommand {
    ListSessions { limit: usize },
    CacheStats,
    CacheClean,
    CacheClear,
    SwitchModel(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdminReply {
    Sessions { sessions: Vec<Session> },
    CacheStats { stats: CacheStats },
    CachePurged { removed: usize },
    ModelSwitched { previous: String, current: String },
}

pub struct AppContext {
    config: ResearchConfig,
    store: Arc<dyn SessionStore>,
    cache: Arc<Cache>,
    llm: Option<Arc<dyn LanguageModel>>,
    leases: SessionLeases,
    reflector: Arc<ReflectorLoop>,
}

impl AppContext {
    pub async fn open(config: ResearchConfig) -> Result<Self> {
        config.validate()?;

        let store: Arc<dyn SessionStore> = if config.database_url == "memory" {
            Arc::new(InMemorySessionStore::new())
        } else {
            Arc::new(SqliteSessionStore::open(&config.database_url).await?)
        };

        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FinancialDatasetsProvider::from_config(&config)?));
        info!(providers = ?registry.provider_names(), "provider registry built");

        let llm: Option<Arc<dyn LanguageModel>> = match GeminiClient::from_config(&config)? {
            Some(client) => Some(Arc::new(client)),
            None => None,
        };

        let context = Self::assemble(config, store, registry, llm);
        info!(
            database = %context.config.database_url,
            cache = context.cache.is_enabled(),
            cache_dir = %context.cache.dir().display(),
            llm = context.llm.is_some(),
            "application context opened"
        );
        Ok(context)
    }

    /// Wires the loop from already-built parts.
    pub fn assemble(
        config: ResearchConfig,
        store: Arc<dyn SessionStore>,
        registry: ProviderRegistry,
        llm: Option<Arc<dyn LanguageModel>>,
    ) -> Self {
        let cache = Arc::new(Cache::from_settings(&config.cache));
        let leases = SessionLeases::new();

        let planner: Arc<dyn Planner> = match &llm {
            Some(llm) => Arc::new(GeminiPlanner::new(Arc::clone(llm))),
            None => Arc::new(RuleBasedPlanner::new()),
        };
        let composer: Arc<dyn AnswerComposer> = match &llm {
            Some(llm) => Arc::new(GeminiComposer::new(Arc::clone(llm))),
            None => Arc::new(TemplateComposer),
        };

        let executor = Arc::new(Executor::new(
            Arc::new(registry),
            Arc::clone(&cache),
            Arc::clone(&store),
            &config.executor,
        ));
        let synthesizer = Arc::new(Synthesizer::new(Arc::clone(&store), composer));

        let reflector = Arc::new(ReflectorLoop::new(
            planner,
            executor,
            Arc::new(create_default_validator()),
            synthesizer,
            Arc::clone(&store),
            leases.clone(),
            config.limits.clone(),
        ));

        Self {
            config,
            store,
            cache,
            llm,
            leases,
            reflector,
        }
    }

    pub fn config(&self) -> &ResearchConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        Arc::clone(&self.store)
    }

    pub fn reflector(&self) -> Arc<ReflectorLoop> {
        Arc::clone(&self.reflector)
    }

    pub fn leases(&self) -> &SessionLeases {
        &self.leases
    }

    pub async fn admin(&self, command: AdminCommand) -> Result<AdminReply> {
        info!(command = ?command, "admin command");

        match command {
            AdminCommand::ListSessions { limit } => Ok(AdminReply::Sessions {
                sessions: self.store.list_recent(limit).await?,
            }),
            AdminCommand::CacheStats => Ok(AdminReply::CacheStats {
                stats: self.cache.stats().await,
            }),
            AdminCommand::CacheClean => Ok(AdminReply::CachePurged {
                removed: self.cache.purge_expired().await,
            }),
            AdminCommand::CacheClear => Ok(AdminReply::CachePurged {
                removed: self.cache.purge_all().await,
            }),
            AdminCommand::SwitchModel(model) => {
                let model = model.trim();
                if model.is_empty() {
                    return Err(ResearchError::Config("model name is empty".to_string()));
                }
                let llm = self.llm.as_ref().ok_or_else(|| {
                    ResearchError::Config("no language model is configured".to_string())
                })?;
                let previous = llm.model();
                llm.set_model(model);
                Ok(AdminReply::ModelSwitched {
                    previous,
                    current: llm.model(),
                })
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.store.close().await?;
        info!("application context closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::models::CapabilitySet;
    use crate::testing::{ScriptedLlm, ScriptedProvider};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn context(tmp: &TempDir, llm: Option<Arc<dyn LanguageModel>>) -> AppContext {
        let config = ResearchConfig {
            database_url: "memory".to_string(),
            cache: CacheSettings {
                enabled: true,
                dir: tmp.path().to_path_buf(),
                ttl: Duration::from_secs(3600),
            },
            ..ResearchConfig::default()
        };
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(ScriptedProvider::new(CapabilitySet::all())));
        AppContext::assemble(config, Arc::new(InMemorySessionStore::new()), registry, llm)
    }

    #[tokio::test]
    async fn test_open_with_memory_store() {
        let tmp = TempDir::new().unwrap();
        let config = ResearchConfig {
            database_url: "memory".to_string(),
            cache: CacheSettings {
                enabled: false,
                dir: tmp.path().to_path_buf(),
                ttl: Duration::from_secs(60),
            },
            ..ResearchConfig::default()
        };

        let ctx = AppContext::open(config).await.unwrap();
        let reply = ctx.admin(AdminCommand::ListSessions { limit: 5 }).await.unwrap();
        assert!(matches!(reply, AdminReply::Sessions { sessions } if sessions.is_empty()));
        tokio_test::assert_ok!(ctx.close().await);
    }

    #[tokio::test]
    async fn test_cache_admin_after_research() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp, None);

        ctx.reflector()
            .start("Apple Q4 revenue", &CancellationToken::new())
            .await
            .unwrap();

        match ctx.admin(AdminCommand::CacheStats).await.unwrap() {
            AdminReply::CacheStats { stats } => assert_eq!(stats.valid, 1),
            other => panic!("unexpected reply {:?}", other),
        }
        match ctx.admin(AdminCommand::CacheClear).await.unwrap() {
            AdminReply::CachePurged { removed } => assert_eq!(removed, 1),
            other => panic!("unexpected reply {:?}", other),
        }
        match ctx.admin(AdminCommand::ListSessions { limit: 10 }).await.unwrap() {
            AdminReply::Sessions { sessions } => assert_eq!(sessions.len(), 1),
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_switch_model() {
        let tmp = TempDir::new().unwrap();

        let without = context(&tmp, None);
        assert!(matches!(
            without.admin(AdminCommand::SwitchModel("gemini-2.5-pro".into())).await,
            Err(ResearchError::Config(_))
        ));

        let llm: Arc<dyn LanguageModel> = Arc::new(ScriptedLlm::new(vec![]));
        let with = context(&tmp, Some(llm.clone()));
        let reply = with
            .admin(AdminCommand::SwitchModel("gemini-2.5-pro".into()))
            .await
            .unwrap();
        assert!(matches!(
            reply,
            AdminReply::ModelSwitched { ref previous, ref current }
                if previous == "scripted-model" && current == "gemini-2.5-pro"
        ));
        assert_eq!(llm.model(), "gemini-2.5-pro");
    }
}
