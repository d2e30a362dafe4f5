//! Facade over the SQLite store: route records, the usage log, and the
//! persisted global configuration.

use std::collections::BTreeSet;

use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseConnection,
    DbErr, EntityTrait, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use time::OffsetDateTime;

use anyproxy_common::{GlobalConfig, GlobalConfigPatch};

use crate::entities;

#[derive(Clone)]
pub struct RouteStorage {
    db: DatabaseConnection,
}

#[derive(Debug, Clone)]
pub struct RouteInput {
    pub display_name: String,
    pub logical_model: String,
    pub upstream_url: String,
    pub credential: Option<String>,
    pub group_name: Option<String>,
    pub format_tag: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub model: String,
    pub route_id: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    pub success: bool,
    pub error_message: Option<String>,
}

impl RouteStorage {
    pub async fn connect(database_path: &str) -> Result<Self, DbErr> {
        let in_memory = database_path == ":memory:";
        let dsn = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            format!("sqlite://{database_path}?mode=rwc")
        };
        let mut options = sea_orm::ConnectOptions::new(dsn);
        if in_memory {
            // A pooled in-memory database would give every connection its
            // own empty store.
            options.max_connections(1);
        }
        let db = Database::connect(options).await?;
        Ok(Self { db })
    }

    pub async fn connect_in_memory() -> Result<Self, DbErr> {
        Self::connect(":memory:").await
    }

    /// Create missing tables. Existing tables are left alone.
    pub async fn sync_schema(&self) -> Result<(), DbErr> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);

        let mut routes = schema.create_table_from_entity(entities::Routes);
        routes.if_not_exists();
        self.db.execute(backend.build(&routes)).await?;

        let mut usage = schema.create_table_from_entity(entities::UsageLogs);
        usage.if_not_exists();
        self.db.execute(backend.build(&usage)).await?;

        let mut config = schema.create_table_from_entity(entities::GlobalConfig);
        config.if_not_exists();
        self.db.execute(backend.build(&config)).await?;

        Ok(())
    }

    // ---- Routes ----

    pub async fn list_routes(&self) -> Result<Vec<entities::routes::Model>, DbErr> {
        entities::Routes::find()
            .order_by_asc(entities::routes::Column::Id)
            .all(&self.db)
            .await
    }

    pub async fn get_route(&self, id: i64) -> Result<Option<entities::routes::Model>, DbErr> {
        entities::Routes::find_by_id(id).one(&self.db).await
    }

    /// Enabled routes serving a logical model; the router load-balances over
    /// these.
    pub async fn routes_for_model(
        &self,
        logical_model: &str,
    ) -> Result<Vec<entities::routes::Model>, DbErr> {
        entities::Routes::find()
            .filter(entities::routes::Column::LogicalModel.eq(logical_model))
            .filter(entities::routes::Column::Enabled.eq(true))
            .all(&self.db)
            .await
    }

    pub async fn available_models(&self) -> Result<Vec<String>, DbErr> {
        let routes = entities::Routes::find()
            .filter(entities::routes::Column::Enabled.eq(true))
            .all(&self.db)
            .await?;
        let names: BTreeSet<String> = routes
            .into_iter()
            .map(|route| route.logical_model)
            .collect();
        Ok(names.into_iter().collect())
    }

    pub async fn insert_route(
        &self,
        input: RouteInput,
    ) -> Result<entities::routes::Model, DbErr> {
        let now = OffsetDateTime::now_utc();
        let model = entities::routes::ActiveModel {
            id: ActiveValue::NotSet,
            display_name: ActiveValue::Set(input.display_name),
            logical_model: ActiveValue::Set(input.logical_model),
            upstream_url: ActiveValue::Set(input.upstream_url),
            credential: ActiveValue::Set(input.credential),
            group_name: ActiveValue::Set(input.group_name),
            format_tag: ActiveValue::Set(input.format_tag),
            enabled: ActiveValue::Set(input.enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        model.insert(&self.db).await
    }

    pub async fn update_route(
        &self,
        id: i64,
        input: RouteInput,
    ) -> Result<Option<entities::routes::Model>, DbErr> {
        let Some(existing) = self.get_route(id).await? else {
            return Ok(None);
        };
        let mut model: entities::routes::ActiveModel = existing.into();
        model.display_name = ActiveValue::Set(input.display_name);
        model.logical_model = ActiveValue::Set(input.logical_model);
        model.upstream_url = ActiveValue::Set(input.upstream_url);
        model.credential = ActiveValue::Set(input.credential);
        model.group_name = ActiveValue::Set(input.group_name);
        model.format_tag = ActiveValue::Set(input.format_tag);
        model.enabled = ActiveValue::Set(input.enabled);
        model.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
        Ok(Some(model.update(&self.db).await?))
    }

    pub async fn delete_route(&self, id: i64) -> Result<bool, DbErr> {
        let result = entities::Routes::delete_by_id(id).exec(&self.db).await?;
        Ok(result.rows_affected > 0)
    }

    // ---- Usage log ----

    pub async fn record_usage(&self, record: UsageRecord) -> Result<(), DbErr> {
        let model = entities::usage_logs::ActiveModel {
            id: ActiveValue::NotSet,
            model: ActiveValue::Set(record.model),
            route_id: ActiveValue::Set(record.route_id),
            prompt_tokens: ActiveValue::Set(record.prompt_tokens),
            completion_tokens: ActiveValue::Set(record.completion_tokens),
            total_tokens: ActiveValue::Set(record.total_tokens),
            success: ActiveValue::Set(record.success),
            error_message: ActiveValue::Set(record.error_message),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        model.insert(&self.db).await?;
        Ok(())
    }

    pub async fn recent_usage(
        &self,
        limit: u64,
    ) -> Result<Vec<entities::usage_logs::Model>, DbErr> {
        entities::UsageLogs::find()
            .order_by_desc(entities::usage_logs::Column::Id)
            .limit(limit)
            .all(&self.db)
            .await
    }

    // ---- Global config ----

    /// Stored configuration as a patch layer (CLI flags overlay it).
    pub async fn load_config(&self) -> Result<Option<GlobalConfigPatch>, DbErr> {
        let row = entities::GlobalConfig::find()
            .order_by_asc(entities::global_config::Column::Id)
            .one(&self.db)
            .await?;
        Ok(row.map(|row| GlobalConfigPatch {
            bind_host: Some(row.bind_host),
            bind_port: Some(row.bind_port as u16),
            local_credential: Some(row.local_credential),
            database_path: None,
            redirect_enabled: Some(row.redirect_enabled),
            redirect_keyword: Some(row.redirect_keyword),
            redirect_target_model: Some(row.redirect_target_model),
        }))
    }

    pub async fn save_config(&self, config: &GlobalConfig) -> Result<(), DbErr> {
        let now = OffsetDateTime::now_utc();
        let existing = entities::GlobalConfig::find()
            .order_by_asc(entities::global_config::Column::Id)
            .one(&self.db)
            .await?;

        match existing {
            Some(row) => {
                let mut model: entities::global_config::ActiveModel = row.into();
                model.bind_host = ActiveValue::Set(config.bind_host.clone());
                model.bind_port = ActiveValue::Set(config.bind_port as i32);
                model.local_credential = ActiveValue::Set(config.local_credential.clone());
                model.redirect_enabled = ActiveValue::Set(config.redirect_enabled);
                model.redirect_keyword = ActiveValue::Set(config.redirect_keyword.clone());
                model.redirect_target_model =
                    ActiveValue::Set(config.redirect_target_model.clone());
                model.updated_at = ActiveValue::Set(now);
                model.update(&self.db).await?;
            }
            None => {
                let model = entities::global_config::ActiveModel {
                    id: ActiveValue::NotSet,
                    bind_host: ActiveValue::Set(config.bind_host.clone()),
                    bind_port: ActiveValue::Set(config.bind_port as i32),
                    local_credential: ActiveValue::Set(config.local_credential.clone()),
                    redirect_enabled: ActiveValue::Set(config.redirect_enabled),
                    redirect_keyword: ActiveValue::Set(config.redirect_keyword.clone()),
                    redirect_target_model: ActiveValue::Set(
                        config.redirect_target_model.clone(),
                    ),
                    updated_at: ActiveValue::Set(now),
                };
                model.insert(&self.db).await?;
            }
        }
        Ok(())
    }
}
