//! In-process metadata store.
//!
//! Keeps every entity in `RwLock`'d maps. This is the store used by the
//! test suite and by single-node deployments that treat schedule and
//! webhook definitions as operator-provisioned configuration.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::{
    AppWebhook, Application, EntityKind, MetaError, MetaResult, MetadataStore, Schedule,
    Subscription,
};

/// `MetadataStore` backed by in-process maps.
#[derive(Debug, Default)]
pub struct MemoryMetadataStore {
    applications: RwLock<HashMap<String, Application>>,
    webhooks: RwLock<HashMap<String, AppWebhook>>,
    subscriptions: RwLock<HashMap<String, Subscription>>,
    schedules: RwLock<HashMap<String, Schedule>>,
}

impl MemoryMetadataStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn create_application(&self, app: Application) -> MetaResult<Application> {
        let mut apps = self.applications.write();
        if apps.contains_key(&app.id) {
            return Err(MetaError::Conflict(format!(
                "application {} already exists",
                app.id
            )));
        }
        apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn application(&self, id: &str) -> MetaResult<Application> {
        self.applications
            .read()
            .get(id)
            .cloned()
            .ok_or(MetaError::NotFound(EntityKind::Application))
    }

    async fn application_by_api_key(&self, api_key: &str) -> MetaResult<Application> {
        self.applications
            .read()
            .values()
            .find(|app| app.api_key == api_key)
            .cloned()
            .ok_or(MetaError::NotFound(EntityKind::Application))
    }

    async fn list_applications(&self) -> MetaResult<Vec<Application>> {
        let mut apps: Vec<_> = self.applications.read().values().cloned().collect();
        apps.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(apps)
    }

    async fn update_application(&self, app: Application) -> MetaResult<Application> {
        let mut apps = self.applications.write();
        if !apps.contains_key(&app.id) {
            return Err(MetaError::NotFound(EntityKind::Application));
        }
        apps.insert(app.id.clone(), app.clone());
        Ok(app)
    }

    async fn delete_application(&self, id: &str) -> MetaResult<()> {
        self.applications
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or(MetaError::NotFound(EntityKind::Application))
    }

    async fn create_webhook(&self, webhook: AppWebhook) -> MetaResult<AppWebhook> {
        self.webhooks
            .write()
            .insert(webhook.id.clone(), webhook.clone());
        Ok(webhook)
    }

    async fn webhook(&self, id: &str) -> MetaResult<AppWebhook> {
        self.webhooks
            .read()
            .get(id)
            .cloned()
            .ok_or(MetaError::NotFound(EntityKind::Webhook))
    }

    async fn list_webhooks(&self, application_id: Option<&str>) -> MetaResult<Vec<AppWebhook>> {
        let mut hooks: Vec<_> = self
            .webhooks
            .read()
            .values()
            .filter(|hook| application_id.is_none_or(|app| hook.application_id == app))
            .cloned()
            .collect();
        hooks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(hooks)
    }

    async fn update_webhook(&self, webhook: AppWebhook) -> MetaResult<AppWebhook> {
        let mut hooks = self.webhooks.write();
        if !hooks.contains_key(&webhook.id) {
            return Err(MetaError::NotFound(EntityKind::Webhook));
        }
        hooks.insert(webhook.id.clone(), webhook.clone());
        Ok(webhook)
    }

    async fn delete_webhook(&self, id: &str) -> MetaResult<()> {
        self.webhooks
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or(MetaError::NotFound(EntityKind::Webhook))
    }

    async fn record_webhook_success(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> MetaResult<AppWebhook> {
        let mut hooks = self.webhooks.write();
        let hook = hooks
            .get_mut(id)
            .ok_or(MetaError::NotFound(EntityKind::Webhook))?;
        hook.register_success(at);
        Ok(hook.clone())
    }

    async fn record_webhook_failure(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> MetaResult<AppWebhook> {
        let mut hooks = self.webhooks.write();
        let hook = hooks
            .get_mut(id)
            .ok_or(MetaError::NotFound(EntityKind::Webhook))?;
        hook.register_failure(at);
        Ok(hook.clone())
    }

    async fn create_subscription(&self, sub: Subscription) -> MetaResult<Subscription> {
        self.subscriptions
            .write()
            .insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn subscription(&self, id: &str) -> MetaResult<Subscription> {
        self.subscriptions
            .read()
            .get(id)
            .cloned()
            .ok_or(MetaError::NotFound(EntityKind::Subscription))
    }

    async fn list_subscriptions(
        &self,
        application_id: Option<&str>,
    ) -> MetaResult<Vec<Subscription>> {
        let mut subs: Vec<_> = self
            .subscriptions
            .read()
            .values()
            .filter(|sub| application_id.is_none_or(|app| sub.application_id == app))
            .cloned()
            .collect();
        subs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(subs)
    }

    async fn update_subscription(&self, sub: Subscription) -> MetaResult<Subscription> {
        let mut subs = self.subscriptions.write();
        if !subs.contains_key(&sub.id) {
            return Err(MetaError::NotFound(EntityKind::Subscription));
        }
        subs.insert(sub.id.clone(), sub.clone());
        Ok(sub)
    }

    async fn delete_subscription(&self, id: &str) -> MetaResult<()> {
        self.subscriptions
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or(MetaError::NotFound(EntityKind::Subscription))
    }

    async fn record_subscription_trigger(
        &self,
        id: &str,
        at: DateTime<Utc>,
    ) -> MetaResult<Subscription> {
        let mut subs = self.subscriptions.write();
        let sub = subs
            .get_mut(id)
            .ok_or(MetaError::NotFound(EntityKind::Subscription))?;
        sub.trigger_count = sub.trigger_count.saturating_add(1);
        sub.last_triggered_at = Some(at);
        sub.updated_at = at;
        Ok(sub.clone())
    }

    async fn create_schedule(&self, schedule: Schedule) -> MetaResult<Schedule> {
        let mut schedules = self.schedules.write();
        if schedules.values().any(|s| s.name == schedule.name) {
            return Err(MetaError::Conflict(format!(
                "schedule name {} already exists",
                schedule.name
            )));
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn schedule(&self, id: &str) -> MetaResult<Schedule> {
        self.schedules
            .read()
            .get(id)
            .cloned()
            .ok_or(MetaError::NotFound(EntityKind::Schedule))
    }

    async fn list_schedules(&self) -> MetaResult<Vec<Schedule>> {
        let mut schedules: Vec<_> = self.schedules.read().values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(schedules)
    }

    async fn update_schedule(&self, schedule: Schedule) -> MetaResult<Schedule> {
        let mut schedules = self.schedules.write();
        if !schedules.contains_key(&schedule.id) {
            return Err(MetaError::NotFound(EntityKind::Schedule));
        }
        if schedules
            .values()
            .any(|s| s.id != schedule.id && s.name == schedule.name)
        {
            return Err(MetaError::Conflict(format!(
                "schedule name {} already exists",
                schedule.name
            )));
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn delete_schedule(&self, id: &str) -> MetaResult<()> {
        self.schedules
            .write()
            .remove(id)
            .map(|_| ())
            .ok_or(MetaError::NotFound(EntityKind::Schedule))
    }
}
