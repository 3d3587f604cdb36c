use sqlx::{Executor, QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    model::{unix_now, LifecycleStatus, ResourceRecord, ServiceBinding},
    Error, Result,
};

use super::{decode_blob, ensure_current, finish, push_status_set, Filter, Store};

const BINDING_COLUMNS: &str = "b.id, b.name, b.cluster_name, b.version, b.service_name, \
    b.service_id, b.status, b.error_message, b.workloads, b.permissions, b.crd, \
    b.capability_plugin, b.process_time, b.create_time, b.update_time";

const BINDING_FILTERS: &[&str] = &[
    "id",
    "name",
    "cluster_name",
    "version",
    "service_name",
    "service_id",
    "status",
];

#[derive(sqlx::FromRow)]
struct BindingRow {
    id: String,
    name: String,
    cluster_name: String,
    version: String,
    service_name: String,
    service_id: String,
    status: String,
    error_message: String,
    workloads: String,
    permissions: String,
    crd: String,
    capability_plugin: String,
    process_time: i64,
    create_time: i64,
    update_time: i64,
}

impl TryFrom<BindingRow> for ServiceBinding {
    type Error = Error;

    fn try_from(row: BindingRow) -> Result<Self> {
        Ok(Self {
            status: row.status.parse()?,
            workloads: decode_blob(&row.workloads)?,
            permissions: decode_blob(&row.permissions)?,
            crd: decode_blob(&row.crd)?,
            capability_plugin: decode_blob(&row.capability_plugin)?,
            id: row.id,
            name: row.name,
            cluster_name: row.cluster_name,
            version: row.version,
            service_name: row.service_name,
            service_id: row.service_id,
            message: row.error_message,
            process_time: row.process_time,
            create_time: row.create_time,
            update_time: row.update_time,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ResourceRow {
    id: String,
    service_binding_id: String,
    kind: String,
    group_name: String,
    api_version: String,
    plural: String,
    create_time: i64,
    update_time: i64,
}

impl From<ResourceRow> for ResourceRecord {
    fn from(row: ResourceRow) -> Self {
        Self {
            id: row.id,
            service_binding_id: row.service_binding_id,
            kind: row.kind,
            group: row.group_name,
            api_version: row.api_version,
            plural: row.plural,
            create_time: row.create_time,
            update_time: row.update_time,
        }
    }
}

/// Blob columns hold canonical JSON; a missing plugin is stored as an empty string.
struct BindingBlobs {
    workloads: String,
    permissions: String,
    crd: String,
    capability_plugin: String,
}

impl BindingBlobs {
    fn encode(binding: &ServiceBinding) -> Result<Self> {
        Ok(Self {
            workloads: serde_json::to_string(&binding.workloads)?,
            permissions: serde_json::to_string(&binding.permissions)?,
            crd: serde_json::to_string(&binding.crd)?,
            capability_plugin: match &binding.capability_plugin {
                Some(plugin) => serde_json::to_string(plugin)?,
                None => String::new(),
            },
        })
    }
}

pub(super) async fn select_resources<'e, E>(executor: E, binding_id: &str) -> Result<Vec<ResourceRecord>>
where
    E: Executor<'e, Database = Sqlite>,
{
    let rows: Vec<ResourceRow> = sqlx::query_as(
        "SELECT id, service_binding_id, kind, group_name, api_version, plural, create_time, \
         update_time FROM resource WHERE service_binding_id = ? ORDER BY create_time, id",
    )
    .bind(binding_id)
    .fetch_all(executor)
    .await?;
    Ok(rows.into_iter().map(ResourceRecord::from).collect())
}

async fn insert_binding(
    conn: &mut SqliteConnection,
    binding: &ServiceBinding,
    resources: &[ResourceRecord],
) -> Result<()> {
    let blobs = BindingBlobs::encode(binding)?;
    sqlx::query(
        "INSERT INTO service_binding (id, name, cluster_name, version, service_name, service_id, \
         status, error_message, workloads, permissions, crd, capability_plugin, process_time, \
         create_time, update_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&binding.id)
    .bind(&binding.name)
    .bind(&binding.cluster_name)
    .bind(&binding.version)
    .bind(&binding.service_name)
    .bind(&binding.service_id)
    .bind(binding.status.as_str())
    .bind(&binding.message)
    .bind(&blobs.workloads)
    .bind(&blobs.permissions)
    .bind(&blobs.crd)
    .bind(&blobs.capability_plugin)
    .bind(binding.process_time)
    .bind(binding.create_time)
    .bind(binding.update_time)
    .execute(&mut *conn)
    .await?;

    for resource in resources {
        sqlx::query(
            "INSERT INTO resource (id, service_binding_id, kind, group_name, api_version, plural, \
             create_time, update_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&resource.id)
        .bind(&resource.service_binding_id)
        .bind(&resource.kind)
        .bind(&resource.group)
        .bind(&resource.api_version)
        .bind(&resource.plural)
        .bind(resource.create_time)
        .bind(resource.update_time)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn write_binding<'e, E>(executor: E, binding: &ServiceBinding) -> Result<()>
where
    E: Executor<'e, Database = Sqlite>,
{
    let blobs = BindingBlobs::encode(binding)?;
    let done = sqlx::query(
        "UPDATE service_binding SET version = ?, service_name = ?, service_id = ?, \
         status = ?, error_message = ?, workloads = ?, permissions = ?, crd = ?, \
         capability_plugin = ?, process_time = ?, update_time = ? WHERE id = ?",
    )
    .bind(&binding.version)
    .bind(&binding.service_name)
    .bind(&binding.service_id)
    .bind(binding.status.as_str())
    .bind(&binding.message)
    .bind(&blobs.workloads)
    .bind(&blobs.permissions)
    .bind(&blobs.crd)
    .bind(&blobs.capability_plugin)
    .bind(binding.process_time)
    .bind(binding.update_time)
    .bind(&binding.id)
    .execute(executor)
    .await?;
    if done.rows_affected() == 0 {
        return Err(Error::NotFound(format!("service binding {}", binding.name)));
    }
    Ok(())
}

async fn upgrade_rows(
    conn: &mut SqliteConnection,
    binding: &ServiceBinding,
    resources: &[ResourceRecord],
) -> Result<()> {
    write_binding(&mut *conn, binding).await?;
    replace_resource_rows(conn, &binding.id, resources).await
}

async fn delete_binding_rows(conn: &mut SqliteConnection, id: &str) -> Result<()> {
    sqlx::query("DELETE FROM resource WHERE service_binding_id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM service_binding WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

impl Store {
    /// Insert a binding and its resource rows atomically, assigning ids and timestamps.
    pub async fn create_binding(
        &self,
        binding: &mut ServiceBinding,
        resources: &mut [ResourceRecord],
    ) -> Result<()> {
        let now = unix_now();
        if binding.id.is_empty() {
            binding.id = self.next_id();
        }
        binding.create_time = now;
        binding.update_time = now;
        for resource in resources.iter_mut() {
            if resource.id.is_empty() {
                resource.id = self.next_id();
            }
            resource.service_binding_id = binding.id.clone();
            resource.create_time = now;
            resource.update_time = now;
        }

        let mut tx = self.begin().await?;
        let result = insert_binding(&mut tx, binding, resources).await;
        finish(tx, result).await
    }

    pub async fn get_binding(&self, filter: &Filter) -> Result<Option<ServiceBinding>> {
        Ok(self.list_bindings(filter).await?.into_iter().next())
    }

    pub async fn get_binding_by_id(&self, id: &str) -> Result<Option<ServiceBinding>> {
        self.get_binding(&Filter::new().eq("id", id)).await
    }

    /// Look a binding up by its natural key.
    pub async fn get_binding_by_name(
        &self,
        name: &str,
        cluster_name: &str,
    ) -> Result<Option<ServiceBinding>> {
        self.get_binding(&Filter::new().eq("name", name).eq("cluster_name", cluster_name))
            .await
    }

    pub async fn list_bindings(&self, filter: &Filter) -> Result<Vec<ServiceBinding>> {
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BINDING_COLUMNS} FROM service_binding b"
        ));
        filter.push_where(&mut query, "b", BINDING_FILTERS)?;
        query.push(" ORDER BY b.create_time, b.id");

        let rows: Vec<BindingRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ServiceBinding::try_from).collect()
    }

    /// All bindings whose status is one of `statuses`.
    pub async fn list_bindings_by_status(
        &self,
        statuses: &[LifecycleStatus],
    ) -> Result<Vec<ServiceBinding>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {BINDING_COLUMNS} FROM service_binding b"
        ));
        push_status_set(&mut query, "b", statuses);

        let rows: Vec<BindingRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(ServiceBinding::try_from).collect()
    }

    pub async fn list_resources(&self, binding_id: &str) -> Result<Vec<ResourceRecord>> {
        select_resources(&self.pool, binding_id).await
    }

    /// Rewrite every mutable column of a binding, keeping its stored `create_time`.
    pub async fn update_binding(&self, binding: &mut ServiceBinding) -> Result<()> {
        self.stamp_binding(binding).await?;
        write_binding(&self.pool, binding).await
    }

    /// Rewrite a binding together with its resource rows, used when an upgrade
    /// changes its CRDs. Either both land or neither does.
    pub async fn upgrade_binding(
        &self,
        binding: &mut ServiceBinding,
        resources: &mut [ResourceRecord],
    ) -> Result<()> {
        self.stamp_binding(binding).await?;
        for resource in resources.iter_mut() {
            if resource.id.is_empty() {
                resource.id = self.next_id();
            }
            resource.service_binding_id = binding.id.clone();
            resource.create_time = binding.update_time;
            resource.update_time = binding.update_time;
        }

        let mut tx = self.begin().await?;
        let result = upgrade_rows(&mut tx, binding, resources).await;
        finish(tx, result).await
    }

    async fn stamp_binding(&self, binding: &mut ServiceBinding) -> Result<()> {
        let existing = self
            .get_binding_by_id(&binding.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("service binding {}", binding.name)))?;
        binding.create_time = existing.create_time;
        binding.update_time = unix_now();
        Ok(())
    }

    /// Set the step deadline without touching `update_time`.
    pub async fn set_binding_process_time(&self, binding: &mut ServiceBinding, at: i64) -> Result<()> {
        let done = sqlx::query("UPDATE service_binding SET process_time = ? WHERE id = ? AND status = ?")
            .bind(at)
            .bind(&binding.id)
            .bind(binding.status.as_str())
            .execute(&self.pool)
            .await?;
        ensure_current(done, format!("service binding {}", binding.name), binding.status)?;
        binding.process_time = at;
        Ok(())
    }

    /// Record why the binding is still waiting. Leaves `update_time` alone so
    /// the step budget keeps running.
    pub async fn set_binding_message(&self, binding: &mut ServiceBinding, message: &str) -> Result<()> {
        if binding.message == message {
            return Ok(());
        }
        let done = sqlx::query("UPDATE service_binding SET error_message = ? WHERE id = ? AND status = ?")
            .bind(message)
            .bind(&binding.id)
            .bind(binding.status.as_str())
            .execute(&self.pool)
            .await?;
        ensure_current(done, format!("service binding {}", binding.name), binding.status)?;
        binding.message = message.to_string();
        Ok(())
    }

    /// Targeted write of status and message that also clears the step deadline.
    /// Only applies while the row still has the status `binding` was loaded with.
    pub async fn update_binding_status_msg(
        &self,
        binding: &mut ServiceBinding,
        status: LifecycleStatus,
        message: &str,
    ) -> Result<()> {
        let now = unix_now();
        let done = sqlx::query(
            "UPDATE service_binding SET status = ?, process_time = 0, error_message = ?, \
             update_time = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(message)
        .bind(now)
        .bind(&binding.id)
        .bind(binding.status.as_str())
        .execute(&self.pool)
        .await?;
        ensure_current(done, format!("service binding {}", binding.name), binding.status)?;

        binding.status = status;
        binding.message = message.to_string();
        binding.process_time = 0;
        binding.update_time = now;
        Ok(())
    }

    /// Delete a binding and its resource rows. Deleting a missing binding succeeds.
    pub async fn delete_binding(&self, binding: &ServiceBinding) -> Result<()> {
        let id = if binding.id.is_empty() {
            match self
                .get_binding_by_name(&binding.name, &binding.cluster_name)
                .await?
            {
                Some(existing) => existing.id,
                None => return Ok(()),
            }
        } else {
            binding.id.clone()
        };

        let mut tx = self.begin().await?;
        let result = delete_binding_rows(&mut tx, &id).await;
        finish(tx, result).await
    }
}

async fn replace_resource_rows(
    conn: &mut SqliteConnection,
    binding_id: &str,
    resources: &[ResourceRecord],
) -> Result<()> {
    let existing = select_resources(&mut *conn, binding_id).await?;
    for old in &existing {
        let kept = resources
            .iter()
            .any(|r| r.kind == old.kind && r.api_version == old.api_version);
        let referenced: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instance WHERE resource_id = ?")
            .bind(&old.id)
            .fetch_one(&mut *conn)
            .await?;
        if !kept && referenced > 0 {
            return Err(Error::ValidationError(format!(
                "{} {} still has {referenced} instances",
                old.kind, old.api_version
            )));
        }
        if !kept {
            sqlx::query("DELETE FROM resource WHERE id = ?")
                .bind(&old.id)
                .execute(&mut *conn)
                .await?;
        }
    }

    for resource in resources {
        let present = existing
            .iter()
            .any(|r| r.kind == resource.kind && r.api_version == resource.api_version);
        if present {
            continue;
        }
        sqlx::query(
            "INSERT INTO resource (id, service_binding_id, kind, group_name, api_version, plural, \
             create_time, update_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&resource.id)
        .bind(&resource.service_binding_id)
        .bind(&resource.kind)
        .bind(&resource.group)
        .bind(&resource.api_version)
        .bind(&resource.plural)
        .bind(resource.create_time)
        .bind(resource.update_time)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        resources::fixtures::{sample_crd, sample_resources},
        store::fixtures::sample_instance,
    };

    pub(crate) fn sample_binding(name: &str) -> ServiceBinding {
        let resources = sample_resources();
        ServiceBinding {
            name: name.into(),
            cluster_name: "default".into(),
            version: "1.0.0".into(),
            service_name: name.into(),
            service_id: format!("{name}-id"),
            status: LifecycleStatus::Installing,
            workloads: resources.workloads,
            permissions: resources.permissions,
            crd: vec![sample_crd("apiextensions.k8s.io/v1")],
            ..Default::default()
        }
    }

    pub(crate) async fn insert_sample(store: &Store, name: &str) -> ServiceBinding {
        let mut binding = sample_binding(name);
        let mut resources = binding.resource_records().unwrap();
        store.create_binding(&mut binding, &mut resources).await.unwrap();
        binding
    }

    #[tokio::test]
    async fn create_then_read_back_decodes_blobs() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;

        let read = store
            .get_binding_by_name("mysql", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read, binding);
        assert_eq!(read.workloads.deployments.len(), 1);

        let resources = store.list_resources(&binding.id).await.unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].group, "db.example.com");
    }

    #[tokio::test]
    async fn natural_key_is_unique() {
        let store = Store::in_memory().await.unwrap();
        insert_sample(&store, "mysql").await;

        let mut again = sample_binding("mysql");
        let err = store.create_binding(&mut again, &mut []).await.unwrap_err();
        assert!(err.is_unique_violation());

        let mut elsewhere = sample_binding("mysql");
        elsewhere.cluster_name = "edge".into();
        store.create_binding(&mut elsewhere, &mut []).await.unwrap();
    }

    #[tokio::test]
    async fn status_set_query_returns_only_matching_rows() {
        let store = Store::in_memory().await.unwrap();
        let mut installing = insert_sample(&store, "a").await;
        let mut done = insert_sample(&store, "b").await;
        store
            .update_binding_status_msg(&mut done, LifecycleStatus::Succeeded, "")
            .await
            .unwrap();
        store
            .set_binding_process_time(&mut installing, 42)
            .await
            .unwrap();

        let rows = store
            .list_bindings_by_status(&[LifecycleStatus::Installing, LifecycleStatus::Deleting])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].name, "a");
        assert_eq!(rows[0].process_time, 42);
        assert!(store.list_bindings_by_status(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_preserves_create_time() {
        let store = Store::in_memory().await.unwrap();
        let mut binding = insert_sample(&store, "mysql").await;
        let created = binding.create_time;

        binding.create_time = 1;
        binding.version = "1.0.1".into();
        binding.status = LifecycleStatus::Upgrading;
        store.update_binding(&mut binding).await.unwrap();

        let read = store.get_binding_by_id(&binding.id).await.unwrap().unwrap();
        assert_eq!(read.create_time, created);
        assert_eq!(read.version, "1.0.1");
        assert_eq!(read.status, LifecycleStatus::Upgrading);
    }

    #[tokio::test]
    async fn status_msg_clears_deadline() {
        let store = Store::in_memory().await.unwrap();
        let mut binding = insert_sample(&store, "mysql").await;
        store.set_binding_process_time(&mut binding, 99).await.unwrap();
        store
            .update_binding_status_msg(&mut binding, LifecycleStatus::Failed, "boom")
            .await
            .unwrap();

        let read = store.get_binding_by_id(&binding.id).await.unwrap().unwrap();
        assert_eq!(read.process_time, 0);
        assert_eq!(read.message, "boom");
        assert_eq!(read.status, LifecycleStatus::Failed);
    }

    #[tokio::test]
    async fn delete_resolves_by_natural_key_and_tolerates_missing_rows() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;

        let by_name = ServiceBinding {
            name: "mysql".into(),
            cluster_name: "default".into(),
            ..Default::default()
        };
        store.delete_binding(&by_name).await.unwrap();
        assert!(store.get_binding_by_id(&binding.id).await.unwrap().is_none());
        assert!(store.list_resources(&binding.id).await.unwrap().is_empty());

        store.delete_binding(&by_name).await.unwrap();
    }

    #[tokio::test]
    async fn upgrade_is_all_or_nothing() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;
        let mut instances = vec![sample_instance("orders")];
        store.create_instances(&mut instances, &binding.id).await.unwrap();

        // Dropping the CRD an instance still uses must not leave the new version behind
        let mut upgraded = binding.clone();
        upgraded.version = "2.0.0".into();
        upgraded.status = LifecycleStatus::Upgrading;
        upgraded.crd.clear();
        let err = store.upgrade_binding(&mut upgraded, &mut []).await.unwrap_err();
        assert!(matches!(err, Error::ValidationError(_)));

        let read = store.get_binding_by_id(&binding.id).await.unwrap().unwrap();
        assert_eq!(read.version, "1.0.0");
        assert_eq!(read.status, LifecycleStatus::Installing);
        assert_eq!(store.list_resources(&binding.id).await.unwrap().len(), 1);

        let mut resources = binding.resource_records().unwrap();
        let mut upgraded = binding.clone();
        upgraded.version = "2.0.0".into();
        upgraded.status = LifecycleStatus::Upgrading;
        store.upgrade_binding(&mut upgraded, &mut resources).await.unwrap();
        let read = store.get_binding_by_id(&binding.id).await.unwrap().unwrap();
        assert_eq!(read.version, "2.0.0");
        assert_eq!(read.status, LifecycleStatus::Upgrading);
    }

    #[tokio::test]
    async fn lifecycle_writes_require_the_loaded_status() {
        let store = Store::in_memory().await.unwrap();
        let mut stale = insert_sample(&store, "mysql").await;

        let mut deleting = stale.clone();
        deleting.status = LifecycleStatus::Deleting;
        store.update_binding(&mut deleting).await.unwrap();

        let err = store
            .update_binding_status_msg(&mut stale, LifecycleStatus::Succeeded, "")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert!(matches!(
            store.set_binding_process_time(&mut stale, 42).await,
            Err(Error::Conflict(_))
        ));
        assert_eq!(stale.status, LifecycleStatus::Installing);

        let read = store.get_binding_by_id(&stale.id).await.unwrap().unwrap();
        assert_eq!(read.status, LifecycleStatus::Deleting);
        assert_eq!(read.process_time, 0);
    }

    #[tokio::test]
    async fn waiting_message_keeps_the_step_clock() {
        let store = Store::in_memory().await.unwrap();
        let mut binding = insert_sample(&store, "mysql").await;
        store.backdate_binding(&binding.id, 1000).await.unwrap();

        store
            .set_binding_message(&mut binding, "service package is Pending")
            .await
            .unwrap();

        let read = store.get_binding_by_id(&binding.id).await.unwrap().unwrap();
        assert_eq!(read.message, "service package is Pending");
        assert_eq!(read.update_time, 1000);
    }
}
