use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::{
    model::{unix_now, Instance, LifecycleStatus},
    Error, Result,
};

use super::{
    bindings::select_resources, decode_blob, ensure_current, finish, push_status_set, Filter, Store,
};

const INSTANCE_SELECT: &str = "SELECT i.id, i.name, i.namespace, i.cluster_name, \
    i.service_binding_id, i.resource_id, i.raw_resource, i.status, i.error_message, \
    i.install_state, i.process_time, i.create_time, i.update_time, \
    COALESCE(r.kind, '') AS kind, COALESCE(r.api_version, '') AS api_version, \
    COALESCE(r.plural, '') AS plural \
    FROM instance i LEFT JOIN resource r ON r.id = i.resource_id";

const INSTANCE_FILTERS: &[&str] = &[
    "id",
    "name",
    "namespace",
    "cluster_name",
    "service_binding_id",
    "resource_id",
    "status",
];

#[derive(sqlx::FromRow)]
struct InstanceRow {
    id: String,
    name: String,
    namespace: String,
    cluster_name: String,
    service_binding_id: String,
    resource_id: String,
    raw_resource: String,
    status: String,
    error_message: String,
    install_state: String,
    process_time: i64,
    create_time: i64,
    update_time: i64,
    kind: String,
    api_version: String,
    plural: String,
}

impl TryFrom<InstanceRow> for Instance {
    type Error = Error;

    fn try_from(row: InstanceRow) -> Result<Self> {
        Ok(Self {
            status: row.status.parse()?,
            raw_resource: decode_blob(&row.raw_resource)?,
            install_state: decode_blob(&row.install_state)?,
            id: row.id,
            name: row.name,
            namespace: row.namespace,
            cluster_name: row.cluster_name,
            service_binding_id: row.service_binding_id,
            resource_id: row.resource_id,
            message: row.error_message,
            process_time: row.process_time,
            create_time: row.create_time,
            update_time: row.update_time,
            kind: row.kind,
            api_version: row.api_version,
            plural: row.plural,
        })
    }
}

async fn insert_instances(
    conn: &mut SqliteConnection,
    binding_id: &str,
    instances: &mut [Instance],
) -> Result<()> {
    let resources = select_resources(&mut *conn, binding_id).await?;
    for instance in instances.iter_mut() {
        let resource = resources
            .iter()
            .find(|r| r.kind == instance.kind && r.api_version == instance.api_version)
            .ok_or_else(|| {
                Error::InstanceCreateError(format!(
                    "{} {} is not served by the service binding",
                    instance.kind, instance.api_version
                ))
            })?;
        if !instance.plural.is_empty() && instance.plural != resource.plural {
            return Err(Error::InstanceCreateError(format!(
                "{} is not the plural of {}",
                instance.plural, instance.kind
            )));
        }
        instance.resource_id = resource.id.clone();
        instance.plural = resource.plural.clone();
        instance.service_binding_id = binding_id.to_string();

        sqlx::query(
            "INSERT INTO instance (id, name, namespace, cluster_name, service_binding_id, \
             resource_id, raw_resource, status, error_message, install_state, process_time, \
             create_time, update_time) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&instance.id)
        .bind(&instance.name)
        .bind(&instance.namespace)
        .bind(&instance.cluster_name)
        .bind(&instance.service_binding_id)
        .bind(&instance.resource_id)
        .bind(serde_json::to_string(&instance.raw_resource)?)
        .bind(instance.status.as_str())
        .bind(&instance.message)
        .bind(serde_json::to_string(&instance.install_state)?)
        .bind(instance.process_time)
        .bind(instance.create_time)
        .bind(instance.update_time)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

impl Store {
    /// Insert instances of one binding atomically. Every instance must match a
    /// resource row of that binding by kind and api version.
    pub async fn create_instances(&self, instances: &mut [Instance], binding_id: &str) -> Result<()> {
        let now = unix_now();
        for instance in instances.iter_mut() {
            if instance.id.is_empty() {
                instance.id = self.next_id();
            }
            instance.create_time = now;
            instance.update_time = now;
        }

        let mut tx = self.begin().await?;
        let result = insert_instances(&mut tx, binding_id, instances).await;
        finish(tx, result).await
    }

    pub async fn get_instance(&self, filter: &Filter) -> Result<Option<Instance>> {
        Ok(self.list_instances(filter).await?.into_iter().next())
    }

    pub async fn get_instance_by_id(&self, id: &str) -> Result<Option<Instance>> {
        self.get_instance(&Filter::new().eq("id", id)).await
    }

    pub async fn get_instance_by_name(
        &self,
        name: &str,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Option<Instance>> {
        let filter = Filter::new()
            .eq("name", name)
            .eq("namespace", namespace)
            .eq("cluster_name", cluster_name);
        self.get_instance(&filter).await
    }

    pub async fn list_instances(&self, filter: &Filter) -> Result<Vec<Instance>> {
        let mut query = QueryBuilder::<Sqlite>::new(INSTANCE_SELECT);
        filter.push_where(&mut query, "i", INSTANCE_FILTERS)?;
        query.push(" ORDER BY i.create_time, i.id");

        let rows: Vec<InstanceRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    pub async fn list_instances_by_status(&self, statuses: &[LifecycleStatus]) -> Result<Vec<Instance>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let mut query = QueryBuilder::<Sqlite>::new(INSTANCE_SELECT);
        push_status_set(&mut query, "i", statuses);

        let rows: Vec<InstanceRow> = query.build_query_as().fetch_all(&self.pool).await?;
        rows.into_iter().map(Instance::try_from).collect()
    }

    /// Number of instances still attached to a binding.
    pub async fn count_instances(&self, binding_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM instance WHERE service_binding_id = ?")
            .bind(binding_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Rewrite the mutable columns of an instance, keeping its stored `create_time`.
    pub async fn update_instance(&self, instance: &mut Instance) -> Result<()> {
        let status = instance.status;
        self.write_instance(instance, status, None).await
    }

    /// Rewrite the mutable columns of an instance and move it to `status`, but
    /// only while the stored row still has the status `instance` was loaded with.
    pub async fn advance_instance(&self, instance: &mut Instance, status: LifecycleStatus) -> Result<()> {
        let expected = instance.status;
        self.write_instance(instance, status, Some(expected)).await
    }

    async fn write_instance(
        &self,
        instance: &mut Instance,
        status: LifecycleStatus,
        expected: Option<LifecycleStatus>,
    ) -> Result<()> {
        let existing = self
            .get_instance_by_id(&instance.id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("instance {}", instance.name)))?;
        let update_time = unix_now();

        let mut query = QueryBuilder::<Sqlite>::new("UPDATE instance SET raw_resource = ");
        query
            .push_bind(serde_json::to_string(&instance.raw_resource)?)
            .push(", status = ")
            .push_bind(status.as_str())
            .push(", error_message = ")
            .push_bind(instance.message.clone())
            .push(", install_state = ")
            .push_bind(serde_json::to_string(&instance.install_state)?)
            .push(", process_time = ")
            .push_bind(instance.process_time)
            .push(", update_time = ")
            .push_bind(update_time)
            .push(" WHERE id = ")
            .push_bind(instance.id.clone());
        if let Some(expected) = expected {
            query.push(" AND status = ").push_bind(expected.as_str());
        }
        let done = query.build().execute(&self.pool).await?;
        if let Some(expected) = expected {
            ensure_current(done, format!("instance {}", instance.name), expected)?;
        }

        instance.status = status;
        instance.create_time = existing.create_time;
        instance.update_time = update_time;
        Ok(())
    }

    /// Set the step deadline without touching `update_time`.
    pub async fn set_instance_process_time(&self, instance: &mut Instance, at: i64) -> Result<()> {
        let done = sqlx::query("UPDATE instance SET process_time = ? WHERE id = ? AND status = ?")
            .bind(at)
            .bind(&instance.id)
            .bind(instance.status.as_str())
            .execute(&self.pool)
            .await?;
        ensure_current(done, format!("instance {}", instance.name), instance.status)?;
        instance.process_time = at;
        Ok(())
    }

    /// Record why the instance is still waiting. Leaves `update_time` alone so
    /// the step budget keeps running.
    pub async fn set_instance_message(&self, instance: &mut Instance, message: &str) -> Result<()> {
        if instance.message == message {
            return Ok(());
        }
        let done = sqlx::query("UPDATE instance SET error_message = ? WHERE id = ? AND status = ?")
            .bind(message)
            .bind(&instance.id)
            .bind(instance.status.as_str())
            .execute(&self.pool)
            .await?;
        ensure_current(done, format!("instance {}", instance.name), instance.status)?;
        instance.message = message.to_string();
        Ok(())
    }

    /// Targeted write of status and message that also fails any running install
    /// condition and clears the step deadline. Only applies while the row still
    /// has the status `instance` was loaded with.
    pub async fn update_instance_status_msg(
        &self,
        instance: &mut Instance,
        status: LifecycleStatus,
        message: &str,
    ) -> Result<()> {
        let mut install_state = instance.install_state.clone();
        let mut message = message.to_string();
        if let Some(first) = install_state.fail_running(status) {
            message = if message.is_empty() {
                first
            } else {
                format!("{message}:{first}")
            };
        }
        let now = unix_now();

        let done = sqlx::query(
            "UPDATE instance SET status = ?, error_message = ?, install_state = ?, \
             process_time = 0, update_time = ? WHERE id = ? AND status = ?",
        )
        .bind(status.as_str())
        .bind(&message)
        .bind(serde_json::to_string(&install_state)?)
        .bind(now)
        .bind(&instance.id)
        .bind(instance.status.as_str())
        .execute(&self.pool)
        .await?;
        ensure_current(done, format!("instance {}", instance.name), instance.status)?;

        instance.status = status;
        instance.message = message;
        instance.install_state = install_state;
        instance.process_time = 0;
        instance.update_time = now;
        Ok(())
    }


    /// Delete an instance row. Deleting a missing instance succeeds.
    pub async fn delete_instance(&self, instance: &Instance) -> Result<()> {
        let id = if instance.id.is_empty() {
            match self
                .get_instance_by_name(&instance.name, &instance.namespace, &instance.cluster_name)
                .await?
            {
                Some(existing) => existing.id,
                None => return Ok(()),
            }
        } else {
            instance.id.clone()
        };
        sqlx::query("DELETE FROM instance WHERE id = ?")
            .bind(&id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        model::{ConditionStatus, ConditionType},
        store::bindings::tests::insert_sample,
    };

    pub(crate) fn sample_instance(name: &str) -> Instance {
        let raw = json!({
            "apiVersion": "db.example.com/v1",
            "kind": "Mysql",
            "metadata": { "name": name },
            "spec": { "replicas": 1 }
        });
        Instance::from_raw(raw, "shop", "default").unwrap()
    }

    #[tokio::test]
    async fn create_joins_resource_columns() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;

        let mut instances = vec![sample_instance("orders")];
        store.create_instances(&mut instances, &binding.id).await.unwrap();

        let read = store
            .get_instance_by_name("orders", "shop", "default")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.plural, "mysqls");
        assert_eq!(read.kind, "Mysql");
        assert_eq!(read.service_binding_id, binding.id);
        assert_eq!(read.raw_resource["metadata"]["namespace"], "shop");
        assert_eq!(store.count_instances(&binding.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unknown_kind_rolls_back_the_whole_batch() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;

        let mut stranger = sample_instance("cache");
        stranger.kind = "Redis".into();
        let mut instances = vec![sample_instance("orders"), stranger];
        let err = store
            .create_instances(&mut instances, &binding.id)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InstanceCreateError(_)));
        assert_eq!(store.count_instances(&binding.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn status_msg_fails_running_conditions() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;
        let mut instances = vec![sample_instance("orders")];
        store.create_instances(&mut instances, &binding.id).await.unwrap();

        let mut instance = instances.remove(0);
        instance
            .install_state
            .update_condition(ConditionType::CreateResource, ConditionStatus::Running, "");
        store.update_instance(&mut instance).await.unwrap();
        store.set_instance_process_time(&mut instance, 10).await.unwrap();

        store
            .update_instance_status_msg(&mut instance, LifecycleStatus::InitFailed, "time out")
            .await
            .unwrap();

        let read = store.get_instance_by_id(&instance.id).await.unwrap().unwrap();
        assert_eq!(read.status, LifecycleStatus::InitFailed);
        assert_eq!(read.message, "time out:timed out to do CreateResource");
        assert_eq!(read.process_time, 0);
        assert_eq!(read.install_state.phase, LifecycleStatus::InitFailed);
        assert_eq!(
            read.install_state
                .condition(ConditionType::CreateResource)
                .map(|c| c.status),
            Some(ConditionStatus::Failed)
        );
    }

    #[tokio::test]
    async fn by_status_and_delete() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;
        let mut instances = vec![sample_instance("orders"), sample_instance("users")];
        store.create_instances(&mut instances, &binding.id).await.unwrap();

        let pending = store
            .list_instances_by_status(&[LifecycleStatus::Initializing])
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        let by_name = Instance {
            name: "orders".into(),
            namespace: "shop".into(),
            cluster_name: "default".into(),
            ..Default::default()
        };
        store.delete_instance(&by_name).await.unwrap();
        store.delete_instance(&by_name).await.unwrap();

        let left = store
            .list_instances(&Filter::new().eq("service_binding_id", binding.id.clone()))
            .await
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].name, "users");
    }

    #[tokio::test]
    async fn stale_instance_cannot_overwrite_a_newer_status() {
        let store = Store::in_memory().await.unwrap();
        let binding = insert_sample(&store, "mysql").await;
        let mut instances = vec![sample_instance("orders")];
        store.create_instances(&mut instances, &binding.id).await.unwrap();
        let mut stale = instances.remove(0);

        let mut deleting = stale.clone();
        deleting.status = LifecycleStatus::Deleting;
        store.update_instance(&mut deleting).await.unwrap();

        let err = store
            .advance_instance(&mut stale, LifecycleStatus::Initialized)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(stale.status, LifecycleStatus::Initializing);
        assert!(matches!(
            store
                .update_instance_status_msg(&mut stale, LifecycleStatus::InitFailed, "time out")
                .await,
            Err(Error::Conflict(_))
        ));

        let read = store.get_instance_by_id(&stale.id).await.unwrap().unwrap();
        assert_eq!(read.status, LifecycleStatus::Deleting);
        assert!(read.message.is_empty());

        let mut current = read;
        store
            .advance_instance(&mut current, LifecycleStatus::Deleting)
            .await
            .unwrap();
    }
}
