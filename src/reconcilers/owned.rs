use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use tracing::{debug, info};

use crate::Result;

use super::{desired::prepare_replace, is_owned_by, ObjectApi};

/// Converge one kind of owned sub-resource towards `desired`.
///
/// Owned objects missing from `desired` are deleted. While upgrading, objects
/// that exist are replaced by their desired form; otherwise they are left alone.
pub(crate) async fn converge<K>(
    api: &dyn ObjectApi<K>,
    owner: &OwnerReference,
    mut desired: BTreeMap<String, K>,
    upgrading: bool,
) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
{
    let kind = K::kind(&());

    for existing in owned(api, owner).await? {
        let name = existing.name_any();
        match desired.remove(&name) {
            None => {
                api.delete(&name).await?;
                info!(r#"Deleted {kind} "{name}" no longer in the bundle of "{}""#, owner.name);
            }
            Some(mut wanted) if upgrading => {
                prepare_replace(&mut wanted, &existing);
                api.replace(&name, &wanted).await?;
                info!(r#"Updated {kind} "{name}" of "{}""#, owner.name);
            }
            Some(_) => {}
        }
    }

    for (name, mut wanted) in desired {
        match api.get_opt(&name).await? {
            Some(existing) if upgrading => {
                prepare_replace(&mut wanted, &existing);
                api.replace(&name, &wanted).await?;
                info!(r#"Updated {kind} "{name}" of "{}""#, owner.name);
            }
            Some(_) => debug!(r#"{kind} "{name}" exists, skipping"#),
            None => {
                api.create(&wanted).await?;
                info!(r#"Created {kind} "{name}" for "{}""#, owner.name);
            }
        }
    }
    Ok(())
}

/// Delete every object of this kind owned by `owner`.
pub(crate) async fn remove_all<K>(api: &dyn ObjectApi<K>, owner: &OwnerReference) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync,
{
    for existing in owned(api, owner).await? {
        let name = existing.name_any();
        api.delete(&name).await?;
        info!(r#"Deleted {} "{name}" of "{}""#, K::kind(&()), owner.name);
    }
    Ok(())
}

async fn owned<K: Resource>(api: &dyn ObjectApi<K>, owner: &OwnerReference) -> Result<Vec<K>> {
    Ok(api
        .list()
        .await?
        .into_iter()
        .filter(|object| is_owned_by(object, owner))
        .collect())
}
