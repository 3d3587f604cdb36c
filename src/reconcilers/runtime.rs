use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use kube::ResourceExt;

use crate::{
    resources::{PackagePhase, Workloads},
    Result,
};

use super::ClusterApi;

/// Result of walking the workloads of a package.
#[derive(Debug, PartialEq)]
pub(crate) struct Health {
    pub phase: PackagePhase,
    pub reasons: Vec<String>,
}

impl Health {
    fn new() -> Self {
        Self {
            phase: PackagePhase::Running,
            reasons: Vec::new(),
        }
    }

    fn record(&mut self, finding: Option<(PackagePhase, String)>) {
        let Some((phase, reason)) = finding else {
            return;
        };
        // Failed wins over Unknown
        if phase == PackagePhase::Failed || self.phase != PackagePhase::Failed {
            self.phase = phase;
        }
        self.reasons.push(reason);
    }
}

/// Check that every workload of the bundle runs replicas.
pub(crate) async fn check<C: ClusterApi>(
    cluster: &C,
    namespace: &str,
    workloads: &Workloads,
) -> Result<Health> {
    let mut health = Health::new();

    let deployments = cluster.namespaced::<Deployment>(namespace);
    for wanted in &workloads.deployments {
        let name = wanted.name_any();
        let found = deployments.get_opt(&name).await?;
        health.record(deployment(found.as_ref(), namespace, &name));
    }

    let daemon_sets = cluster.namespaced::<DaemonSet>(namespace);
    for wanted in &workloads.daemon_sets {
        let name = wanted.name_any();
        let found = daemon_sets.get_opt(&name).await?;
        health.record(daemon_set(found.as_ref(), namespace, &name));
    }

    let stateful_sets = cluster.namespaced::<StatefulSet>(namespace);
    for wanted in &workloads.stateful_sets {
        let name = wanted.name_any();
        let found = stateful_sets.get_opt(&name).await?;
        health.record(stateful_set(found.as_ref(), namespace, &name));
    }

    Ok(health)
}

fn not_found(kind: &str, namespace: &str, name: &str) -> Option<(PackagePhase, String)> {
    Some((
        PackagePhase::Failed,
        format!("{kind} {namespace}/{name} is not found"),
    ))
}

fn unknown(kind: &str, namespace: &str, name: &str) -> Option<(PackagePhase, String)> {
    Some((
        PackagePhase::Unknown,
        format!("{kind} {namespace}/{name} has unknown reasons to run 0 replicas"),
    ))
}

fn deployment(found: Option<&Deployment>, namespace: &str, name: &str) -> Option<(PackagePhase, String)> {
    let Some(found) = found else {
        return not_found("Deployment", namespace, name);
    };
    let status = found.status.clone().unwrap_or_default();
    let available = status.available_replicas.unwrap_or(0);
    let unavailable = status.unavailable_replicas.unwrap_or(0);
    if available == 0 {
        unknown("Deployment", namespace, name)
    } else if unavailable > 0 {
        Some((
            PackagePhase::Failed,
            format!(
                "Deployment {namespace}/{name} has {unavailable} unavailable replicas, {available} available"
            ),
        ))
    } else {
        None
    }
}

fn daemon_set(found: Option<&DaemonSet>, namespace: &str, name: &str) -> Option<(PackagePhase, String)> {
    let Some(found) = found else {
        return not_found("DaemonSet", namespace, name);
    };
    let status = found.status.clone().unwrap_or_default();
    let desired = status.desired_number_scheduled;
    let current = status.current_number_scheduled;
    if status.number_available.unwrap_or(0) == 0 {
        unknown("DaemonSet", namespace, name)
    } else if desired != current {
        Some((
            PackagePhase::Failed,
            format!("DaemonSet {namespace}/{name} schedules {current} of {desired} desired pods"),
        ))
    } else {
        None
    }
}

fn stateful_set(found: Option<&StatefulSet>, namespace: &str, name: &str) -> Option<(PackagePhase, String)> {
    let Some(found) = found else {
        return not_found("StatefulSet", namespace, name);
    };
    let status = found.status.clone().unwrap_or_default();
    let current = status.current_replicas.unwrap_or(0);
    let replicas = status.replicas;
    if current == 0 {
        unknown("StatefulSet", namespace, name)
    } else if replicas != current {
        Some((
            PackagePhase::Failed,
            format!("StatefulSet {namespace}/{name} runs {current} of {replicas} replicas"),
        ))
    } else {
        None
    }
}
