//! Domain records kept in the database: bindings, their resource rows and instances.

mod binding;
mod install_state;
mod instance;
mod status;

pub use binding::*;
pub use install_state::*;
pub use instance::*;
pub use status::*;

use std::fmt::{self, Display};

/// Addresses a resource type in the cluster API.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Gvr {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl Gvr {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            version: version.into(),
            resource: resource.into(),
        }
    }

    /// `group/version`, or just `version` for the core group.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl Display for Gvr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.api_version(), self.resource)
    }
}

/// Split an `apiVersion` into group and version.
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

/// Seconds since the unix epoch, the resolution rows store time in.
pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_version_handles_core_group() {
        assert_eq!(Gvr::new("", "v1", "configmaps").api_version(), "v1");
        assert_eq!(
            Gvr::new("db.example.com", "v1", "mysqls").to_string(),
            "db.example.com/v1/mysqls"
        );
        assert_eq!(split_api_version("apps/v1"), ("apps", "v1"));
        assert_eq!(split_api_version("v1"), ("", "v1"));
    }
}
