mod bundle;
mod service_package;

pub use bundle::*;
pub use service_package::*;

#[cfg(test)]
pub(crate) use bundle::tests as fixtures;

/// Build an `ObjectMeta` owned by the given owner references.
macro_rules! meta {
    (owners: $owners:expr) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),

            ..Default::default()
        }
    }};

    (owners: $owners:expr, $($lhs:ident : $rhs:expr),*) => {{
        ::kube::core::ObjectMeta {
            owner_references: Some($owners),
            $($lhs : $rhs),*,

            ..Default::default()
        }
    }};
}
pub(crate) use meta;
