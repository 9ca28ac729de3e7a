//! The `Foo` custom resource
// fields generated on `Foo` by the derive carry no docs
#![allow(missing_docs)]
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Desired state of a [`Foo`]
///
/// A `Foo` asks for a single Deployment named `deploymentName`, running
/// `replicas` copies of `image`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "sample.com",
    version = "v1alpha1",
    kind = "Foo",
    namespaced,
    status = "FooStatus",
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct FooSpec {
    /// Name of the managed Deployment in the namespace of the Foo
    #[serde(default)]
    pub deployment_name: String,
    /// Desired replica count, left to the Deployment default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Container image, a built-in default is used when unset or empty
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

/// Observed state of a [`Foo`], written only by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FooStatus {
    /// Available replicas of the managed Deployment
    #[serde(default)]
    pub available_replicas: i32,
}
