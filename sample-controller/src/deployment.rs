//! Desired state of the Deployment managed by a [`Foo`]
//!
//! Everything here is pure: the reconciler decides when to call the API.
use std::collections::BTreeMap;

use k8s_openapi::{
    api::{
        apps::v1::{Deployment, DeploymentSpec},
        core::v1::{Container, PodSpec, PodTemplateSpec},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::{Resource, ResourceExt};

use crate::{crd::Foo, Error, Result};

/// Image used when a Foo does not ask for one
pub const DEFAULT_IMAGE: &str = "istiaka2i/bookapp:v1.0";

/// Name of the single container in the managed pod template
pub const CONTAINER_NAME: &str = "main";

// The selector of a Deployment is immutable, so this pair can never change
// without orphaning the pods of existing Deployments.
const APP_LABEL_KEY: &str = "app";
const APP_LABEL_VALUE: &str = "foo";

/// Labels used both on the pod template and as the Deployment selector
pub fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([(APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string())])
}

/// The image a Foo wants, with the default applied
pub fn desired_image(foo: &Foo) -> &str {
    foo.spec
        .image
        .as_deref()
        .filter(|image| !image.is_empty())
        .unwrap_or(DEFAULT_IMAGE)
}

/// Build the Deployment that should exist for `foo`
///
/// The result is a complete manifest, controlled by `foo` through an owner reference so
/// that the API server garbage collects it together with its owner.
pub fn new_deployment(foo: &Foo) -> Result<Deployment> {
    let owner = foo
        .controller_owner_ref(&())
        .ok_or(Error::MissingObjectKey(".metadata.uid"))?;
    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(foo.spec.deployment_name.clone()),
            namespace: foo.namespace(),
            owner_references: Some(vec![owner]),
            ..ObjectMeta::default()
        },
        spec: Some(DeploymentSpec {
            replicas: foo.spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(desired_image(foo).to_string()),
                        ..Container::default()
                    }],
                    ..PodSpec::default()
                }),
            },
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    })
}

/// Replica count currently requested by a Deployment
pub fn current_replicas(deployment: &Deployment) -> Option<i32> {
    deployment.spec.as_ref().and_then(|spec| spec.replicas)
}

/// Image of the first container of a Deployment
pub fn current_image(deployment: &Deployment) -> Option<&str> {
    deployment
        .spec
        .as_ref()?
        .template
        .spec
        .as_ref()?
        .containers
        .first()?
        .image
        .as_deref()
}

/// Available replicas as reported by the Deployment status
pub fn available_replicas(deployment: &Deployment) -> i32 {
    deployment
        .status
        .as_ref()
        .and_then(|status| status.available_replicas)
        .unwrap_or(0)
}

/// Whether `deployment` carries a controller owner reference to this exact `foo`
pub fn is_controlled_by(deployment: &Deployment, foo: &Foo) -> bool {
    let Some(uid) = foo.uid() else {
        return false;
    };
    deployment
        .owner_references()
        .iter()
        .any(|owner| owner.controller == Some(true) && owner.uid == uid)
}

/// Managed fields of a Deployment that no longer match its Foo
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Drift {
    /// `(current, desired)` replicas, only tracked when the Foo sets replicas
    pub replicas: Option<(Option<i32>, i32)>,
    /// `(current, desired)` container image
    pub image: Option<(Option<String>, String)>,
}

impl Drift {
    /// Compare the managed fields of `current` against what `foo` asks for
    pub fn detect(foo: &Foo, current: &Deployment) -> Self {
        let replicas = match (foo.spec.replicas, current_replicas(current)) {
            (Some(desired), current) if current != Some(desired) => Some((current, desired)),
            _ => None,
        };
        let desired = desired_image(foo);
        let image = match current_image(current) {
            Some(image) if image == desired => None,
            image => Some((image.map(String::from), desired.to_string())),
        };
        Drift { replicas, image }
    }

    /// True when the Deployment already matches
    pub fn is_empty(&self) -> bool {
        self.replicas.is_none() && self.image.is_none()
    }
}
