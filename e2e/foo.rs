//! Drives a running sample-controller through the basic Foo lifecycle
use std::time::Duration;

use k8s_openapi::{
    api::apps::v1::Deployment, apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition,
};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    runtime::wait::{await_condition, conditions, Condition},
    Client, CustomResourceExt, ResourceExt,
};
use sample_controller::{deployment, Foo};
use tracing::info;

const FOO_NAME: &str = "example-foo";
const DEPLOYMENT_NAME: &str = "example-foo";
const TIMEOUT: Duration = Duration::from_secs(60);

fn deployment_ready(replicas: i32, image: &'static str) -> impl Condition<Deployment> {
    move |obj: Option<&Deployment>| {
        obj.is_some_and(|d| {
            deployment::current_replicas(d) == Some(replicas) && deployment::current_image(d) == Some(image)
        })
    }
}

fn foo_status(available: i32) -> impl Condition<Foo> {
    move |obj: Option<&Foo>| {
        obj.and_then(|foo| foo.status.as_ref())
            .is_some_and(|status| status.available_replicas == available)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let client = Client::try_default().await?;

    info!("Installing Foo CRD");
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = Foo::crd();
    let crd_name = crd.name_any();
    let ssapply = PatchParams::apply("sample-controller-e2e").force();
    crds.patch(&crd_name, &ssapply, &Patch::Apply(&crd)).await?;
    let established = await_condition(crds.clone(), &crd_name, conditions::is_crd_established());
    let _ = tokio::time::timeout(Duration::from_secs(10), established).await?;

    let foos: Api<Foo> = Api::default_namespaced(client.clone());
    let deployments: Api<Deployment> = Api::default_namespaced(client);

    info!("Creating Foo");
    let foo: Foo = serde_json::from_value(serde_json::json!({
        "apiVersion": "sample.com/v1alpha1",
        "kind": "Foo",
        "metadata": { "name": FOO_NAME },
        "spec": {
            "deploymentName": DEPLOYMENT_NAME,
            "replicas": 1,
        }
    }))?;
    foos.create(&PostParams::default(), &foo).await?;

    info!("Waiting for Deployment");
    let created = await_condition(
        deployments.clone(),
        DEPLOYMENT_NAME,
        deployment_ready(1, deployment::DEFAULT_IMAGE),
    );
    let _ = tokio::time::timeout(TIMEOUT, created).await?;

    info!("Scaling Foo to 2 replicas");
    let scale = serde_json::json!({ "spec": { "replicas": 2 } });
    foos.patch(FOO_NAME, &PatchParams::default(), &Patch::Merge(&scale))
        .await?;
    let scaled = await_condition(
        deployments.clone(),
        DEPLOYMENT_NAME,
        deployment_ready(2, deployment::DEFAULT_IMAGE),
    );
    let _ = tokio::time::timeout(TIMEOUT, scaled).await?;

    info!("Waiting for Foo status");
    let status = await_condition(foos.clone(), FOO_NAME, foo_status(2));
    let _ = tokio::time::timeout(TIMEOUT, status).await?;

    info!("Cleaning up");
    foos.delete(FOO_NAME, &DeleteParams::background()).await?;
    let gone = await_condition(deployments, DEPLOYMENT_NAME, |obj: Option<&Deployment>| obj.is_none());
    let _ = tokio::time::timeout(TIMEOUT, gone).await?;
    crds.delete(&crd_name, &DeleteParams::default()).await?;
    Ok(())
}
