//! Drives a single Foo towards its desired state
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    api::{Api, PostParams},
    runtime::reflector::{ObjectRef, Store},
    Client, ResourceExt,
};
use tracing::{debug, info, instrument, warn};

use crate::{
    crd::{Foo, FooStatus},
    deployment::{self, Drift},
    Error, Result,
};

/// What a reconciliation pass did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The Foo is no longer cached, nothing to do
    Deleted,
    /// The Foo has no deployment name and is skipped until it changes
    InvalidSpec,
    /// The Deployment matches the Foo and the Foo status was refreshed
    Synced(DeploymentChange),
}

/// The write issued against the managed Deployment, at most one per pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentChange {
    /// The Deployment did not exist
    Created,
    /// The Deployment had drifted and was replaced
    Updated,
    /// No write was needed
    Unchanged,
}

/// Reconciles Foo objects against the cached cluster state
///
/// Reads only ever go to the caches; the API server sees nothing but writes.
#[derive(Clone)]
pub struct Reconciler {
    client: Client,
    foos: Store<Foo>,
    deployments: Store<Deployment>,
}

impl Reconciler {
    /// Create a reconciler writing through `client`
    pub fn new(client: Client, foos: Store<Foo>, deployments: Store<Deployment>) -> Self {
        Self {
            client,
            foos,
            deployments,
        }
    }

    /// Reconcile the Foo identified by `key`
    ///
    /// A Foo that has disappeared from the cache was deleted since it was queued, which is
    /// not an error.
    #[instrument(skip_all, fields(foo = %key))]
    pub async fn reconcile(&self, key: &ObjectRef<Foo>) -> Result<Outcome> {
        let Some(foo) = self.foos.get(key) else {
            info!("Foo referenced by item in work queue no longer exists");
            return Ok(Outcome::Deleted);
        };
        self.reconcile_foo(&foo).await
    }

    async fn reconcile_foo(&self, foo: &Foo) -> Result<Outcome> {
        let deployment_name = foo.spec.deployment_name.as_str();
        if deployment_name.is_empty() {
            warn!(field = "spec.deploymentName", "Deployment name missing from object reference");
            return Ok(Outcome::InvalidSpec);
        }
        let namespace = foo
            .namespace()
            .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);

        let cached = self
            .deployments
            .get(&ObjectRef::new(deployment_name).within(&namespace));
        let (available_replicas, change) = match cached {
            None => {
                info!(deployment = deployment_name, "Creating deployment");
                let created = api
                    .create(&PostParams::default(), &deployment::new_deployment(foo)?)
                    .await
                    .map_err(|source| Error::CreateDeployment {
                        name: deployment_name.to_string(),
                        source,
                    })?;
                (deployment::available_replicas(&created), DeploymentChange::Created)
            }
            Some(current) => {
                if !deployment::is_controlled_by(&current, foo) {
                    return Err(Error::NotOwned {
                        deployment: deployment_name.to_string(),
                        foo: format!("{namespace}/{}", foo.name_any()),
                    });
                }
                let drift = Drift::detect(foo, &current);
                if drift.is_empty() {
                    (deployment::available_replicas(&current), DeploymentChange::Unchanged)
                } else {
                    if let Some((current_replicas, desired_replicas)) = drift.replicas {
                        debug!(?current_replicas, desired_replicas, "Update deployment replicas");
                    }
                    if let Some((current_image, desired_image)) = &drift.image {
                        debug!(?current_image, %desired_image, "Update deployment image");
                    }
                    let updated = api
                        .replace(deployment_name, &PostParams::default(), &deployment::new_deployment(foo)?)
                        .await
                        .map_err(|source| Error::UpdateDeployment {
                            name: deployment_name.to_string(),
                            source,
                        })?;
                    (deployment::available_replicas(&updated), DeploymentChange::Updated)
                }
            }
        };

        self.update_status(foo, &namespace, available_replicas).await?;
        info!(deployment = deployment_name, ?change, "Successfully processed Foo");
        Ok(Outcome::Synced(change))
    }

    async fn update_status(&self, foo: &Foo, namespace: &str, available_replicas: i32) -> Result<()> {
        let name = foo.name_any();
        // the cached object is shared, write a copy
        let mut copy = foo.clone();
        copy.status = Some(FooStatus { available_replicas });
        let data = serde_json::to_vec(&copy).map_err(|source| Error::SerializeFoo {
            name: name.clone(),
            source,
        })?;
        let api: Api<Foo> = Api::namespaced(self.client.clone(), namespace);
        api.replace_status(&name, &PostParams::default(), data)
            .await
            .map_err(|source| Error::UpdateFooStatus { name, source })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{crd::FooSpec, deployment::DEFAULT_IMAGE};
    use assert_json_diff::assert_json_include;
    use futures::poll;
    use http::{Method, Request, Response, StatusCode};
    use k8s_openapi::api::apps::v1::DeploymentStatus;
    use kube::{
        client::Body,
        runtime::{reflector::store::Writer, watcher},
    };
    use serde_json::json;
    use std::time::Duration;

    const FOO_UID: &str = "9d8c7a3e-5a8f-4b6e-8f0e-3c1d2b4a5e6f";

    fn test_foo(replicas: Option<i32>, image: Option<&str>) -> Foo {
        let mut foo = Foo::new("example", FooSpec {
            deployment_name: "example-foo".into(),
            replicas,
            image: image.map(String::from),
        });
        foo.metadata.namespace = Some("default".into());
        foo.metadata.uid = Some(FOO_UID.into());
        foo.metadata.resource_version = Some("100".into());
        foo
    }

    fn existing_deployment(foo: &Foo, available: i32) -> Deployment {
        let mut deployment = deployment::new_deployment(foo).unwrap();
        deployment.metadata.resource_version = Some("200".into());
        deployment.status = Some(DeploymentStatus {
            available_replicas: Some(available),
            ..DeploymentStatus::default()
        });
        deployment
    }

    fn store<K>(objects: Vec<K>) -> Store<K>
    where
        K: kube::Resource<DynamicType = ()> + Clone + 'static,
    {
        let mut writer = Writer::default();
        writer.apply_watcher_event(&watcher::Event::Init);
        for obj in objects {
            writer.apply_watcher_event(&watcher::Event::InitApply(obj));
        }
        writer.apply_watcher_event(&watcher::Event::InitDone);
        writer.as_reader()
    }

    fn key() -> ObjectRef<Foo> {
        ObjectRef::new("example").within("default")
    }

    #[tokio::test]
    async fn creates_missing_deployment_owned_by_foo() {
        let foo = test_foo(Some(1), Some(""));
        let (reconciler, fakeserver) = testcontext(vec![foo.clone()], vec![]);
        let mocksrv = fakeserver.run(Scenario::Create { available: 1 });

        let outcome = reconciler.reconcile(&key()).await.expect("reconciler");
        assert_eq!(outcome, Outcome::Synced(DeploymentChange::Created));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn replica_and_image_drift_is_fixed_with_one_update() {
        let old = test_foo(Some(1), Some("istiaka2i/bookapp:v0.9"));
        let current = existing_deployment(&old, 1);
        let foo = test_foo(Some(3), None);
        let (reconciler, fakeserver) = testcontext(vec![foo], vec![current]);
        let mocksrv = fakeserver.run(Scenario::Update {
            replicas: 3,
            image: DEFAULT_IMAGE,
            available: 3,
        });

        let outcome = reconciler.reconcile(&key()).await.expect("reconciler");
        assert_eq!(outcome, Outcome::Synced(DeploymentChange::Updated));
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn matching_deployment_only_refreshes_status() {
        let foo = test_foo(Some(2), None);
        let current = existing_deployment(&foo, 2);
        let (reconciler, fakeserver) = testcontext(vec![foo], vec![current]);
        let mocksrv = fakeserver.run(Scenario::StatusOnly { available: 2, times: 2 });

        // reconciling an unchanged Foo twice writes nothing but its status
        for _ in 0..2 {
            let outcome = reconciler.reconcile(&key()).await.expect("reconciler");
            assert_eq!(outcome, Outcome::Synced(DeploymentChange::Unchanged));
        }
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn empty_deployment_name_is_skipped_without_api_calls() {
        let mut foo = test_foo(Some(1), None);
        foo.spec.deployment_name = String::new();
        let (reconciler, mut fakeserver) = testcontext(vec![foo], vec![]);

        let outcome = tokio::time::timeout(Duration::from_secs(1), reconciler.reconcile(&key()))
            .await
            .expect("no api call expected")
            .expect("reconciler");
        assert_eq!(outcome, Outcome::InvalidSpec);
        assert!(poll!(Box::pin(fakeserver.0.next_request())).is_pending());
    }

    #[tokio::test]
    async fn deleted_foo_is_not_an_error() {
        let (reconciler, mut fakeserver) = testcontext(vec![], vec![]);
        let outcome = reconciler.reconcile(&key()).await.expect("reconciler");
        assert_eq!(outcome, Outcome::Deleted);
        assert!(poll!(Box::pin(fakeserver.0.next_request())).is_pending());
    }

    #[tokio::test]
    async fn foreign_deployment_is_never_touched() {
        let foo = test_foo(Some(3), None);
        let mut current = existing_deployment(&foo, 1);
        current.metadata.owner_references = None;
        let (reconciler, mut fakeserver) = testcontext(vec![foo], vec![current]);

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::NotOwned { .. }), "{err}");
        assert!(!err.is_retryable());
        assert!(poll!(Box::pin(fakeserver.0.next_request())).is_pending());
    }

    #[tokio::test]
    async fn create_failure_is_returned_for_retry() {
        let foo = test_foo(Some(1), None);
        let (reconciler, fakeserver) = testcontext(vec![foo], vec![]);
        let mocksrv = fakeserver.run(Scenario::CreateFails);

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::CreateDeployment { .. }), "{err}");
        assert!(err.is_retryable());
        timeout_after_1s(mocksrv).await;
    }

    #[tokio::test]
    async fn status_conflict_is_returned_for_retry() {
        let foo = test_foo(Some(2), None);
        let current = existing_deployment(&foo, 1);
        let (reconciler, fakeserver) = testcontext(vec![foo], vec![current]);
        let mocksrv = fakeserver.run(Scenario::StatusConflict);

        let err = reconciler.reconcile(&key()).await.unwrap_err();
        assert!(matches!(err, Error::UpdateFooStatus { .. }), "{err}");
        assert!(err.is_retryable());
        timeout_after_1s(mocksrv).await;
    }

    // ------------------------------------------------------------------------
    // mock test setup cruft
    // ------------------------------------------------------------------------

    type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
    struct ApiServerVerifier(ApiServerHandle);

    async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("timeout on mock apiserver")
            .expect("scenario succeeded")
    }

    /// Scenarios the mock apiserver can play
    enum Scenario {
        /// Deployment POST, then a status PUT
        Create { available: i32 },
        /// Deployment PUT, then a status PUT
        Update {
            replicas: i32,
            image: &'static str,
            available: i32,
        },
        /// Status PUTs only
        StatusOnly { available: i32, times: usize },
        /// Deployment POST answered with a server error
        CreateFails,
        /// Status PUT answered with a conflict
        StatusConflict,
    }

    impl ApiServerVerifier {
        /// Play `scenario`, asserting on every request the reconciler makes
        ///
        /// NB: extra requests not handled by the scenario surface as a
        /// `Service(Closed(()))` error in the reconciler.
        fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
            tokio::spawn(async move {
                match scenario {
                    Scenario::Create { available } => {
                        self.handle_deployment_create(available)
                            .await
                            .handle_status_update(available)
                            .await
                    }
                    Scenario::Update {
                        replicas,
                        image,
                        available,
                    } => {
                        self.handle_deployment_replace(replicas, image, available)
                            .await
                            .handle_status_update(available)
                            .await
                    }
                    Scenario::StatusOnly { available, times } => {
                        let mut verifier = self;
                        for _ in 0..times {
                            verifier = verifier.handle_status_update(available).await;
                        }
                        verifier
                    }
                    Scenario::CreateFails => {
                        self.handle_error(Method::POST, DEPLOYMENTS, StatusCode::INTERNAL_SERVER_ERROR)
                            .await
                    }
                    Scenario::StatusConflict => {
                        self.handle_error(Method::PUT, FOO_STATUS, StatusCode::CONFLICT).await
                    }
                };
            })
        }

        async fn next_json(&mut self, method: Method, path: &str) -> (serde_json::Value, SendResponse) {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), method);
            assert_eq!(request.uri().path(), path);
            let body = request.into_body().collect_bytes().await.unwrap();
            (serde_json::from_slice(&body).expect("valid json"), send)
        }

        async fn handle_deployment_create(mut self, available: i32) -> Self {
            let (body, send) = self.next_json(Method::POST, DEPLOYMENTS).await;
            assert_json_include!(
                actual: body.clone(),
                expected: json!({
                    "metadata": {
                        "name": "example-foo",
                        "ownerReferences": [{
                            "apiVersion": "sample.com/v1alpha1",
                            "kind": "Foo",
                            "name": "example",
                            "uid": FOO_UID,
                            "controller": true,
                        }],
                    },
                    "spec": {
                        "replicas": 1,
                        "selector": { "matchLabels": { "app": "foo" } },
                        "template": {
                            "metadata": { "labels": { "app": "foo" } },
                            "spec": { "containers": [{ "name": "main", "image": DEFAULT_IMAGE }] },
                        },
                    },
                })
            );
            send.send_response(deployment_response(body, available));
            self
        }

        async fn handle_deployment_replace(mut self, replicas: i32, image: &str, available: i32) -> Self {
            let (body, send) = self
                .next_json(Method::PUT, &format!("{DEPLOYMENTS}/example-foo"))
                .await;
            assert_json_include!(
                actual: body.clone(),
                expected: json!({
                    "metadata": { "name": "example-foo" },
                    "spec": {
                        "replicas": replicas,
                        "template": { "spec": { "containers": [{ "image": image }] } },
                    },
                })
            );
            send.send_response(deployment_response(body, available));
            self
        }

        async fn handle_status_update(mut self, available: i32) -> Self {
            let (body, send) = self.next_json(Method::PUT, FOO_STATUS).await;
            assert_eq!(body["status"], json!({ "availableReplicas": available }));
            // the spec travels unchanged alongside the status
            assert_eq!(body["spec"]["deploymentName"], "example-foo");
            assert_eq!(body["metadata"]["resourceVersion"], "100");
            let response = serde_json::to_vec(&body).unwrap();
            send.send_response(Response::builder().body(Body::from(response)).unwrap());
            self
        }

        async fn handle_error(mut self, method: Method, path: &str, code: StatusCode) -> Self {
            let (request, send) = self.0.next_request().await.expect("service not called");
            assert_eq!(request.method(), method);
            assert_eq!(request.uri().path(), path);
            let status = json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "injected failure",
                "reason": if code == StatusCode::CONFLICT { "Conflict" } else { "InternalError" },
                "code": code.as_u16(),
            });
            let response = serde_json::to_vec(&status).unwrap();
            send.send_response(Response::builder().status(code).body(Body::from(response)).unwrap());
            self
        }
    }

    type SendResponse = tower_test::mock::SendResponse<Response<Body>>;

    const DEPLOYMENTS: &str = "/apis/apps/v1/namespaces/default/deployments";
    const FOO_STATUS: &str = "/apis/sample.com/v1alpha1/namespaces/default/foos/example/status";

    /// Echo a written Deployment back as the apiserver would, with the rollout already done
    fn deployment_response(mut body: serde_json::Value, available: i32) -> Response<Body> {
        body["status"] = json!({ "availableReplicas": available });
        let response = serde_json::to_vec(&body).unwrap();
        Response::builder().body(Body::from(response)).unwrap()
    }

    // Create a test context with a mocked kube client
    fn testcontext(foos: Vec<Foo>, deployments: Vec<Deployment>) -> (Reconciler, ApiServerVerifier) {
        let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
        let mock_client = Client::new(mock_service, "default");
        let reconciler = Reconciler::new(mock_client, store(foos), store(deployments));
        (reconciler, ApiServerVerifier(handle))
    }
}
