//! Turns cache notifications into work queue keys
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::reflector::{ObjectRef, Store},
    Resource, ResourceExt,
};
use tracing::debug;

use crate::{
    crd::Foo,
    informer::{DeletedObject, Notification},
    queue::WorkQueue,
};

/// Event handlers registered on the Foo and Deployment informers
#[derive(Clone)]
pub struct EventHandler {
    foos: Store<Foo>,
    queue: WorkQueue<Foo>,
}

impl EventHandler {
    /// Handlers resolving Deployment owners through `foos`
    pub fn new(foos: Store<Foo>, queue: WorkQueue<Foo>) -> Self {
        Self { foos, queue }
    }

    /// Every Foo notification, including resyncs, queues the Foo itself
    pub fn on_foo(&self, notification: Notification<Foo>) {
        self.enqueue(&notification.into_latest());
    }

    /// Deployment notifications queue the Foo controlling the Deployment, if any
    pub fn on_deployment(&self, notification: Notification<Deployment>) {
        let deployment = match notification {
            Notification::Added(deployment) => deployment,
            Notification::Updated { old, new } => {
                // periodic resyncs replay objects that did not change
                if old.resource_version() == new.resource_version() {
                    return;
                }
                new
            }
            Notification::Deleted(DeletedObject::Live(deployment)) => deployment,
            Notification::Deleted(DeletedObject::Tombstone(deployment)) => {
                debug!(deployment = %deployment.name_any(), "Recovered deleted object");
                deployment
            }
        };
        self.handle_object(deployment.as_ref());
    }

    fn handle_object<K: Resource>(&self, object: &K) {
        let Some(owner) = object.owner_references().iter().find(|o| o.controller == Some(true)) else {
            return;
        };
        if owner.kind != Foo::kind(&()) {
            return;
        }
        let namespace = object.meta().namespace.as_deref().unwrap_or_default();
        let key = ObjectRef::<Foo>::new(&owner.name).within(namespace);
        match self.foos.get(&key) {
            Some(foo) => self.enqueue(&foo),
            None => debug!(
                object = %object.meta().name.as_deref().unwrap_or_default(),
                foo = %owner.name,
                "Ignore orphaned object"
            ),
        }
    }

    fn enqueue(&self, foo: &Arc<Foo>) {
        self.queue.add(ObjectRef::from_obj(foo.as_ref()));
    }
}
