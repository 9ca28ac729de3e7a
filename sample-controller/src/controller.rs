//! Wires the informers, the work queue and the worker pool together
use std::{convert::Infallible, sync::Arc, time::Duration};

use futures::{
    channel::mpsc::UnboundedReceiver,
    future::{self, BoxFuture},
    FutureExt, StreamExt,
};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{
        controller::{self, applier, Action},
        reflector::{ObjectRef, Store},
        watcher,
    },
    Api, Client,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    crd::Foo,
    handler::EventHandler,
    informer::Informer,
    queue::{work_queue, RateLimiter, WorkQueue},
    reconciler::Reconciler,
    Error, Result,
};

/// Default number of concurrent reconciliations
pub const DEFAULT_WORKERS: u16 = 2;

/// Default bound on the initial cache sync
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(120);

/// Runtime knobs of [`Controller::run`]
#[derive(Debug, Clone)]
pub struct Settings {
    /// Size of the worker pool
    pub workers: u16,
    /// How long to wait for the caches before giving up
    pub cache_sync_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            cache_sync_timeout: DEFAULT_CACHE_SYNC_TIMEOUT,
        }
    }
}

/// State shared by the workers
pub struct Context {
    reconciler: Reconciler,
    limiter: RateLimiter<Foo>,
}

impl Context {
    /// Context with a fresh rate limiter
    pub fn new(reconciler: Reconciler) -> Self {
        Self {
            reconciler,
            limiter: RateLimiter::default(),
        }
    }
}

/// The Foo controller
///
/// Watches Foo and Deployment objects in all namespaces and keeps every Foo's Deployment
/// in line with its spec.
pub struct Controller {
    client: Client,
    foos: Informer<Foo>,
    deployments: Informer<Deployment>,
    queue: WorkQueue<Foo>,
    keys: UnboundedReceiver<ObjectRef<Foo>>,
}

impl Controller {
    /// Set up informers and the work queue, nothing runs until [`Controller::run`]
    pub fn new(client: Client) -> Self {
        let (queue, keys) = work_queue();
        Self {
            client,
            foos: Informer::default(),
            deployments: Informer::default(),
            queue,
            keys,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Workers only start once both caches hold a complete initial list; failing to get there,
    /// including a shutdown that arrives first, is fatal. After cancellation, reconciliations
    /// already in flight are allowed to finish and `Ok(())` is returned.
    pub async fn run(self, shutdown: CancellationToken, settings: Settings) -> Result<()> {
        let Controller {
            client,
            foos,
            deployments,
            queue,
            keys,
        } = self;
        let stop = shutdown.child_token();
        let foo_store = foos.store();
        let deployment_store = deployments.store();
        let handler = EventHandler::new(foo_store.clone(), queue.clone());

        info!("Starting Foo controller");
        let informers = [
            tokio::spawn(foos.run(
                Api::all(client.clone()),
                watcher::Config::default(),
                stop.clone(),
                {
                    let handler = handler.clone();
                    move |notification| handler.on_foo(notification)
                },
            )),
            tokio::spawn(deployments.run(
                Api::all(client.clone()),
                watcher::Config::default(),
                stop.clone(),
                move |notification| handler.on_deployment(notification),
            )),
        ];

        info!("Waiting for informer caches to sync");
        let synced = wait_for_cache_sync(&stop, settings.cache_sync_timeout, &foo_store, &deployment_store).await;
        if synced.is_ok() {
            info!(count = settings.workers, "Starting workers");
            let context = Arc::new(Context::new(Reconciler::new(
                client,
                foo_store.clone(),
                deployment_store,
            )));
            run_workers(context, foo_store, keys, stop.clone(), settings.workers).await;
            info!("Shutting down workers");
        }

        stop.cancel();
        queue.shut_down();
        for informer in future::join_all(informers).await {
            if let Err(error) = informer {
                warn!(%error, "informer task failed");
            }
        }
        synced
    }
}

/// Wait until both caches have synced, `shutdown` is cancelled or `timeout` expires
pub async fn wait_for_cache_sync(
    shutdown: &CancellationToken,
    timeout: Duration,
    foos: &Store<Foo>,
    deployments: &Store<Deployment>,
) -> Result<()> {
    let synced = async { futures::try_join!(foos.wait_until_ready(), deployments.wait_until_ready()) };
    tokio::select! {
        () = shutdown.cancelled() => Err(Error::CacheSyncAborted),
        synced = tokio::time::timeout(timeout, synced) => match synced {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::CacheSyncAborted),
            Err(_) => Err(Error::CacheSyncTimeout(timeout)),
        },
    }
}

/// Drain `keys` with up to `workers` concurrent reconciliations until `shutdown`
///
/// The kube runtime applier provides the queue semantics: keys are coalesced while
/// queued, a key is never processed by two workers at once, and failed keys come back
/// after the delay chosen by [`error_policy`].
pub async fn run_workers(
    context: Arc<Context>,
    foos: Store<Foo>,
    keys: UnboundedReceiver<ObjectRef<Foo>>,
    shutdown: CancellationToken,
    workers: u16,
) {
    let queue = keys
        .map(Ok::<_, Infallible>)
        .take_until(shutdown.cancelled_owned());
    let config = controller::Config::default().concurrency(workers);
    applier(reconcile, error_policy, context.clone(), foos, queue, config)
        .for_each(|result| {
            match result {
                Ok((key, _)) => info!(foo = %key, "Successfully synced"),
                Err(controller::Error::ObjectNotFound(key)) => {
                    debug!(foo = %key, "Foo referenced by item in work queue no longer exists");
                    // a Foo recreated under the same name starts without backoff
                    let foo = ObjectRef::<Foo>::new(&key.name);
                    let foo = match key.namespace.as_deref() {
                        Some(namespace) => foo.within(namespace),
                        None => foo,
                    };
                    context.limiter.forget(&foo);
                }
                // logged by the error policy together with the retry decision
                Err(controller::Error::ReconcilerFailed(..)) => {}
                Err(error) => warn!(%error, "work queue failure"),
            }
            future::ready(())
        })
        .await;
}

fn reconcile(foo: Arc<Foo>, ctx: Arc<Context>) -> BoxFuture<'static, Result<Action>> {
    async move {
        let key = ObjectRef::from_obj(foo.as_ref());
        ctx.reconciler.reconcile(&key).await?;
        ctx.limiter.forget(&key);
        Ok(Action::await_change())
    }
    .boxed()
}

/// Requeue transient failures with backoff, park permanent ones until the Foo changes
pub fn error_policy(foo: Arc<Foo>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = ObjectRef::from_obj(foo.as_ref());
    if error.is_retryable() {
        let delay = ctx.limiter.when(&key);
        error!(
            foo = %key,
            %error,
            retries = ctx.limiter.retries(&key),
            ?delay,
            "Error syncing; requeuing for later retry"
        );
        Action::requeue(delay)
    } else {
        ctx.limiter.forget(&key);
        warn!(foo = %key, %error, "Error syncing; not retrying until the object changes");
        Action::await_change()
    }
}
