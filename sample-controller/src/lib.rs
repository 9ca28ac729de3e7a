//! A Kubernetes controller for the `Foo` custom resource
//!
//! Every `Foo` names a Deployment that should exist next to it. The controller creates that
//! Deployment when it is missing, corrects its replica count and image when they drift, and
//! copies the number of available replicas back into the status of the `Foo`.
//!
//! The moving parts, in the order events flow through them:
//!
//! - [`informer`] keeps a local cache of Foo and Deployment objects and reports changes
//! - [`handler`] maps those changes to the key of the Foo that needs attention
//! - [`queue`] carries the keys and rate limits retries
//! - [`controller`] runs a pool of workers draining the queue
//! - [`reconciler`] brings one Foo in line, using [`deployment`] to build the desired state
pub mod config;
pub mod controller;
pub mod crd;
pub mod deployment;
mod error;
pub mod handler;
pub mod informer;
pub mod queue;
pub mod reconciler;
pub mod signals;

pub use controller::{Controller, Settings};
pub use crd::{Foo, FooSpec, FooStatus};
pub use error::{Error, Result};
