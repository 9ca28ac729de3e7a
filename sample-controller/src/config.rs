//! Command line configuration
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    Client, Config,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    controller::{Settings, DEFAULT_CACHE_SYNC_TIMEOUT, DEFAULT_WORKERS},
    Error, Result,
};

/// Output format of the log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human readable lines
    Text,
    /// One JSON object per line
    Json,
}

/// Reconciles Foo resources into Deployments
#[derive(Debug, Parser)]
#[command(name = "sample-controller", version)]
pub struct Args {
    /// Path to a kubeconfig file [default: ~/.kube/config, falling back to in-cluster config]
    #[arg(long)]
    pub kubeconfig: Option<PathBuf>,

    /// Number of Foo objects reconciled concurrently
    #[arg(long, default_value_t = DEFAULT_WORKERS, value_parser = clap::value_parser!(u16).range(1..))]
    pub workers: u16,

    /// Seconds to wait for the initial cache sync before giving up
    #[arg(long, default_value_t = DEFAULT_CACHE_SYNC_TIMEOUT.as_secs())]
    pub cache_sync_timeout: u64,

    /// Log output format, filtered through RUST_LOG
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl Args {
    /// Install the global tracing subscriber
    pub fn init_tracing(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
        match self.log_format {
            LogFormat::Text => subscriber.init(),
            LogFormat::Json => subscriber.json().init(),
        }
    }

    /// Settings for [`Controller::run`](crate::Controller::run)
    pub fn settings(&self) -> Settings {
        Settings {
            workers: self.workers,
            cache_sync_timeout: Duration::from_secs(self.cache_sync_timeout),
        }
    }

    /// The kubeconfig to load, if any
    ///
    /// An explicit path is always used. The per-user default only applies when it exists,
    /// otherwise the in-cluster environment is tried.
    pub fn kubeconfig_path(&self) -> Option<PathBuf> {
        match &self.kubeconfig {
            Some(path) => Some(path.clone()),
            None => default_kubeconfig().filter(|path| path.exists()),
        }
    }

    /// Build a client for the configured cluster
    pub async fn client(&self) -> Result<Client> {
        let config = match self.kubeconfig_path() {
            Some(path) => {
                info!(kubeconfig = %path.display(), "Loading kubeconfig");
                load_kubeconfig(&path).await?
            }
            None => {
                info!("No kubeconfig found, inferring cluster config");
                Config::infer().await.map_err(Error::InferConfig)?
            }
        };
        Client::try_from(config).map_err(Error::BuildClient)
    }
}

fn default_kubeconfig() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".kube").join("config"))
}

async fn load_kubeconfig(path: &Path) -> Result<Config> {
    let kubeconfig = Kubeconfig::read_from(path).map_err(Error::Kubeconfig)?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(Error::Kubeconfig)
}
