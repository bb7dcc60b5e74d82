use std::sync::Arc;

use anyhow::Context;
use bollard::Docker;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stevedore::config::{ManagerConfig, WorkerConfig};
use stevedore::manager::{Manager, ManagerApi};
use stevedore::scheduler::SchedulerKind;
use stevedore::task::{ContainerRuntime, DockerClient};
use stevedore::worker::{Worker, WorkerApi};

const WORKER_COUNT: u16 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stevedore=info")),
        )
        .init();

    let manager_config = ManagerConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;

    let docker = Docker::connect_with_unix_defaults()
        .context("failed to connect to the docker daemon")?;
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerClient::new(docker));

    let mut worker_names = Vec::new();
    for i in 0..WORKER_COUNT {
        let port = worker_config.port + i;
        let name = format!("{}:{}", worker_config.host, port);
        info!(worker = %name, "starting worker");

        let worker = Arc::new(Worker::new(&name, runtime.clone()));
        tokio::spawn(worker.clone().run_tasks());
        tokio::spawn(worker.clone().update_tasks());
        tokio::spawn(worker.clone().collect_stats());

        let api = WorkerApi::new(worker, &worker_config.host, port);
        tokio::spawn(async move {
            if let Err(err) = api.start().await {
                error!(error = %err, "worker api server failed");
                std::process::exit(1);
            }
        });

        worker_names.push(name);
    }

    info!(workers = worker_names.len(), "starting manager");
    let manager = Arc::new(Manager::new(worker_names, SchedulerKind::Epvm));
    tokio::spawn(manager.clone().process_tasks());
    tokio::spawn(manager.clone().update_tasks_loop());
    tokio::spawn(manager.clone().run_health_checks());

    let api = ManagerApi::new(manager, &manager_config.host, manager_config.port);
    api.start().await.context("manager api server failed")?;

    Ok(())
}
