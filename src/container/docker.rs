//! Docker implementation of [`ContainerRuntime`] over bollard.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::image::BuildImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig, HostConfigLogConfig};
use bollard::Docker;
use futures_util::StreamExt;

use super::runtime::{ChunkStream, ContainerRuntime, ContainerStatus, RunOptions, StatsStream};
use crate::error::{Error, Result};

/// Docker-backed container runtime.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connects to the local Docker socket.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Config(format!("cannot connect to Docker: {}", e)))?;
        Ok(Self { docker })
    }

    /// Capped json-file logging so long runs cannot fill the host disk.
    fn log_config() -> HostConfigLogConfig {
        HostConfigLogConfig {
            typ: Some("json-file".to_string()),
            config: Some(HashMap::from([
                ("max-size".to_string(), "10m".to_string()),
                ("max-file".to_string(), "3".to_string()),
            ])),
        }
    }
}

/// Packs the build context directory into an uncompressed tar archive.
fn tar_context(context: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", context)?;
    Ok(builder.into_inner()?)
}

fn run_error(e: bollard::errors::Error) -> Error {
    Error::ContainerRun(e.to_string())
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn build_image(
        &self,
        image: &str,
        context: &Path,
        dockerfile: Option<&str>,
    ) -> Result<()> {
        let tarball = tar_context(context).map_err(|e| Error::Build(e.to_string()))?;
        let options = BuildImageOptions::<String> {
            dockerfile: dockerfile.unwrap_or("Dockerfile").to_string(),
            t: image.to_string(),
            rm: true,
            platform: "linux/amd64".to_string(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(bytes::Bytes::from(tarball)));
        while let Some(frame) = stream.next().await {
            let info = frame.map_err(|e| Error::Build(e.to_string()))?;
            if let Some(message) = info.error {
                return Err(Error::Build(message));
            }
            if let Some(line) = info.stream {
                tracing::debug!(image, "{}", line.trim_end());
            }
        }
        Ok(())
    }

    async fn start_container(&self, image: &str, opts: &RunOptions) -> Result<String> {
        let binds = opts
            .bind_mount
            .as_ref()
            .map(|host| vec![format!("{}:/mnt:rw", host.display())]);

        let host_config = HostConfig {
            binds,
            privileged: Some(true),
            log_config: Some(Self::log_config()),
            ..Default::default()
        };
        let config = Config::<String> {
            image: Some(image.to_string()),
            cmd: opts.command.clone(),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, config)
            .await
            .map_err(run_error)?;
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
            .map_err(run_error)?;
        Ok(created.id)
    }

    async fn container_status(&self, id: &str) -> Result<ContainerStatus> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(run_error)?;
        let status = inspect
            .state
            .and_then(|state| state.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);
        Ok(match status {
            ContainerStateStatusEnum::CREATED => ContainerStatus::Created,
            ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::PAUSED => {
                ContainerStatus::Running
            }
            ContainerStateStatusEnum::EXITED => ContainerStatus::Exited,
            ContainerStateStatusEnum::DEAD => ContainerStatus::Dead,
            _ => ContainerStatus::Unknown,
        })
    }

    async fn wait_exit(&self, id: &str) -> Result<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions<String>>);
        match stream.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // bollard reports a non-zero exit as a wait error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(run_error(e)),
            None => Ok(-1),
        }
    }

    async fn stop_container(&self, id: &str) -> Result<()> {
        self.docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
            .map_err(run_error)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(run_error)
    }

    async fn log_stream(&self, id: &str) -> Result<ChunkStream> {
        let stream = self
            .docker
            .logs(
                id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            )
            .map(|item| {
                item.map(|output| String::from_utf8_lossy(&output.into_bytes()).into_owned())
                    .map_err(run_error)
            });
        Ok(Box::pin(stream))
    }

    async fn attach_stream(&self, id: &str) -> Result<ChunkStream> {
        let results = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(run_error)?;
        let stream = results.output.map(|item| {
            item.map(|output| String::from_utf8_lossy(&output.into_bytes()).into_owned())
                .map_err(run_error)
        });
        Ok(Box::pin(stream))
    }

    async fn stats_stream(&self, id: &str) -> Result<StatsStream> {
        let stream = self
            .docker
            .stats(
                id,
                Some(StatsOptions {
                    stream: true,
                    one_shot: false,
                }),
            )
            .map(|item| {
                item.map_err(run_error).and_then(|stats| {
                    serde_json::to_value(&stats).map_err(|e| Error::ContainerRun(e.to_string()))
                })
            });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn tar_context_packs_nested_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".sadguard")).unwrap();
        std::fs::write(dir.path().join(".sadguard/Dockerfile"), "FROM scratch\n").unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();

        let tarball = tar_context(dir.path()).unwrap();

        let mut archive = tar::Archive::new(&tarball[..]);
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect();
        assert!(names.iter().any(|n| n.ends_with("app.py")));
        assert!(names.iter().any(|n| n.contains(".sadguard")));
    }
}
