//! Container image builds

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::deploy::process::{tool_available, CommandSpec, ProcessRunner};
use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::models::deployment::AppType;

/// Inputs for one image build
#[derive(Debug, Clone)]
pub struct ImageBuildRequest {
    /// Source tree used as build context
    pub context: Dir,
    pub image: String,
    pub app_type: AppType,
    pub container_port: u16,
    /// Variables made available to the build
    pub env: BTreeMap<String, String>,
}

/// Produces a runnable image from a source tree
#[async_trait]
pub trait ImageBuilder: Send + Sync {
    async fn build(&self, request: &ImageBuildRequest) -> Result<(), AgentError>;
}

/// Builds with the docker CLI, falling back to nixpacks or a generated recipe
pub struct DockerImageBuilder {
    runner: Arc<dyn ProcessRunner>,
    docker_bin: String,
    nixpacks_bin: String,
    timeout: Duration,
}

impl DockerImageBuilder {
    pub fn new(runner: Arc<dyn ProcessRunner>, docker_bin: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runner,
            docker_bin: docker_bin.into(),
            nixpacks_bin: "nixpacks".to_string(),
            timeout,
        }
    }

    async fn docker_build(&self, request: &ImageBuildRequest) -> Result<(), AgentError> {
        let context = request.context.path().display().to_string();
        let spec = CommandSpec::new(&self.docker_bin)
            .args(["build", "-t", request.image.as_str(), context.as_str()])
            .timeout(self.timeout);
        let output = self.runner.run(&spec).await.map_err(build_error)?;
        if !output.success() {
            return Err(AgentError::BuildError(format!(
                "docker build exited with {:?}: {}",
                output.exit_code,
                output.stderr_excerpt()
            )));
        }
        Ok(())
    }

    async fn nixpacks_build(&self, request: &ImageBuildRequest) -> Result<(), AgentError> {
        let context = request.context.path().display().to_string();
        let mut spec = CommandSpec::new(&self.nixpacks_bin)
            .args(["build", context.as_str(), "--name", request.image.as_str()])
            .args(["--env".to_string(), format!("PORT={}", request.container_port)])
            .timeout(self.timeout);
        // Values travel through the process environment, not argv
        for (key, value) in &request.env {
            spec = spec.arg("--env").arg(key.as_str()).env(key.as_str(), value.as_str());
        }

        let output = self.runner.run(&spec).await.map_err(build_error)?;
        if !output.success() {
            return Err(AgentError::BuildError(format!(
                "nixpacks exited with {:?}: {}",
                output.exit_code,
                output.stderr_excerpt()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(&self, request: &ImageBuildRequest) -> Result<(), AgentError> {
        info!("Building {} ({})", request.image, request.app_type);

        if request.context.contains("Dockerfile").await {
            debug!("Using repository Dockerfile");
            return self.docker_build(request).await;
        }

        if tool_available(self.runner.as_ref(), &self.nixpacks_bin, "--version").await {
            debug!("Using nixpacks");
            return self.nixpacks_build(request).await;
        }

        let recipe = generated_dockerfile(request.app_type, request.container_port)
            .ok_or_else(|| {
                AgentError::BuildError(format!(
                    "no Dockerfile and no build recipe for {}",
                    request.app_type
                ))
            })?;
        warn!("nixpacks unavailable, generating a Dockerfile for {}", request.app_type);
        request
            .context
            .file("Dockerfile")
            .write_string(&recipe)
            .await?;
        self.docker_build(request).await
    }
}

fn build_error(err: AgentError) -> AgentError {
    match err {
        AgentError::TimeoutError(m) => AgentError::BuildError(format!("timed out: {}", m)),
        AgentError::ProcessError(m) => AgentError::BuildError(m),
        other => other,
    }
}

/// Minimal build recipe for an application type
pub fn generated_dockerfile(app_type: AppType, port: u16) -> Option<String> {
    let body = match app_type {
        AppType::Node => format!(
            "FROM node:20-alpine\n\
             WORKDIR /app\n\
             COPY package*.json ./\n\
             RUN npm ci --omit=dev || npm install --omit=dev\n\
             COPY . .\n\
             ENV NODE_ENV=production PORT={port}\n\
             EXPOSE {port}\n\
             CMD [\"npm\", \"start\"]\n"
        ),
        AppType::Python => format!(
            "FROM python:3.12-slim\n\
             RUN apt-get update && apt-get install -y --no-install-recommends curl \
             && rm -rf /var/lib/apt/lists/*\n\
             WORKDIR /app\n\
             COPY . .\n\
             RUN if [ -f requirements.txt ]; then pip install --no-cache-dir -r requirements.txt; fi\n\
             ENV PORT={port}\n\
             EXPOSE {port}\n\
             CMD [\"sh\", \"-c\", \"gunicorn -b 0.0.0.0:$PORT app:app || python app.py\"]\n"
        ),
        AppType::Go => format!(
            "FROM golang:1.22-alpine AS build\n\
             WORKDIR /src\n\
             COPY . .\n\
             RUN CGO_ENABLED=0 go build -o /out/app .\n\
             FROM alpine:3.20\n\
             COPY --from=build /out/app /app\n\
             ENV PORT={port}\n\
             EXPOSE {port}\n\
             CMD [\"/app\"]\n"
        ),
        AppType::Rust => format!(
            "FROM rust:1 AS build\n\
             WORKDIR /src\n\
             COPY . .\n\
             RUN cargo install --path . --root /out\n\
             FROM debian:bookworm-slim\n\
             RUN apt-get update && apt-get install -y --no-install-recommends curl ca-certificates \
             && rm -rf /var/lib/apt/lists/*\n\
             COPY --from=build /out/bin/ /usr/local/bin/\n\
             ENV PORT={port}\n\
             EXPOSE {port}\n\
             CMD [\"sh\", \"-c\", \"exec $(ls /usr/local/bin/* | head -n 1)\"]\n"
        ),
        AppType::Static => format!(
            "FROM nginx:alpine\n\
             COPY . /usr/share/nginx/html\n\
             RUN sed -i 's/listen  *80;/listen {port};/' /etc/nginx/conf.d/default.conf\n\
             EXPOSE {port}\n"
        ),
        _ => return None,
    };
    Some(body)
}
