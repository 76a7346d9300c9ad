//! Artifact pipeline: resolve sources, compile, publish.
//!
//! ```text
//! CREATED ─► SOURCES_RESOLVED ─► COMPILING ─► COMPILED ─► PUBLISHING ─► COMPLETED
//! ```
//!
//! Every source is resolved through the artifacts adapter concurrently.
//! Compilation is handed to the adapter, which calls back `COMPILED`;
//! publication is a retried call whose answer completes the task. Both
//! are issued by the handler of the sub-stage that waits for them, so a
//! task resumed after a restart issues them again.

use std::collections::BTreeSet;
use std::sync::Arc;

use armada_tasks::domain::{overwrite_if_some, TaskBody};
use armada_tasks::engine::{CallbackPayload, StageContext, TaskOf, Workflow};
use armada_tasks::{FailureDetail, SubStage, TaskError, TaskUpdate};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::adapter::{execute_with_retry, submit, AdapterOperation, AdapterRequest, AdapterResponse};
use crate::registry::{ResourceState, ResourceType};
use crate::workflows::{context_id_of, Services};

/// Property of the publish response holding the published location.
pub const PUBLISHED_LINK_KEY: &str = "publishedLink";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactSubStage {
    Created,
    SourcesResolved,
    Compiling,
    Compiled,
    Publishing,
    Completed,
    Error,
}

impl SubStage for ArtifactSubStage {
    const CREATED: Self = Self::Created;
    const COMPLETED: Self = Self::Completed;
    const ERROR: Self = Self::Error;
    const ALL: &'static [Self] = &[
        Self::Created,
        Self::SourcesResolved,
        Self::Compiling,
        Self::Compiled,
        Self::Publishing,
        Self::Completed,
        Self::Error,
    ];

    fn name(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::SourcesResolved => "SOURCES_RESOLVED",
            Self::Compiling => "COMPILING",
            Self::Compiled => "COMPILED",
            Self::Publishing => "PUBLISHING",
            Self::Completed => "COMPLETED",
            Self::Error => "ERROR",
        }
    }

    fn is_transient(self) -> bool {
        matches!(self, Self::Compiling | Self::Publishing)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<String>,
    /// Build target passed to the compiler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub resolved_sources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_link: Option<String>,
}

impl TaskBody for ArtifactBody {
    fn merge(&mut self, patch: Self) {
        overwrite_if_some(&mut self.name, patch.name);
        if !patch.sources.is_empty() {
            self.sources = patch.sources;
        }
        overwrite_if_some(&mut self.target, patch.target);
        self.resolved_sources.extend(patch.resolved_sources);
        overwrite_if_some(&mut self.artifact_link, patch.artifact_link);
        overwrite_if_some(&mut self.published_link, patch.published_link);
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.as_deref().unwrap_or_default().is_empty() {
            return Err("'name' must not be empty".to_string());
        }
        if self.sources.is_empty() {
            return Err("'sources' must not be empty".to_string());
        }
        Ok(())
    }
}

/// Builds and publishes one artifact; see the module docs.
#[derive(Debug, Clone)]
pub struct ArtifactPipeline {
    services: Services,
}

impl ArtifactPipeline {
    pub fn new(services: Services) -> Self {
        Self { services }
    }

    fn resolve_sources(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let policy = ctx.retry_policy();
        let operations = task
            .body
            .sources
            .iter()
            .enumerate()
            .map(|(index, source)| {
                let id = format!("{index}:{source}");
                let adapter = Arc::clone(&self.services.adapters.artifacts);
                let request = AdapterRequest::new(source, AdapterOperation::Validate);
                let source = source.clone();
                let op = async move {
                    let response = execute_with_retry(adapter, request, policy).await?;
                    // A source without a pinned form resolves to itself.
                    Ok::<_, FailureDetail>(if response.resource_links.is_empty() {
                        vec![source]
                    } else {
                        response.resource_links.into_iter().collect()
                    })
                };
                (id, op)
            })
            .collect();
        let address = ctx.address().clone();
        ctx.fan_out(operations, move |resolved: Vec<Vec<String>>| {
            let resolved: BTreeSet<String> = resolved.into_iter().flatten().collect();
            TaskUpdate::to_sub_stage(address, ArtifactSubStage::SourcesResolved)
                .with_body(json!({ "resolvedSources": resolved }))
        });
    }

    fn register_artifact(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let name = task.body.name.clone().unwrap_or_default();
        let artifact = ResourceState::new(ResourceType::Artifact, task.address.id(), &name)
            .with_correlation_id(context_id_of(task))
            .with_custom_property("target", Self::target(task));
        let artifact_link = artifact.link.clone();
        self.services.registry.ensure(artifact)?;
        ctx.send(
            ctx.next(ArtifactSubStage::Compiling)
                .with_body(json!({ "artifactLink": artifact_link })),
        );
        Ok(())
    }

    fn target(task: &TaskOf<Self>) -> String {
        task.body.target.clone().unwrap_or_else(|| "default".to_string())
    }

    fn compile(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) -> Result<(), FailureDetail> {
        let artifact_link = ResourceType::Artifact.link(task.address.id());
        let sources: Vec<&str> = task.body.resolved_sources.iter().map(String::as_str).collect();
        let request = AdapterRequest::new(&artifact_link, AdapterOperation::Create)
            .with_custom_properties(task.custom_properties.clone())
            .with_custom_property("sources", sources.join(","))
            .with_custom_property("target", Self::target(task))
            .with_callback(ctx.link(ArtifactSubStage::Compiled));
        submit(Arc::clone(&self.services.adapters.artifacts), ctx.engine(), request)?;
        Ok(())
    }

    fn publish(&self, ctx: &StageContext<Self>, task: &TaskOf<Self>) {
        let artifact_link = ResourceType::Artifact.link(task.address.id());
        let adapter = Arc::clone(&self.services.adapters.artifacts);
        let registry = Arc::clone(&self.services.registry);
        let request = AdapterRequest::new(&artifact_link, AdapterOperation::Apply)
            .with_custom_properties(task.custom_properties.clone());
        let address = ctx.address().clone();
        ctx.spawn_with_retry(
            format!("publish {artifact_link}"),
            ctx.retry_policy(),
            move |_attempt| {
                let adapter = Arc::clone(&adapter);
                let request = request.clone();
                async move { adapter.execute(&request).await }
            },
            move |response: AdapterResponse| {
                let published = response
                    .custom_properties
                    .get(PUBLISHED_LINK_KEY)
                    .cloned()
                    .unwrap_or_else(|| artifact_link.clone());
                let marked = registry.update(&artifact_link, |artifact| {
                    artifact
                        .custom_properties
                        .insert(PUBLISHED_LINK_KEY.to_string(), published.clone());
                });
                if let Err(e) = marked {
                    return TaskUpdate::failed(address, e.into());
                }
                TaskUpdate::to_sub_stage(address, ArtifactSubStage::Completed)
                    .with_resource_links(response.resource_links)
                    .with_body(json!({ "artifactLink": artifact_link, "publishedLink": published }))
            },
        );
    }
}

#[async_trait]
impl Workflow for ArtifactPipeline {
    type SubStage = ArtifactSubStage;
    type Body = ArtifactBody;
    const KIND: &'static str = "artifact-pipeline";

    fn display_name(&self) -> &'static str {
        "Artifact Pipeline"
    }

    async fn handle(&self, ctx: StageContext<Self>, task: TaskOf<Self>) -> Result<(), TaskError> {
        match task.sub_stage {
            ArtifactSubStage::Created => self.resolve_sources(&ctx, &task),
            ArtifactSubStage::SourcesResolved => {
                if let Err(failure) = self.register_artifact(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            ArtifactSubStage::Compiling => {
                if let Err(failure) = self.compile(&ctx, &task) {
                    ctx.fail(failure);
                }
            }
            ArtifactSubStage::Compiled => ctx.proceed(ArtifactSubStage::Publishing),
            ArtifactSubStage::Publishing => self.publish(&ctx, &task),
            ArtifactSubStage::Completed | ArtifactSubStage::Error => {}
        }
        Ok(())
    }

    fn finished_payload(&self, task: &TaskOf<Self>) -> CallbackPayload {
        let mut payload = CallbackPayload::with_resource_links(task.resource_links.clone());
        if let Some(published) = &task.body.published_link {
            payload = payload.with_custom_property(PUBLISHED_LINK_KEY, published);
        }
        payload
    }
}
