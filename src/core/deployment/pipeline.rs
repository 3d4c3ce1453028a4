//! Mode pipelines and the lifecycle dispatcher.
//!
//! Each pipeline is straight-line code: one stage per state transition, one
//! await point per external boundary. The chat handler consumes the event
//! channel; a disconnected consumer never cancels a running pipeline, so
//! half-provisioned cloud resources always end up with a recorded owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::core::cluster;
use crate::core::config::OrchestratorConfig;
use crate::core::credentials::CredentialScope;
use crate::core::deployment::progress::{EventSeverity, ProgressSender, StageReporter};
use crate::core::deployment::{
    DeployStart, DeploymentMode, DeploymentOutcome, DeploymentRegistry, DeploymentRequest,
    DeploymentState, LifecycleAction, action_precondition,
};
use crate::core::docker::{self, ImageRef};
use crate::core::errors::{OrchestratorError, Result};
use crate::core::kubernetes::{self, ManifestInputs};
use crate::core::process;
use crate::core::source::{self, SourceSnapshot};
use crate::core::ssh::{self, SshTarget};
use crate::core::templates;
use crate::core::terraform;
use crate::core::workspace::{DeploymentMeta, MetaError, Workspace, WorkspaceStore};

const EC2_INSTANCE_TYPE: &str = "t3.large";

#[derive(Clone)]
pub struct PipelineContext {
    pub config: Arc<OrchestratorConfig>,
    pub store: Arc<WorkspaceStore>,
    pub registry: DeploymentRegistry,
    pub events: ProgressSender,
}

/// Whether the IaC stage provisions or reuses previously recorded outputs
/// (redeploys never re-run apply).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IacPolicy {
    Provision,
    ReuseOutputs,
}

struct PipelineRun {
    ctx: PipelineContext,
    request: DeploymentRequest,
    workspace: Workspace,
    mode: DeploymentMode,
    meta: DeploymentMeta,
}

impl PipelineRun {
    /// Advance the state machine and persist the new status.
    async fn enter(&mut self, state: DeploymentState) -> Result<()> {
        self.ctx.registry.transition(&self.request.id, state)?;
        self.meta.status = state.as_str().to_string();
        self.workspace.write_meta(&mut self.meta)?;
        info!("deployment '{}' -> {}", self.request.id, state.as_str());
        Ok(())
    }

    fn reporter(&self, stage: &str) -> StageReporter {
        StageReporter::new(
            self.ctx.events.clone(),
            stage,
            Some(&self.workspace.logs_dir()),
        )
    }

    fn record_outputs(&mut self, outputs: &HashMap<String, String>) {
        self.meta.outputs.extend(outputs.clone());
    }
}

/// Run one lifecycle action to completion and return its structured outcome.
/// Errors are folded into the outcome; the terminal progress event always
/// carries it.
pub async fn run_lifecycle(
    ctx: PipelineContext,
    action: LifecycleAction,
    request: DeploymentRequest,
) -> DeploymentOutcome {
    let id = request.id.clone();
    let events = ctx.events.clone();
    let store = ctx.store.clone();
    let registry = ctx.registry.clone();

    let result = dispatch(ctx, action, request).await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("deployment '{}' {} failed: {}", id, action.as_str(), err);
            let meta_error = MetaError {
                kind: err.kind().to_string(),
                message: events.redact(&err.to_string()),
            };
            // Keep the workspace for inspection; record the failure if one
            // was ever allocated.
            if let Some(workspace) = store.locate(&id) {
                if let Ok(Some(mut meta)) = workspace.read_meta() {
                    meta.status = "failed".to_string();
                    meta.error = Some(meta_error.clone());
                    if matches!(err, OrchestratorError::Decommission(_)) {
                        meta.decommission_attempted = true;
                    }
                    let _ = workspace.write_meta(&mut meta);
                }
            }
            if registry.state(&id).is_some() {
                let _ = registry.transition(&id, DeploymentState::Failed);
            }
            DeploymentOutcome {
                deployment_id: id.clone(),
                status: "failed".to_string(),
                url: None,
                outputs: HashMap::new(),
                error: Some(meta_error),
            }
        }
    };

    let terminal = StageReporter::new(events, "deployment", None);
    let summary = match &outcome.error {
        Some(err) => format!("{}: {} ({})", outcome.status, err.message, err.kind),
        None => match &outcome.url {
            Some(url) => format!("{}: {}", outcome.status, url),
            None => outcome.status.clone(),
        },
    };
    let severity = if outcome.error.is_some() {
        EventSeverity::Error
    } else {
        EventSeverity::Info
    };
    let payload = serde_json::to_value(&outcome).unwrap_or_default();
    terminal.end_with_data(severity, &summary, payload).await;
    outcome
}

async fn dispatch(
    ctx: PipelineContext,
    action: LifecycleAction,
    request: DeploymentRequest,
) -> Result<DeploymentOutcome> {
    let existing_meta = match ctx.store.locate(&request.id) {
        Some(ws) => ws.read_meta()?,
        None => None,
    };
    let start = action_precondition(action, existing_meta.as_ref().map(|m| m.status.as_str()))?;

    match action {
        LifecycleAction::Deploy => {
            let start = start.unwrap_or(DeployStart::Fresh);
            deploy(ctx, request, start).await
        }
        LifecycleAction::Redeploy => {
            let meta = existing_meta.ok_or_else(|| {
                OrchestratorError::Validation("redeploy requires an existing deployment".into())
            })?;
            redeploy(ctx, request, meta).await
        }
        LifecycleAction::Scale => {
            let meta = existing_meta.ok_or_else(|| {
                OrchestratorError::Validation("scale requires an existing deployment".into())
            })?;
            scale(ctx, request, meta).await
        }
        LifecycleAction::Decommission => {
            let meta = existing_meta.ok_or_else(|| {
                OrchestratorError::Validation("no such deployment to decommission".into())
            })?;
            decommission(ctx, request, meta).await
        }
    }
}

// ── deploy ────────────────────────────────────────────────────────────────

async fn deploy(
    ctx: PipelineContext,
    request: DeploymentRequest,
    start: DeployStart,
) -> Result<DeploymentOutcome> {
    let mode = request.mode.ok_or_else(|| {
        OrchestratorError::Validation("deployment_mode is required for deploy".into())
    })?;

    ctx.registry.begin(&request.id, DeploymentState::Init)?;
    let _guard = ctx.store.lock(&request.id).await;
    let workspace = ctx
        .store
        .allocate(&request.id, start == DeployStart::Resume)?;

    let mut meta = match workspace.read_meta()? {
        Some(mut existing) if start == DeployStart::Resume => {
            existing.status = DeploymentState::Init.as_str().to_string();
            existing.error = None;
            existing
        }
        _ => DeploymentMeta::new(&request.id, mode, DeploymentState::Init.as_str()),
    };
    workspace.write_meta(&mut meta)?;

    let mut run = PipelineRun {
        ctx,
        request,
        workspace,
        mode,
        meta,
    };

    let total = run.ctx.config.timeouts.cloud_hosted_total;
    let outcome = match mode {
        DeploymentMode::Local => deploy_local(&mut run, IacPolicy::Provision).await?,
        DeploymentMode::CloudLocal => deploy_cloud_local(&mut run, IacPolicy::Provision).await?,
        DeploymentMode::CloudHosted => {
            match tokio::time::timeout(total, deploy_cloud_hosted(&mut run, IacPolicy::Provision))
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    return Err(OrchestratorError::SubprocessExit {
                        program: "pipeline".to_string(),
                        code: None,
                        timed_out: true,
                        tail: format!(
                            "cloud-hosted pipeline exceeded its {}s ceiling",
                            total.as_secs()
                        ),
                    });
                }
            }
        }
    };
    Ok(outcome)
}

/// Clone the repository and refuse to continue without a container recipe.
async fn clone_stage(run: &mut PipelineRun) -> Result<SourceSnapshot> {
    run.enter(DeploymentState::Cloning).await?;
    let reporter = run.reporter("clone");
    let repo_url = run.request.repo_url.clone().ok_or_else(|| {
        OrchestratorError::Validation("github_repo_url is required for deploy".into())
    })?;
    reporter.start(&format!("cloning {}", repo_url)).await;
    let snapshot = source::fetch(
        &repo_url,
        &run.workspace,
        &reporter,
        run.ctx.config.timeouts.clone,
    )
    .await?;
    if !snapshot.has_dockerfile {
        return Err(OrchestratorError::Source(format!(
            "repository {} has no Dockerfile at its root; cannot build a container image",
            repo_url
        )));
    }
    if let Some(hint) = &snapshot.build_hint {
        reporter.line(&format!("readme build hint: {}", hint)).await;
    }
    if let Some(hint) = &snapshot.run_hint {
        reporter.line(&format!("readme run hint: {}", hint)).await;
    }
    if !snapshot.ports.is_empty() {
        reporter
            .line(&format!("detected listening ports: {:?}", snapshot.ports))
            .await;
    }
    reporter
        .end(&format!("cloned at commit {}", &snapshot.commit[..12.min(snapshot.commit.len())]))
        .await;
    run.meta
        .outputs
        .insert("repo_url".to_string(), repo_url);
    Ok(snapshot)
}

fn manifest_inputs<'a>(
    run: &'a PipelineRun,
    image: &'a ImageRef,
    snapshot: &'a SourceSnapshot,
    service_type: &'a str,
    ingress_host: Option<&'a str>,
) -> ManifestInputs<'a> {
    ManifestInputs {
        app_name: &run.request.id,
        namespace: &run.request.namespace,
        image,
        replicas: run.request.replicas,
        container_port: snapshot.container_port(),
        service_type,
        image_pull_policy: "IfNotPresent",
        env_vars: &run.request.env_vars,
        ingress_host,
    }
}

fn succeeded_outcome(run: &PipelineRun, url: Option<String>) -> DeploymentOutcome {
    DeploymentOutcome {
        deployment_id: run.request.id.clone(),
        status: "succeeded".to_string(),
        url,
        outputs: run.meta.outputs.clone(),
        error: None,
    }
}

async fn finish_succeeded(run: &mut PipelineRun, image: &ImageRef, url: Option<String>) -> Result<DeploymentOutcome> {
    run.enter(DeploymentState::Succeeded).await?;
    run.meta.image_ref = Some(image.full_name());
    if let Some(url) = &url {
        run.meta.outputs.insert("app_url".to_string(), url.clone());
    }
    run.workspace.write_meta(&mut run.meta)?;
    Ok(succeeded_outcome(run, url))
}

async fn deploy_local(run: &mut PipelineRun, _iac: IacPolicy) -> Result<DeploymentOutcome> {
    let snapshot = clone_stage(run).await?;
    let image = ImageRef::local(&run.request.id, &snapshot.commit);

    run.enter(DeploymentState::Rendering).await?;
    let files = kubernetes::render_manifests(
        &run.workspace,
        &manifest_inputs(run, &image, &snapshot, "NodePort", None),
    )?;

    // No IaC in local mode; rendering flows straight into the build.
    run.enter(DeploymentState::Building).await?;
    let reporter = run.reporter("build");
    reporter.start(&format!("building {}", image.full_name())).await;
    docker::build_local(
        &run.workspace.source_dir(),
        &image,
        &reporter,
        run.ctx.config.timeouts.build,
    )
    .await?;
    reporter.end("image built").await;

    run.enter(DeploymentState::ClusterBootstrapping).await?;
    let reporter = run.reporter("cluster");
    reporter.start("ensuring local cluster").await;
    cluster::ensure_local_cluster(&run.ctx.config, &run.workspace, &reporter).await?;
    cluster::load_local_image(&run.ctx.config.kind_cluster_name, &image, &reporter).await?;
    reporter.end("cluster ready, image loaded").await;

    run.enter(DeploymentState::ApplyingManifests).await?;
    let reporter = run.reporter("apply-manifests");
    let kubeconfig = run.workspace.kubeconfig_path();
    let env = HashMap::new();
    kubernetes::apply_manifests(&kubeconfig, &env, &files, &reporter).await?;

    run.enter(DeploymentState::WaitingRollout).await?;
    let reporter = run.reporter("wait-rollout");
    kubernetes::wait_for_rollout(
        &kubeconfig,
        &env,
        &run.request.namespace,
        &run.request.id,
        run.ctx.config.timeouts.rollout,
        &reporter,
    )
    .await?;
    let node_port =
        kubernetes::get_node_port(&kubeconfig, &env, &run.request.namespace, &run.request.id)
            .await?;
    run.meta
        .outputs
        .insert("node_port".to_string(), node_port.to_string());

    finish_succeeded(run, &image, Some(format!("http://localhost:{}", node_port))).await
}

/// Run the IaC stage for one terraform root: provision, resume or reuse.
async fn iac_stage(
    run: &mut PipelineRun,
    iac: IacPolicy,
    tf_dir: &std::path::Path,
    env: &HashMap<String, String>,
    vars: &[(String, String)],
) -> Result<terraform::OutputBag> {
    if iac == IacPolicy::ReuseOutputs {
        return Ok(run.meta.outputs.clone().into());
    }
    let reporter = run.reporter("iac-apply");
    reporter.start("initializing infrastructure").await;
    terraform::init(tf_dir, env, &reporter).await?;

    let resuming = terraform::has_state(tf_dir);
    let plan = terraform::plan(
        tf_dir,
        env,
        vars,
        &reporter,
        run.ctx.config.timeouts.iac_apply,
    )
    .await?;

    if resuming {
        if !plan.is_noop() {
            return Err(OrchestratorError::IaCPlanMismatch {
                summary: plan.summary,
            });
        }
        reporter.end("existing infrastructure is current; reusing outputs").await;
        let outputs = terraform::output(tf_dir, env).await?;
        run.record_outputs(outputs.as_map());
        run.workspace.write_meta(&mut run.meta)?;
        return Ok(outputs);
    }

    reporter.line(&plan.summary).await;
    // Marked before apply: a failed apply leaves partial resources that
    // release must refuse to discard.
    run.workspace.mark_iac_state()?;
    let outputs = terraform::apply(tf_dir, env, &reporter, run.ctx.config.timeouts.iac_apply).await?;
    run.record_outputs(outputs.as_map());
    run.workspace.write_meta(&mut run.meta)?;
    reporter.end("infrastructure ready").await;
    Ok(outputs)
}

async fn deploy_cloud_local(run: &mut PipelineRun, iac: IacPolicy) -> Result<DeploymentOutcome> {
    let config = run.ctx.config.clone();
    let key_name = run.request.ec2_key_name.clone().ok_or_else(|| {
        OrchestratorError::Validation("ec2_key_name is required for cloud-local deploy".into())
    })?;
    // Fatal configuration problems surface before any external call.
    let key_path = ssh::resolve_key_path(&config, &key_name)?;

    let scope = CredentialScope::resolve(run.request.credentials.as_ref(), &config)?;
    scope.register_with(&run.ctx.events);
    scope.verify().await?;
    let env = scope.env_map();

    let snapshot = clone_stage(run).await?;
    let image = ImageRef::local(&run.request.id, &snapshot.commit);

    run.enter(DeploymentState::Rendering).await?;
    let instance_name = run
        .request
        .instance_name
        .clone()
        .unwrap_or_else(|| run.request.id.clone());
    templates::render_to_file(
        templates::TF_EC2_INSTANCE,
        &templates::vars(&[
            ("deployment_id", run.request.id.as_str()),
            ("instance_type", EC2_INSTANCE_TYPE),
            ("key_name", key_name.as_str()),
            ("cluster_name", config.kind_cluster_name.as_str()),
            ("instance_name", instance_name.as_str()),
        ]),
        &run.workspace.tf_dir().join("main.tf"),
    )?;
    let files = kubernetes::render_manifests(
        &run.workspace,
        &manifest_inputs(run, &image, &snapshot, "NodePort", None),
    )?;

    run.enter(DeploymentState::IacApplying).await?;
    let tf_dir = run.workspace.tf_dir();
    let outputs = iac_stage(run, iac, &tf_dir, &env, &[]).await?;
    let public_ip = outputs.require("public_ip")?.to_string();
    let target = SshTarget::new(&public_ip, key_path);

    run.enter(DeploymentState::Building).await?;
    let reporter = run.reporter("build");
    reporter
        .start(&format!("waiting for {} to finish bootstrap", public_ip))
        .await;
    target
        .wait_for_sentinel(ssh::BOOTSTRAP_SENTINEL, Duration::from_secs(10 * 60), &reporter)
        .await?;
    docker::build_remote(
        &target,
        &run.workspace,
        &image,
        &config.kind_cluster_name,
        &reporter,
        run.ctx.config.timeouts.build,
    )
    .await?;
    reporter.end("remote image built and loaded").await;

    run.enter(DeploymentState::ClusterBootstrapping).await?;
    let reporter = run.reporter("cluster");
    let probe = target
        .exec_captured("sudo kind get clusters", Duration::from_secs(60))
        .await?;
    let clusters = process::require_captured("ssh", probe)?;
    if !clusters.lines().any(|l| l.trim() == config.kind_cluster_name) {
        return Err(OrchestratorError::Configuration(format!(
            "cluster '{}' is not running on {}",
            config.kind_cluster_name, public_ip
        )));
    }
    reporter.line("remote cluster is up").await;

    run.enter(DeploymentState::ApplyingManifests).await?;
    let reporter = run.reporter("apply-manifests");
    remote_apply_manifests(&target, &run.request.id, &files, &reporter).await?;

    run.enter(DeploymentState::WaitingRollout).await?;
    let reporter = run.reporter("wait-rollout");
    remote_rollout_wait(
        &target,
        &run.request.namespace,
        &run.request.id,
        run.ctx.config.timeouts.rollout,
        &reporter,
    )
    .await?;
    let node_port = remote_node_port(&target, &run.request.namespace, &run.request.id).await?;
    run.meta
        .outputs
        .insert("node_port".to_string(), node_port.to_string());

    finish_succeeded(
        run,
        &image,
        Some(format!("http://{}:{}", public_ip, node_port)),
    )
    .await
}

async fn deploy_cloud_hosted(run: &mut PipelineRun, iac: IacPolicy) -> Result<DeploymentOutcome> {
    let config = run.ctx.config.clone();

    let domain_pair = match (
        run.request.base_hosted_zone_id.clone(),
        run.request.app_subdomain_label.clone(),
    ) {
        (Some(zone), Some(label)) => {
            let domain = config.default_domain.clone().ok_or_else(|| {
                OrchestratorError::Configuration(
                    "DEFAULT_DOMAIN_NAME_FOR_APPS is not set but a hosted zone was requested"
                        .into(),
                )
            })?;
            Some((zone, format!("{}.{}", label, domain)))
        }
        (None, None) => None,
        _ => {
            return Err(OrchestratorError::Validation(
                "base_hosted_zone_id and app_subdomain_label are mutually required".into(),
            ));
        }
    };

    let scope = CredentialScope::resolve(run.request.credentials.as_ref(), &config)?;
    scope.register_with(&run.ctx.events);
    scope.verify().await?;
    let env = scope.env_map();

    let snapshot = clone_stage(run).await?;
    let image = ImageRef::local(&run.request.id, &snapshot.commit);

    run.enter(DeploymentState::Rendering).await?;
    let cluster_name = run
        .request
        .instance_name
        .clone()
        .unwrap_or_else(|| run.request.id.clone());
    let cluster_tf = run.workspace.tf_dir().join("cluster");
    templates::render_to_file(
        templates::TF_EKS_CLUSTER,
        &templates::vars(&[
            ("deployment_id", run.request.id.as_str()),
            ("cluster_name", cluster_name.as_str()),
        ]),
        &cluster_tf.join("main.tf"),
    )?;
    let dns_tf = run.workspace.tf_dir().join("dns");
    if let Some((zone, fqdn)) = &domain_pair {
        templates::render_to_file(
            templates::TF_EKS_DNS_TLS,
            &templates::vars(&[
                ("app_fqdn", fqdn.as_str()),
                ("base_hosted_zone_id", zone.as_str()),
            ]),
            &dns_tf.join("main.tf"),
        )?;
    }

    run.enter(DeploymentState::IacApplying).await?;
    let outputs = iac_stage(run, iac, &cluster_tf, &env, &[]).await?;
    let ecr_url = outputs.require("ecr_repository_url")?.to_string();
    let endpoint = outputs.require("eks_cluster_endpoint")?.to_string();
    let ca_data = outputs.require("eks_cluster_ca_data")?.to_string();

    run.enter(DeploymentState::Building).await?;
    let reporter = run.reporter("build");
    reporter.start(&format!("building {}", image.full_name())).await;
    docker::build_local(
        &run.workspace.source_dir(),
        &image,
        &reporter,
        run.ctx.config.timeouts.build,
    )
    .await?;
    reporter.end("image built").await;

    run.enter(DeploymentState::ImagePublishing).await?;
    let reporter = run.reporter("push");
    let remote_image = image.with_registry(&ecr_url);
    let registry_host = remote_image
        .registry_host()
        .ok_or_else(|| {
            OrchestratorError::Configuration(format!("malformed registry URL '{}'", ecr_url))
        })?
        .to_string();
    docker::login_registry(&registry_host, &scope, &reporter).await?;
    docker::push(&image, &remote_image, &reporter, run.ctx.config.timeouts.build).await?;
    reporter.end(&format!("pushed {}", remote_image.full_name())).await;

    run.enter(DeploymentState::ClusterBootstrapping).await?;
    let reporter = run.reporter("cluster");
    let kubeconfig = cluster::write_eks_kubeconfig(
        &run.workspace,
        &cluster_name,
        &endpoint,
        &ca_data,
        scope.region(),
    )?;

    let (app_url, ingress_host) = if iac == IacPolicy::Provision {
        cluster::install_ingress_controller(
            &kubeconfig,
            &run.workspace,
            &env,
            &reporter,
            Duration::from_secs(10 * 60),
        )
        .await?;
        let lb_dns = cluster::wait_for_load_balancer(
            &kubeconfig,
            &env,
            Duration::from_secs(10 * 60),
            &reporter,
        )
        .await?;
        run.meta
            .outputs
            .insert("nlb_dns_name".to_string(), lb_dns.clone());

        // The load balancer address is only known now, so DNS and TLS are a
        // second, staged apply with the address injected as an input
        // variable.
        let mut app_url = format!("http://{}", lb_dns);
        let mut ingress_host = lb_dns.clone();
        if domain_pair.is_some() {
            let zone_id = cluster::lookup_nlb_hosted_zone(&lb_dns, &env).await?;
            let vars = vec![
                ("nlb_dns_name".to_string(), lb_dns.clone()),
                ("nlb_hosted_zone_id".to_string(), zone_id),
            ];
            terraform::init(&dns_tf, &env, &reporter).await?;
            terraform::plan(&dns_tf, &env, &vars, &reporter, run.ctx.config.timeouts.iac_apply)
                .await?;
            let dns_outputs =
                terraform::apply(&dns_tf, &env, &reporter, run.ctx.config.timeouts.iac_apply)
                    .await?;
            run.record_outputs(dns_outputs.as_map());
            run.workspace.write_meta(&mut run.meta)?;
            if let Some(url) = dns_outputs.get("app_url_https") {
                app_url = url.to_string();
            }
            if let Some((_, fqdn)) = &domain_pair {
                ingress_host = fqdn.clone();
            }
        }
        (app_url, ingress_host)
    } else {
        // Redeploy: the controller and records already exist.
        let lb_dns = run.meta.outputs.get("nlb_dns_name").cloned().ok_or_else(|| {
            OrchestratorError::Configuration("recorded nlb_dns_name missing".into())
        })?;
        let app_url = run
            .meta
            .outputs
            .get("app_url_https")
            .cloned()
            .unwrap_or_else(|| format!("http://{}", lb_dns));
        let ingress_host = domain_pair
            .as_ref()
            .map(|(_, fqdn)| fqdn.clone())
            .unwrap_or(lb_dns);
        (app_url, ingress_host)
    };
    reporter.end("cluster bootstrapped").await;

    run.enter(DeploymentState::ApplyingManifests).await?;
    let reporter = run.reporter("apply-manifests");
    let files = kubernetes::render_manifests(
        &run.workspace,
        &manifest_inputs(run, &remote_image, &snapshot, "ClusterIP", Some(&ingress_host)),
    )?;
    kubernetes::apply_manifests(&kubeconfig, &env, &files, &reporter).await?;

    run.enter(DeploymentState::WaitingRollout).await?;
    let reporter = run.reporter("wait-rollout");
    kubernetes::wait_for_rollout(
        &kubeconfig,
        &env,
        &run.request.namespace,
        &run.request.id,
        run.ctx.config.timeouts.rollout,
        &reporter,
    )
    .await?;

    finish_succeeded(run, &remote_image, Some(app_url)).await
}

// ── redeploy / scale / decommission ───────────────────────────────────────

async fn redeploy(
    ctx: PipelineContext,
    mut request: DeploymentRequest,
    meta: DeploymentMeta,
) -> Result<DeploymentOutcome> {
    let mode = meta.mode;
    request.mode = Some(mode);
    if request.repo_url.is_none() {
        // Fall back to the recorded repository when the request omits it.
        request.repo_url = meta.outputs.get("repo_url").cloned();
    }

    ctx.registry.begin(&request.id, DeploymentState::Init)?;
    let _guard = ctx.store.lock(&request.id).await;
    let workspace = ctx.store.allocate(&request.id, true)?;

    let mut run = PipelineRun {
        ctx,
        request,
        workspace,
        mode,
        meta,
    };
    run.meta.error = None;

    // Redeploy rebuilds the image and rolls the manifests; IaC outputs are
    // reused, never re-applied.
    match mode {
        DeploymentMode::Local => deploy_local(&mut run, IacPolicy::ReuseOutputs).await,
        DeploymentMode::CloudLocal => deploy_cloud_local(&mut run, IacPolicy::ReuseOutputs).await,
        DeploymentMode::CloudHosted => deploy_cloud_hosted(&mut run, IacPolicy::ReuseOutputs).await,
    }
}

async fn scale(
    ctx: PipelineContext,
    request: DeploymentRequest,
    mut meta: DeploymentMeta,
) -> Result<DeploymentOutcome> {
    let _guard = ctx.store.lock(&request.id).await;
    let workspace = ctx.store.locate(&request.id).ok_or_else(|| {
        OrchestratorError::Validation("scale requires an existing workspace".into())
    })?;
    let reporter = StageReporter::new(ctx.events.clone(), "scale", Some(&workspace.logs_dir()));
    reporter
        .start(&format!("scaling to {} replicas", request.replicas))
        .await;

    match meta.mode {
        DeploymentMode::CloudLocal => {
            let key_name = request.ec2_key_name.clone().ok_or_else(|| {
                OrchestratorError::Validation("ec2_key_name is required to scale cloud-local".into())
            })?;
            let key_path = ssh::resolve_key_path(&ctx.config, &key_name)?;
            let public_ip = meta.outputs.get("public_ip").cloned().ok_or_else(|| {
                OrchestratorError::Configuration("recorded public_ip missing".into())
            })?;
            let target = SshTarget::new(&public_ip, key_path);
            let outcome = target
                .exec_streamed(
                    &format!(
                        "sudo kubectl scale deployment/{} -n {} --replicas={}",
                        request.id, request.namespace, request.replicas
                    ),
                    Duration::from_secs(60),
                    &reporter,
                )
                .await?;
            if !outcome.success() {
                return Err(process::exit_error("ssh", &outcome));
            }
        }
        _ => {
            let env = if meta.mode.is_cloud() {
                let scope = CredentialScope::resolve(request.credentials.as_ref(), &ctx.config)?;
                scope.register_with(&ctx.events);
                scope.env_map()
            } else {
                HashMap::new()
            };
            kubernetes::scale(
                &workspace.kubeconfig_path(),
                &env,
                &request.namespace,
                &request.id,
                request.replicas,
                &reporter,
            )
            .await?;
        }
    }

    meta.outputs
        .insert("replicas".to_string(), request.replicas.to_string());
    workspace.write_meta(&mut meta)?;
    reporter.end("scaled").await;

    Ok(DeploymentOutcome {
        deployment_id: request.id.clone(),
        status: "succeeded".to_string(),
        url: meta.outputs.get("app_url").cloned(),
        outputs: meta.outputs.clone(),
        error: None,
    })
}

async fn decommission(
    ctx: PipelineContext,
    request: DeploymentRequest,
    mut meta: DeploymentMeta,
) -> Result<DeploymentOutcome> {
    ctx.registry
        .begin(&request.id, DeploymentState::Decommissioning)?;
    let _guard = ctx.store.lock(&request.id).await;
    let workspace = ctx.store.locate(&request.id).ok_or_else(|| {
        OrchestratorError::Validation("no such deployment to decommission".into())
    })?;

    meta.status = DeploymentState::Decommissioning.as_str().to_string();
    workspace.write_meta(&mut meta)?;

    let reporter = StageReporter::new(
        ctx.events.clone(),
        "decommission",
        Some(&workspace.logs_dir()),
    );
    reporter.start("decommissioning deployment").await;

    match meta.mode {
        DeploymentMode::Local => {
            // Best-effort namespace teardown; the shared cluster stays up.
            let kubeconfig = workspace.kubeconfig_path();
            if kubeconfig.exists() {
                let spec = process::CommandSpec::new("kubectl")
                    .args(["delete", "namespace"])
                    .arg(request.namespace.clone())
                    .arg("--ignore-not-found")
                    .arg("--kubeconfig")
                    .arg(kubeconfig.to_string_lossy().into_owned())
                    .timeout(Duration::from_secs(120));
                if let Ok(outcome) = process::run_streamed(&spec, &reporter).await {
                    if !outcome.success() {
                        reporter.warn("namespace deletion did not complete").await;
                    }
                }
            }
        }
        DeploymentMode::CloudLocal => {
            let scope = CredentialScope::resolve(request.credentials.as_ref(), &ctx.config)?;
            scope.register_with(&ctx.events);
            let env = scope.env_map();
            terraform::destroy(
                &workspace.tf_dir(),
                &env,
                &[],
                &reporter,
                ctx.config.timeouts.iac_apply,
            )
            .await?;
        }
        DeploymentMode::CloudHosted => {
            let scope = CredentialScope::resolve(request.credentials.as_ref(), &ctx.config)?;
            scope.register_with(&ctx.events);
            let env = scope.env_map();

            let dns_tf = workspace.tf_dir().join("dns");
            if terraform::has_state(&dns_tf) {
                let vars = vec![
                    (
                        "nlb_dns_name".to_string(),
                        meta.outputs
                            .get("nlb_dns_name")
                            .cloned()
                            .unwrap_or_else(|| "unavailable".to_string()),
                    ),
                    (
                        "nlb_hosted_zone_id".to_string(),
                        meta.outputs
                            .get("nlb_hosted_zone_id")
                            .cloned()
                            .unwrap_or_else(|| "unavailable".to_string()),
                    ),
                ];
                terraform::destroy(&dns_tf, &env, &vars, &reporter, ctx.config.timeouts.iac_apply)
                    .await?;
            }

            let cluster_tf = workspace.tf_dir().join("cluster");
            if terraform::has_state(&cluster_tf) {
                terraform::destroy(
                    &cluster_tf,
                    &env,
                    &[],
                    &reporter,
                    ctx.config.timeouts.iac_apply,
                )
                .await?;
            }
        }
    }

    workspace.clear_iac_state()?;
    ctx.registry
        .transition(&request.id, DeploymentState::Decommissioned)?;
    meta.status = DeploymentState::Decommissioned.as_str().to_string();
    workspace.write_meta(&mut meta)?;
    ctx.store.release(&request.id, false)?;
    reporter.end("deployment decommissioned, workspace removed").await;

    Ok(DeploymentOutcome {
        deployment_id: request.id.clone(),
        status: "decommissioned".to_string(),
        url: None,
        outputs: HashMap::new(),
        error: None,
    })
}

// ── remote manifest helpers (cloud-local) ─────────────────────────────────

async fn remote_apply_manifests(
    target: &SshTarget,
    deployment_id: &str,
    files: &[std::path::PathBuf],
    reporter: &StageReporter,
) -> Result<()> {
    let remote_dir = format!("/tmp/{}-manifests", deployment_id);
    let mkdir = target
        .exec_captured(
            &format!("rm -rf {dir} && mkdir -p {dir}", dir = remote_dir),
            Duration::from_secs(30),
        )
        .await?;
    process::require_captured("ssh", mkdir)?;

    for file in files {
        let name = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote_path = format!("{}/{}", remote_dir, name);
        target
            .copy_to(file, &remote_path, Duration::from_secs(60), reporter)
            .await?;
        let outcome = target
            .exec_streamed(
                &format!("sudo kubectl apply -f {}", remote_path),
                Duration::from_secs(120),
                reporter,
            )
            .await?;
        if !outcome.success() {
            return Err(process::exit_error("ssh", &outcome));
        }
    }
    Ok(())
}

async fn remote_rollout_wait(
    target: &SshTarget,
    namespace: &str,
    app_name: &str,
    timeout: Duration,
    reporter: &StageReporter,
) -> Result<()> {
    let outcome = target
        .exec_streamed(
            &format!(
                "sudo kubectl rollout status deployment/{} -n {} --timeout={}s",
                app_name,
                namespace,
                timeout.as_secs()
            ),
            timeout + Duration::from_secs(30),
            reporter,
        )
        .await?;
    if !outcome.success() {
        let last_status = outcome
            .tail
            .last()
            .cloned()
            .unwrap_or_else(|| "no rollout status observed".to_string());
        return Err(OrchestratorError::RolloutTimeout {
            deployment: app_name.to_string(),
            seconds: timeout.as_secs(),
            last_status,
        });
    }
    Ok(())
}

async fn remote_node_port(target: &SshTarget, namespace: &str, app_name: &str) -> Result<u16> {
    let captured = target
        .exec_captured(
            &format!(
                "sudo kubectl get service {} -n {} -o json",
                app_name, namespace
            ),
            Duration::from_secs(60),
        )
        .await?;
    let stdout = process::require_captured("ssh", captured)?;
    kubernetes::parse_node_port(&stdout).ok_or_else(|| {
        OrchestratorError::Configuration(format!(
            "service '{}' has no NodePort assigned",
            app_name
        ))
    })
}
