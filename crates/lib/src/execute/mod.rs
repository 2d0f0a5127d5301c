//! Build pipeline execution.
//!
//! [`build`] runs a recipe's steps strictly in order. Each step sees the
//! [`StepState`] left by the step before it, derives its cache key from the
//! parent layer, its substituted payload and that state, and either adopts a
//! matching layer from the store or executes and publishes a new one. The
//! first failing step aborts the build; layers published before it stay
//! cached.

mod base;
mod copy;
mod run;
mod state;
pub mod types;

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::consts::FORMAT_VERSION;
use crate::layer::{CacheKey, LayerId, LayerRecord, LayerStore, StagedLayer};
use crate::manifest::{ImageManifest, save_manifest};
use crate::recipe::{Instruction, ParseError, Recipe, RunCommand, Step, StepKind};
use crate::store_lock::{LockMode, StoreLock};
use crate::subst::substitute;
use crate::util::fs::{copy_tree, normalize_image_path, resolve_in_rootfs};
use crate::util::hash::ContentHash;

pub use state::StepState;
pub use types::{
  BuildConfig, BuildError, BuildOutcome, CommandStatus, Isolation, PipelineError, RetryPolicy, StepFailure,
  StepReport, UnusedArgPolicy, exit_code,
};

use run::{RunRequest, run_command};

/// Everything a step needs besides its own instruction.
struct Context<'a> {
  store: &'a LayerStore,
  config: &'a BuildConfig,
  overrides: &'a BTreeMap<String, String>,
  cancel: &'a CancellationToken,
}

/// Execute a recipe and persist the resulting image manifest.
///
/// `overrides` supplies build-argument values. Names no `ARG` declares are
/// handled according to [`BuildConfig::unused_args`]. The store is held
/// under a shared lock for the duration of the build.
pub async fn build(
  recipe: &Recipe,
  overrides: &BTreeMap<String, String>,
  store: &LayerStore,
  config: &BuildConfig,
  cancel: &CancellationToken,
) -> Result<BuildOutcome, PipelineError> {
  check_overrides(recipe, overrides, config.unused_args)?;
  let _lock = StoreLock::acquire(store.root(), LockMode::Shared, "build").map_err(BuildError::from)?;

  info!(steps = recipe.len(), "starting build");
  let ctx = Context {
    store,
    config,
    overrides,
    cancel,
  };

  let mut current: Option<LayerRecord> = None;
  let mut reports = Vec::with_capacity(recipe.len());

  for step in &recipe.steps {
    let started = Instant::now();
    let result = if cancel.is_cancelled() {
      Err(BuildError::Cancelled)
    } else {
      execute_step(step, current.as_ref(), &ctx).await
    };

    let (record, cached) = result.map_err(|error| {
      warn!(index = step.index, line = step.line, error = %error, "step failed");
      PipelineError::Step(Box::new(StepFailure {
        index: step.index,
        line: step.line,
        instruction: step.text.clone(),
        error,
      }))
    })?;

    let duration = started.elapsed();
    info!(
      index = step.index,
      kind = %step.kind(),
      layer = %record.id.short(),
      cached,
      elapsed = ?duration,
      "step complete"
    );
    reports.push(StepReport {
      index: step.index,
      kind: step.kind(),
      instruction: step.text.clone(),
      layer: record.id.clone(),
      cached,
      duration,
    });
    current = Some(record);
  }

  let last = current.ok_or(BuildError::Parse(ParseError::Empty))?;
  let manifest = ImageManifest {
    version: FORMAT_VERSION,
    base: last.state.base.clone(),
    layers: reports.iter().map(|r| r.layer.clone()).collect(),
    rootfs: last.rootfs.clone(),
    env: last.state.env.clone(),
    workdir: last.state.workdir.clone(),
    labels: last.state.labels.clone(),
  };
  let manifest_id = save_manifest(store, &manifest).map_err(BuildError::from)?;

  let outcome = BuildOutcome {
    manifest_id,
    manifest,
    steps: reports,
  };
  info!(
    manifest = %outcome.manifest_id.short(),
    cached = outcome.cached_steps(),
    executed = outcome.steps.len() - outcome.cached_steps(),
    "build complete"
  );
  Ok(outcome)
}

fn check_overrides(
  recipe: &Recipe,
  overrides: &BTreeMap<String, String>,
  policy: UnusedArgPolicy,
) -> Result<(), BuildError> {
  let declared = recipe.declared_args();
  let names: Vec<String> = overrides
    .keys()
    .filter(|name| !declared.contains(name.as_str()))
    .cloned()
    .collect();

  if names.is_empty() {
    return Ok(());
  }

  match policy {
    UnusedArgPolicy::Reject => Err(BuildError::UndeclaredBuildArgs { names }),
    UnusedArgPolicy::Warn => {
      warn!(args = %names.join(", "), "ignoring build arguments that no ARG declares");
      Ok(())
    }
  }
}

/// Run blocking filesystem work off the async runtime.
async fn blocking<T, F>(f: F) -> Result<T, BuildError>
where
  F: FnOnce() -> Result<T, BuildError> + Send + 'static,
  T: Send + 'static,
{
  tokio::task::spawn_blocking(f)
    .await
    .map_err(|e| BuildError::Io(std::io::Error::other(e)))?
}

async fn execute_step(
  step: &Step,
  parent: Option<&LayerRecord>,
  ctx: &Context<'_>,
) -> Result<(LayerRecord, bool), BuildError> {
  let policy = ctx.config.unresolved;

  let Some(parent) = parent else {
    return match &step.instruction {
      Instruction::From { image } => execute_from(step, image, ctx).await,
      _ => Err(
        ParseError::MissingFrom {
          line: step.line,
          found: step.kind(),
        }
        .into(),
      ),
    };
  };
  let state = &parent.state;

  match &step.instruction {
    Instruction::From { .. } => Err(ParseError::FromNotFirst { line: step.line }.into()),

    Instruction::Arg { name, default } => {
      let value = match ctx.overrides.get(name) {
        Some(value) => value.clone(),
        None => match default {
          Some(default) => substitute(default, state, policy)?,
          None => String::new(),
        },
      };
      let payload = format!("{}={}", name, value);
      let next = state.with_arg(name, &value);
      metadata_layer(step, parent, &payload, next, ctx).await
    }

    Instruction::Env { pairs } => {
      let pairs = substitute_pairs(pairs, state, policy)?;
      let next = state.with_env(&pairs);
      metadata_layer(step, parent, &pairs_payload(&pairs), next, ctx).await
    }

    Instruction::Label { pairs } => {
      let pairs = substitute_pairs(pairs, state, policy)?;
      let next = state.with_labels(&pairs);
      metadata_layer(step, parent, &pairs_payload(&pairs), next, ctx).await
    }

    Instruction::Workdir { path } => {
      let path = normalize_image_path(&state.workdir, &substitute(path, state, policy)?);
      execute_workdir(step, parent, &path, ctx).await
    }

    Instruction::Run { command } => execute_run(step, parent, command, ctx).await,

    Instruction::Copy { sources, dest } => {
      let sources = sources
        .iter()
        .map(|s| substitute(s, state, policy))
        .collect::<Result<Vec<_>, _>>()?;
      let dest = substitute(dest, state, policy)?;
      execute_copy(step, parent, sources, dest, ctx).await
    }
  }
}

fn substitute_pairs(
  pairs: &[(String, String)],
  state: &StepState,
  policy: crate::subst::UnresolvedPolicy,
) -> Result<Vec<(String, String)>, BuildError> {
  // every value sees the state before this instruction, not its siblings
  pairs
    .iter()
    .map(|(key, value)| Ok((key.clone(), substitute(value, state, policy)?)))
    .collect()
}

fn pairs_payload(pairs: &[(String, String)]) -> String {
  pairs
    .iter()
    .map(|(k, v)| format!("{}={}", k, v))
    .collect::<Vec<_>>()
    .join("\n")
}

/// Adopt the layer for `key` if the store has it.
async fn cached_layer(id: &LayerId, ctx: &Context<'_>) -> Result<Option<LayerRecord>, BuildError> {
  let store = ctx.store.clone();
  let id = id.clone();
  let verify = ctx.config.verify_cache;
  let found = blocking(move || Ok(store.lookup(&id, verify)?)).await?;
  if let Some(record) = &found {
    debug!(layer = %record.id.short(), "cache hit");
  }
  Ok(found)
}

fn layer_id(
  parent: Option<&LayerRecord>,
  kind: StepKind,
  payload: &str,
  state: &StepState,
  inputs: Option<&ContentHash>,
) -> Result<LayerId, BuildError> {
  let key = CacheKey {
    parent: parent.map(|p| &p.id),
    kind,
    payload,
    state,
    inputs,
  };
  Ok(key.layer_id()?)
}

fn new_record(id: LayerId, step: &Step, parent: Option<&LayerRecord>, state: StepState, rootfs: LayerId) -> LayerRecord {
  LayerRecord {
    version: FORMAT_VERSION,
    id,
    parent: parent.map(|p| p.id.clone()),
    kind: step.kind(),
    instruction: step.text.clone(),
    state,
    rootfs,
    content_hash: None,
  }
}

async fn publish(staged: StagedLayer, record: LayerRecord, ctx: &Context<'_>) -> Result<LayerRecord, BuildError> {
  let store = ctx.store.clone();
  let published = blocking(move || Ok(store.publish(staged, record)?)).await?;
  Ok(published.record)
}

/// Record a step that changes only metadata as an empty layer.
async fn metadata_layer(
  step: &Step,
  parent: &LayerRecord,
  payload: &str,
  next: StepState,
  ctx: &Context<'_>,
) -> Result<(LayerRecord, bool), BuildError> {
  let id = layer_id(Some(parent), step.kind(), payload, &parent.state, None)?;
  if let Some(record) = cached_layer(&id, ctx).await? {
    return Ok((record, true));
  }

  let record = new_record(id, step, Some(parent), next, parent.rootfs.clone());
  let staged = ctx.store.stage()?;
  Ok((publish(staged, record, ctx).await?, false))
}

/// Stage a copy of the parent's filesystem, let `work` modify it, publish.
async fn filesystem_layer<W, Fut>(
  step: &Step,
  parent: &LayerRecord,
  id: LayerId,
  next: StepState,
  ctx: &Context<'_>,
  work: W,
) -> Result<(LayerRecord, bool), BuildError>
where
  W: FnOnce(std::path::PathBuf) -> Fut,
  Fut: Future<Output = Result<(), BuildError>>,
{
  let staged = ctx.store.stage()?;
  let source = ctx.store.rootfs_dir(parent);
  let rootfs = staged.rootfs();

  let target = rootfs.clone();
  blocking(move || Ok(copy_tree(&source, &target)?)).await?;
  work(rootfs).await?;

  let record = new_record(id.clone(), step, Some(parent), next, id);
  Ok((publish(staged, record, ctx).await?, false))
}

async fn execute_from(step: &Step, image: &str, ctx: &Context<'_>) -> Result<(LayerRecord, bool), BuildError> {
  let config = ctx.config;
  let image = substitute(image, &StepState::root(""), config.unresolved)?;
  let base = base::resolve_base(&image, &config.images_dir, &config.fetch_retry, ctx.cancel).await?;

  let state = StepState::root(image.as_str());
  let id = layer_id(None, StepKind::From, &image, &state, Some(&base.digest))?;
  if let Some(record) = cached_layer(&id, ctx).await? {
    return Ok((record, true));
  }

  let staged = ctx.store.stage()?;
  base.materialize(&staged.rootfs(), &config.fetch_retry, ctx.cancel).await?;

  let record = new_record(id.clone(), step, None, state, id);
  Ok((publish(staged, record, ctx).await?, false))
}

async fn execute_workdir(
  step: &Step,
  parent: &LayerRecord,
  path: &str,
  ctx: &Context<'_>,
) -> Result<(LayerRecord, bool), BuildError> {
  let state = &parent.state;
  let id = layer_id(Some(parent), StepKind::Workdir, path, state, None)?;
  if let Some(record) = cached_layer(&id, ctx).await? {
    return Ok((record, true));
  }

  let next = state.with_workdir(path);
  let existing = resolve_in_rootfs(&ctx.store.rootfs_dir(parent), path).map_err(|e| path_error(path, e))?;
  match existing.metadata() {
    Ok(meta) if meta.is_dir() => {
      debug!(path = %path, "working directory already exists");
      let record = new_record(id, step, Some(parent), next, parent.rootfs.clone());
      let staged = ctx.store.stage()?;
      return Ok((publish(staged, record, ctx).await?, false));
    }
    Ok(_) => {
      return Err(BuildError::PathError {
        path: path.to_string(),
        message: "exists and is not a directory".to_string(),
      });
    }
    Err(_) => {}
  }

  let image_path = path.to_string();
  filesystem_layer(step, parent, id, next, ctx, |rootfs| async move {
    blocking(move || {
      let dir = resolve_in_rootfs(&rootfs, &image_path).map_err(|e| path_error(&image_path, e))?;
      std::fs::create_dir_all(&dir).map_err(|e| BuildError::PathError {
        path: image_path,
        message: format!("cannot create directory: {}", e),
      })
    })
    .await
  })
  .await
}

fn path_error(path: &str, error: std::io::Error) -> BuildError {
  BuildError::PathError {
    path: path.to_string(),
    message: error.to_string(),
  }
}

async fn execute_run(
  step: &Step,
  parent: &LayerRecord,
  command: &RunCommand,
  ctx: &Context<'_>,
) -> Result<(LayerRecord, bool), BuildError> {
  let state = &parent.state;
  let payload = serde_json::to_string(command)?;
  let id = layer_id(Some(parent), StepKind::Run, &payload, state, None)?;
  if let Some(record) = cached_layer(&id, ctx).await? {
    return Ok((record, true));
  }

  let env = state.process_env();
  let config = ctx.config;
  filesystem_layer(step, parent, id, state.clone(), ctx, |rootfs| async move {
    let req = RunRequest {
      command,
      env: &env,
      rootfs: &rootfs,
      workdir: &state.workdir,
      isolation: config.isolation,
      shell: config.shell.as_deref(),
      timeout: config.run_timeout,
    };
    run_command(&req, ctx.cancel).await.map(|_| ())
  })
  .await
}

async fn execute_copy(
  step: &Step,
  parent: &LayerRecord,
  sources: Vec<String>,
  dest: String,
  ctx: &Context<'_>,
) -> Result<(LayerRecord, bool), BuildError> {
  let state = &parent.state;
  let context_dir = ctx.config.context_dir.clone();
  let resolved = blocking(move || {
    let resolved = copy::resolve_sources(&context_dir, &sources)?;
    let digest = copy::digest_sources(&resolved)?;
    Ok((resolved, digest))
  })
  .await;
  let (resolved, digest) = resolved?;

  let payload = format!("{} -> {}", resolved.iter().map(|s| s.name.as_str()).collect::<Vec<_>>().join(" "), dest);
  let id = layer_id(Some(parent), StepKind::Copy, &payload, state, Some(&digest))?;
  if let Some(record) = cached_layer(&id, ctx).await? {
    return Ok((record, true));
  }

  let workdir = state.workdir.clone();
  filesystem_layer(step, parent, id, state.clone(), ctx, |rootfs| async move {
    blocking(move || copy::apply_copy(&rootfs, &workdir, &resolved, &dest)).await
  })
  .await
}
