//! Per-job state shared by stage handlers.

use std::path::PathBuf;
use std::sync::Arc;

use vrender_models::{FrameName, ImageType, JobMessage, LevelSpec, ModelError, StageKind};
use vrender_storage::{LocalRoots, Storage};

use crate::error::{WorkerError, WorkerResult};
use crate::logging::JobLogger;
use crate::rewrite::PathRewriter;
use crate::rig::Rig;
use crate::runner::BinaryRunner;

/// `value`, or a missing-parameter error naming it.
pub fn required<T>(value: Option<T>, name: &'static str) -> WorkerResult<T> {
    value.ok_or(WorkerError::Model(ModelError::MissingParameter(name)))
}

/// Everything a handler needs for one job.
///
/// `msg` is the job as received and is never mutated; handlers build their
/// binary parameters from [`JobContext::params`].
pub struct JobContext {
    pub msg: JobMessage,
    pub stage: StageKind,
    pub storage: Arc<Storage>,
    pub runner: Arc<BinaryRunner>,
    pub roots: LocalRoots,
    pub logger: JobLogger,
    rewriter: PathRewriter,
}

impl JobContext {
    pub fn new(
        msg: JobMessage,
        stage: StageKind,
        storage: Arc<Storage>,
        runner: Arc<BinaryRunner>,
        roots: LocalRoots,
        logger: JobLogger,
    ) -> Self {
        let rewriter = PathRewriter::new(&msg, &roots);
        Self {
            msg,
            stage,
            storage,
            runner,
            roots,
            logger,
            rewriter,
        }
    }

    /// Copy of the job message with the rig pointing at its local copy.
    pub fn params(&self) -> JobMessage {
        let mut params = self.msg.clone();
        params.rig = self.rig_path().to_string_lossy().into_owned();
        params
    }

    /// The rig in place when it is local, otherwise its download location.
    pub fn rig_path(&self) -> PathBuf {
        match self.storage.local_path(&self.msg.rig) {
            Ok(Some(path)) => path,
            _ => self.roots.rig_path(&self.msg),
        }
    }

    pub fn local_path(&self, image_type: ImageType, level: Option<u32>) -> WorkerResult<PathBuf> {
        Ok(self.roots.image_type_path(image_type, level)?)
    }

    /// [`JobContext::local_path`] as a flag value.
    pub fn local(&self, image_type: ImageType, level: Option<u32>) -> WorkerResult<String> {
        Ok(self.local_path(image_type, level)?.to_string_lossy().into_owned())
    }

    /// The single destination level of the job; `None` for full-size output.
    pub fn dst_level(&self) -> WorkerResult<Option<u32>> {
        match &self.msg.dst_level {
            LevelSpec::One(level) => Ok(Some(*level)),
            LevelSpec::None => Ok(None),
            LevelSpec::Many(levels) if levels.len() == 1 => Ok(levels.first().copied()),
            LevelSpec::Many(levels) => Err(WorkerError::job_failed(format!(
                "{} takes one destination level, got {levels:?}",
                self.stage
            ))),
        }
    }

    pub fn background_frame(&self) -> WorkerResult<FrameName> {
        Ok(self.msg.require_background_frame()?)
    }

    pub async fn download_rig(&self) -> WorkerResult<bool> {
        Ok(self.storage.download_rig(&self.msg, &self.roots).await?)
    }

    /// Local rig, fetched first when the input root is remote.
    pub async fn load_rig(&self) -> WorkerResult<Rig> {
        self.download_rig().await?;
        Rig::load(&self.rig_path()).await
    }

    /// Fetch `(image type, level)` pairs for the frames of the job's chunk.
    pub async fn download(&self, types: &[(ImageType, Option<u32>)]) -> WorkerResult<bool> {
        Ok(self
            .storage
            .download_image_types(&self.msg, &self.roots, types, None)
            .await?)
    }

    /// Fetch `(image type, level)` pairs for explicit frames.
    pub async fn download_frames(
        &self,
        types: &[(ImageType, Option<u32>)],
        frames: &[FrameName],
    ) -> WorkerResult<bool> {
        Ok(self
            .storage
            .download_image_types(&self.msg, &self.roots, types, Some(frames))
            .await?)
    }

    /// Push `image_type` at `level`; `frames` defaults to the job's chunk.
    pub async fn upload(
        &self,
        image_type: ImageType,
        frames: Option<&[FrameName]>,
        level: Option<u32>,
    ) -> WorkerResult<bool> {
        Ok(self
            .storage
            .upload_image_type(&self.msg, &self.roots, image_type, frames, level)
            .await?)
    }

    /// Run `binary` with `params`, remote roots rewritten to local ones.
    pub async fn run(&self, binary: &str, params: &JobMessage) -> WorkerResult<()> {
        let flags = self.rewriter.rewrite_flags(params.to_flag_map());
        self.logger.binary_started(binary);
        self.runner.run(binary, &flags).await
    }

    /// Run the binary of the job's own stage.
    pub async fn run_stage(&self, params: &JobMessage) -> WorkerResult<()> {
        let binary = self
            .stage
            .binary()
            .ok_or_else(|| WorkerError::job_failed(format!("{} has no binary", self.stage)))?;
        self.run(binary, params).await
    }
}
