//! Checkpoint layout of a training run.
//!
//! Each epoch checkpoint holds four records: the denoising network, its EMA
//! shadow, the optimizer state and the feature network.
//!
//! ```text
//! <root>/<run_name>/config.json
//! <root>/<run_name>/epoch_<n>/{model,ema,optim,feature}.mpk
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use burn::config::Config;
use burn::module::Module;
use burn::record::{FullPrecisionSettings, NamedMpkFileRecorder, Record, Recorder};
use burn::tensor::backend::Backend;

use crate::error::{DiffusionError, Result};

const EPOCH_PREFIX: &str = "epoch_";

type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// File paths of one epoch checkpoint, without the recorder extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    pub model: PathBuf,
    pub ema: PathBuf,
    pub optimizer: PathBuf,
    pub feature: PathBuf,
}

#[derive(Debug, Clone)]
pub struct CheckpointLayout {
    root: PathBuf,
    run_name: String,
}

impl CheckpointLayout {
    pub fn new(root: impl Into<PathBuf>, run_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            run_name: run_name.into(),
        }
    }

    pub fn run_name(&self) -> &str {
        &self.run_name
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join(&self.run_name)
    }

    pub fn epoch_dir(&self, epoch: usize) -> PathBuf {
        self.run_dir().join(format!("{EPOCH_PREFIX}{epoch}"))
    }

    pub fn paths(&self, epoch: usize) -> CheckpointPaths {
        let dir = self.epoch_dir(epoch);
        CheckpointPaths {
            model: dir.join("model"),
            ema: dir.join("ema"),
            optimizer: dir.join("optim"),
            feature: dir.join("feature"),
        }
    }

    /// Creates the directory of `epoch` and returns its paths.
    pub fn setup(&self, epoch: usize) -> Result<CheckpointPaths> {
        fs::create_dir_all(self.epoch_dir(epoch))?;
        Ok(self.paths(epoch))
    }

    /// Highest epoch with a checkpoint directory, if any.
    pub fn latest_epoch(&self) -> Result<Option<usize>> {
        let dir = self.run_dir();
        if !dir.exists() {
            return Ok(None);
        }

        let mut latest = None;
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let epoch = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(EPOCH_PREFIX))
                .and_then(|epoch| epoch.parse::<usize>().ok());
            latest = latest.max(epoch);
        }

        Ok(latest)
    }

    /// Stores the run configuration next to its checkpoints.
    pub fn save_config<C: Config>(&self, config: &C) -> Result<PathBuf> {
        fs::create_dir_all(self.run_dir())?;
        let path = self.run_dir().join("config.json");
        config.save(&path)?;
        Ok(path)
    }

    pub fn load_config<C: Config>(&self) -> Result<C> {
        let path = self.run_dir().join("config.json");
        C::load(&path).map_err(|err| {
            DiffusionError::Checkpoint(format!("could not load {}: {err:?}", path.display()))
        })
    }
}

pub fn save_module<B: Backend, M: Module<B>>(module: M, path: &Path) -> Result<()> {
    module
        .save_file(path.to_path_buf(), &CheckpointRecorder::new())
        .map_err(|err| {
            DiffusionError::Checkpoint(format!("could not save {}: {err:?}", path.display()))
        })?;
    tracing::info!(path = %path.display(), "saved module");

    Ok(())
}

/// Loads parameters into `module`; the architecture has to match the record.
pub fn load_module<B: Backend, M: Module<B>>(
    module: M,
    path: &Path,
    device: &B::Device,
) -> Result<M> {
    module
        .load_file(path.to_path_buf(), &CheckpointRecorder::new(), device)
        .map_err(|err| {
            DiffusionError::Checkpoint(format!("could not load {}: {err:?}", path.display()))
        })
}

/// Saves any record, e.g. the one returned by `Optimizer::to_record`.
pub fn save_record<B: Backend, R: Record<B>>(record: R, path: &Path) -> Result<()> {
    Recorder::<B>::record(&CheckpointRecorder::new(), record, path.to_path_buf()).map_err(
        |err| DiffusionError::Checkpoint(format!("could not save {}: {err:?}", path.display())),
    )
}

pub fn load_record<B: Backend, R: Record<B>>(path: &Path, device: &B::Device) -> Result<R> {
    Recorder::<B>::load(&CheckpointRecorder::new(), path.to_path_buf(), device).map_err(|err| {
        DiffusionError::Checkpoint(format!("could not load {}: {err:?}", path.display()))
    })
}
