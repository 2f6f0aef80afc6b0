use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tch::{nn::VarStore, Tensor};
use tracing::{debug, info};

use crate::error::{Result, SrganError};
use crate::model::ModelParameters;

/// Where training stood when a checkpoint was written. Informational only:
/// a restore brings back parameters, not the loop position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub phase: String,
    pub pretrain_iter: u64,
    pub train_iter: u64,
    pub epoch: usize,
}

/// Files written by one save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointHandle {
    pub generator: PathBuf,
    pub discriminator: PathBuf,
    pub progress: PathBuf,
}

pub trait CheckpointStore {
    fn save(&mut self, params: ModelParameters<'_>, progress: &Progress) -> Result<CheckpointHandle>;

    fn exists(&self) -> bool;

    /// Copies stored values into `params`. Every variable must be present
    /// with the same shape and dtype, otherwise nothing is modified.
    fn load(&self, params: ModelParameters<'_>) -> Result<Option<Progress>>;
}

/// Checkpoint kept as `<prefix>.g.ot`, `<prefix>.d.ot` and `<prefix>.json`.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    prefix: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(prefix: impl Into<PathBuf>) -> FileCheckpointStore {
        FileCheckpointStore { prefix: prefix.into() }
    }

    pub fn handle(&self) -> CheckpointHandle {
        CheckpointHandle {
            generator: self.with_suffix(".g.ot"),
            discriminator: self.with_suffix(".d.ot"),
            progress: self.with_suffix(".json"),
        }
    }

    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut name = OsString::from(self.prefix.as_os_str());
        name.push(suffix);
        PathBuf::from(name)
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn save(&mut self, params: ModelParameters<'_>, progress: &Progress) -> Result<CheckpointHandle> {
        let handle = self.handle();
        if let Some(parent) = handle.generator.parent() {
            fs::create_dir_all(parent)?;
        }
        params.generator.save(&handle.generator)?;
        params.discriminator.save(&handle.discriminator)?;
        fs::write(&handle.progress, serde_json::to_string_pretty(progress)?)?;
        debug!(path = %self.prefix.display(), ?progress, "checkpoint saved");
        Ok(handle)
    }

    fn exists(&self) -> bool {
        let handle = self.handle();
        handle.generator.is_file() && handle.discriminator.is_file()
    }

    fn load(&self, params: ModelParameters<'_>) -> Result<Option<Progress>> {
        let handle = self.handle();
        if !self.exists() {
            return Err(SrganError::CheckpointMissing(self.prefix.clone()));
        }
        let generator = read_checked(params.generator, &handle.generator)?;
        let discriminator = read_checked(params.discriminator, &handle.discriminator)?;
        let progress = read_progress(&handle.progress)?;
        copy_into(params.generator, generator)?;
        copy_into(params.discriminator, discriminator)?;
        info!(path = %self.prefix.display(), ?progress, "restored checkpoint");
        Ok(progress)
    }
}

/// The progress marker is optional; any other read failure is an error.
fn read_progress(path: &Path) -> Result<Option<Progress>> {
    let fail = |msg: String| SrganError::CheckpointLoad(format!("{}: {msg}", path.display()));
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(serde_json::from_str(&text).map_err(|err| fail(err.to_string()))?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(fail(err.to_string())),
    }
}

/// Reads a saved tensor file and checks it against the live variables.
fn read_checked(vs: &VarStore, path: &Path) -> Result<HashMap<String, Tensor>> {
    let fail = |msg: String| SrganError::CheckpointLoad(format!("{}: {msg}", path.display()));
    let saved: HashMap<String, Tensor> = Tensor::load_multi(path)
        .map_err(|err| fail(err.to_string()))?
        .into_iter()
        .collect();
    let vars = vs.variables();
    for (name, var) in &vars {
        let stored = saved.get(name).ok_or_else(|| fail(format!("missing variable `{name}`")))?;
        if stored.size() != var.size() || stored.kind() != var.kind() {
            return Err(fail(format!(
                "`{name}` is {:?} {:?}, model expects {:?} {:?}",
                stored.kind(),
                stored.size(),
                var.kind(),
                var.size()
            )));
        }
    }
    if let Some(extra) = saved.keys().find(|name| !vars.contains_key(*name)) {
        return Err(fail(format!("unexpected variable `{extra}`")));
    }
    Ok(saved)
}

fn copy_into(vs: &VarStore, saved: HashMap<String, Tensor>) -> Result<()> {
    let device = vs.device();
    tch::no_grad(|| -> Result<()> {
        for (name, mut var) in vs.variables() {
            var.f_copy_(&saved[&name].to_device(device))?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Mode, NetConfig, SrGan};
    use tch::{Device, Kind};

    fn net(residual_blocks: usize) -> NetConfig {
        NetConfig { hr_height: 16, hr_width: 16, residual_blocks, ..NetConfig::default() }
    }

    fn outputs(model: &SrGan, lr: &Tensor) -> (Tensor, Tensor) {
        let sr = model.generator.upscale(lr, Mode::Inference);
        let p = model.discriminator.evaluate(&sr, Mode::Inference);
        (sr, p)
    }

    #[test]
    fn round_trip_reproduces_forward_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("ckpt/weights"));
        assert!(!store.exists());

        tch::manual_seed(1);
        let original = SrGan::new(&net(2), Device::Cpu);
        let progress = Progress { phase: "pretraining".into(), pretrain_iter: 1000, ..Progress::default() };
        let handle = store.save(original.parameters(), &progress).unwrap();
        assert!(handle.generator.ends_with("weights.g.ot"));
        assert!(store.exists());

        tch::manual_seed(2);
        let restored = SrGan::new(&net(2), Device::Cpu);
        let lr = Tensor::randn([1, 4, 4, 3], (Kind::Float, Device::Cpu));
        assert!(!outputs(&original, &lr).0.equal(&outputs(&restored, &lr).0));

        assert_eq!(store.load(restored.parameters()).unwrap(), Some(progress));
        let (sr_a, p_a) = outputs(&original, &lr);
        let (sr_b, p_b) = outputs(&restored, &lr);
        assert!(sr_a.equal(&sr_b));
        assert!(p_a.equal(&p_b));
    }

    #[test]
    fn mismatched_architecture_is_rejected_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("weights"));
        let small = SrGan::new(&net(1), Device::Cpu);
        store.save(small.parameters(), &Progress::default()).unwrap();

        let big = SrGan::new(&net(3), Device::Cpu);
        let before: Vec<Tensor> = big.generator_vars().iter().map(|v| v.detach().copy()).collect();
        assert!(matches!(store.load(big.parameters()), Err(SrganError::CheckpointLoad(_))));
        for (a, b) in before.iter().zip(big.generator_vars()) {
            assert!(a.equal(&b));
        }
    }

    #[test]
    fn malformed_file_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("weights"));
        let handle = store.handle();
        fs::write(&handle.generator, b"junk").unwrap();
        fs::write(&handle.discriminator, b"junk").unwrap();
        let model = SrGan::new(&net(1), Device::Cpu);
        assert!(matches!(store.load(model.parameters()), Err(SrganError::CheckpointLoad(_))));
    }

    #[test]
    fn missing_checkpoint_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path().join("nothing"));
        let model = SrGan::new(&net(1), Device::Cpu);
        assert!(matches!(store.load(model.parameters()), Err(SrganError::CheckpointMissing(_))));
    }

    #[test]
    fn progress_marker_is_optional() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("weights"));
        let model = SrGan::new(&net(1), Device::Cpu);
        let handle = store.save(model.parameters(), &Progress::default()).unwrap();
        fs::remove_file(&handle.progress).unwrap();
        assert_eq!(store.load(model.parameters()).unwrap(), None);
    }

    #[test]
    fn unreadable_progress_marker_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("weights"));
        tch::manual_seed(1);
        let saved = SrGan::new(&net(1), Device::Cpu);
        let handle = store.save(saved.parameters(), &Progress::default()).unwrap();
        // A directory in place of the marker fails with something other than NotFound.
        fs::remove_file(&handle.progress).unwrap();
        fs::create_dir(&handle.progress).unwrap();

        tch::manual_seed(2);
        let model = SrGan::new(&net(1), Device::Cpu);
        let before: Vec<Tensor> = model.generator_vars().iter().map(|v| v.detach().copy()).collect();
        assert!(matches!(store.load(model.parameters()), Err(SrganError::CheckpointLoad(_))));
        for (a, b) in before.iter().zip(model.generator_vars()) {
            assert!(a.equal(&b));
        }
    }
}
