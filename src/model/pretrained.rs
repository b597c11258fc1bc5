//! ImageNet checkpoints from torchvision
//!
//! Checkpoints are cached the way torch hub caches them, so files already
//! downloaded by PyTorch are reused.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{FullPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};
use tracing::{debug, info};

use super::registry::ArchitectureSpec;
use super::Architecture;
use crate::utils::{FinetuneError, Result};

/// Checkpoint cache directory.
///
/// `override_dir` wins, then `$TORCH_HOME/hub/checkpoints`, then
/// `{cache}/torch/hub/checkpoints`.
pub fn weights_dir(override_dir: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = override_dir {
        return Ok(dir.to_path_buf());
    }
    if let Some(torch_home) = std::env::var_os("TORCH_HOME") {
        return Ok(PathBuf::from(torch_home).join("hub").join("checkpoints"));
    }
    dirs::cache_dir()
        .map(|cache| cache.join("torch").join("hub").join("checkpoints"))
        .ok_or_else(|| {
            FinetuneError::Config("no cache directory available, pass --weights_dir".into())
        })
}

/// Path of the checkpoint for `spec`, downloading it when missing
pub fn ensure_weights(spec: &ArchitectureSpec, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(spec.weights_file);
    if path.is_file() {
        debug!("Using cached weights {:?}", path);
        return Ok(path);
    }

    fs::create_dir_all(dir)?;
    let url = spec.weights_url();
    info!("Downloading {} weights from {}", spec.name, url);

    let response = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| FinetuneError::Download(format!("{}: {}", url, e)))?;
    let bytes = response
        .bytes()
        .map_err(|e| FinetuneError::Download(format!("{}: {}", url, e)))?;

    // renamed into place only once complete
    let partial = path.with_extension("partial");
    let mut file = fs::File::create(&partial)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    fs::rename(&partial, &path)?;

    info!("Saved {} ({:.1} MB)", path.display(), bytes.len() as f64 / 1e6);
    Ok(path)
}

/// Load an ImageNet checkpoint into a freshly built 1000-class model
pub fn load_pretrained<B, M>(model: M, spec: &ArchitectureSpec, path: &Path, device: &B::Device) -> Result<M>
where
    B: Backend,
    M: Architecture<B>,
{
    let mut args = LoadArgs::new(path.to_path_buf());
    for (from, to) in M::key_remaps(spec) {
        args = args.with_key_remap(&from, &to);
    }

    let recorder = PyTorchFileRecorder::<FullPrecisionSettings>::default();
    let record: <M as Module<B>>::Record = Recorder::<B>::load(&recorder, args, device)
        .map_err(|e| FinetuneError::Record(format!("cannot import {}: {:?}", path.display(), e)))?;

    info!("Loaded pretrained {} weights", spec.name);
    Ok(model.load_record(record))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::registry::lookup;
    use tempfile::TempDir;

    #[test]
    fn test_override_dir_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(weights_dir(Some(dir.path())).unwrap(), dir.path());
    }

    #[test]
    fn test_cached_file_is_not_downloaded() {
        let dir = TempDir::new().unwrap();
        let spec = lookup("squeezenet1_1").unwrap();
        let cached = dir.path().join(spec.weights_file);
        fs::write(&cached, b"cached").unwrap();

        assert_eq!(ensure_weights(spec, dir.path()).unwrap(), cached);
        assert_eq!(fs::read(&cached).unwrap(), b"cached");
    }
}
