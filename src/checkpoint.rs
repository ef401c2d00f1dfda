// checkpoint.rs

use crate::error::{Error, IoContext, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tch::{nn, Tensor};

/// `<models>/stage{1,2}_best.safetensors`
pub fn stage_checkpoint(models_dir: &Path, stage: u8) -> PathBuf {
    models_dir.join(format!("stage{stage}_best.safetensors"))
}

/// Names the checkpoint holding the lowest validation loss, next to it.
pub const BEST_MARKER: &str = "best.txt";

/// The stage checkpoint holding the running best. Read from the marker
/// written by [`RunningBest::consider`]; without one, the newest file wins.
pub fn best_available(models_dir: &Path) -> Option<PathBuf> {
    if let Some(marked) = read_marker(models_dir) {
        return Some(marked);
    }
    [1u8, 2]
        .into_iter()
        .map(|stage| stage_checkpoint(models_dir, stage))
        .filter_map(|p| {
            let modified = fs::metadata(&p).and_then(|m| m.modified()).ok()?;
            Some((modified, p))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, p)| p)
}

fn read_marker(models_dir: &Path) -> Option<PathBuf> {
    let text = fs::read_to_string(models_dir.join(BEST_MARKER)).ok()?;
    let name = text.split_whitespace().next()?;
    let path = models_dir.join(name);
    path.is_file().then_some(path)
}

fn write_marker(checkpoint: &Path, loss: f64) -> Result<()> {
    let Some(name) = checkpoint.file_name().and_then(|n| n.to_str()) else {
        return Ok(());
    };
    let marker = checkpoint.with_file_name(BEST_MARKER);
    fs::write(&marker, format!("{name} {loss}\n")).at(&marker)
}

/// Writes every variable of `vs` to `path` as safetensors, replacing any
/// previous file as a whole.
pub fn save(vs: &nn::VarStore, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).at(parent)?;
    }
    // the temporary keeps the extension so the store writes safetensors
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("checkpoint");
    let tmp = path.with_file_name(format!(".{stem}.partial.safetensors"));
    vs.save(&tmp)?;
    fs::rename(&tmp, path).at(path)?;
    tracing::debug!("checkpoint written to {}", path.display());
    Ok(())
}

/// Loads `path` into `vs`. The file must hold exactly the store's variable
/// names with identical shapes; nothing is copied otherwise.
pub fn load(vs: &mut nn::VarStore, path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::io(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "checkpoint not found"),
        ));
    }
    let stored: HashMap<String, Tensor> = Tensor::read_safetensors(path)?.into_iter().collect();
    let mut vars = vs.variables();

    let mut problems = Vec::new();
    for (name, var) in &vars {
        match stored.get(name) {
            None => problems.push(format!("missing '{name}'")),
            Some(t) if t.size() != var.size() => problems.push(format!(
                "'{name}' has shape {:?}, model expects {:?}",
                t.size(),
                var.size()
            )),
            Some(_) => {}
        }
    }
    for name in stored.keys() {
        if !vars.contains_key(name) {
            problems.push(format!("unexpected '{name}'"));
        }
    }
    if !problems.is_empty() {
        problems.sort();
        return Err(Error::CheckpointMismatch {
            path: path.to_path_buf(),
            reason: problems.join("; "),
        });
    }

    tch::no_grad(|| {
        for (name, var) in vars.iter_mut() {
            if let Some(src) = stored.get(name) {
                var.copy_(src);
            }
        }
    });
    tracing::debug!("loaded {} tensors from {}", stored.len(), path.display());
    Ok(())
}

/// Lowest validation loss seen so far, shared by both training stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunningBest {
    loss: f64,
}

impl Default for RunningBest {
    fn default() -> Self {
        Self {
            loss: f64::INFINITY,
        }
    }
}

impl RunningBest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loss(&self) -> f64 {
        self.loss
    }

    /// Strictly lower only, so a tie keeps the earlier checkpoint.
    pub fn improves(&self, loss: f64) -> bool {
        loss < self.loss
    }

    /// Saves `vs` to `path` and records `loss` when it beats the best so far.
    pub fn consider(&mut self, loss: f64, vs: &nn::VarStore, path: &Path) -> Result<bool> {
        if !self.improves(loss) {
            return Ok(false);
        }
        save(vs, path)?;
        write_marker(path, loss)?;
        self.loss = loss;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    fn store(hidden: i64) -> nn::VarStore {
        let vs = nn::VarStore::new(Device::Cpu);
        let _ = nn::linear(vs.root() / "head" / "fc", hidden, 6, Default::default());
        vs
    }

    #[test]
    fn stage_paths() {
        let p = stage_checkpoint(Path::new("models"), 2);
        assert_eq!(p, PathBuf::from("models/stage2_best.safetensors"));
    }

    #[test]
    fn marker_beats_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let vs = store(4);
        let stage1 = stage_checkpoint(dir.path(), 1);
        let stage2 = stage_checkpoint(dir.path(), 2);

        let mut best = RunningBest::new();
        assert!(best.consider(0.5, &vs, &stage1).unwrap());
        // a stage 2 file from an earlier run, written after this run's best
        std::thread::sleep(std::time::Duration::from_millis(20));
        save(&vs, &stage2).unwrap();
        assert_eq!(best_available(dir.path()), Some(stage1.clone()));

        assert!(best.consider(0.3, &vs, &stage2).unwrap());
        assert_eq!(best_available(dir.path()), Some(stage2));
    }

    #[test]
    fn newest_stage_checkpoint_wins() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(best_available(dir.path()), None);
        let vs = store(4);
        save(&vs, &stage_checkpoint(dir.path(), 1)).unwrap();
        assert_eq!(
            best_available(dir.path()),
            Some(stage_checkpoint(dir.path(), 1))
        );
        std::thread::sleep(std::time::Duration::from_millis(20));
        save(&vs, &stage_checkpoint(dir.path(), 2)).unwrap();
        assert_eq!(
            best_available(dir.path()),
            Some(stage_checkpoint(dir.path(), 2))
        );
    }

    #[test]
    fn save_then_load_restores_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.safetensors");
        let a = store(8);
        save(&a, &path).unwrap();

        let mut b = store(8);
        load(&mut b, &path).unwrap();
        let wa = &a.variables()["head.fc.weight"];
        let wb = &b.variables()["head.fc.weight"];
        assert!(wa.equal(wb));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.safetensors");
        save(&store(8), &path).unwrap();

        let mut other = store(16);
        let before = other.variables()["head.fc.weight"].copy();
        match load(&mut other, &path) {
            Err(Error::CheckpointMismatch { reason, .. }) => assert!(reason.contains("shape")),
            r => panic!("expected mismatch, got {r:?}"),
        }
        assert!(before.equal(&other.variables()["head.fc.weight"]));
    }

    #[test]
    fn unexpected_and_missing_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.safetensors");
        let t = Tensor::zeros([6], (Kind::Float, Device::Cpu));
        Tensor::write_safetensors(&[("head.fc.bias", &t), ("extra.bias", &t)], &path).unwrap();

        let mut vs = store(8);
        match load(&mut vs, &path) {
            Err(Error::CheckpointMismatch { reason, .. }) => {
                assert!(reason.contains("missing 'head.fc.weight'"));
                assert!(reason.contains("unexpected 'extra.bias'"));
            }
            r => panic!("expected mismatch, got {r:?}"),
        }
    }

    fn weight(vs: &nn::VarStore) -> Tensor {
        vs.variables()["head.fc.weight"].copy()
    }

    #[test]
    fn running_best_only_moves_down() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("best.safetensors");
        let first = store(4);
        let worse = store(4);
        assert!(!weight(&first).equal(&weight(&worse)));
        let mut best = RunningBest::new();

        assert!(best.consider(0.9, &first, &path).unwrap());
        assert!(path.exists());

        // ties and higher losses leave the file holding the first weights
        assert!(!best.consider(0.9, &worse, &path).unwrap());
        assert!(!best.consider(1.2, &worse, &path).unwrap());
        let mut reloaded = store(4);
        load(&mut reloaded, &path).unwrap();
        assert!(weight(&reloaded).equal(&weight(&first)));
        assert!(!weight(&reloaded).equal(&weight(&worse)));
        assert_eq!(best.loss(), 0.9);

        assert!(best.consider(0.4, &worse, &path).unwrap());
        load(&mut reloaded, &path).unwrap();
        assert!(weight(&reloaded).equal(&weight(&worse)));
        assert_eq!(best.loss(), 0.4);
        assert!(!best.improves(f64::NAN));
    }
}
