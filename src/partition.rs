// partition.rs

use crate::category::Category;
use crate::error::{Error, IoContext, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::fs;
use std::path::{Path, PathBuf};

/// File extensions picked up from the raw pool and the split directories.
pub const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Validation,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Validation, Split::Test];

    pub fn dir_name(self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Validation => "validation",
            Split::Test => "test",
        }
    }
}

/// Split membership for one class, computed before anything is copied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSplit {
    pub train: Vec<PathBuf>,
    pub validation: Vec<PathBuf>,
    pub test: Vec<PathBuf>,
}

impl ClassSplit {
    pub fn get(&self, split: Split) -> &[PathBuf] {
        match split {
            Split::Train => &self.train,
            Split::Validation => &self.validation,
            Split::Test => &self.test,
        }
    }

    pub fn len(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SplitFractions {
    pub test: f64,
    /// Share of the remainder once the test files are removed.
    pub validation: f64,
}

#[derive(Debug, Clone)]
pub struct ClassCounts {
    pub category: Category,
    pub train: usize,
    pub validation: usize,
    pub test: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PartitionReport {
    pub classes: Vec<ClassCounts>,
}

impl PartitionReport {
    pub fn total(&self, split: Split) -> usize {
        self.classes
            .iter()
            .map(|c| match split {
                Split::Train => c.train,
                Split::Validation => c.validation,
                Split::Test => c.test,
            })
            .sum()
    }
}

pub fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
}

/// Sorted image files directly inside `dir`.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .at(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| is_image_file(p))
        .collect();
    // read_dir order is platform dependent; sorting makes the seeded shuffle reproducible
    files.sort();
    Ok(files)
}

/// Number of (test, validation) files for a class of `n` images. Every
/// split keeps at least one file; `n` must be at least 3.
pub(crate) fn split_sizes(n: usize, fractions: SplitFractions) -> (usize, usize) {
    let n_test = ((fractions.test * n as f64).round() as usize).clamp(1, n - 2);
    let rest = n - n_test;
    let n_val = ((fractions.validation * rest as f64).round() as usize).clamp(1, rest - 1);
    (n_test, n_val)
}

/// Shuffles one class's files with a seeded RNG and cuts them into splits.
/// `files` must already be sorted and hold at least three entries.
pub(crate) fn plan_split(mut files: Vec<PathBuf>, fractions: SplitFractions, seed: u64) -> ClassSplit {
    let (n_test, n_val) = split_sizes(files.len(), fractions);
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    files.shuffle(&mut rng);

    let train_val = files.split_off(n_test);
    let test = files;
    let mut train = train_val;
    let validation = train.split_off(train.len() - n_val);

    ClassSplit {
        train,
        validation,
        test,
    }
}

fn check_fractions(fractions: SplitFractions) -> Result<()> {
    let mut errors = Vec::new();
    if !(fractions.test > 0.0 && fractions.test < 1.0) {
        errors.push(format!("test fraction {} is not in (0, 1)", fractions.test));
    }
    if !(fractions.validation > 0.0 && fractions.validation < 1.0) {
        errors.push(format!(
            "validation fraction {} is not in (0, 1)",
            fractions.validation
        ));
    }
    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Config(errors))
    }
}

/// Plans the split of every category under `raw_dir` without touching the
/// destination. Fails on the first missing, empty or undersized class.
pub fn plan_partition(
    raw_dir: &Path,
    fractions: SplitFractions,
    seed: u64,
) -> Result<Vec<(Category, ClassSplit)>> {
    check_fractions(fractions)?;

    let mut plans = Vec::with_capacity(Category::COUNT);
    for category in Category::ALL {
        let class_dir = raw_dir.join(category.name());
        if !class_dir.is_dir() {
            return Err(Error::MissingClassDir(class_dir));
        }
        let files = list_images(&class_dir)?;
        if files.is_empty() {
            return Err(Error::EmptyClassDir(class_dir));
        }
        if files.len() < Split::ALL.len() {
            return Err(Error::TooFewImages {
                path: class_dir,
                found: files.len(),
                required: Split::ALL.len(),
            });
        }
        plans.push((category, plan_split(files, fractions, seed)));
    }
    Ok(plans)
}

/// Copies the raw pool into `<data_dir>/{train,validation,test}/<class>/`.
///
/// Source files are never moved. Running twice into a populated destination
/// adds to what is already there; clear `data_dir` first for a clean split.
pub fn partition_dataset(
    raw_dir: &Path,
    data_dir: &Path,
    fractions: SplitFractions,
    seed: u64,
) -> Result<PartitionReport> {
    tracing::info!(
        "partitioning {} into {} (test={}, validation={}, seed={})",
        raw_dir.display(),
        data_dir.display(),
        fractions.test,
        fractions.validation,
        seed
    );
    let plans = plan_partition(raw_dir, fractions, seed)?;

    let mut report = PartitionReport::default();
    for (category, plan) in &plans {
        for split in Split::ALL {
            let dest = data_dir.join(split.dir_name()).join(category.name());
            if dest.is_dir() && fs::read_dir(&dest).at(&dest)?.next().is_some() {
                tracing::warn!(
                    "{} is not empty; copies will accumulate with earlier runs",
                    dest.display()
                );
            }
            fs::create_dir_all(&dest).at(&dest)?;

            for src in plan.get(split) {
                let Some(name) = src.file_name() else { continue };
                let target = dest.join(name);
                fs::copy(src, &target).at(&target)?;
            }
        }

        tracing::info!(
            "  {}: train={} validation={} test={}",
            category,
            plan.train.len(),
            plan.validation.len(),
            plan.test.len()
        );
        report.classes.push(ClassCounts {
            category: *category,
            train: plan.train.len(),
            validation: plan.validation.len(),
            test: plan.test.len(),
        });
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const FRACTIONS: SplitFractions = SplitFractions {
        test: 0.1,
        validation: 0.1,
    };

    fn paths(n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("img_{i:04}.jpg"))).collect()
    }

    #[test]
    fn hundred_images_split_ten_nine_eighty_one() {
        assert_eq!(split_sizes(100, FRACTIONS), (10, 9));
        let plan = plan_split(paths(100), FRACTIONS, 42);
        assert_eq!(plan.test.len(), 10);
        assert_eq!(plan.validation.len(), 9);
        assert_eq!(plan.train.len(), 81);
    }

    #[test]
    fn split_is_exhaustive_and_disjoint() {
        for n in [3, 7, 40, 137] {
            let plan = plan_split(paths(n), FRACTIONS, 7);
            assert_eq!(plan.len(), n);
            let mut seen = HashSet::new();
            for split in Split::ALL {
                assert!(!plan.get(split).is_empty(), "empty {split:?} for n={n}");
                for p in plan.get(split) {
                    assert!(seen.insert(p.clone()), "{p:?} appears twice");
                }
            }
            assert_eq!(seen.len(), n);
        }
    }

    #[test]
    fn same_seed_same_membership() {
        let a = plan_split(paths(50), FRACTIONS, 42);
        let b = plan_split(paths(50), FRACTIONS, 42);
        assert_eq!(a, b);
        let c = plan_split(paths(50), FRACTIONS, 43);
        assert_ne!(a, c);
    }

    #[test]
    fn smallest_class_keeps_one_per_split() {
        assert_eq!(split_sizes(3, FRACTIONS), (1, 1));
        let big = SplitFractions {
            test: 0.9,
            validation: 0.9,
        };
        let (t, v) = split_sizes(10, big);
        assert!(t >= 1 && v >= 1 && t + v < 10);
    }

    #[test]
    fn missing_class_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = plan_partition(dir.path(), FRACTIONS, 42).unwrap_err();
        assert!(matches!(err, Error::MissingClassDir(p) if p.ends_with("cardboard")));
    }

    #[test]
    fn empty_class_directory_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        for c in Category::ALL {
            fs::create_dir_all(dir.path().join(c.name())).unwrap();
        }
        let err = plan_partition(dir.path(), FRACTIONS, 42).unwrap_err();
        assert!(matches!(err, Error::EmptyClassDir(_)));
    }

    #[test]
    fn bad_fractions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let bad = SplitFractions {
            test: 0.0,
            validation: 1.0,
        };
        assert!(matches!(
            plan_partition(dir.path(), bad, 42),
            Err(Error::Config(msgs)) if msgs.len() == 2
        ));
    }

    #[test]
    fn class_with_two_images_is_too_small() {
        let dir = tempfile::tempdir().unwrap();
        for c in Category::ALL {
            let class_dir = dir.path().join(c.name());
            fs::create_dir_all(&class_dir).unwrap();
            let n = if c == Category::Glass { 2 } else { 3 };
            for i in 0..n {
                fs::write(class_dir.join(format!("{i}.jpg")), b"").unwrap();
            }
        }
        match plan_partition(dir.path(), FRACTIONS, 42) {
            Err(Error::TooFewImages {
                path,
                found,
                required,
            }) => {
                assert!(path.ends_with("glass"));
                assert_eq!((found, required), (2, 3));
            }
            other => panic!("expected too few images, got {other:?}"),
        }
    }
}
