// evaluate.rs

use crate::augment::{load_rgb, EvalTransform, ImageTransform};
use crate::category::Category;
use crate::checkpoint;
use crate::error::{Error, IoContext, Result};
use crate::loader::DataLoader;
use crate::model::{build_model, ModelSpec, WasteModel};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tch::{Device, Kind, Tensor};

/// Test-split predictions with the derived metrics.
#[derive(Debug, Clone)]
pub struct EvaluationResults {
    pub predictions: Vec<i64>,
    pub true_labels: Vec<i64>,
    pub probabilities: Vec<Vec<f64>>,
    pub confusion: Vec<Vec<i64>>,
}

impl EvaluationResults {
    pub fn len(&self) -> usize {
        self.true_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.true_labels.is_empty()
    }

    pub fn correct(&self) -> usize {
        self.predictions
            .iter()
            .zip(&self.true_labels)
            .filter(|(p, t)| p == t)
            .count()
    }

    /// Fraction in [0, 1].
    pub fn accuracy(&self) -> f64 {
        if self.is_empty() {
            0.0
        } else {
            self.correct() as f64 / self.len() as f64
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: i64,
}

/// Rows are actual categories, columns predicted ones. Labels outside the
/// category range are ignored.
pub fn confusion_matrix(actual: &[i64], pred: &[i64], num_classes: usize) -> Vec<Vec<i64>> {
    let mut matrix = vec![vec![0; num_classes]; num_classes];
    let in_range = |v: i64| v >= 0 && (v as usize) < num_classes;
    for (&p, &t) in pred.iter().zip(actual.iter()) {
        if in_range(t) && in_range(p) {
            matrix[t as usize][p as usize] += 1;
        }
    }
    matrix
}

pub fn class_metrics(matrix: &[Vec<i64>]) -> Vec<ClassMetrics> {
    (0..matrix.len())
        .map(|i| {
            let tp = matrix[i][i];
            let fp: i64 = (0..matrix.len()).filter(|&j| j != i).map(|j| matrix[j][i]).sum();
            let support: i64 = matrix[i].iter().sum();
            let fn_ = support - tp;
            let precision = if tp + fp > 0 { tp as f64 / (tp + fp) as f64 } else { 0.0 };
            let recall = if tp + fn_ > 0 { tp as f64 / (tp + fn_) as f64 } else { 0.0 };
            let f1 = if precision + recall > 0.0 {
                2.0 * precision * recall / (precision + recall)
            } else {
                0.0
            };
            ClassMetrics {
                precision,
                recall,
                f1,
                support,
            }
        })
        .collect()
}

pub fn print_classification_report(matrix: &[Vec<i64>], class_names: &[&str]) {
    println!("\nClassification Report:");
    println!(
        "{:>12} {:>10} {:>10} {:>10} {:>10}",
        "Class", "Precision", "Recall", "F1-Score", "Support"
    );
    println!("{}", "-".repeat(60));

    let metrics = class_metrics(matrix);
    let total: i64 = metrics.iter().map(|m| m.support).sum();
    let (mut wp, mut wr, mut wf) = (0.0, 0.0, 0.0);
    for (m, name) in metrics.iter().zip(class_names) {
        println!(
            "{:>12} {:>10.2} {:>10.2} {:>10.2} {:>10}",
            name, m.precision, m.recall, m.f1, m.support
        );
        wp += m.precision * m.support as f64;
        wr += m.recall * m.support as f64;
        wf += m.f1 * m.support as f64;
    }
    if total > 0 {
        wp /= total as f64;
        wr /= total as f64;
        wf /= total as f64;
    }
    println!("{}", "-".repeat(60));
    println!(
        "{:>12} {:>10.2} {:>10.2} {:>10.2} {:>10}",
        "Weighted Avg", wp, wr, wf, total
    );
}

pub fn print_confusion_matrix(matrix: &[Vec<i64>], class_names: &[&str]) {
    println!("\nConfusion Matrix:");
    println!("Predicted ->");
    print!("Actual\\    ");
    for name in class_names {
        print!("{:>10} ", name);
    }
    println!();
    for (row, name) in matrix.iter().zip(class_names) {
        print!("{:>10} ", name);
        for &val in row {
            print!("{:>10} ", val);
        }
        println!();
    }
    println!();
}

pub fn save_confusion_matrix_csv(
    matrix: &[Vec<i64>],
    class_names: &[&str],
    path: &Path,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).at(parent)?;
    }
    let mut file = BufWriter::new(File::create(path).at(path)?);
    let header: Vec<&str> = std::iter::once("actual\\predicted")
        .chain(class_names.iter().copied())
        .collect();
    writeln!(file, "{}", header.join(",")).at(path)?;
    for (row, name) in matrix.iter().zip(class_names) {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        writeln!(file, "{},{}", name, cells.join(",")).at(path)?;
    }
    file.flush().at(path)?;
    Ok(())
}

/// Per-sample predictions: actual, predicted and one probability per category.
pub fn save_predictions_csv(results: &EvaluationResults, path: &Path) -> Result<()> {
    let mut file = BufWriter::new(File::create(path).at(path)?);
    let probs: Vec<String> = Category::ALL
        .iter()
        .map(|c| format!("p_{}", c.name()))
        .collect();
    writeln!(file, "actual,predicted,{}", probs.join(",")).at(path)?;
    for ((&actual, &pred), p) in results
        .true_labels
        .iter()
        .zip(&results.predictions)
        .zip(&results.probabilities)
    {
        let cells: Vec<String> = p.iter().map(|v| format!("{v:.6}")).collect();
        writeln!(file, "{},{},{}", actual, pred, cells.join(",")).at(path)?;
    }
    file.flush().at(path)?;
    Ok(())
}

/// Full pass over `loader` with the model in evaluation mode.
pub fn eval_model(model: &WasteModel, loader: &mut DataLoader) -> Result<EvaluationResults> {
    let device = model.device();
    let mut predictions = Vec::with_capacity(loader.len());
    let mut true_labels = Vec::with_capacity(loader.len());
    let mut probabilities = Vec::with_capacity(loader.len());

    tch::no_grad(|| -> Result<()> {
        for batch in loader.iter()? {
            let batch = batch?;
            let images = batch.images.to_device(device);
            let probs = model
                .forward_t(&images, false)
                .softmax(-1, Kind::Float)
                .to_device(Device::Cpu);
            let preds = Vec::<i64>::try_from(&probs.argmax(-1, false))?;
            let labels = Vec::<i64>::try_from(&batch.labels)?;
            let rows: Vec<Vec<f64>> = Vec::<Vec<f64>>::try_from(&probs.to_kind(Kind::Double))?;

            predictions.extend(preds);
            true_labels.extend(labels);
            probabilities.extend(rows);
        }
        Ok(())
    })?;

    let confusion = confusion_matrix(&true_labels, &predictions, Category::COUNT);
    Ok(EvaluationResults {
        predictions,
        true_labels,
        probabilities,
        confusion,
    })
}

/// Loads `checkpoint` into a fresh model of `spec` and evaluates the test
/// loader. Prints the accuracy line, confusion matrix and per-class report.
pub fn evaluate_test_set(
    spec: &ModelSpec,
    checkpoint_path: &Path,
    loader: &mut DataLoader,
    device: Device,
) -> Result<EvaluationResults> {
    Category::ensure_count(spec.num_categories)?;
    let mut model = build_model(&spec.for_checkpoint(), device)?;
    checkpoint::load(model.var_store_mut(), checkpoint_path)?;
    tracing::info!(
        "evaluating {} on {} test images",
        checkpoint_path.display(),
        loader.len()
    );

    let results = eval_model(&model, loader)?;
    let names = Category::names();
    println!(
        "Test Accuracy: {:.4} ({}/{})",
        results.accuracy(),
        results.correct(),
        results.len()
    );
    print_confusion_matrix(&results.confusion, &names);
    print_classification_report(&results.confusion, &names);
    Ok(results)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub category: Category,
    /// Soft-max probability of `category`, in [0, 1].
    pub confidence: f64,
}

/// A checkpointed model ready for single-image inference.
#[derive(Debug)]
pub struct Predictor {
    model: WasteModel,
    transform: EvalTransform,
}

impl Predictor {
    pub fn new(spec: &ModelSpec, checkpoint_path: &Path, image_size: u32, device: Device) -> Result<Self> {
        let mut model = build_model(&spec.for_checkpoint(), device)?;
        checkpoint::load(model.var_store_mut(), checkpoint_path)?;
        Ok(Self {
            model,
            transform: EvalTransform::new(image_size),
        })
    }

    pub fn predict(&self, image_path: &Path) -> Result<Prediction> {
        let img = load_rgb(image_path)?;
        let size = self.transform.size() as i64;
        let input = Tensor::from_slice(&self.transform.transform(img))
            .view([1, 3, size, size])
            .to_device(self.model.device());

        let probs = tch::no_grad(|| self.model.forward_t(&input, false))
            .softmax(-1, Kind::Float)
            .to_device(Device::Cpu)
            .squeeze_dim(0);
        let index = probs.argmax(-1, false).int64_value(&[]);
        let confidence = probs.double_value(&[index]);
        Ok(Prediction {
            category: Category::from_label(index)?,
            confidence,
        })
    }
}

/// One-shot helper: build a predictor and classify one image.
pub fn predict(
    image_path: &Path,
    checkpoint_path: &Path,
    spec: &ModelSpec,
    image_size: u32,
    device: Device,
) -> Result<Prediction> {
    if !image_path.is_file() {
        return Err(Error::io(
            image_path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "image not found"),
        ));
    }
    Predictor::new(spec, checkpoint_path, image_size, device)?.predict(image_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confusion_rows_are_actual_labels() {
        let actual = [0, 0, 1, 2, 5];
        let pred = [0, 1, 1, 2, 0];
        let m = confusion_matrix(&actual, &pred, 6);
        assert_eq!(m[0][0], 1);
        assert_eq!(m[0][1], 1);
        assert_eq!(m[5][0], 1);
        assert_eq!(m.iter().flatten().sum::<i64>(), 5);
    }

    #[test]
    fn out_of_range_labels_are_skipped() {
        let m = confusion_matrix(&[0, 7, -1], &[0, 0, 0], 6);
        assert_eq!(m.iter().flatten().sum::<i64>(), 1);
    }

    #[test]
    fn per_class_metrics() {
        let m = vec![vec![3, 1], vec![0, 2]];
        let metrics = class_metrics(&m);
        assert_eq!(metrics[0].precision, 1.0);
        assert_eq!(metrics[0].recall, 0.75);
        assert_eq!(metrics[1].support, 2);
        assert!((metrics[1].precision - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn confusion_csv_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("confusion.csv");
        save_confusion_matrix_csv(&[vec![1, 2], vec![3, 4]], &["glass", "metal"], &path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "actual\\predicted,glass,metal\nglass,1,2\nmetal,3,4\n");
    }

    #[test]
    fn accuracy_of_empty_results_is_zero() {
        let r = EvaluationResults {
            predictions: vec![],
            true_labels: vec![],
            probabilities: vec![],
            confusion: vec![],
        };
        assert_eq!(r.accuracy(), 0.0);
    }
}
