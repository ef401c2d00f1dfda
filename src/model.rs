// model.rs

use crate::category::Category;
use crate::config::{DeviceChoice, ModelConfig};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tch::nn::{self, ModuleT};
use tch::vision::resnet;
use tch::{Device, Tensor};

pub const BACKBONE_PREFIX: &str = "backbone";
pub const HEAD_PREFIX: &str = "head";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backbone {
    /// Small six-conv network, trained from scratch unless weights are given.
    SimpleCnn,
    ResNet18,
    ResNet34,
    ResNet50,
}

impl Backbone {
    pub fn name(self) -> &'static str {
        match self {
            Backbone::SimpleCnn => "simple_cnn",
            Backbone::ResNet18 => "resnet18",
            Backbone::ResNet34 => "resnet34",
            Backbone::ResNet50 => "resnet50",
        }
    }

    /// Width of the pooled feature vector handed to the head.
    pub fn feature_dim(self) -> i64 {
        match self {
            Backbone::SimpleCnn => 128,
            Backbone::ResNet18 | Backbone::ResNet34 => 512,
            Backbone::ResNet50 => 2048,
        }
    }

    fn build(self, p: &nn::Path) -> Box<dyn ModuleT> {
        match self {
            Backbone::SimpleCnn => Box::new(simple_cnn(p)),
            Backbone::ResNet18 => Box::new(resnet::resnet18_no_final_layer(p)),
            Backbone::ResNet34 => Box::new(resnet::resnet34_no_final_layer(p)),
            Backbone::ResNet50 => Box::new(resnet::resnet50_no_final_layer(p)),
        }
    }
}

impl fmt::Display for Backbone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backbone {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simple_cnn" => Ok(Backbone::SimpleCnn),
            "resnet18" => Ok(Backbone::ResNet18),
            "resnet34" => Ok(Backbone::ResNet34),
            "resnet50" => Ok(Backbone::ResNet50),
            _ => Err(Error::UnknownBackbone(s.to_string())),
        }
    }
}

// Conv + BN + ReLU pairs with pooling, then global average pooling.
fn simple_cnn(p: &nn::Path) -> nn::SequentialT {
    let conv = |c_in, c_out, name: &str| {
        nn::conv2d(
            p / name,
            c_in,
            c_out,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        )
    };
    let bn = |c, name: &str| nn::batch_norm2d(p / name, c, Default::default());

    let mut seq = nn::seq_t();
    let mut c_in = 3;
    for (block, c_out) in [32, 64, 128].into_iter().enumerate() {
        for layer in 0..2 {
            let id = format!("{}_{}", block + 1, layer + 1);
            seq = seq
                .add(conv(c_in, c_out, &format!("conv{id}")))
                .add(bn(c_out, &format!("bn{id}")))
                .add_fn(|xs| xs.relu());
            c_in = c_out;
        }
        seq = seq.add_fn(|xs| xs.max_pool2d_default(2));
    }
    seq.add_fn(|xs| xs.adaptive_avg_pool2d(&[1, 1]).flatten(1, -1))
}

/// Backbone identifier, head width and weight source for one model.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    pub backbone: Backbone,
    pub num_categories: usize,
    pub pretrained: bool,
    pub weights: Option<PathBuf>,
    pub dropout: f64,
}

impl ModelSpec {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        Ok(Self {
            backbone: cfg.backbone.parse()?,
            num_categories: Category::COUNT,
            pretrained: cfg.pretrained,
            weights: cfg.pretrained_weights.clone(),
            dropout: cfg.dropout,
        })
    }

    /// Same architecture without a pretrained source, as needed to hold a
    /// checkpoint that will overwrite every variable anyway.
    pub fn for_checkpoint(&self) -> Self {
        Self {
            pretrained: false,
            ..self.clone()
        }
    }
}

#[derive(Debug)]
struct Classifier {
    backbone: Box<dyn ModuleT>,
    head: nn::SequentialT,
}

impl ModuleT for Classifier {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let features = self.backbone.forward_t(xs, train);
        self.head.forward_t(&features, train)
    }
}

/// Backbone and classification head sharing one variable store. Backbone
/// variables live under `backbone.`, head variables under `head.`.
pub struct WasteModel {
    vs: nn::VarStore,
    net: Classifier,
    spec: ModelSpec,
}

impl fmt::Debug for WasteModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasteModel")
            .field("spec", &self.spec)
            .field("device", &self.vs.device())
            .finish()
    }
}

/// CUDA when requested and present, CPU otherwise.
pub fn select_device(choice: DeviceChoice) -> Device {
    match choice {
        DeviceChoice::Cpu => Device::Cpu,
        DeviceChoice::Auto if tch::Cuda::is_available() => {
            tracing::info!("CUDA is available, using CUDA");
            Device::Cuda(0)
        }
        DeviceChoice::Auto => {
            tracing::warn!("no accelerator available, falling back to CPU");
            Device::Cpu
        }
    }
}

pub fn build_model(spec: &ModelSpec, device: Device) -> Result<WasteModel> {
    WasteModel::new(spec.clone(), device)
}

impl WasteModel {
    pub fn new(spec: ModelSpec, device: Device) -> Result<Self> {
        Category::ensure_count(spec.num_categories)?;

        let vs = nn::VarStore::new(device);
        let root = vs.root();
        let backbone = spec.backbone.build(&(&root / BACKBONE_PREFIX));
        let dropout = spec.dropout;
        let head = nn::seq_t()
            .add_fn_t(move |xs, train| xs.dropout(dropout, train))
            .add(nn::linear(
                &root / HEAD_PREFIX / "fc",
                spec.backbone.feature_dim(),
                spec.num_categories as i64,
                Default::default(),
            ));

        let mut model = Self {
            vs,
            net: Classifier { backbone, head },
            spec,
        };

        if model.spec.pretrained {
            let path = model
                .spec
                .weights
                .clone()
                .ok_or_else(|| Error::PretrainedWeights("no weights file configured".to_string()))?;
            let copied = model.load_pretrained(&path)?;
            tracing::info!(
                "loaded pretrained {} backbone ({} tensors) from {}",
                model.spec.backbone,
                copied,
                path.display()
            );
        }

        tracing::debug!(
            "built {} with {} categories on {:?}",
            model.spec.backbone,
            model.spec.num_categories,
            device
        );
        Ok(model)
    }

    /// Copies every tensor of `path` whose backbone-prefixed name and shape
    /// match a model variable. Accepts `.safetensors` and `.ot` files.
    pub fn load_pretrained(&mut self, path: &Path) -> Result<usize> {
        if !path.is_file() {
            return Err(Error::PretrainedWeights(format!(
                "'{}' does not exist; fetch the ImageNet weights published with tch-rs \
                 ({}.ot) or set model.pretrained = false",
                path.display(),
                self.spec.backbone
            )));
        }
        let source = read_weights(path)?;
        let mut targets = self.vs.variables();
        let prefix = format!("{BACKBONE_PREFIX}.");

        let mut copied = 0usize;
        for (name, tensor) in &source {
            let dst_name = if name.starts_with(&prefix) {
                name.clone()
            } else {
                format!("{prefix}{name}")
            };
            if try_copy(&mut targets, &dst_name, tensor) {
                copied += 1;
            }
        }

        if copied == 0 {
            return Err(Error::PretrainedWeights(format!(
                "no tensors copied from '{}'",
                path.display()
            )));
        }
        Ok(copied)
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        self.net.forward_t(xs, train)
    }

    /// Stops gradients for every backbone variable; the head stays trainable.
    pub fn freeze_backbone(&mut self) -> usize {
        let prefix = format!("{BACKBONE_PREFIX}.");
        let mut frozen = 0usize;
        for (name, var) in self.vs.variables() {
            if name.starts_with(&prefix) {
                let _ = var.set_requires_grad(false);
                frozen += 1;
            }
        }
        frozen
    }

    pub fn unfreeze_all(&mut self) {
        self.vs.unfreeze();
    }

    /// Number of scalar parameters that currently receive gradients.
    pub fn trainable_count(&self) -> usize {
        self.vs
            .trainable_variables()
            .iter()
            .filter(|t| t.requires_grad())
            .map(|t| t.numel())
            .sum()
    }

    pub fn head_variables(&self) -> Vec<String> {
        let prefix = format!("{HEAD_PREFIX}.");
        let mut names: Vec<String> = self
            .vs
            .variables()
            .into_keys()
            .filter(|n| n.starts_with(&prefix))
            .collect();
        names.sort();
        names
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.vs
    }

    pub fn device(&self) -> Device {
        self.vs.device()
    }

    pub fn spec(&self) -> &ModelSpec {
        &self.spec
    }
}

pub(crate) fn read_weights(path: &Path) -> Result<Vec<(String, Tensor)>> {
    let is_safetensors = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("safetensors"))
        .unwrap_or(false);
    let tensors = if is_safetensors {
        Tensor::read_safetensors(path)?
    } else {
        Tensor::load_multi(path)?
    };
    Ok(tensors)
}

// copy if the name exists and the shape matches
fn try_copy(dst: &mut HashMap<String, Tensor>, name: &str, src: &Tensor) -> bool {
    if let Some(d) = dst.get_mut(name) {
        if d.size() == src.size() {
            tch::no_grad(|| {
                d.copy_(src);
            });
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ModelSpec {
        ModelSpec {
            backbone: Backbone::SimpleCnn,
            num_categories: Category::COUNT,
            pretrained: false,
            weights: None,
            dropout: 0.2,
        }
    }

    #[test]
    fn logits_have_one_column_per_category() {
        let model = build_model(&spec(), Device::Cpu).unwrap();
        let xs = Tensor::zeros([2, 3, 32, 32], (tch::Kind::Float, Device::Cpu));
        let out = model.forward_t(&xs, false);
        assert_eq!(out.size(), vec![2, 6]);
    }

    #[test]
    fn head_is_separately_addressable() {
        let model = build_model(&spec(), Device::Cpu).unwrap();
        assert_eq!(model.head_variables(), vec!["head.fc.bias", "head.fc.weight"]);
    }

    #[test]
    fn freezing_leaves_only_the_head_trainable() {
        let mut model = build_model(&spec(), Device::Cpu).unwrap();
        let all = model.trainable_count();
        assert!(model.freeze_backbone() > 0);
        assert_eq!(model.trainable_count(), 128 * 6 + 6);
        model.unfreeze_all();
        assert_eq!(model.trainable_count(), all);
    }

    #[test]
    fn unknown_backbone_is_rejected() {
        assert!(matches!(
            "densenet_9000".parse::<Backbone>(),
            Err(Error::UnknownBackbone(_))
        ));
        assert_eq!("ResNet18".parse::<Backbone>().unwrap(), Backbone::ResNet18);
    }

    #[test]
    fn wrong_category_count_is_rejected() {
        let mut s = spec();
        s.num_categories = 4;
        assert!(matches!(
            build_model(&s, Device::Cpu),
            Err(Error::CategoryCount { .. })
        ));
    }

    #[test]
    fn missing_pretrained_file_is_an_error() {
        let mut s = spec();
        s.pretrained = true;
        s.weights = Some(PathBuf::from("/nonexistent/weights.safetensors"));
        match build_model(&s, Device::Cpu) {
            Err(Error::PretrainedWeights(msg)) => assert!(msg.contains("model.pretrained = false")),
            other => panic!("expected a pretrained weights error, got {other:?}"),
        }
    }

    #[test]
    fn default_model_config_needs_no_weight_file() {
        let spec = ModelSpec::from_config(&ModelConfig::default()).unwrap();
        assert!(!spec.pretrained);
        let model = build_model(&spec, Device::Cpu).unwrap();
        assert_eq!(model.spec().backbone, Backbone::ResNet18);
    }

    #[test]
    fn pretrained_weights_are_copied_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.safetensors");
        let donor = build_model(&spec(), Device::Cpu).unwrap();
        donor.var_store().save(&path).unwrap();

        let mut s = spec();
        s.pretrained = true;
        s.weights = Some(path);
        let model = build_model(&s, Device::Cpu).unwrap();
        let a = donor.var_store().variables();
        let b = model.var_store().variables();
        let name = "backbone.conv1_1.weight";
        assert!(a[name].equal(&b[name]));
    }

    #[test]
    fn weights_without_matching_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("other.safetensors");
        let t = Tensor::zeros([3], (tch::Kind::Float, Device::Cpu));
        Tensor::write_safetensors(&[("unrelated.weight", &t)], &path).unwrap();

        let mut model = build_model(&spec(), Device::Cpu).unwrap();
        assert!(matches!(
            model.load_pretrained(&path),
            Err(Error::PretrainedWeights(msg)) if msg.contains("no tensors copied")
        ));
    }
}
