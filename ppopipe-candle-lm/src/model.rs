use crate::optimizer::{ModelOptimizer, OptimizerKind, clip_grad_norm};
use crate::sequential::build_sequential;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Module, Sequential, VarBuilder, VarMap};
use ppopipe_core::config::ModelConfig;
use ppopipe_core::{PipelineError, Result};
use std::fmt::Debug;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModelKey {
    SharedHead,
    Policy,
    Critic,
}

impl ModelKey {
    pub const ALL: [ModelKey; 3] = [Self::SharedHead, Self::Policy, Self::Critic];

    pub fn name(self) -> &'static str {
        match self {
            Self::SharedHead => "SHARED_HEAD",
            Self::Policy => "POLICY",
            Self::Critic => "CRITIC",
        }
    }

    pub fn file_name(self) -> String {
        format!("{}.safetensors", self.name())
    }
}

/// One MLP with its own parameters and optimizer.
pub struct Model {
    pub key: ModelKey,
    pub config: ModelConfig,
    pub num_inputs: usize,
    pub num_outputs: usize,
    varmap: VarMap,
    /// Sorted by name so flattened snapshots line up across calls.
    params: Vec<Var>,
    nn: Sequential,
    optimizer: OptimizerKind,
}

impl Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("key", &self.key)
            .field("num_inputs", &self.num_inputs)
            .field("num_outputs", &self.num_outputs)
            .field("learning_rate", &self.learning_rate())
            .finish()
    }
}

fn sorted_vars(varmap: &VarMap) -> Vec<Var> {
    let data = match varmap.data().lock() {
        Ok(data) => data,
        Err(poisoned) => poisoned.into_inner(),
    };
    let mut named: Vec<(&String, &Var)> = data.iter().collect();
    named.sort_by(|a, b| a.0.cmp(b.0));
    named.into_iter().map(|(_, var)| var.clone()).collect()
}

impl Model {
    pub fn new(
        key: ModelKey,
        config: ModelConfig,
        num_inputs: usize,
        num_outputs: usize,
        lr: f64,
        device: &Device,
    ) -> Result<Self> {
        if !config.is_valid() {
            return Err(PipelineError::Config(format!(
                "model {} has no layers",
                key.name()
            )));
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let (nn, num_outputs) = build_sequential(num_inputs, &config, num_outputs, &vb)?;
        let params = sorted_vars(&varmap);
        let optimizer = OptimizerKind::new(config.optimizer, params.clone(), lr)?;
        Ok(Self {
            key,
            config,
            num_inputs,
            num_outputs,
            varmap,
            params,
            nn,
            optimizer,
        })
    }

    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        Ok(self.nn.forward(input)?)
    }

    pub fn vars(&self) -> &[Var] {
        &self.params
    }

    pub fn param_count(&self) -> usize {
        self.params.iter().map(|var| var.elem_count()).sum()
    }

    /// Detached copy of every parameter, flattened into one vector.
    pub fn copy_params(&self) -> Result<Tensor> {
        let flat = self
            .params
            .iter()
            .map(|var| var.as_tensor().flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&flat, 0)?.detach().copy()?)
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr)
    }

    pub fn clip_grad_norm(&self, grads: &mut GradStore, max_norm: f32) -> Result<f32> {
        Ok(clip_grad_norm(grads, &self.params, max_norm)?)
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        Ok(self.optimizer.step(grads)?)
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.key.file_name())
    }

    pub fn save(&self, dir: &Path) -> Result<()> {
        Ok(self.varmap.save(self.path_in(dir))?)
    }

    /// Overwrites the parameters in place from `dir`.
    pub fn load(&mut self, dir: &Path) -> Result<()> {
        let path = self.path_in(dir);
        if !path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("missing model file {}", path.display()),
            )
            .into());
        }
        Ok(self.varmap.load(path)?)
    }
}
