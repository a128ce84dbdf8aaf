use candle_core::backprop::GradStore;
use candle_core::{Result, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, SGD};
use enum_dispatch::enum_dispatch;
use ppopipe_core::config::OptimizerType;

#[enum_dispatch]
pub trait ModelOptimizer {
    fn step(&mut self, grads: &GradStore) -> Result<()>;
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

impl ModelOptimizer for AdamW {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        Optimizer::step(self, grads)
    }

    fn learning_rate(&self) -> f64 {
        Optimizer::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        Optimizer::set_learning_rate(self, lr)
    }
}

impl ModelOptimizer for SGD {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        Optimizer::step(self, grads)
    }

    fn learning_rate(&self) -> f64 {
        Optimizer::learning_rate(self)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        Optimizer::set_learning_rate(self, lr)
    }
}

#[enum_dispatch(ModelOptimizer)]
pub enum OptimizerKind {
    AdamW(AdamW),
    Sgd(SGD),
}

impl OptimizerKind {
    pub fn new(optimizer: OptimizerType, vars: Vec<Var>, lr: f64) -> Result<Self> {
        match optimizer {
            OptimizerType::Adam => {
                let params = ParamsAdamW {
                    lr,
                    weight_decay: 0.,
                    ..Default::default()
                };
                Ok(AdamW::new(vars, params)?.into())
            }
            OptimizerType::AdamW => {
                let params = ParamsAdamW {
                    lr,
                    ..Default::default()
                };
                Ok(AdamW::new(vars, params)?.into())
            }
            OptimizerType::Sgd => Ok(SGD::new(vars, lr)?.into()),
        }
    }
}

/// Scales the gradients of `params` so their joint L2 norm is at most `max_norm`.
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, params: &[Var], max_norm: f32) -> Result<f32> {
    let mut total_norm_squared = 0.0f32;
    for var in params {
        if let Some(grad) = grads.get(var) {
            total_norm_squared += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    let total_norm = total_norm_squared.sqrt();
    if total_norm > max_norm {
        let clip_coef = (max_norm / (total_norm + 1e-6)) as f64;
        for var in params {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, (grad * clip_coef)?);
            }
        }
    }
    Ok(total_norm)
}

/// Sums `grads` into `acc` for every var in `params`. The first store is taken as is.
pub fn accumulate_grads(acc: &mut Option<GradStore>, mut grads: GradStore, params: &[Var]) -> Result<()> {
    let Some(store) = acc.as_mut() else {
        *acc = Some(grads);
        return Ok(());
    };
    for var in params {
        if let Some(grad) = grads.remove(var) {
            let summed = match store.remove(var) {
                Some(prev) => (prev + grad)?,
                None => grad,
            };
            store.insert(var, summed);
        }
    }
    Ok(())
}
