use candle_core::Tensor;
use derive_more::{Deref, DerefMut, Display};

/// Action probabilities after masking, `[B, num_actions]`.
#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct Probs(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct Logp(pub Tensor);

/// `log pi_new - log pi_old` per row.
#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct LogpDiff(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct ValuesPred(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct PolicyLoss(pub Tensor);

#[derive(Deref, DerefMut, Debug, Display, Clone)]
pub struct ValueLoss(pub Tensor);
