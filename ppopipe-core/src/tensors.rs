use crate::error::{PipelineError, Result};
use candle_core::{Device, Tensor};

/// Column-aligned training tensors. Row `i` of every present field describes the same step.
#[derive(Debug, Clone, Default)]
pub struct ExperienceTensors {
    /// `[N, obs_size]` f32
    pub states: Option<Tensor>,
    /// `[N]` u32
    pub actions: Option<Tensor>,
    /// `[N]` f32
    pub log_probs: Option<Tensor>,
    /// `[N]` f32
    pub target_values: Option<Tensor>,
    /// `[N, num_actions]` u8
    pub action_masks: Option<Tensor>,
    /// `[N]` f32
    pub advantages: Option<Tensor>,
}

impl ExperienceTensors {
    pub fn fields(&self) -> [(&'static str, Option<&Tensor>); 6] {
        [
            ("states", self.states.as_ref()),
            ("actions", self.actions.as_ref()),
            ("log_probs", self.log_probs.as_ref()),
            ("target_values", self.target_values.as_ref()),
            ("action_masks", self.action_masks.as_ref()),
            ("advantages", self.advantages.as_ref()),
        ]
    }

    fn try_map(&self, mut f: impl FnMut(&Tensor) -> candle_core::Result<Tensor>) -> Result<Self> {
        let mut apply = |field: &Option<Tensor>| field.as_ref().map(&mut f).transpose();
        Ok(Self {
            states: apply(&self.states)?,
            actions: apply(&self.actions)?,
            log_probs: apply(&self.log_probs)?,
            target_values: apply(&self.target_values)?,
            action_masks: apply(&self.action_masks)?,
            advantages: apply(&self.advantages)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    /// Rows in `states`, zero when no states are present.
    pub fn row_count(&self) -> usize {
        self.states
            .as_ref()
            .and_then(|states| states.dims().first().copied())
            .unwrap_or(0)
    }

    /// Rows that can be addressed safely in every gathered field.
    pub fn row_limit(&self) -> usize {
        let actions = self
            .actions
            .as_ref()
            .and_then(|actions| actions.dims().first().copied());
        match actions {
            Some(actions) => self.row_count().min(actions),
            None => self.row_count(),
        }
    }

    /// Checks that every present field has the same number of rows and returns it.
    pub fn validate(&self) -> Result<usize> {
        let expected = self.row_count();
        for (field, tensor) in self.fields() {
            let Some(tensor) = tensor else { continue };
            let found = tensor.dims().first().copied().unwrap_or(0);
            if found != expected {
                return Err(PipelineError::ShapeMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(expected)
    }

    pub fn require<'a>(field: &'static str, tensor: &'a Option<Tensor>) -> Result<&'a Tensor> {
        tensor.as_ref().ok_or(PipelineError::MissingField(field))
    }

    pub fn to_device(&self, device: &Device) -> Result<Self> {
        self.try_map(|t| t.to_device(device))
    }

    pub fn is_on_device(&self, device: &Device) -> bool {
        self.fields()
            .into_iter()
            .filter_map(|(_, tensor)| tensor)
            .all(|tensor| tensor.device().same_device(device))
    }

    /// Gathers rows by index. `indices` must be a u32 tensor on the same device.
    pub fn index_select(&self, indices: &Tensor) -> Result<Self> {
        self.try_map(|t| t.index_select(indices, 0))
    }

    pub fn narrow(&self, start: usize, len: usize) -> Result<Self> {
        self.try_map(|t| t.narrow(0, start, len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reports_the_misaligned_field() {
        let device = Device::Cpu;
        let tensors = ExperienceTensors {
            states: Some(Tensor::zeros((4, 2), candle_core::DType::F32, &device).unwrap()),
            advantages: Some(Tensor::zeros(3, candle_core::DType::F32, &device).unwrap()),
            ..Default::default()
        };
        match tensors.validate() {
            Err(PipelineError::ShapeMismatch { field, expected, found }) => {
                assert_eq!((field, expected, found), ("advantages", 4, 3));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
