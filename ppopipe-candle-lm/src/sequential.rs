use candle_core::Result;
use candle_nn::{Activation as NnActivation, Sequential, VarBuilder, linear, seq};
use ppopipe_core::config::{Activation, ModelConfig};

fn with_activation(nn: Sequential, activation: Activation) -> Sequential {
    match activation {
        Activation::Relu => nn.add(NnActivation::Relu),
        Activation::LeakyRelu => nn.add(NnActivation::LeakyRelu(0.01)),
        Activation::Sigmoid => nn.add(NnActivation::Sigmoid),
        Activation::Tanh => nn.add_fn(|xs| xs.tanh()),
    }
}

/// Builds the hidden stack described by `config`, plus a linear head of `output_dim` when the
/// config asks for one. Returns the network and the width of its output.
pub fn build_sequential(
    input_dim: usize,
    config: &ModelConfig,
    output_dim: usize,
    vb: &VarBuilder,
) -> Result<(Sequential, usize)> {
    let mut last_dim = input_dim;
    let mut nn = seq();
    for (layer_idx, &layer_size) in config.layer_sizes.iter().enumerate() {
        let layer = linear(last_dim, layer_size, vb.pp(format!("l{layer_idx}")))?;
        nn = with_activation(nn.add(layer), config.activation);
        last_dim = layer_size;
    }
    if config.add_output_layer {
        nn = nn.add(linear(last_dim, output_dim, vb.pp("out"))?);
        last_dim = output_dim;
    }
    Ok((nn, last_dim))
}
